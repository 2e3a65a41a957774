use qctl::{
    disc::hfsc::{HfscClassRequest, HfscDiscipline},
    ClassId, ClassParams, ClassRequest, InterfaceConfig, InterfaceId, MemoryDevice,
    TrafficControlState,
};

mod cbq;
mod classifier;
mod conditioner;
mod hfsc;
mod lifecycle;
mod load;
mod reversibility;
mod status;

type State = TrafficControlState<MemoryDevice>;

/// An HFSC interface `em0` with a linear root class at the full link rate.
fn hfsc_interface(bandwidth: u64) -> (State, InterfaceId, ClassId) {
    let mut state = State::new(MemoryDevice::new());
    let em0 = state
        .add_interface("em0", InterfaceConfig::new(bandwidth), Box::new(HfscDiscipline::new()))
        .unwrap();
    let root = state
        .add_class(em0, None, "root", ClassRequest::Hfsc(HfscClassRequest::linear(bandwidth)))
        .unwrap();
    (state, em0, root)
}

fn params(state: &State, class: ClassId) -> ClassParams {
    state.class(class).unwrap().params().clone()
}
