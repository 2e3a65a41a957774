use qctl::{
    device::KernelClass,
    disc::cdnr::{Action, ConditionerDiscipline, ConditionerElement},
    ClassRequest, Error, InterfaceConfig, MemoryDevice, TbProfile,
};

use crate::State;

fn element(element: ConditionerElement) -> ClassRequest {
    ClassRequest::Conditioner(element)
}

fn conditioner() -> Box<ConditionerDiscipline> {
    Box::new(ConditionerDiscipline::new())
}

#[test]
fn referenced_elements_outlive_their_referrers() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut state = State::new(MemoryDevice::new());
    let in0 = state
        .add_interface("in0", InterfaceConfig::new(0).input(), conditioner())
        .unwrap();
    let holder = state.add_class(in0, None, "holder", ClassRequest::None).unwrap();
    assert!(state.class(holder).unwrap().handle().is_none());

    let dropper = state
        .add_class(in0, Some(holder), "drop", element(ConditionerElement::Action(Action::Drop)))
        .unwrap();
    let meter = ConditionerElement::TokenBucket {
        profile: TbProfile::new(1_000_000, 3_000),
        in_action: Action::Mark(0x2e),
        out_action: Action::Element(dropper),
    };
    let meter = state.add_class(in0, Some(holder), "meter", element(meter)).unwrap();

    let dropper_handle = state.class(dropper).unwrap().handle();
    let meter_handle = state.class(meter).unwrap().handle();
    let installed = &state.device().qdisc("in0").unwrap().classes[&meter_handle];
    assert_eq!(
        installed.class,
        KernelClass::Conditioner(ConditionerElement::TokenBucket {
            profile: TbProfile::new(1_000_000, 3_000),
            in_action: Action::Mark(0x2e),
            out_action: Action::Element(dropper_handle),
        })
    );

    let err = state.delete_class(dropper).unwrap_err();
    assert!(matches!(err, Error::ClassPermission(_)), "{err}");

    state.clear(in0).unwrap();
    assert!(state.interface(in0).unwrap().classes().is_empty());
    assert!(state.device().qdisc("in0").unwrap().classes.is_empty());
}

#[test]
fn references_cannot_form_cycles() {
    let mut state = State::new(MemoryDevice::new());
    let in0 = state
        .add_interface("in0", InterfaceConfig::new(0).input(), conditioner())
        .unwrap();
    let holder = state.add_class(in0, None, "holder", ClassRequest::None).unwrap();

    let a = state
        .add_class(in0, Some(holder), "a", element(ConditionerElement::Action(Action::Pass)))
        .unwrap();
    let b = state
        .add_class(in0, Some(holder), "b", element(ConditionerElement::Action(Action::Element(a))))
        .unwrap();

    let err = state
        .modify_class(a, element(ConditionerElement::Action(Action::Element(b))))
        .unwrap_err();
    assert!(matches!(err, Error::ClassInvalid(_)), "{err}");

    let err = state
        .modify_class(a, element(ConditionerElement::Action(Action::Element(a))))
        .unwrap_err();
    assert!(matches!(err, Error::ClassInvalid(_)), "{err}");

    // Dropping the reference frees the target.
    state.modify_class(b, element(ConditionerElement::Action(Action::Return))).unwrap();
    state.delete_class(a).unwrap();
}

#[test]
fn elements_need_existing_targets() {
    let mut state = State::new(MemoryDevice::new());
    let in0 = state
        .add_interface("in0", InterfaceConfig::new(0).input(), conditioner())
        .unwrap();
    let holder = state.add_class(in0, None, "holder", ClassRequest::None).unwrap();
    let a = state
        .add_class(in0, Some(holder), "a", element(ConditionerElement::Action(Action::Pass)))
        .unwrap();
    state.delete_class(a).unwrap();

    let err = state
        .add_class(in0, Some(holder), "b", element(ConditionerElement::Action(Action::Element(a))))
        .unwrap_err();
    assert!(matches!(err, Error::BadClass(_)), "{err}");

    let looped = element(ConditionerElement::Action(Action::Element(holder)));
    let err = state.add_class(in0, Some(holder), "c", looped).unwrap_err();
    assert!(matches!(err, Error::ClassInvalid(_)), "{err}");
}

#[test]
fn output_interfaces_are_refused() {
    let mut state = State::new(MemoryDevice::new());
    let err =
        state.add_interface("em0", InterfaceConfig::new(1_000_000), conditioner()).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)), "{err}");
}

#[test]
fn teardown_removes_everything() {
    let mut state = State::new(MemoryDevice::new());
    let in0 = state
        .add_interface("in0", InterfaceConfig::new(0).input(), conditioner())
        .unwrap();
    let holder = state.add_class(in0, None, "holder", ClassRequest::None).unwrap();

    let mut target = None;
    for name in ["a", "b", "c", "d"] {
        let action = target.map_or(Action::Drop, Action::Element);
        target = Some(
            state
                .add_class(in0, Some(holder), name, element(ConditionerElement::Action(action)))
                .unwrap(),
        );
    }

    state.delete_interface(in0).unwrap();
    assert!(state.device().qdisc("in0").is_none());
    assert!(state.interface(in0).is_none());
    assert_eq!(
        state.device().calls().iter().filter(|c| c.starts_with("delete_class")).count(),
        4
    );
}
