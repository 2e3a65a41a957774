use qctl::{
    device::KernelClass,
    disc::cbq::{CbqClass, CbqClassFlags, CbqClassRequest, CbqDiscipline, CbqOptions},
    ClassId, ClassParams, ClassRequest, Error, InterfaceConfig, InterfaceId, MemoryDevice,
};

use crate::State;

const LINK: u64 = 10_000_000;

fn cbq_interface(options: CbqOptions) -> (State, InterfaceId, ClassId) {
    let mut state = State::new(MemoryDevice::new());
    let em0 = state
        .add_interface("em0", InterfaceConfig::new(LINK), Box::new(CbqDiscipline::new(options)))
        .unwrap();
    let root = state.add_class(em0, None, "root", cbq(LINK)).unwrap();
    (state, em0, root)
}

fn cbq(bandwidth: u64) -> ClassRequest {
    ClassRequest::Cbq(CbqClassRequest::new(bandwidth))
}

fn ledger(state: &State, class: ClassId) -> CbqClass {
    match state.class(class).unwrap().params() {
        ClassParams::Cbq(c) => c.clone(),
        other => panic!("not a cbq class: {other:?}"),
    }
}

#[test]
fn admission_is_monotonic() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut state, em0, root) = cbq_interface(CbqOptions::default());

    state.add_class(em0, Some(root), "a", cbq(6_000_000)).unwrap();
    assert_eq!(ledger(&state, root).allocated, 6_000_000);

    let err = state.add_class(em0, Some(root), "b", cbq(5_000_000)).unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");
    assert_eq!(ledger(&state, root).allocated, 6_000_000);
    assert!(state.find_class(em0, "b").is_none());

    state.add_class(em0, Some(root), "c", cbq(4_000_000)).unwrap();
    assert_eq!(ledger(&state, root).allocated, LINK);
    assert_eq!(ledger(&state, root).available(), 0);
}

#[test]
fn root_carries_interface_options() {
    let options = CbqOptions::default().with_wrr(true).with_efficient(true);
    let (state, em0, root) = cbq_interface(options);

    let class = state.class(root).unwrap();
    let spec = ledger(&state, root).spec;
    let expected = CbqClassFlags::ROOTCLASS | CbqClassFlags::WRR | CbqClassFlags::EFFICIENT;
    assert!(spec.flags.contains(expected));
    assert_eq!(spec.ns_per_byte, 800);

    let installed = &state.device().qdisc("em0").unwrap().classes[&class.handle()];
    assert_eq!(installed.class, KernelClass::Cbq(spec));
    assert_eq!(state.interface(em0).unwrap().classes().len(), 1);
}

#[test]
fn children_reference_parent_and_borrow_handles() {
    let (mut state, em0, root) = cbq_interface(CbqOptions::default());
    let request = CbqClassRequest::new(2_000_000).with_borrow(root).default_class();
    let child = state.add_class(em0, Some(root), "child", ClassRequest::Cbq(request)).unwrap();

    let root_handle = state.class(root).unwrap().handle();
    let spec = ledger(&state, child).spec;
    assert_eq!(spec.parent, root_handle);
    assert_eq!(spec.borrow, root_handle);
    assert!(spec.flags.contains(CbqClassFlags::BORROW | CbqClassFlags::DEFCLASS));
    assert!(!spec.flags.contains(CbqClassFlags::ROOTCLASS));
}

#[test]
fn enable_needs_a_default_class() {
    let (mut state, em0, root) = cbq_interface(CbqOptions::default());

    let err = state.enable(em0).unwrap_err();
    assert!(matches!(err, Error::ClassPermission(_)), "{err}");
    assert!(!state.interface(em0).unwrap().is_enabled());

    let default = ClassRequest::Cbq(CbqClassRequest::new(1_000_000).default_class());
    state.add_class(em0, Some(root), "default", default).unwrap();
    state.enable(em0).unwrap();
    assert!(state.device().qdisc("em0").unwrap().enabled);
}

#[test]
fn only_one_default_class() {
    let (mut state, em0, root) = cbq_interface(CbqOptions::default());
    let default = ClassRequest::Cbq(CbqClassRequest::new(1_000_000).default_class());

    state.add_class(em0, Some(root), "d1", default.clone()).unwrap();
    let err = state.add_class(em0, Some(root), "d2", default).unwrap_err();
    assert!(matches!(err, Error::ClassInvalid(_)), "{err}");
    assert_eq!(ledger(&state, root).allocated, 1_000_000);
}

#[test]
fn second_root_is_refused() {
    let (mut state, em0, _) = cbq_interface(CbqOptions::default());
    let err = state.add_class(em0, None, "root2", cbq(LINK)).unwrap_err();
    assert!(matches!(err, Error::ClassPermission(_)), "{err}");
}

#[test]
fn priority_out_of_range() {
    let (mut state, em0, root) = cbq_interface(CbqOptions::default());
    let request = ClassRequest::Cbq(CbqClassRequest::new(1_000).with_priority(8));
    let err = state.add_class(em0, Some(root), "a", request).unwrap_err();
    assert!(matches!(err, Error::OutOfRange(_)), "{err}");
    assert_eq!(ledger(&state, root).allocated, 0);
}

#[test]
fn modify_applies_ledger_delta() {
    let (mut state, em0, root) = cbq_interface(CbqOptions::default());
    let agg = state.add_class(em0, Some(root), "agg", cbq(4_000_000)).unwrap();
    state.add_class(em0, Some(agg), "leaf", cbq(3_000_000)).unwrap();

    state.modify_class(agg, cbq(8_000_000)).unwrap();
    assert_eq!(ledger(&state, root).allocated, 8_000_000);
    assert_eq!(ledger(&state, agg).request.bandwidth, 8_000_000);
    assert_eq!(ledger(&state, agg).spec.ns_per_byte, 1_000);

    let err = state.modify_class(agg, cbq(11_000_000)).unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");
    assert_eq!(ledger(&state, root).allocated, 8_000_000);
    assert_eq!(ledger(&state, agg).request.bandwidth, 8_000_000);

    let err = state.modify_class(agg, cbq(2_000_000)).unwrap_err();
    assert!(matches!(err, Error::Admission(_)), "{err}");
    assert_eq!(ledger(&state, agg).allocated, 3_000_000);
}

#[test]
fn delete_releases_bandwidth() {
    let (mut state, em0, root) = cbq_interface(CbqOptions::default());
    let agg = state.add_class(em0, Some(root), "agg", cbq(4_000_000)).unwrap();
    let leaf = state.add_class(em0, Some(agg), "leaf", cbq(3_000_000)).unwrap();

    let err = state.delete_class(agg).unwrap_err();
    assert!(matches!(err, Error::ClassPermission(_)), "{err}");

    state.delete_class(leaf).unwrap();
    state.delete_class(agg).unwrap();
    assert_eq!(ledger(&state, root).allocated, 0);
    assert_eq!(state.device().qdisc("em0").unwrap().classes.len(), 1);
}

#[test]
fn attach_needs_a_bandwidth() {
    let mut state = State::new(MemoryDevice::new());
    let err = state
        .add_interface("em0", InterfaceConfig::new(0), Box::new(CbqDiscipline::default()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)), "{err}");
    assert!(state.device().qdisc("em0").is_none());
}
