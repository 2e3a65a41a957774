use std::net::Ipv4Addr;

use qctl::{
    device::{KernelClass, QdiscParams},
    disc::hfsc::{HfscClass, HfscClassRequest, HfscDiscipline},
    ClassParams, ClassRequest, Error, FilterSpec, InterfaceConfig, Ipv4Match, MemoryDevice,
};
use qctl_curve::ServiceCurve;

use crate::{hfsc_interface, params, State};

const LINK: u64 = 10_000_000;

fn hfsc(request: HfscClassRequest) -> ClassRequest {
    ClassRequest::Hfsc(request)
}

fn gens(params: &ClassParams) -> &HfscClass {
    match params {
        ClassParams::Hfsc(c) => c,
        other => panic!("not an hfsc class: {other:?}"),
    }
}

#[test]
fn admitted_curves_stay_under_the_parent() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut state, em0, root) = hfsc_interface(LINK);

    let burst = HfscClassRequest::new(
        ServiceCurve::new(8_000_000, 10, 2_000_000),
        ServiceCurve::linear(2_000_000),
    );
    state.add_class(em0, Some(root), "burst", hfsc(burst)).unwrap();

    let after_add = params(&state, root);
    let parent = gens(&after_add);
    assert!(parent.gen_rsc.is_under(&ServiceCurve::linear(LINK)));
    assert!(parent.gen_fsc.is_under(&ServiceCurve::linear(LINK)));
    assert!(!parent.gen_rsc.is_empty());

    // Fits in the long run, not during the first 10ms.
    let err = state
        .add_class(em0, Some(root), "late", hfsc(HfscClassRequest::linear(3_000_000)))
        .unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");
    assert_eq!(params(&state, root), after_add);
    assert!(state.find_class(em0, "late").is_none());

    state
        .add_class(em0, Some(root), "rest", hfsc(HfscClassRequest::linear(2_000_000)))
        .unwrap();
}

#[test]
fn link_sharing_only_classes_skip_the_real_time_sum() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    let ls = HfscClassRequest::link_sharing(ServiceCurve::linear(9_000_000));
    state.add_class(em0, Some(root), "ls", hfsc(ls)).unwrap();

    let root_params = params(&state, root);
    assert!(gens(&root_params).gen_rsc.is_empty());
    assert!(!gens(&root_params).gen_fsc.is_empty());
}

#[test]
fn invalid_curves_are_refused() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    let convex = HfscClassRequest::new(ServiceCurve::new(1_000, 5, 2_000), ServiceCurve::linear(1));
    let err = state.add_class(em0, Some(root), "bad", hfsc(convex)).unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)), "{err}");
}

#[test]
fn enable_needs_a_default_leaf() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    state
        .add_class(em0, Some(root), "a", hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    let err = state.enable(em0).unwrap_err();
    assert!(err.is_class_error(), "{err}");
    assert!(matches!(err, Error::Class(_)));

    let b = state
        .add_class(em0, Some(root), "b", hfsc(HfscClassRequest::linear(1_000_000).default_class()))
        .unwrap();
    state.enable(em0).unwrap();

    let default_class = state.class(b).unwrap().handle();
    assert_eq!(
        state.device().qdisc("em0").unwrap().params,
        QdiscParams::Hfsc { default_class }
    );
}

#[test]
fn default_class_must_be_a_leaf() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    let default = hfsc(HfscClassRequest::linear(5_000_000).default_class());
    let agg = state.add_class(em0, Some(root), "agg", default).unwrap();
    state
        .add_class(em0, Some(agg), "leaf", hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    let err = state.enable(em0).unwrap_err();
    assert!(matches!(err, Error::Class(_)), "{err}");
}

#[test]
fn internal_classes_cannot_have_filters() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    let agg = state
        .add_class(em0, Some(root), "agg", hfsc(HfscClassRequest::linear(5_000_000)))
        .unwrap();
    let default = hfsc(HfscClassRequest::linear(1_000_000).default_class());
    state.add_class(em0, Some(agg), "leaf", default).unwrap();
    let web = Ipv4Match::new().with_dst(Ipv4Addr::new(10, 0, 0, 1)).with_dport(80);
    let filter = state.add_filter(agg, "web", FilterSpec::new(10, web)).unwrap();

    assert!(matches!(state.enable(em0), Err(Error::Class(_))));

    state.delete_filter(filter).unwrap();
    state.enable(em0).unwrap();
}

#[test]
fn modify_checks_parent_and_children() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    let agg = state
        .add_class(em0, Some(root), "agg", hfsc(HfscClassRequest::linear(5_000_000)))
        .unwrap();
    state
        .add_class(em0, Some(agg), "leaf", hfsc(HfscClassRequest::linear(4_000_000)))
        .unwrap();
    let root_before = params(&state, root);
    let agg_before = params(&state, agg);

    let err = state.modify_class(agg, hfsc(HfscClassRequest::linear(3_000_000))).unwrap_err();
    assert!(matches!(err, Error::Admission(_)), "{err}");

    let err = state.modify_class(agg, hfsc(HfscClassRequest::linear(11_000_000))).unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");
    assert_eq!(params(&state, root), root_before);
    assert_eq!(params(&state, agg), agg_before);

    let grown = HfscClassRequest::linear(8_000_000);
    state.modify_class(agg, hfsc(grown.clone())).unwrap();
    assert_eq!(gens(&params(&state, agg)).request, grown);

    let handle = state.class(agg).unwrap().handle();
    let installed = &state.device().qdisc("em0").unwrap().classes[&handle];
    assert_eq!(installed.class, KernelClass::Hfsc(grown));
}

#[test]
fn root_is_bounded_by_the_link() {
    let mut state = State::new(MemoryDevice::new());
    let em0 = state
        .add_interface("em0", InterfaceConfig::new(LINK), Box::new(HfscDiscipline::new()))
        .unwrap();

    let err = state
        .add_class(em0, None, "root", hfsc(HfscClassRequest::linear(100_000_000)))
        .unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");
    assert!(err.is_admission_error());
    assert!(state.find_class(em0, "root").is_none());
    assert!(state.device().qdisc("em0").unwrap().classes.is_empty());

    let burst = HfscClassRequest::link_sharing(ServiceCurve::new(2 * LINK, 10, LINK));
    let err = state.add_class(em0, None, "root", hfsc(burst)).unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");

    let root = state.add_class(em0, None, "root", hfsc(HfscClassRequest::linear(LINK))).unwrap();
    let err = state.modify_class(root, hfsc(HfscClassRequest::linear(2 * LINK))).unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");
    assert_eq!(gens(&params(&state, root)).request, HfscClassRequest::linear(LINK));

    state.modify_class(root, hfsc(HfscClassRequest::linear(LINK / 2))).unwrap();
    let err = state
        .add_class(em0, Some(root), "a", hfsc(HfscClassRequest::linear(LINK)))
        .unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");
}

#[test]
fn delete_restores_the_parent_sum() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    state
        .add_class(em0, Some(root), "a", hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();
    let before = params(&state, root);

    let concave = HfscClassRequest::new(
        ServiceCurve::new(6_000_000, 20, 1_000_000),
        ServiceCurve::new(0, 5, 3_000_000),
    );
    let b = state.add_class(em0, Some(root), "b", hfsc(concave)).unwrap();
    assert_ne!(params(&state, root), before);

    state.delete_class(b).unwrap();
    assert_eq!(params(&state, root), before);
}

#[test]
fn failed_install_rolls_back_admission() {
    let (mut state, em0, root) = hfsc_interface(LINK);
    let before = params(&state, root);

    state.device_mut().fail_next("add_class", 12);
    let err = state
        .add_class(em0, Some(root), "a", hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap_err();
    assert!(matches!(err, Error::SysCall(_)), "{err}");
    assert_eq!(params(&state, root), before);
    assert_eq!(state.interface(em0).unwrap().classes().len(), 1);
}
