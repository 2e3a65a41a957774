use qctl::{
    device::QdiscParams,
    disc::{
        hfsc::{HfscClassRequest, HfscDiscipline},
        leaf::{FifoParams, LeafDiscipline, LeafParams, RedParams},
        nop::NopDiscipline,
        priq::{PriqClassRequest, PriqDiscipline},
    },
    ClassRequest, DisciplineKind, Error, InterfaceConfig, MemoryDevice, TbProfile,
};

use crate::{hfsc_interface, State};

#[test]
fn children_are_linked_exactly_once() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut state, em0, root) = hfsc_interface(10_000_000);

    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(2_000_000)))
        .unwrap();
    let b = state
        .add_class(em0, Some(root), "b", ClassRequest::Hfsc(HfscClassRequest::linear(2_000_000)))
        .unwrap();
    let c = state
        .add_class(em0, Some(a), "c", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    let classes = state.interface(em0).unwrap().classes();
    assert_eq!(classes.get(root).unwrap().children(), &[a, b]);
    assert_eq!(classes.get(a).unwrap().children(), &[c]);
    assert_eq!(classes.get(c).unwrap().parent(), Some(a));
    assert_eq!(classes.roots().count(), 1);
    assert_eq!(classes.path(c), ["root", "a", "c"]);

    state.delete_class(c).unwrap();
    let classes = state.interface(em0).unwrap().classes();
    assert!(classes.get(a).unwrap().is_leaf());
    assert!(state.class(c).is_none());
    assert_eq!(classes.len(), 3);
}

#[test]
fn interfaces_start_disabled_and_cleared() {
    let mut state = State::new(MemoryDevice::new());
    state
        .add_interface("em0", InterfaceConfig::new(1_000_000), Box::new(HfscDiscipline::new()))
        .unwrap();

    assert_eq!(state.device().calls(), ["attach em0", "disable em0", "clear em0"]);
    assert!(!state.interface_by_name("em0").unwrap().is_enabled());
}

#[test]
fn interface_names_are_unique() {
    let (mut state, _, _) = hfsc_interface(10_000_000);
    let err = state
        .add_interface("em0", InterfaceConfig::new(1_000_000), Box::new(HfscDiscipline::new()))
        .unwrap_err();
    assert!(matches!(err, Error::BadInterface(_)), "{err}");
}

#[test]
fn failed_attach_leaves_nothing_behind() {
    let mut state = State::new(MemoryDevice::new());
    state.device_mut().fail_next("attach", 19);

    let err = state
        .add_interface("em0", InterfaceConfig::new(1_000_000), Box::new(HfscDiscipline::new()))
        .unwrap_err();
    assert!(matches!(err, Error::SysCall(_)), "{err}");
    assert!(state.interface_by_name("em0").is_none());

    state
        .add_interface("em0", InterfaceConfig::new(1_000_000), Box::new(HfscDiscipline::new()))
        .unwrap();
}

#[test]
fn token_bucket_round_trip() {
    let before = TbProfile::new(7_000_000, 4_000);
    let device = MemoryDevice::new().with_token_bucket("em0", before);
    let mut state = State::new(device);

    let config = InterfaceConfig::new(10_000_000).with_token_bucket(TbProfile::new(5_000_000, 0));
    let em0 = state.add_interface("em0", config, Box::new(PriqDiscipline::new())).unwrap();
    let default = ClassRequest::Priq(PriqClassRequest::new(0).default_class());
    state.add_class(em0, None, "default", default).unwrap();
    assert_eq!(state.device().token_bucket_of("em0"), before);

    state.enable(em0).unwrap();
    assert_eq!(state.device().token_bucket_of("em0"), TbProfile::new(5_000_000, 6_000));
    assert!(state.token_buckets().is_installed("em0"));

    state.disable(em0).unwrap();
    assert_eq!(state.device().token_bucket_of("em0"), before);

    state.enable(em0).unwrap();
    state.delete_interface(em0).unwrap();
    assert_eq!(state.device().token_bucket_of("em0"), before);
    assert_eq!(state.token_buckets().profile("em0"), None);
}

#[test]
fn failed_enable_keeps_the_interface_disabled() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    state
        .add_class(
            em0,
            Some(root),
            "default",
            ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000).default_class()),
        )
        .unwrap();

    state.device_mut().fail_next("enable", 1);
    assert!(matches!(state.enable(em0), Err(Error::SysCall(_))));
    assert!(!state.interface(em0).unwrap().is_enabled());

    state.enable(em0).unwrap();
    assert!(state.interface(em0).unwrap().is_enabled());
}

#[test]
fn teardown_is_best_effort() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    state.device_mut().fail_next("detach", 16);
    let err = state.delete_interface(em0).unwrap_err();
    assert!(matches!(err, Error::SysCall(_)), "{err}");
    assert!(state.interface(em0).is_none());
    assert!(state.interface_by_name("em0").is_none());

    // The device still holds the scheduler, with every class removed.
    assert!(state.device().qdisc("em0").unwrap().classes.is_empty());
}

#[test]
fn reservation_class_follows_deletion() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let rsvp = state
        .add_class(em0, Some(root), "rsvp", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    state.set_reservation_class(em0, Some(rsvp)).unwrap();
    assert_eq!(state.interface(em0).unwrap().reservation_class(), Some(rsvp));

    state.delete_class(rsvp).unwrap();
    assert_eq!(state.interface(em0).unwrap().reservation_class(), None);
    assert!(matches!(state.set_reservation_class(em0, Some(rsvp)), Err(Error::BadClass(_))));
}

#[test]
fn leaf_disciplines_have_no_classes() {
    let mut state = State::new(MemoryDevice::new());
    let red = LeafParams::Red(RedParams::default());
    let em0 = state
        .add_interface("em0", InterfaceConfig::new(1_000_000), Box::new(LeafDiscipline::new(red)))
        .unwrap();

    let err = state.add_class(em0, None, "a", ClassRequest::None).unwrap_err();
    assert!(matches!(err, Error::ClassInvalid(_)), "{err}");

    state.enable(em0).unwrap();
    let qdisc = state.device().qdisc("em0").unwrap();
    assert_eq!(qdisc.kind, DisciplineKind::Red);
    assert_eq!(qdisc.params, QdiscParams::Leaf(red));

    let fifo = LeafParams::Fifo(FifoParams { qlimit: 0 });
    let err = state
        .add_interface("em1", InterfaceConfig::new(1_000_000), Box::new(LeafDiscipline::new(fifo)))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)), "{err}");
}

#[test]
fn priq_classes_are_flat() {
    let mut state = State::new(MemoryDevice::new());
    let em0 = state
        .add_interface("em0", InterfaceConfig::new(1_000_000), Box::new(PriqDiscipline::new()))
        .unwrap();

    let high = state
        .add_class(em0, None, "high", ClassRequest::Priq(PriqClassRequest::new(7)))
        .unwrap();
    let err = state
        .add_class(em0, None, "clash", ClassRequest::Priq(PriqClassRequest::new(7)))
        .unwrap_err();
    assert!(matches!(err, Error::ClassInvalid(_)), "{err}");

    let err = state
        .add_class(em0, Some(high), "child", ClassRequest::Priq(PriqClassRequest::new(1)))
        .unwrap_err();
    assert!(matches!(err, Error::ClassInvalid(_)), "{err}");

    assert!(matches!(state.enable(em0), Err(Error::Class(_))));

    let low = state
        .add_class(em0, None, "low", ClassRequest::Priq(PriqClassRequest::new(1).default_class()))
        .unwrap();
    state.enable(em0).unwrap();

    let default_class = state.class(low).unwrap().handle();
    assert_eq!(
        state.device().qdisc("em0").unwrap().params,
        QdiscParams::Priq { default_class, bands: 8 }
    );

    state.modify_class(high, ClassRequest::Priq(PriqClassRequest::new(3))).unwrap();
    state
        .add_class(em0, None, "again", ClassRequest::Priq(PriqClassRequest::new(7)))
        .unwrap();
}

#[test]
fn none_discipline_touches_nothing() {
    let mut state = State::new(MemoryDevice::new());
    let lo0 = state
        .add_interface("lo0", InterfaceConfig::new(1_000_000), Box::new(NopDiscipline))
        .unwrap();

    let a = state.add_class(lo0, None, "a", ClassRequest::None).unwrap();
    let err = state.add_class(lo0, None, "b", ClassRequest::None).unwrap_err();
    assert!(matches!(err, Error::ClassPermission(_)), "{err}");
    state.add_class(lo0, Some(a), "c", ClassRequest::None).unwrap();
    assert!(state.find_class(lo0, "b").is_none());
    state.enable(lo0).unwrap();
    state.delete_interface(lo0).unwrap();

    assert!(state.device().calls().is_empty());
}
