use std::net::Ipv4Addr;

use qctl::{
    disc::{
        cbq::{CbqClassRequest, CbqOptions},
        cdnr::{Action, ConditionerElement},
        hfsc::HfscClassRequest,
        leaf::{LeafParams, RedParams},
    },
    ClassParams, Declaration, DisciplineConfig, Error, FilterSpec, InterfaceConfig, Ipv4Match,
    MemoryDevice, NamedRequest, TbProfile, TrafficControlState,
};

fn hfsc(request: HfscClassRequest) -> NamedRequest {
    NamedRequest::Hfsc(request)
}

fn config() -> Vec<Declaration> {
    let ssh = Ipv4Match::new().with_proto(6).with_dport(22);
    let web = Ipv4Match::new().with_proto(6).with_dport(80);

    vec![
        Declaration::interface(
            "em0",
            InterfaceConfig::new(10_000_000).with_token_bucket(TbProfile::default()),
            DisciplineConfig::Hfsc,
        ),
        Declaration::class(
            "em0",
            "interactive",
            Some("root"),
            hfsc(HfscClassRequest::linear(2_000_000)),
        ),
        Declaration::class(
            "em0",
            "bulk",
            Some("root"),
            hfsc(HfscClassRequest::linear(6_000_000).default_class()),
        ),
        Declaration::filter("em0", "interactive", "ssh", FilterSpec::new(10, ssh).with_line(5)),
        Declaration::filter("em0", "bulk", "web", FilterSpec::new(20, web).with_line(6)),
        Declaration::interface(
            "em1",
            InterfaceConfig::new(100_000_000),
            DisciplineConfig::Cbq(CbqOptions::default().with_wrr(true)),
        ),
        Declaration::class(
            "em1",
            "root",
            None,
            NamedRequest::Cbq { request: CbqClassRequest::new(100_000_000), borrow: None },
        ),
        Declaration::class(
            "em1",
            "default",
            Some("root"),
            NamedRequest::Cbq {
                request: CbqClassRequest::new(40_000_000).default_class(),
                borrow: Some("root".into()),
            },
        ),
        Declaration::interface(
            "em2",
            InterfaceConfig::new(1_000_000),
            DisciplineConfig::Leaf(LeafParams::Red(RedParams::default())),
        ),
    ]
}

#[test]
fn init_applies_and_enables_everything() {
    let _ = tracing_subscriber::fmt::try_init();
    let state = TrafficControlState::init(MemoryDevice::new(), &config()).unwrap();

    assert_eq!(state.interfaces().count(), 3);
    assert!(state.interfaces().all(|i| i.is_enabled()));

    let em0 = state.interface_by_name("em0").unwrap();
    assert_eq!(em0.classes().len(), 3);
    assert_eq!(em0.filters().count(), 2);
    assert_eq!(state.device().token_bucket_of("em0"), TbProfile::new(10_000_000, 6_000));

    let em1 = state.interface_by_name("em1").unwrap();
    let root = em1.classes().find("root").unwrap().id();
    let default = em1.classes().find("default").unwrap();
    assert_eq!(default.parent(), Some(root));
}

#[test]
fn failure_tears_everything_down() {
    let mut decls = config();
    // Over-commits em0's root.
    decls.push(Declaration::class(
        "em0",
        "video",
        Some("root"),
        hfsc(HfscClassRequest::linear(3_000_000)),
    ));

    let mut state = TrafficControlState::new(MemoryDevice::new());
    let err = state.reload(&decls).unwrap_err();
    assert!(matches!(err, Error::AdmissionNoBandwidth(_)), "{err}");

    assert_eq!(state.interfaces().count(), 0);
    for name in ["em0", "em1", "em2"] {
        assert!(state.device().qdisc(name).is_none(), "{name} left attached");
    }
    assert_eq!(state.device().token_bucket_of("em0"), TbProfile::default());
}

#[test]
fn enable_failure_tears_everything_down() {
    let decls = vec![
        Declaration::interface("em0", InterfaceConfig::new(10_000_000), DisciplineConfig::Hfsc),
        Declaration::class("em0", "a", Some("root"), hfsc(HfscClassRequest::linear(1_000_000))),
    ];

    let mut state = TrafficControlState::new(MemoryDevice::new());
    let err = state.reload(&decls).unwrap_err();
    assert!(matches!(err, Error::Class(_)), "{err}");
    assert_eq!(state.interfaces().count(), 0);
}

#[test]
fn reload_replaces_the_configuration() {
    let mut state = TrafficControlState::init(MemoryDevice::new(), &config()).unwrap();

    let em3 = InterfaceConfig::new(1_000_000);
    let smaller = vec![Declaration::interface("em3", em3, DisciplineConfig::None)];
    state.reload(&smaller).unwrap();

    assert_eq!(state.interfaces().map(|i| i.name().to_owned()).collect::<Vec<_>>(), ["em3"]);
    assert!(state.device().qdisc("em0").is_none());

    state.disable_all().unwrap();
    assert!(state.interfaces().all(|i| !i.is_enabled()));
}

#[test]
fn conditioner_elements_resolve_by_name() {
    let mark = Ipv4Match::new().with_src(Ipv4Addr::new(10, 1, 0, 0));
    let decls = vec![
        Declaration::interface(
            "in0",
            InterfaceConfig::new(0).input(),
            DisciplineConfig::Conditioner,
        ),
        Declaration::class(
            "in0",
            "dropper",
            None,
            NamedRequest::Conditioner(ConditionerElement::Action(Action::Drop)),
        ),
        Declaration::class(
            "in0",
            "meter",
            None,
            NamedRequest::Conditioner(ConditionerElement::TokenBucket {
                profile: TbProfile::new(1_000_000, 3_000),
                in_action: Action::Pass,
                out_action: Action::Element("dropper".into()),
            }),
        ),
        Declaration::filter("in0", "meter", "clients", FilterSpec::new(1, mark)),
    ];

    let state = TrafficControlState::init(MemoryDevice::new(), &decls).unwrap();
    let in0 = state.interface_by_name("in0").unwrap();
    let holder = in0.classes().find(qctl::CONDITIONER_HOLDER).unwrap().id();
    let dropper = in0.classes().find("dropper").unwrap().id();
    let meter = in0.classes().find("meter").unwrap();

    assert_eq!(meter.parent(), Some(holder));
    let ClassParams::Conditioner(ConditionerElement::TokenBucket { out_action, .. }) =
        meter.params()
    else {
        panic!("meter is not a token bucket: {:?}", meter.params());
    };
    assert_eq!(*out_action, Action::Element(dropper));
}
