use std::net::{Ipv4Addr, Ipv6Addr};

use qctl::{
    disc::hfsc::HfscClassRequest, ClassRequest, Error, FilterSpec, Ipv4Match, Ipv6Match,
};

use crate::hfsc_interface;

const TCP: u8 = 6;
const UDP: u8 = 17;

fn web() -> Ipv4Match {
    Ipv4Match::new().with_dport(80)
}

fn web_from_host() -> Ipv4Match {
    web().with_src(Ipv4Addr::new(192, 168, 1, 7))
}

#[test]
fn broader_filter_must_come_last() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();
    let b = state
        .add_class(em0, Some(root), "b", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    state.add_filter(a, "host", FilterSpec::new(10, web_from_host())).unwrap();
    state.add_filter(b, "web", FilterSpec::new(20, web())).unwrap();

    let err = state.add_filter(b, "early-web", FilterSpec::new(5, web())).unwrap_err();
    match err {
        Error::FilterShadow { filter, existing } => {
            assert_eq!(filter, "early-web");
            assert_eq!(existing, "host");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Evaluated after "web", which already catches everything it would.
    let err = state.add_filter(a, "late-host", FilterSpec::new(30, web_from_host())).unwrap_err();
    assert!(matches!(err, Error::FilterShadow { .. }), "{err}");

    let rules: Vec<_> =
        state.interface(em0).unwrap().filters().map(|f| f.spec().rule).collect();
    assert_eq!(rules, [10, 20]);
    assert_eq!(state.device().qdisc("em0").unwrap().filters.len(), 2);
}

#[test]
fn disjoint_protocols_coexist() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    state.add_filter(a, "tcp", FilterSpec::new(10, Ipv4Match::new().with_proto(TCP))).unwrap();
    state.add_filter(a, "udp", FilterSpec::new(5, Ipv4Match::new().with_proto(UDP))).unwrap();
    state.add_filter(a, "v6", FilterSpec::new(1, Ipv6Match::new())).unwrap();

    let names: Vec<_> =
        state.interface(em0).unwrap().filters().map(|f| f.name().to_owned()).collect();
    assert_eq!(names, ["v6", "udp", "tcp"]);
}

#[test]
fn equal_rules_keep_insertion_order() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    let v6 = |last: u16| {
        Ipv6Match::new().with_dst(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last), 128)
    };
    state.add_filter(a, "first", FilterSpec::new(10, v6(1))).unwrap();
    state.add_filter(a, "second", FilterSpec::new(10, v6(2))).unwrap();

    let names: Vec<_> =
        state.interface(em0).unwrap().filters().map(|f| f.name().to_owned()).collect();
    assert_eq!(names, ["first", "second"]);
}

#[test]
fn dont_warn_only_silences_the_log() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    state.add_filter(a, "host", FilterSpec::new(10, web_from_host())).unwrap();
    let err = state
        .add_filter(a, "web", FilterSpec::new(5, web()).with_dont_warn().with_line(42))
        .unwrap_err();
    assert!(matches!(err, Error::FilterShadow { .. }));
}

#[test]
fn intersecting_filters_are_accepted() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();
    let b = state
        .add_class(em0, Some(root), "b", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    let by_src = Ipv4Match::new().with_src(Ipv4Addr::new(10, 0, 0, 1));
    let by_dst = Ipv4Match::new().with_dst(Ipv4Addr::new(10, 0, 0, 2));
    state.add_filter(a, "src", FilterSpec::new(10, by_src)).unwrap();
    state.add_filter(b, "dst", FilterSpec::new(20, by_dst)).unwrap();
    assert_eq!(state.interface(em0).unwrap().filters().count(), 2);
}

#[test]
fn deleting_a_class_deletes_its_filters() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();
    let f = state.add_filter(a, "web", FilterSpec::new(10, web())).unwrap();

    state.delete_class(a).unwrap();
    assert!(state.filter(f).is_none());
    assert_eq!(state.interface(em0).unwrap().filters().count(), 0);
    assert!(state.device().qdisc("em0").unwrap().filters.is_empty());

    assert!(matches!(state.delete_filter(f), Err(Error::BadFilter(_))));
}
