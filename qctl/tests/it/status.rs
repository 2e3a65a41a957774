use std::net::Ipv4Addr;

use qctl::{
    disc::hfsc::HfscClassRequest, ClassRequest, DisciplineKind, EntryKind, Error, FilterSpec,
    InterfaceStatus, Ipv4Match, KernelHandle,
};

use crate::hfsc_interface;

#[test]
fn entries_are_fully_qualified() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let bulk = state
        .add_class(em0, Some(root), "bulk", ClassRequest::Hfsc(HfscClassRequest::linear(4_000_000)))
        .unwrap();
    let ssh = Ipv4Match::new().with_proto(6).with_dport(22);
    state.add_filter(bulk, "ssh", FilterSpec::new(10, ssh)).unwrap();

    let entries = state.entries();
    let names: Vec<_> = entries.iter().map(|e| (e.kind, e.name.as_str())).collect();
    assert_eq!(
        names,
        [
            (EntryKind::Interface, "em0"),
            (EntryKind::Class, "em0:/root"),
            (EntryKind::Class, "em0:/root/bulk"),
            (EntryKind::Filter, "em0:/root/bulk:ssh"),
        ]
    );
    assert_eq!(entries[0].handle, KernelHandle::NONE);

    for entry in &entries[1..] {
        assert_eq!(state.name_of_handle("em0", entry.handle).as_deref(), Some(entry.name.as_str()));
    }
    assert_eq!(state.name_of_handle("em0", KernelHandle::NONE), None);
    assert_eq!(state.name_of_handle("em1", entries[1].handle), None);
    assert_eq!(state.class_name(bulk).as_deref(), Some("em0:/root/bulk"));
}

#[test]
fn interface_status_reflects_enablement() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    state
        .add_class(
            em0,
            Some(root),
            "default",
            ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000).default_class()),
        )
        .unwrap();

    let expected = |enabled| InterfaceStatus {
        name: "em0".into(),
        discipline: DisciplineKind::Hfsc,
        bandwidth: 10_000_000,
        enabled,
    };
    assert_eq!(state.interface_status("em0").unwrap(), expected(false));

    state.enable(em0).unwrap();
    assert_eq!(state.interface_status("em0").unwrap(), expected(true));

    let err = state.interface_status("em9").unwrap_err();
    assert!(matches!(err, Error::BadInterface(_)), "{err}");
}

#[test]
fn filters_are_described_by_their_match() {
    let (mut state, em0, root) = hfsc_interface(10_000_000);
    let a = state
        .add_class(em0, Some(root), "a", ClassRequest::Hfsc(HfscClassRequest::linear(1_000_000)))
        .unwrap();

    let web = Ipv4Match::new().with_dst(Ipv4Addr::new(10, 0, 0, 1)).with_dport(80).with_proto(6);
    let f = state.add_filter(a, "web", FilterSpec::new(7, web)).unwrap();
    assert_eq!(
        state.filter_description(f).unwrap(),
        "rule 7 inet dst 10.0.0.1 mask 255.255.255.255 dport 80 proto 6"
    );

    state.delete_filter(f).unwrap();
    assert!(matches!(state.filter_description(f), Err(Error::BadFilter(_))));
}
