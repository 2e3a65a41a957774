//! u32 filters built from [`FlowMatch`]es.
//!
//! Every filter is installed with protocol `ETH_P_ALL` and starts with a key on the IP version
//! nibble, so IPv4 and IPv6 filters can share a preference. Offsets are relative to the network
//! header; ports assume a header without options, as `tc`'s `match ip sport` does.

use std::net::Ipv6Addr;

use bytes::{BufMut, BytesMut};
use qctl::{FlowMatch, Ipv4Match, Ipv6Match};
use rtnetlink::packet_core::NetlinkMessage;
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcHandle},
    RouteNetlinkMessage,
};

use super::handle::QdiscRequestInner;
use super::nla::{options, put_nla};
use super::{finish, message, Mode};

/// EtherType for matching all protocols supported by Ethernet.
pub const ETH_P_ALL: u16 = nix::libc::ETH_P_ALL as u16;

// U32 filter TCA_OPTIONS sub-attributes (from linux/pkt_cls.h)
const TCA_U32_CLASSID: u16 = 1;
const TCA_U32_SEL: u16 = 5;

/// Marks a u32 filter as terminal, required for it to return a classification result.
const TC_U32_TERMINAL: u8 = 1;

/// The kernel's `tc_u32_key`. `mask` and `val` hold the bytes of the packet word in network
/// order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct U32Key {
    pub mask: u32,
    pub val: u32,
    /// Offset of the word from the network header.
    pub off: i32,
}

impl U32Key {
    const fn new(off: i32, mask: u32, val: u32) -> Self {
        Self { mask, val: val & mask, off }
    }

    fn put(self, buf: &mut BytesMut) {
        buf.put_u32(self.mask);
        buf.put_u32(self.val);
        buf.put_i32_ne(self.off);
        // offmask
        buf.put_i32_ne(0);
    }
}

/// Collects keys, folding those on the same word together.
#[derive(Debug, Default)]
struct Keys(Vec<U32Key>);

impl Keys {
    fn push(&mut self, off: i32, mask: u32, val: u32) {
        if mask == 0 {
            return;
        }
        match self.0.iter_mut().find(|k| k.off == off) {
            Some(key) => {
                key.mask |= mask;
                key.val |= val & mask;
            }
            None => self.0.push(U32Key::new(off, mask, val)),
        }
    }

    fn push_v6(&mut self, off: i32, addr: Ipv6Addr, mask: Ipv6Addr) {
        let (addr, mask) = (u128::from(addr), u128::from(mask));
        for word in 0..4 {
            let shift = 96 - 32 * word;
            self.push(off + 4 * word, (mask >> shift) as u32, (addr >> shift) as u32);
        }
    }
}

fn ports(sport: u16, dport: u16) -> (u32, u32) {
    let mask = (if sport != 0 { 0xffff_0000 } else { 0 }) | (if dport != 0 { 0xffff } else { 0 });
    (mask, (u32::from(sport) << 16) | u32::from(dport))
}

fn ipv4_keys(m: &Ipv4Match) -> Vec<U32Key> {
    let mut keys = Keys::default();
    keys.push(0, 0xf000_0000, 0x4000_0000);
    keys.push(0, u32::from(m.tos_mask) << 16, u32::from(m.tos) << 16);
    if m.proto != 0 {
        keys.push(8, 0x00ff_0000, u32::from(m.proto) << 16);
    }
    keys.push(12, u32::from(m.src_mask), u32::from(m.src));
    keys.push(16, u32::from(m.dst_mask), u32::from(m.dst));

    let (mask, val) = ports(m.sport, m.dport);
    keys.push(20, mask, val);
    if m.gpi != 0 {
        keys.push(20, u32::MAX, m.gpi);
    }
    keys.0
}

fn ipv6_keys(m: &Ipv6Match) -> Vec<U32Key> {
    let mut keys = Keys::default();
    keys.push(0, 0xf000_0000, 0x6000_0000);
    keys.push(0, u32::from(m.tclass_mask) << 20, u32::from(m.tclass) << 20);
    if m.flowlabel != 0 {
        keys.push(0, 0x000f_ffff, m.flowlabel);
    }
    if m.proto != 0 {
        keys.push(4, 0x0000_ff00, u32::from(m.proto) << 8);
    }
    keys.push_v6(8, m.src, m.src_mask);
    keys.push_v6(24, m.dst, m.dst_mask);

    let (mask, val) = ports(m.sport, m.dport);
    keys.push(40, mask, val);
    if m.gpi != 0 {
        keys.push(40, u32::MAX, m.gpi);
    }
    keys.0
}

/// The selector keys matching `flow`.
pub fn keys(flow: &FlowMatch) -> Vec<U32Key> {
    match flow {
        FlowMatch::V4(m) => ipv4_keys(m),
        FlowMatch::V6(m) => ipv6_keys(m),
    }
}

/// Builder for a u32 filter sending `flow` to a class.
///
/// Filters are checked in order of preference, lower first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U32FilterRequest {
    pub inner: QdiscRequestInner,
    pub flow: FlowMatch,
    pub class_id: u32,
    pub pref: u16,
}

impl U32FilterRequest {
    pub fn new(inner: QdiscRequestInner, flow: FlowMatch) -> Self {
        Self { inner, flow, class_id: 0, pref: 1 }
    }

    pub fn with_class_id(mut self, class_id: u32) -> Self {
        self.class_id = class_id;
        self
    }

    pub fn with_pref(mut self, pref: u16) -> Self {
        self.pref = pref;
        self
    }

    /// The `tc_u32_sel` header followed by its keys.
    fn encode_selector(&self) -> BytesMut {
        let keys = keys(&self.flow);

        let mut sel = BytesMut::with_capacity(16 + 16 * keys.len());
        sel.put_u8(TC_U32_TERMINAL);
        // offshift
        sel.put_u8(0);
        sel.put_u8(keys.len() as u8);
        // padding
        sel.put_u8(0);
        // offmask, off, offoff, hoff
        sel.put_bytes(0, 8);
        // hmask
        sel.put_u32_ne(0);
        for key in keys {
            key.put(&mut sel);
        }
        sel
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = message(&self.inner);
        // Let the kernel assign the node handle.
        tc_message.header.handle = TcHandle::from(0u32);
        tc_message.header.info = (u32::from(self.pref) << 16) | u32::from(ETH_P_ALL.to_be());
        tc_message.attributes.push(TcAttribute::Kind("u32".to_string()));

        let mut opts = BytesMut::new();
        put_nla(&mut opts, TCA_U32_CLASSID, &self.class_id.to_ne_bytes());
        put_nla(&mut opts, TCA_U32_SEL, &self.encode_selector());
        tc_message.attributes.push(TcAttribute::Other(options(opts)));

        finish(RouteNetlinkMessage::NewTrafficFilter(tc_message), Mode::Create.flags())
    }
}
