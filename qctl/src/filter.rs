//! Packet match specifications and the conflict classifier.
//!
//! Filters on an interface are evaluated by rule number. Before a new filter is installed it is
//! compared against every existing one with [`relation`], which tells whether two filters can
//! match the same packet and, if so, whether one of them makes the other unreachable.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

/// An IPv4 match. Zero fields and unspecified addresses are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Match {
    /// Source address, already masked.
    pub src: Ipv4Addr,
    /// Netmask applied to the source address.
    pub src_mask: Ipv4Addr,
    /// Destination address, already masked.
    pub dst: Ipv4Addr,
    /// Netmask applied to the destination address.
    pub dst_mask: Ipv4Addr,
    /// Source port.
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// IP protocol number.
    pub proto: u8,
    /// TOS bits, already masked.
    pub tos: u8,
    /// The TOS bits that are compared.
    pub tos_mask: u8,
    /// Generalized port identifier (e.g. the IPsec SPI).
    pub gpi: u32,
}

impl Default for Ipv4Match {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::UNSPECIFIED,
            src_mask: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            dst_mask: Ipv4Addr::UNSPECIFIED,
            sport: 0,
            dport: 0,
            proto: 0,
            tos: 0,
            tos_mask: 0,
            gpi: 0,
        }
    }
}

impl Ipv4Match {
    /// Creates a match that matches every IPv4 packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match on an exact source address.
    pub fn with_src(self, src: Ipv4Addr) -> Self {
        self.with_src_masked(src, Ipv4Addr::BROADCAST)
    }

    /// Match on the source address bits selected by `mask`.
    pub fn with_src_masked(mut self, src: Ipv4Addr, mask: Ipv4Addr) -> Self {
        self.src = src & mask;
        self.src_mask = mask;
        self
    }

    /// Match on an exact destination address.
    pub fn with_dst(self, dst: Ipv4Addr) -> Self {
        self.with_dst_masked(dst, Ipv4Addr::BROADCAST)
    }

    /// Match on the destination address bits selected by `mask`.
    pub fn with_dst_masked(mut self, dst: Ipv4Addr, mask: Ipv4Addr) -> Self {
        self.dst = dst & mask;
        self.dst_mask = mask;
        self
    }

    /// Match on the source port.
    pub const fn with_sport(mut self, port: u16) -> Self {
        self.sport = port;
        self
    }

    /// Match on the destination port.
    pub const fn with_dport(mut self, port: u16) -> Self {
        self.dport = port;
        self
    }

    /// Match on the IP protocol number.
    pub const fn with_proto(mut self, proto: u8) -> Self {
        self.proto = proto;
        self
    }

    /// Match on the TOS bits selected by `mask`.
    pub const fn with_tos(mut self, tos: u8, mask: u8) -> Self {
        self.tos = tos & mask;
        self.tos_mask = mask;
        self
    }

    /// Match on the generalized port identifier.
    pub const fn with_gpi(mut self, gpi: u32) -> Self {
        self.gpi = gpi;
        self
    }
}

/// An IPv6 match. Zero fields and unspecified addresses are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Match {
    /// Source prefix, already masked.
    pub src: Ipv6Addr,
    /// Mask of the source prefix.
    pub src_mask: Ipv6Addr,
    /// Destination prefix, already masked.
    pub dst: Ipv6Addr,
    /// Mask of the destination prefix.
    pub dst_mask: Ipv6Addr,
    /// Source port.
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// Next header protocol number.
    pub proto: u8,
    /// Traffic class bits, already masked.
    pub tclass: u8,
    /// The traffic class bits that are compared.
    pub tclass_mask: u8,
    /// 20-bit flow label.
    pub flowlabel: u32,
    /// Generalized port identifier.
    pub gpi: u32,
}

impl Default for Ipv6Match {
    fn default() -> Self {
        Self {
            src: Ipv6Addr::UNSPECIFIED,
            src_mask: Ipv6Addr::UNSPECIFIED,
            dst: Ipv6Addr::UNSPECIFIED,
            dst_mask: Ipv6Addr::UNSPECIFIED,
            sport: 0,
            dport: 0,
            proto: 0,
            tclass: 0,
            tclass_mask: 0,
            flowlabel: 0,
            gpi: 0,
        }
    }
}

impl Ipv6Match {
    /// Creates a match that matches every IPv6 packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match on the first `prefix_len` bits of the source address.
    pub fn with_src(mut self, src: Ipv6Addr, prefix_len: u8) -> Self {
        let mask = prefix_mask(prefix_len);
        self.src = Ipv6Addr::from(u128::from(src) & mask);
        self.src_mask = Ipv6Addr::from(mask);
        self
    }

    /// Match on the first `prefix_len` bits of the destination address.
    pub fn with_dst(mut self, dst: Ipv6Addr, prefix_len: u8) -> Self {
        let mask = prefix_mask(prefix_len);
        self.dst = Ipv6Addr::from(u128::from(dst) & mask);
        self.dst_mask = Ipv6Addr::from(mask);
        self
    }

    /// Match on the source port.
    pub const fn with_sport(mut self, port: u16) -> Self {
        self.sport = port;
        self
    }

    /// Match on the destination port.
    pub const fn with_dport(mut self, port: u16) -> Self {
        self.dport = port;
        self
    }

    /// Match on the IP protocol number.
    pub const fn with_proto(mut self, proto: u8) -> Self {
        self.proto = proto;
        self
    }

    /// Match on the traffic class bits selected by `mask`.
    pub const fn with_tclass(mut self, tclass: u8, mask: u8) -> Self {
        self.tclass = tclass & mask;
        self.tclass_mask = mask;
        self
    }

    /// Match on the flow label. Only the low 20 bits are kept.
    pub const fn with_flowlabel(mut self, label: u32) -> Self {
        self.flowlabel = label & 0x000f_ffff;
        self
    }

    /// Match on the generalized port identifier.
    pub const fn with_gpi(mut self, gpi: u32) -> Self {
        self.gpi = gpi;
        self
    }
}

fn prefix_mask(prefix_len: u8) -> u128 {
    match prefix_len {
        0 => 0,
        len if len >= 128 => u128::MAX,
        len => u128::MAX << (128 - u32::from(len)),
    }
}

/// What a filter matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMatch {
    V4(Ipv4Match),
    V6(Ipv6Match),
}

impl From<Ipv4Match> for FlowMatch {
    fn from(m: Ipv4Match) -> Self {
        Self::V4(m)
    }
}

impl From<Ipv6Match> for FlowMatch {
    fn from(m: Ipv6Match) -> Self {
        Self::V6(m)
    }
}

/// A filter as requested by the configuration: a match plus its rule number.
///
/// Lower rule numbers are evaluated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSpec {
    /// Evaluation order, lowest first.
    pub rule: u32,
    /// The packets the filter claims.
    pub flow: FlowMatch,
    /// Suppresses ordering diagnostics involving this filter.
    pub dont_warn: bool,
    /// The configuration line the filter was declared on.
    pub line: Option<u32>,
}

impl FilterSpec {
    /// A filter for `flow` at rule number `rule`.
    pub fn new(rule: u32, flow: impl Into<FlowMatch>) -> Self {
        Self { rule, flow: flow.into(), dont_warn: false, line: None }
    }

    /// Silences ordering diagnostics. Shadowed filters are still rejected.
    pub const fn with_dont_warn(mut self) -> Self {
        self.dont_warn = true;
        self
    }

    /// Records the configuration line for diagnostics.
    pub const fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

/// How a filter `front`, evaluated first, relates to a filter `back` evaluated after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRelation {
    /// No packet matches both.
    Disjoint,
    /// Every packet matching `front` matches `back`.
    Subset,
    /// Every packet matching `back` matches `front`: `back` never fires.
    Superset,
    /// Some packets match both.
    Intersect,
    /// The overlap requires a packet whose source and destination ports are both the ones
    /// configured, which does not happen for client/server traffic.
    PortIntersect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Containment {
    No,
    Yes,
    PortIntersect,
}

/// Classifies the relation between two filters.
pub fn relation(front: &FlowMatch, back: &FlowMatch) -> FilterRelation {
    let (forward, backward) = match (front, back) {
        (FlowMatch::V4(f), FlowMatch::V4(b)) => {
            if disjoint_v4(f, b) {
                return FilterRelation::Disjoint;
            }
            (subset_v4(f, b), subset_v4(b, f))
        }
        (FlowMatch::V6(f), FlowMatch::V6(b)) => {
            if disjoint_v6(f, b) {
                return FilterRelation::Disjoint;
            }
            (subset_v6(f, b), subset_v6(b, f))
        }
        _ => return FilterRelation::Disjoint,
    };

    match (forward, backward) {
        (Containment::Yes, _) => FilterRelation::Subset,
        (_, Containment::Yes) => FilterRelation::Superset,
        // Only the forward comparison decides; a port clash seen from `back` alone still
        // leaves packets both filters could claim.
        (Containment::PortIntersect, _) => FilterRelation::PortIntersect,
        _ => FilterRelation::Intersect,
    }
}

/// Both sides constrain the field and disagree.
fn conflicts<T: PartialEq + Default>(a: T, b: T) -> bool {
    let any = T::default();
    a != any && b != any && a != b
}

fn disjoint_v4(front: &Ipv4Match, back: &Ipv4Match) -> bool {
    if conflicts(front.proto, back.proto)
        || conflicts(front.sport, back.sport)
        || conflicts(front.dport, back.dport)
        || conflicts(front.gpi, back.gpi)
    {
        return true;
    }

    let masked_differ = |a: Ipv4Addr, am: Ipv4Addr, b: Ipv4Addr, bm: Ipv4Addr| {
        if a.is_unspecified() || b.is_unspecified() {
            return false;
        }
        let mask = u32::from(am) & u32::from(bm);
        u32::from(a) & mask != u32::from(b) & mask
    };
    if masked_differ(front.src, front.src_mask, back.src, back.src_mask)
        || masked_differ(front.dst, front.dst_mask, back.dst, back.dst_mask)
    {
        return true;
    }

    if front.tos != 0 && back.tos != 0 {
        let mask = front.tos_mask & back.tos_mask;
        if front.tos & mask != back.tos & mask {
            return true;
        }
    }

    false
}

fn disjoint_v6(front: &Ipv6Match, back: &Ipv6Match) -> bool {
    if conflicts(front.proto, back.proto)
        || conflicts(front.flowlabel, back.flowlabel)
        || conflicts(front.sport, back.sport)
        || conflicts(front.dport, back.dport)
        || conflicts(front.gpi, back.gpi)
    {
        return true;
    }

    let masked_differ = |a: Ipv6Addr, am: Ipv6Addr, b: Ipv6Addr, bm: Ipv6Addr| {
        if a.is_unspecified() || b.is_unspecified() {
            return false;
        }
        let mask = u128::from(am) & u128::from(bm);
        u128::from(a) & mask != u128::from(b) & mask
    };
    if masked_differ(front.src, front.src_mask, back.src, back.src_mask)
        || masked_differ(front.dst, front.dst_mask, back.dst, back.dst_mask)
    {
        return true;
    }

    if front.tclass != 0 && back.tclass != 0 {
        let mask = front.tclass_mask & back.tclass_mask;
        if front.tclass & mask != back.tclass & mask {
            return true;
        }
    }

    false
}

/// `front` leaves unconstrained a field that `back` constrains.
fn looser<T: PartialEq + Default>(front: T, back: T) -> bool {
    let any = T::default();
    front == any && back != any
}

/// A port left open by `front` but set by `back` means `front` is broader, unless `front` sets the
/// opposite port: then a shared packet would have to carry both configured ports at once.
fn ports_contained(
    front_sport: u16,
    front_dport: u16,
    back_sport: u16,
    back_dport: u16,
) -> Containment {
    if looser(front_sport, back_sport) {
        return if front_dport > 0 {
            Containment::PortIntersect
        } else {
            Containment::No
        };
    }
    if looser(front_dport, back_dport) {
        return if front_sport > 0 {
            Containment::PortIntersect
        } else {
            Containment::No
        };
    }
    Containment::Yes
}

fn subset_v4(front: &Ipv4Match, back: &Ipv4Match) -> Containment {
    if looser(front.proto, back.proto) || looser(front.gpi, back.gpi) {
        return Containment::No;
    }

    let addr_contained = |a: Ipv4Addr, am: Ipv4Addr, b: Ipv4Addr, bm: Ipv4Addr| {
        if a.is_unspecified() {
            return b.is_unspecified();
        }
        b.is_unspecified() || !u32::from(am) & u32::from(bm) == 0
    };
    if !addr_contained(front.src, front.src_mask, back.src, back.src_mask)
        || !addr_contained(front.dst, front.dst_mask, back.dst, back.dst_mask)
    {
        return Containment::No;
    }

    if !front.tos_mask & back.tos_mask != 0 {
        return Containment::No;
    }

    ports_contained(front.sport, front.dport, back.sport, back.dport)
}

fn subset_v6(front: &Ipv6Match, back: &Ipv6Match) -> Containment {
    if looser(front.proto, back.proto)
        || looser(front.gpi, back.gpi)
        || looser(front.flowlabel, back.flowlabel)
    {
        return Containment::No;
    }

    let addr_contained = |a: Ipv6Addr, am: Ipv6Addr, b: Ipv6Addr, bm: Ipv6Addr| {
        if a.is_unspecified() {
            return b.is_unspecified();
        }
        b.is_unspecified() || !u128::from(am) & u128::from(bm) == 0
    };
    if !addr_contained(front.src, front.src_mask, back.src, back.src_mask)
        || !addr_contained(front.dst, front.dst_mask, back.dst, back.dst_mask)
    {
        return Containment::No;
    }

    if !front.tclass_mask & back.tclass_mask != 0 {
        return Containment::No;
    }

    ports_contained(front.sport, front.dport, back.sport, back.dport)
}

impl fmt::Display for Ipv4Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("inet")?;
        if !self.dst.is_unspecified() {
            write!(f, " dst {} mask {}", self.dst, self.dst_mask)?;
        }
        if self.dport != 0 {
            write!(f, " dport {}", self.dport)?;
        }
        if !self.src.is_unspecified() {
            write!(f, " src {} mask {}", self.src, self.src_mask)?;
        }
        if self.sport != 0 {
            write!(f, " sport {}", self.sport)?;
        }
        if self.proto != 0 {
            write!(f, " proto {}", self.proto)?;
        }
        if self.tos_mask != 0 {
            write!(f, " tos {:#04x} tosmask {:#04x}", self.tos, self.tos_mask)?;
        }
        if self.gpi != 0 {
            write!(f, " gpi {:#x}", self.gpi)?;
        }
        Ok(())
    }
}

impl fmt::Display for Ipv6Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("inet6")?;
        if !self.dst.is_unspecified() {
            write!(f, " dst {}/{}", self.dst, u128::from(self.dst_mask).count_ones())?;
        }
        if self.dport != 0 {
            write!(f, " dport {}", self.dport)?;
        }
        if !self.src.is_unspecified() {
            write!(f, " src {}/{}", self.src, u128::from(self.src_mask).count_ones())?;
        }
        if self.sport != 0 {
            write!(f, " sport {}", self.sport)?;
        }
        if self.proto != 0 {
            write!(f, " proto {}", self.proto)?;
        }
        if self.tclass_mask != 0 {
            write!(f, " tclass {:#04x} tclassmask {:#04x}", self.tclass, self.tclass_mask)?;
        }
        if self.flowlabel != 0 {
            write!(f, " flowlabel {:#x}", self.flowlabel)?;
        }
        if self.gpi != 0 {
            write!(f, " gpi {:#x}", self.gpi)?;
        }
        Ok(())
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(m) => m.fmt(f),
            Self::V6(m) => m.fmt(f),
        }
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule {} {}", self.rule, self.flow)
    }
}
