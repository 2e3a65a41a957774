//! Classless qdiscs: `pfifo` and `red`.
//!
//! `pfifo` also sits under every HFSC class and PRIQ band to carry the class queue limit.

use bytes::{BufMut, BytesMut};
use qctl::disc::leaf::{RedFlags, RedParams};
use rtnetlink::packet_core::NetlinkMessage;
use rtnetlink::packet_route::{tc::TcAttribute, RouteNetlinkMessage};

use super::handle::QdiscRequestInner;
use super::nla::{options, put_nla};
use super::{finish, message, Mode};

// RED TCA_OPTIONS sub-attributes (from linux/pkt_sched.h)
const TCA_RED_PARMS: u16 = 1;
const TCA_RED_STAB: u16 = 2;
const TCA_RED_MAX_P: u16 = 3;

/// `TC_RED_ECN`.
const TC_RED_ECN: u8 = 1;

/// Idle damping table. All zeroes together with `Scell_log = 0` turns damping off.
const RED_STAB: [u8; 256] = [0u8; 256];

/// Builder for a `pfifo` qdisc with a packet limit.
#[derive(Debug, Clone)]
pub struct QdiscFifoRequest {
    pub inner: QdiscRequestInner,
    /// Limit in packets.
    pub limit: u32,
    pub mode: Mode,
}

impl QdiscFifoRequest {
    pub fn new(inner: QdiscRequestInner, limit: u32) -> Self {
        Self { inner, limit, mode: Mode::Create }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = message(&self.inner);
        tc_message.attributes.push(TcAttribute::Kind("pfifo".to_string()));
        // tc_fifo_qopt
        tc_message.attributes.push(TcAttribute::Other(options(self.limit.to_ne_bytes().to_vec())));

        finish(RouteNetlinkMessage::NewQueueDiscipline(tc_message), self.mode.flags())
    }
}

/// The kernel's `tc_red_qopt`. Limit and thresholds are in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcRedQopt {
    pub limit: u32,
    pub qth_min: u32,
    pub qth_max: u32,
    pub wlog: u8,
    pub plog: u8,
    pub scell_log: u8,
    pub flags: u8,
}

impl TcRedQopt {
    /// Converts packet-based parameters, assuming packets of `avpkt` bytes.
    pub fn from_params(params: &RedParams, avpkt: u32) -> Self {
        let bytes = |packets: u32| packets.saturating_mul(avpkt);
        let qth_min = bytes(params.thresholds.th_min);
        let qth_max = bytes(params.thresholds.th_max);

        Self {
            limit: bytes(params.qlimit),
            qth_min,
            qth_max,
            wlog: params.weight.trailing_zeros() as u8,
            plog: plog(qth_min, qth_max, params.thresholds.inv_pmax),
            scell_log: 0,
            flags: if params.flags.intersects(RedFlags::ECN) { TC_RED_ECN } else { 0 },
        }
    }

    fn put(self, buf: &mut BytesMut) {
        buf.put_u32_ne(self.limit);
        buf.put_u32_ne(self.qth_min);
        buf.put_u32_ne(self.qth_max);
        buf.put_u8(self.wlog);
        buf.put_u8(self.plog);
        buf.put_u8(self.scell_log);
        buf.put_u8(self.flags);
    }
}

/// `Plog` such that the drop probability reaches `1 / inv_pmax` at `qth_max`.
///
/// Adapted from `tc_red_eval_P()` in `iproute2/tc/tc_red.c`.
fn plog(qth_min: u32, qth_max: u32, inv_pmax: u32) -> u8 {
    let span = qth_max.saturating_sub(qth_min);
    if span == 0 || inv_pmax == 0 {
        return 0;
    }

    let mut prob = 1.0 / f64::from(inv_pmax) / f64::from(span);
    let mut i = 0;
    while i < 31 && prob <= 1.0 {
        prob *= 2.0;
        i += 1;
    }
    i
}

/// Builder for a root `red` qdisc.
#[derive(Debug, Clone)]
pub struct QdiscRedRequest {
    pub inner: QdiscRequestInner,
    pub qopt: TcRedQopt,
    /// Maximum drop probability as a 0.32 fixed point number.
    pub max_p: u32,
    pub mode: Mode,
}

impl QdiscRedRequest {
    pub fn new(inner: QdiscRequestInner, params: &RedParams, avpkt: u32) -> Self {
        let inv_pmax = u64::from(params.thresholds.inv_pmax.max(1));
        Self {
            inner,
            qopt: TcRedQopt::from_params(params, avpkt),
            max_p: u32::try_from((1u64 << 32) / inv_pmax).unwrap_or(u32::MAX),
            mode: Mode::Create,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = message(&self.inner);
        tc_message.attributes.push(TcAttribute::Kind("red".to_string()));

        let mut parms = BytesMut::with_capacity(16);
        self.qopt.put(&mut parms);

        let mut opts = BytesMut::new();
        put_nla(&mut opts, TCA_RED_PARMS, &parms);
        put_nla(&mut opts, TCA_RED_STAB, &RED_STAB);
        put_nla(&mut opts, TCA_RED_MAX_P, &self.max_p.to_ne_bytes());
        tc_message.attributes.push(TcAttribute::Other(options(opts)));

        finish(RouteNetlinkMessage::NewQueueDiscipline(tc_message), self.mode.flags())
    }
}
