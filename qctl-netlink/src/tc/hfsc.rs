//! HFSC (Hierarchical Fair Service Curve) qdisc and class support.

use bytes::{BufMut, BytesMut};
use qctl_curve::ServiceCurve;
use rtnetlink::packet_core::NetlinkMessage;
use rtnetlink::packet_route::{tc::TcAttribute, RouteNetlinkMessage};

use super::handle::QdiscRequestInner;
use super::nla::{options, put_nla};
use super::{finish, message, Mode};

// HFSC class TCA_OPTIONS sub-attributes (from linux/pkt_sched.h)
/// Real-time curve.
const TCA_HFSC_RSC: u16 = 1;
/// Link-sharing curve.
const TCA_HFSC_FSC: u16 = 2;

/// The kernel's `tc_service_curve`: slopes in bytes per second, the corner in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcServiceCurve {
    pub m1: u32,
    pub d: u32,
    pub m2: u32,
}

impl TcServiceCurve {
    fn put(self, buf: &mut BytesMut) {
        buf.put_u32_ne(self.m1);
        buf.put_u32_ne(self.d);
        buf.put_u32_ne(self.m2);
    }
}

impl From<&ServiceCurve> for TcServiceCurve {
    /// Converts bits per second and milliseconds, saturating slopes the kernel cannot express.
    fn from(sc: &ServiceCurve) -> Self {
        let rate = |bps: u64| u32::try_from(bps / 8).unwrap_or(u32::MAX);
        Self {
            m1: rate(sc.m1),
            d: u32::try_from(sc.d.saturating_mul(1_000)).unwrap_or(u32::MAX),
            m2: rate(sc.m2),
        }
    }
}

/// Builder for the HFSC root qdisc, `1:0`.
///
/// The options are a bare `tc_hfsc_qopt`, which only carries the default class minor.
#[derive(Debug, Clone)]
pub struct QdiscHfscRequest {
    pub inner: QdiscRequestInner,
    /// Minor number of the class unclassified traffic goes to.
    pub default_class: u16,
    pub mode: Mode,
}

impl QdiscHfscRequest {
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner, default_class: 0, mode: Mode::Create }
    }

    pub fn with_default_class(mut self, minor: u16) -> Self {
        self.default_class = minor;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = message(&self.inner);
        tc_message.attributes.push(TcAttribute::Kind("hfsc".to_string()));

        let qopt = self.default_class.to_ne_bytes();
        tc_message.attributes.push(TcAttribute::Other(options(qopt.to_vec())));

        finish(RouteNetlinkMessage::NewQueueDiscipline(tc_message), self.mode.flags())
    }
}

/// Builder for an HFSC class.
///
/// A null curve is left out, which the kernel reads as "no such commitment".
#[derive(Debug, Clone)]
pub struct ClassHfscRequest {
    pub inner: QdiscRequestInner,
    pub rsc: ServiceCurve,
    pub fsc: ServiceCurve,
    pub mode: Mode,
}

impl ClassHfscRequest {
    pub fn new(inner: QdiscRequestInner, rsc: ServiceCurve, fsc: ServiceCurve) -> Self {
        Self { inner, rsc, fsc, mode: Mode::Create }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    fn encode_options(&self) -> BytesMut {
        let mut opts = BytesMut::new();
        for (nla_type, sc) in [(TCA_HFSC_RSC, &self.rsc), (TCA_HFSC_FSC, &self.fsc)] {
            if sc.is_null() {
                continue;
            }
            let mut value = BytesMut::with_capacity(12);
            TcServiceCurve::from(sc).put(&mut value);
            put_nla(&mut opts, nla_type, &value);
        }
        opts
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = message(&self.inner);
        tc_message.attributes.push(TcAttribute::Kind("hfsc".to_string()));
        tc_message.attributes.push(TcAttribute::Other(options(self.encode_options())));

        finish(RouteNetlinkMessage::NewTrafficClass(tc_message), self.mode.flags())
    }
}
