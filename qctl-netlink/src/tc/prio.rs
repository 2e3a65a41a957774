//! The `prio` qdisc, which carries PRIQ interfaces.
//!
//! PRIQ serves higher priorities first, `prio` serves lower bands first, so priority `p` lives in
//! band `15 - p`. The qdisc always has the full sixteen bands so that a class keeps its handle no
//! matter which other priorities are in use.

use bytes::{BufMut, BytesMut};
use qctl::disc::priq::PRIQ_MAXPRI;
use rtnetlink::packet_core::NetlinkMessage;
use rtnetlink::packet_route::{tc::TcAttribute, RouteNetlinkMessage};

use super::handle::{class_handle, QdiscRequestInner};
use super::nla::options;
use super::{finish, message, Mode};

/// `TCQ_PRIO_BANDS`.
pub const PRIO_BANDS: u8 = 16;

/// The band serving PRIQ priority `priority`.
pub const fn band(priority: u8) -> u8 {
    PRIQ_MAXPRI - 1 - priority
}

/// The class of the band serving `priority`. Band classes are numbered from 1.
pub const fn band_class(priority: u8) -> u32 {
    class_handle(band(priority) as u16 + 1)
}

/// Builder for the `prio` root qdisc.
#[derive(Debug, Clone)]
pub struct QdiscPrioRequest {
    pub inner: QdiscRequestInner,
    /// The band every skb priority maps to until a filter says otherwise.
    pub default_band: u8,
    pub mode: Mode,
}

impl QdiscPrioRequest {
    /// A request sending unclassified traffic to the lowest band.
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner, default_band: PRIO_BANDS - 1, mode: Mode::Create }
    }

    pub fn with_default_band(mut self, band: u8) -> Self {
        self.default_band = band;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// The kernel's `tc_prio_qopt`: the band count, then the priomap.
    fn encode_qopt(&self) -> BytesMut {
        let mut qopt = BytesMut::with_capacity(20);
        qopt.put_i32_ne(i32::from(PRIO_BANDS));
        qopt.put_bytes(self.default_band, 16);
        qopt
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = message(&self.inner);
        tc_message.attributes.push(TcAttribute::Kind("prio".to_string()));
        tc_message.attributes.push(TcAttribute::Other(options(self.encode_qopt())));

        finish(RouteNetlinkMessage::NewQueueDiscipline(tc_message), self.mode.flags())
    }
}
