//! # Traffic control requests
//!
//! Builders for the rtnetlink messages the [`NetlinkDevice`](crate::NetlinkDevice) sends. Each
//! builder owns the addressing ([`QdiscRequestInner`](handle::QdiscRequestInner)) plus the
//! scheduler-specific options and produces a ready-to-send [`NetlinkMessage`].
//!
//! ## Layout on an interface
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Root qdisc (1:0)                          │
//! │          hfsc, prio, red or pfifo, by discipline             │
//! └──────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌──────────────────┐                  ┌──────────────────┐
//! │  Class 1:1       │   u32 filters    │  Class 1:n       │
//! │  (hfsc class or  │ <--------------- │                  │
//! │   prio band)     │  pref = rule     │                  │
//! └──────────────────┘                  └──────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌──────────────────┐                  ┌──────────────────┐
//! │  pfifo (2:0)     │                  │  pfifo (n+1:0)   │
//! │  limit = qlimit  │                  │                  │
//! └──────────────────┘                  └──────────────────┘
//! ```
//!
//! | Component        | Handle          |
//! |------------------|-----------------|
//! | Root qdisc       | `1:0`           |
//! | HFSC class       | `1:n`           |
//! | PRIQ priority p  | `1:(16 - p)`    |
//! | Class FIFO       | `(n + 1):0`     |

use rtnetlink::packet_core::{
    NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST,
};
use rtnetlink::packet_route::{
    tc::{TcHandle, TcMessage},
    RouteNetlinkMessage,
};

use self::handle::QdiscRequestInner;

pub mod filter;
pub mod handle;
pub mod hfsc;
pub mod leaf;
pub(crate) mod nla;
pub mod prio;

/// How a request treats an object that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Fail with `EEXIST`.
    #[default]
    Create,
    /// Update it in place; fail with `ENOENT` if it is missing.
    Change,
    /// Create it or replace it.
    Replace,
}

impl Mode {
    pub const fn flags(self) -> u16 {
        match self {
            Self::Create => NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK,
            Self::Change => NLM_F_REQUEST | NLM_F_ACK,
            Self::Replace => NLM_F_CREATE | NLM_F_REPLACE | NLM_F_REQUEST | NLM_F_ACK,
        }
    }
}

fn message(inner: &QdiscRequestInner) -> TcMessage {
    let mut tc_message = TcMessage::with_index(inner.interface_index);
    tc_message.header.parent = inner.parent;
    tc_message.header.handle = inner.handle;
    tc_message
}

fn finish(payload: RouteNetlinkMessage, flags: u16) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut nl_req = NetlinkMessage::from(payload);
    nl_req.header.flags = flags;
    nl_req
}

/// Deletes the qdisc at `inner.parent`. Everything below it goes with it.
pub fn delete_qdisc(inner: QdiscRequestInner) -> NetlinkMessage<RouteNetlinkMessage> {
    let payload = RouteNetlinkMessage::DelQueueDiscipline(message(&inner));
    finish(payload, NLM_F_REQUEST | NLM_F_ACK)
}

/// Deletes the class `inner.handle`.
pub fn delete_class(inner: QdiscRequestInner) -> NetlinkMessage<RouteNetlinkMessage> {
    let payload = RouteNetlinkMessage::DelTrafficClass(message(&inner));
    finish(payload, NLM_F_REQUEST | NLM_F_ACK)
}

/// Deletes every filter of the given preference under `inner.parent`.
pub fn delete_filters(
    inner: QdiscRequestInner,
    pref: u16,
    protocol: u16,
) -> NetlinkMessage<RouteNetlinkMessage> {
    let mut tc_message = message(&inner);
    tc_message.header.handle = TcHandle::from(0u32);
    tc_message.header.info = (u32::from(pref) << 16) | u32::from(protocol.to_be());
    finish(RouteNetlinkMessage::DelTrafficFilter(tc_message), NLM_F_REQUEST | NLM_F_ACK)
}
