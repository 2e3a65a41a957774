//! Netlink attribute encoding.
//!
//! Scheduler options travel inside `TCA_OPTIONS`, either as a raw kernel struct (`prio`,
//! `pfifo`, the HFSC qdisc) or as a list of nested attributes (HFSC classes, RED, u32).
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Length (2 bytes) │  Type (2 bytes)     │  <- NLA header (4 bytes)
//! ├─────────────────────────────────────────┤
//! │  Value (variable length, padded to 4)   │
//! └─────────────────────────────────────────┘
//! ```

use bytes::{BufMut, BytesMut};
use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_utils::nla::{DefaultNla, NLA_HEADER_SIZE};

/// Appends one attribute, header and padding included, to `buf`.
pub(crate) fn put_nla(buf: &mut BytesMut, nla_type: u16, value: &[u8]) {
    let len = NLA_HEADER_SIZE + value.len();
    let padding = ((len + 3) & !3) - len;

    buf.reserve(len + padding);
    buf.put_u16_ne(len as u16);
    buf.put_u16_ne(nla_type);
    buf.put_slice(value);
    buf.put_bytes(0, padding);
}

/// Wraps an encoded struct or attribute list in `TCA_OPTIONS`.
pub(crate) fn options(value: impl Into<Vec<u8>>) -> DefaultNla {
    DefaultNla::new(TCA_OPTIONS, value.into())
}
