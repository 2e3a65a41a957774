//! TC handle numbering and the addressing shared by every request.
//!
//! TC handles are 32-bit values split into major:minor (16:16 bits).

use qctl::KernelHandle;
use rtnetlink::packet_route::tc::TcHandle;

/// The root qdisc of every managed interface, `1:0`.
pub const ROOT_QDISC: u32 = 0x0001_0000;

/// Filter handles live above every class handle so the two never collide in status output.
pub const FILTER_HANDLE_BASE: u32 = 0x8000_0000;

/// Addressing of a qdisc, class or filter request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscRequestInner {
    /// The network interface index (from `if_nametoindex`).
    pub interface_index: i32,
    /// Where the object attaches.
    pub parent: TcHandle,
    /// The object's own handle.
    pub handle: TcHandle,
}

impl QdiscRequestInner {
    /// A request for the given interface, with the root as parent.
    pub fn new(index: i32) -> Self {
        Self { interface_index: index, parent: TcHandle::ROOT, handle: TcHandle::default() }
    }

    pub fn with_parent(mut self, parent: u32) -> Self {
        self.parent = TcHandle::from(parent);
        self
    }

    pub fn with_handle(mut self, handle: u32) -> Self {
        self.handle = TcHandle::from(handle);
        self
    }
}

/// The class `1:minor`.
pub const fn class_handle(minor: u16) -> u32 {
    ROOT_QDISC | minor as u32
}

/// The minor number of a class handle.
pub const fn minor(handle: KernelHandle) -> u16 {
    (handle.0 & 0xffff) as u16
}

/// The per-class FIFO hung under class `1:minor`, `(minor + 1):0`. Qdisc handles must have a zero
/// minor, and major 1 is taken by the root.
pub const fn leaf_qdisc_handle(minor: u16) -> u32 {
    (minor as u32 + 1) << 16
}

/// Formats a handle the way `tc` prints it.
pub fn display(handle: u32) -> String {
    format!("{:x}:{:x}", handle >> 16, handle & 0xffff)
}
