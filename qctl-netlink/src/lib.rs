//! Linux backend for the qctl control plane.
//!
//! [`NetlinkDevice`] implements [`qctl::SchedulerDevice`] on top of rtnetlink, mapping HFSC
//! interfaces to the `hfsc` qdisc, PRIQ to `prio`, RED and FIFO interfaces to the classless
//! qdiscs of the same name, and filters to `u32` classifiers.
//!
//! ```no_run
//! use qctl::{
//!     disc::hfsc::{HfscClassRequest, HfscDiscipline},
//!     ClassRequest, InterfaceConfig, TrafficControlState,
//! };
//! use qctl_netlink::NetlinkDevice;
//!
//! let mut state = TrafficControlState::new(NetlinkDevice::connect()?);
//! let eth0 = state.add_interface(
//!     "eth0",
//!     InterfaceConfig::new(100_000_000),
//!     Box::new(HfscDiscipline::new()),
//! )?;
//! let root = ClassRequest::Hfsc(HfscClassRequest::linear(100_000_000));
//! let root = state.add_class(eth0, None, "root", root)?;
//! let bulk = ClassRequest::Hfsc(HfscClassRequest::linear(60_000_000).default_class());
//! state.add_class(eth0, Some(root), "bulk", bulk)?;
//! state.enable(eth0)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Every request needs `CAP_NET_ADMIN`.

mod device;
pub mod tc;

pub use device::NetlinkDevice;

/// Errors raised while setting up the device. Scheduler failures are reported as
/// [`qctl::DeviceError`]s.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
