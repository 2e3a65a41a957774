#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! A userspace control plane for kernel packet schedulers.
//!
//! [`TrafficControlState`] owns a tree of interfaces, classes and filters and writes every change
//! through to a [`KernelDevice`]. Each interface is scheduled by one [`Discipline`]; the
//! classful ones (CBQ, HFSC, PRIQ and traffic conditioners) run admission control before a class
//! reaches the kernel, and every filter is checked against the interface's other filters for
//! ordering mistakes.
//!
//! ```
//! use qctl::{
//!     disc::hfsc::{HfscClassRequest, HfscDiscipline},
//!     ClassRequest, InterfaceConfig, MemoryDevice, TrafficControlState,
//! };
//!
//! let mut state = TrafficControlState::new(MemoryDevice::new());
//! let em0 = state
//!     .add_interface("em0", InterfaceConfig::new(10_000_000), Box::new(HfscDiscipline::new()))
//!     .unwrap();
//!
//! let root = state
//!     .add_class(em0, None, "root", ClassRequest::Hfsc(HfscClassRequest::linear(10_000_000)))
//!     .unwrap();
//! let bulk = ClassRequest::Hfsc(HfscClassRequest::linear(6_000_000).default_class());
//! state.add_class(em0, Some(root), "bulk", bulk).unwrap();
//!
//! // Over-commits the root.
//! let video = ClassRequest::Hfsc(HfscClassRequest::linear(6_000_000));
//! assert!(state.add_class(em0, Some(root), "video", video).unwrap_err().is_admission_error());
//!
//! state.enable(em0).unwrap();
//! ```

pub mod config;
pub mod device;
pub mod disc;
mod error;
pub mod filter;
mod load;
mod status;
pub mod tbr;
mod tree;

pub use config::{Direction, InterfaceConfig};
pub use device::{
    KernelDevice, KernelHandle, MemoryDevice, SchedulerDevice, TbProfile, TokenBucketDevice,
};
pub use disc::{ClassParams, ClassRequest, Discipline, DisciplineKind};
pub use error::{DeviceError, Error, Result};
pub use filter::{FilterSpec, FlowMatch, Ipv4Match, Ipv6Match};
pub use load::{
    ClassDeclaration, Declaration, DisciplineConfig, FilterDeclaration, InterfaceDeclaration,
    NamedRequest, CONDITIONER_HOLDER, HFSC_ROOT,
};
pub use status::{Entry, EntryKind, InterfaceStatus};
pub use tree::{
    Class, ClassId, ClassTable, Filter, FilterId, Interface, InterfaceId, Speculation,
    TrafficControlState,
};
