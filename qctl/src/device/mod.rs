//! The kernel side of the control plane.
//!
//! Every change accepted by the resource tree is written through to a [`SchedulerDevice`]; the
//! token-bucket regulator lives behind a separate [`TokenBucketDevice`]. Both are synchronous and
//! report failures as a [`DeviceError`] carrying an OS error code, which the tree surfaces as
//! [`Error::SysCall`](crate::Error::SysCall) without retrying.

use std::fmt;

use crate::{
    config::Direction,
    disc::{
        cbq::{CbqClassSpec, CbqOptions},
        cdnr::ConditionerElement,
        hfsc::HfscClassRequest,
        leaf::LeafParams,
        priq::PriqClassRequest,
        DisciplineKind,
    },
    error::DeviceError,
    filter::FilterSpec,
};

mod memory;
pub use memory::{MemoryClass, MemoryDevice, MemoryFilter, MemoryQdisc};

/// An opaque handle assigned by the kernel to an installed class or filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelHandle(pub u32);

impl KernelHandle {
    /// The handle of an object that is not installed.
    pub const NONE: Self = Self(0);

    /// Returns true for [`KernelHandle::NONE`].
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// The interface a device call applies to.
#[derive(Debug, Clone, Copy)]
pub struct Link<'a> {
    pub name: &'a str,
    /// Nominal bandwidth in bits per second.
    pub bandwidth: u64,
    pub mtu: u32,
    pub direction: Direction,
    pub kind: DisciplineKind,
}

/// Interface-wide scheduler parameters, sent on attach and again on enable.
#[derive(Debug, Clone, PartialEq)]
pub enum QdiscParams {
    /// No parameters.
    None,
    Cbq { ns_per_byte: u32, options: CbqOptions },
    Hfsc { default_class: KernelHandle },
    Priq { default_class: KernelHandle, bands: u8 },
    Leaf(LeafParams),
    Conditioner,
}

/// A class as installed in the kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelClass {
    Cbq(CbqClassSpec),
    Hfsc(HfscClassRequest),
    Priq(PriqClassRequest),
    /// A conditioner element, its action targets resolved to kernel handles.
    Conditioner(ConditionerElement<KernelHandle>),
}

/// A token-bucket profile. A rate of 0 means the interface is not shaped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TbProfile {
    /// Rate in bits per second.
    pub rate: u64,
    /// Bucket depth in bytes.
    pub depth: u32,
}

impl TbProfile {
    pub const fn new(rate: u64, depth: u32) -> Self {
        Self { rate, depth }
    }
}

/// The packet scheduler device.
pub trait SchedulerDevice {
    /// Attaches a scheduler of kind `link.kind` to the interface.
    fn attach(&mut self, link: &Link<'_>, qdisc: &QdiscParams) -> Result<(), DeviceError>;

    /// Removes the scheduler from the interface.
    fn detach(&mut self, link: &Link<'_>) -> Result<(), DeviceError>;

    /// Starts scheduling with the final interface parameters.
    fn enable(&mut self, link: &Link<'_>, qdisc: &QdiscParams) -> Result<(), DeviceError>;

    /// Stops scheduling. Installed classes and filters are kept.
    fn disable(&mut self, link: &Link<'_>) -> Result<(), DeviceError>;

    /// Removes every class and filter from the interface.
    fn clear(&mut self, link: &Link<'_>) -> Result<(), DeviceError>;

    /// Installs a class under `parent` ([`KernelHandle::NONE`] for a root class).
    fn add_class(
        &mut self,
        link: &Link<'_>,
        parent: KernelHandle,
        class: &KernelClass,
    ) -> Result<KernelHandle, DeviceError>;

    fn modify_class(
        &mut self,
        link: &Link<'_>,
        handle: KernelHandle,
        class: &KernelClass,
    ) -> Result<(), DeviceError>;

    fn delete_class(&mut self, link: &Link<'_>, handle: KernelHandle) -> Result<(), DeviceError>;

    /// Installs a filter feeding `class`.
    fn add_filter(
        &mut self,
        link: &Link<'_>,
        class: KernelHandle,
        filter: &FilterSpec,
    ) -> Result<KernelHandle, DeviceError>;

    fn delete_filter(&mut self, link: &Link<'_>, handle: KernelHandle) -> Result<(), DeviceError>;
}

/// The token-bucket regulator device, addressed by interface name.
pub trait TokenBucketDevice {
    /// Reads the profile currently installed on `ifname`.
    fn token_bucket(&mut self, ifname: &str) -> Result<TbProfile, DeviceError>;

    /// Installs `profile` on `ifname`.
    fn set_token_bucket(&mut self, ifname: &str, profile: &TbProfile) -> Result<(), DeviceError>;
}

/// A device providing both the scheduler and the token-bucket regulator.
pub trait KernelDevice: SchedulerDevice + TokenBucketDevice {}

impl<T: SchedulerDevice + TokenBucketDevice> KernelDevice for T {}
