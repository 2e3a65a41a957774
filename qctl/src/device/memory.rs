use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::{
    KernelClass, KernelHandle, Link, QdiscParams, SchedulerDevice, TbProfile, TokenBucketDevice,
};
use crate::{disc::DisciplineKind, error::DeviceError, filter::FilterSpec};

const ENOENT: i32 = 2;
const ENXIO: i32 = 6;
const EBUSY: i32 = 16;
const EEXIST: i32 = 17;

/// A class installed on a [`MemoryDevice`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryClass {
    pub parent: KernelHandle,
    pub class: KernelClass,
}

/// A filter installed on a [`MemoryDevice`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryFilter {
    pub class: KernelHandle,
    pub spec: FilterSpec,
}

/// A scheduler attached to an interface of a [`MemoryDevice`].
#[derive(Debug, Clone)]
pub struct MemoryQdisc {
    pub kind: DisciplineKind,
    pub params: QdiscParams,
    pub enabled: bool,
    pub classes: BTreeMap<KernelHandle, MemoryClass>,
    pub filters: BTreeMap<KernelHandle, MemoryFilter>,
}

/// An in-memory kernel.
///
/// Keeps the state a real scheduler would hold so that a configuration can be checked without
/// touching the system, and so that tests can inspect what was installed. Handles are allocated
/// from a single counter and never reused. Failures can be injected per operation with
/// [`MemoryDevice::fail_next`].
#[derive(Debug)]
pub struct MemoryDevice {
    qdiscs: FxHashMap<String, MemoryQdisc>,
    token_buckets: FxHashMap<String, TbProfile>,
    failures: FxHashMap<&'static str, i32>,
    calls: Vec<String>,
    next_handle: u32,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self {
            qdiscs: FxHashMap::default(),
            token_buckets: FxHashMap::default(),
            failures: FxHashMap::default(),
            calls: Vec::new(),
            next_handle: 1,
        }
    }
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presets the token-bucket profile of `ifname`, as if configured before we started.
    pub fn with_token_bucket(mut self, ifname: &str, profile: TbProfile) -> Self {
        self.token_buckets.insert(ifname.to_owned(), profile);
        self
    }

    /// Makes the next call to `op` fail with the OS error `code`.
    pub fn fail_next(&mut self, op: &'static str, code: i32) {
        self.failures.insert(op, code);
    }

    /// The scheduler attached to `ifname`, if any.
    pub fn qdisc(&self, ifname: &str) -> Option<&MemoryQdisc> {
        self.qdiscs.get(ifname)
    }

    /// The token-bucket profile installed on `ifname`.
    pub fn token_bucket_of(&self, ifname: &str) -> TbProfile {
        self.token_buckets.get(ifname).copied().unwrap_or_default()
    }

    /// Every call received so far, as `"<op> <ifname>"`.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    fn enter(&mut self, op: &'static str, ifname: &str) -> Result<(), DeviceError> {
        self.calls.push(format!("{op} {ifname}"));
        match self.failures.remove(op) {
            Some(code) => Err(DeviceError::new(op, code)),
            None => Ok(()),
        }
    }

    fn qdisc_mut(
        &mut self,
        op: &'static str,
        ifname: &str,
    ) -> Result<&mut MemoryQdisc, DeviceError> {
        self.qdiscs.get_mut(ifname).ok_or(DeviceError::new(op, ENXIO))
    }

    fn allocate(&mut self) -> KernelHandle {
        let handle = KernelHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

impl SchedulerDevice for MemoryDevice {
    fn attach(&mut self, link: &Link<'_>, qdisc: &QdiscParams) -> Result<(), DeviceError> {
        self.enter("attach", link.name)?;
        if self.qdiscs.contains_key(link.name) {
            return Err(DeviceError::new("attach", EBUSY));
        }

        self.qdiscs.insert(
            link.name.to_owned(),
            MemoryQdisc {
                kind: link.kind,
                params: qdisc.clone(),
                enabled: false,
                classes: BTreeMap::new(),
                filters: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn detach(&mut self, link: &Link<'_>) -> Result<(), DeviceError> {
        self.enter("detach", link.name)?;
        self.qdiscs.remove(link.name).map(drop).ok_or(DeviceError::new("detach", ENXIO))
    }

    fn enable(&mut self, link: &Link<'_>, qdisc: &QdiscParams) -> Result<(), DeviceError> {
        self.enter("enable", link.name)?;
        let q = self.qdisc_mut("enable", link.name)?;
        q.params = qdisc.clone();
        q.enabled = true;
        Ok(())
    }

    fn disable(&mut self, link: &Link<'_>) -> Result<(), DeviceError> {
        self.enter("disable", link.name)?;
        self.qdisc_mut("disable", link.name)?.enabled = false;
        Ok(())
    }

    fn clear(&mut self, link: &Link<'_>) -> Result<(), DeviceError> {
        self.enter("clear", link.name)?;
        let q = self.qdisc_mut("clear", link.name)?;
        q.classes.clear();
        q.filters.clear();
        Ok(())
    }

    fn add_class(
        &mut self,
        link: &Link<'_>,
        parent: KernelHandle,
        class: &KernelClass,
    ) -> Result<KernelHandle, DeviceError> {
        self.enter("add_class", link.name)?;
        let q = self.qdisc_mut("add_class", link.name)?;
        if !parent.is_none() && !q.classes.contains_key(&parent) {
            return Err(DeviceError::new("add_class", ENOENT));
        }

        let handle = self.allocate();
        let q = self.qdisc_mut("add_class", link.name)?;
        q.classes.insert(handle, MemoryClass { parent, class: class.clone() });
        Ok(handle)
    }

    fn modify_class(
        &mut self,
        link: &Link<'_>,
        handle: KernelHandle,
        class: &KernelClass,
    ) -> Result<(), DeviceError> {
        self.enter("modify_class", link.name)?;
        let q = self.qdisc_mut("modify_class", link.name)?;
        let installed =
            q.classes.get_mut(&handle).ok_or(DeviceError::new("modify_class", ENOENT))?;
        installed.class = class.clone();
        Ok(())
    }

    fn delete_class(&mut self, link: &Link<'_>, handle: KernelHandle) -> Result<(), DeviceError> {
        self.enter("delete_class", link.name)?;
        let q = self.qdisc_mut("delete_class", link.name)?;
        if !q.classes.contains_key(&handle) {
            return Err(DeviceError::new("delete_class", ENOENT));
        }
        if q.classes.values().any(|c| c.parent == handle)
            || q.filters.values().any(|f| f.class == handle)
        {
            return Err(DeviceError::new("delete_class", EBUSY));
        }

        q.classes.remove(&handle);
        Ok(())
    }

    fn add_filter(
        &mut self,
        link: &Link<'_>,
        class: KernelHandle,
        filter: &FilterSpec,
    ) -> Result<KernelHandle, DeviceError> {
        self.enter("add_filter", link.name)?;
        let q = self.qdisc_mut("add_filter", link.name)?;
        if !q.classes.contains_key(&class) {
            return Err(DeviceError::new("add_filter", ENOENT));
        }
        if q.filters.values().any(|f| f.spec.rule == filter.rule && f.spec.flow == filter.flow) {
            return Err(DeviceError::new("add_filter", EEXIST));
        }

        let handle = self.allocate();
        let q = self.qdisc_mut("add_filter", link.name)?;
        q.filters.insert(handle, MemoryFilter { class, spec: *filter });
        Ok(handle)
    }

    fn delete_filter(&mut self, link: &Link<'_>, handle: KernelHandle) -> Result<(), DeviceError> {
        self.enter("delete_filter", link.name)?;
        let q = self.qdisc_mut("delete_filter", link.name)?;
        q.filters.remove(&handle).map(drop).ok_or(DeviceError::new("delete_filter", ENOENT))
    }
}

impl TokenBucketDevice for MemoryDevice {
    fn token_bucket(&mut self, ifname: &str) -> Result<TbProfile, DeviceError> {
        self.enter("token_bucket", ifname)?;
        Ok(self.token_bucket_of(ifname))
    }

    fn set_token_bucket(&mut self, ifname: &str, profile: &TbProfile) -> Result<(), DeviceError> {
        self.enter("set_token_bucket", ifname)?;
        if profile.rate == 0 {
            self.token_buckets.remove(ifname);
        } else {
            self.token_buckets.insert(ifname.to_owned(), *profile);
        }
        Ok(())
    }
}
