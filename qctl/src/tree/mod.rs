//! The resource tree: interfaces own classes, classes are fed by filters.
//!
//! ```text
//! TrafficControlState
//!  ├── Interface "em0" (hfsc)          discipline + ClassTable + filter rules
//!  │    └── root
//!  │         ├── bulk                  <- filter rule 10
//!  │         └── interactive           <- filter rule 5, filter rule 20
//!  └── Interface "em1" (priq)
//! ```
//!
//! Every mutation goes through the interface's [`Discipline`], which writes it through to the
//! device. The tree itself never looks at which discipline it is talking to.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::{
    config::{Direction, InterfaceConfig},
    device::{KernelDevice, KernelHandle, Link, SchedulerDevice},
    disc::{ClassRequest, Classful, Context, Discipline, DisciplineKind, NewClass},
    error::{Error, Result},
    filter::FilterSpec,
    tbr::TbrTable,
};

mod class;
pub use class::{Class, ClassId, ClassTable, FilterId, InterfaceId, Speculation};

mod rules;

/// A filter rule bound to a class.
#[derive(Debug, Clone)]
pub struct Filter {
    id: FilterId,
    name: String,
    class: ClassId,
    spec: FilterSpec,
    handle: KernelHandle,
}

impl Filter {
    /// The filter's identifier.
    pub const fn id(&self) -> FilterId {
        self.id
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The class the filter feeds.
    pub const fn class(&self) -> ClassId {
        self.class
    }

    /// The match and rule number as requested.
    pub const fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Kernel handle of the installed filter.
    pub const fn handle(&self) -> KernelHandle {
        self.handle
    }
}

/// A managed network interface.
#[derive(Debug)]
pub struct Interface {
    id: InterfaceId,
    name: String,
    config: InterfaceConfig,
    enabled: bool,
    discipline: Box<dyn Discipline>,
    classes: ClassTable,
    filters: BTreeMap<u32, Filter>,
    /// Filters ordered by rule number, then insertion.
    rules: Vec<FilterId>,
    next_filter: u32,
    reservation: Option<ClassId>,
}

/// Disjoint borrows of an [`Interface`].
struct Parts<'a> {
    link: Link<'a>,
    discipline: &'a mut dyn Discipline,
    classes: &'a mut ClassTable,
}

impl Interface {
    fn new(
        id: InterfaceId,
        name: &str,
        config: InterfaceConfig,
        discipline: Box<dyn Discipline>,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            config,
            enabled: false,
            discipline,
            classes: ClassTable::new(id),
            filters: BTreeMap::new(),
            rules: Vec::new(),
            next_filter: 1,
            reservation: None,
        }
    }

    /// The interface's identifier.
    pub const fn id(&self) -> InterfaceId {
        self.id
    }

    /// The system name of the interface, e.g. `em0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal bandwidth in bits per second.
    pub const fn bandwidth(&self) -> u64 {
        self.config.bandwidth
    }

    /// Largest packet size in bytes.
    pub const fn mtu(&self) -> u32 {
        self.config.mtu
    }

    /// Whether the interface schedules outgoing or conditions incoming traffic.
    pub const fn direction(&self) -> Direction {
        self.config.direction
    }

    /// Returns true if the discipline is currently active.
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The kind of the attached discipline.
    pub fn kind(&self) -> DisciplineKind {
        self.discipline.kind()
    }

    /// The attached discipline.
    pub fn discipline(&self) -> &dyn Discipline {
        self.discipline.as_ref()
    }

    /// The class tree of this interface.
    pub const fn classes(&self) -> &ClassTable {
        &self.classes
    }

    /// Looks up a filter, `None` if it is unknown or belongs to another interface.
    pub fn filter(&self, id: FilterId) -> Option<&Filter> {
        if id.iface != self.id {
            return None;
        }
        self.filters.get(&id.index)
    }

    /// Filters in evaluation order.
    pub fn filters(&self) -> impl Iterator<Item = &Filter> + '_ {
        self.rules.iter().filter_map(|id| self.filters.get(&id.index))
    }

    /// The class admission-controlled flows are placed in.
    pub const fn reservation_class(&self) -> Option<ClassId> {
        self.reservation
    }

    /// The interface as seen by the device.
    pub fn link(&self) -> Link<'_> {
        Link {
            name: &self.name,
            bandwidth: self.config.bandwidth,
            mtu: self.config.mtu,
            direction: self.config.direction,
            kind: self.discipline.kind(),
        }
    }

    fn parts(&mut self) -> Parts<'_> {
        let kind = self.discipline.kind();
        let Self { name, config, discipline, classes, .. } = self;
        Parts {
            link: Link {
                name,
                bandwidth: config.bandwidth,
                mtu: config.mtu,
                direction: config.direction,
                kind,
            },
            discipline: discipline.as_mut(),
            classes,
        }
    }
}

fn classful<'a>(
    link: &Link<'_>,
    discipline: &'a mut dyn Discipline,
) -> Result<&'a mut dyn Classful> {
    discipline
        .as_classful()
        .ok_or_else(|| Error::ClassInvalid(format!("{} ({}) has no classes", link.name, link.kind)))
}

/// Keeps the first error of a best-effort sequence, logging the others.
fn keep_first(first: &mut Option<Error>, res: Result<()>, what: &str, ifname: &str) {
    if let Err(e) = res {
        tracing::warn!(interface = ifname, ?e, "{what} failed during teardown");
        first.get_or_insert(e);
    }
}

/// The whole traffic-control configuration of the host, written through to a device.
#[derive(Debug)]
pub struct TrafficControlState<D> {
    device: D,
    interfaces: BTreeMap<InterfaceId, Interface>,
    names: FxHashMap<String, InterfaceId>,
    tbr: TbrTable,
    next_iface: u32,
}

impl<D: KernelDevice> TrafficControlState<D> {
    /// Creates an empty state on top of `device`.
    pub fn new(device: D) -> Self {
        Self {
            device,
            interfaces: BTreeMap::new(),
            names: FxHashMap::default(),
            tbr: TbrTable::default(),
            next_iface: 1,
        }
    }

    /// The scheduler device every change is sent to.
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the device.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Tears everything down and returns the device.
    pub fn into_device(mut self) -> D {
        if let Err(e) = self.destroy_all() {
            tracing::warn!(?e, "teardown incomplete");
        }
        self.device
    }

    /// The saved token-bucket profiles.
    pub const fn token_buckets(&self) -> &TbrTable {
        &self.tbr
    }

    /// Looks up an interface by id.
    pub fn interface(&self, id: InterfaceId) -> Option<&Interface> {
        self.interfaces.get(&id)
    }

    /// Looks up an interface by its system name.
    pub fn interface_by_name(&self, name: &str) -> Option<&Interface> {
        self.names.get(name).and_then(|id| self.interfaces.get(id))
    }

    /// Interfaces in creation order.
    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> + '_ {
        self.interfaces.values()
    }

    /// Looks up a class on any interface.
    pub fn class(&self, id: ClassId) -> Option<&Class> {
        self.interfaces.get(&id.iface).and_then(|i| i.classes.get(id))
    }

    /// Looks up a filter on any interface.
    pub fn filter(&self, id: FilterId) -> Option<&Filter> {
        self.interfaces.get(&id.iface).and_then(|i| i.filter(id))
    }

    /// The first class named `name` on `iface`.
    pub fn find_class(&self, iface: InterfaceId, name: &str) -> Option<ClassId> {
        self.interfaces.get(&iface).and_then(|i| i.classes.find(name)).map(Class::id)
    }

    fn iface_mut(&mut self, id: InterfaceId) -> Result<&mut Interface> {
        self.interfaces.get_mut(&id).ok_or_else(|| Error::BadInterface(format!("{id:?}")))
    }

    /// Adds an interface scheduled by `discipline`.
    ///
    /// The discipline is attached, then disabled and cleared: interfaces start out deconfigured.
    pub fn add_interface(
        &mut self,
        name: &str,
        config: InterfaceConfig,
        mut discipline: Box<dyn Discipline>,
    ) -> Result<InterfaceId> {
        if self.names.contains_key(name) {
            return Err(Error::BadInterface(format!("{name} already exists")));
        }
        self.names.try_reserve(1)?;

        let id = InterfaceId(self.next_iface);
        let kind = discipline.kind();
        let link = Link {
            name,
            bandwidth: config.bandwidth,
            mtu: config.mtu,
            direction: config.direction,
            kind,
        };

        discipline.attach(&link, &mut self.device)?;
        let res = discipline
            .disable(&link, &mut self.device)
            .and_then(|_| discipline.clear(&link, &mut self.device));
        if let Err(e) = res {
            if let Err(detach) = discipline.detach(&link, &mut self.device) {
                tracing::warn!(interface = name, ?detach, "failed to detach after failed add");
            }
            return Err(e);
        }

        if let Some(profile) = config.effective_token_bucket() {
            self.tbr.register(name, profile)?;
        }

        self.next_iface += 1;
        self.interfaces.insert(id, Interface::new(id, name, config, discipline));
        self.names.insert(name.to_owned(), id);

        tracing::debug!(interface = name, %kind, bandwidth = config.bandwidth, "interface added");
        Ok(id)
    }

    /// Removes an interface with all its classes and filters.
    ///
    /// Teardown is best effort: every step is attempted and the interface is gone afterwards
    /// regardless. The first failure is returned.
    pub fn delete_interface(&mut self, id: InterfaceId) -> Result<()> {
        let mut iface = self
            .interfaces
            .remove(&id)
            .ok_or_else(|| Error::BadInterface(format!("{id:?}")))?;
        self.names.remove(&iface.name);

        let mut first = None;
        let name = iface.name.clone();

        let parts = iface.parts();
        let disabled = parts.discipline.disable(&parts.link, &mut self.device);
        keep_first(&mut first, disabled, "disable", &name);
        keep_first(&mut first, Self::clear_in(&mut iface, &mut self.device), "clear", &name);
        let parts = iface.parts();
        let detached = parts.discipline.detach(&parts.link, &mut self.device);
        keep_first(&mut first, detached, "detach", &name);
        let restored = self.tbr.remove(&name, &mut self.device);
        keep_first(&mut first, restored, "token bucket restore", &name);

        tracing::debug!(interface = %name, "interface deleted");
        first.map_or(Ok(()), Err)
    }

    /// Removes every interface.
    pub fn destroy_all(&mut self) -> Result<()> {
        let mut first = None;
        let ids: Vec<_> = self.interfaces.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.delete_interface(id) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Removes every class and filter of the interface.
    pub fn clear(&mut self, id: InterfaceId) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id)
            .ok_or_else(|| Error::BadInterface(format!("{id:?}")))?;
        Self::clear_in(iface, &mut self.device)
    }

    /// Deletes classes until none is left, always picking a leaf nothing else refers to, then
    /// clears the kernel side.
    fn clear_in(iface: &mut Interface, device: &mut dyn SchedulerDevice) -> Result<()> {
        let mut first = None;

        loop {
            let parts = iface.parts();
            let Some(classful) = parts.discipline.as_classful() else {
                break;
            };
            let next = parts
                .classes
                .iter()
                .find(|c| c.is_leaf() && !classful.is_referenced(c.id()))
                .map(Class::id);
            let Some(class) = next else {
                break;
            };

            if let Err(e) = Self::delete_class_in(iface, device, class) {
                tracing::warn!(interface = %iface.name, ?e, "failed to delete class during clear");
                first.get_or_insert(e);
            }
            if iface.classes.contains(class) {
                break;
            }
        }

        if !iface.classes.is_empty() {
            let left = iface.classes.len();
            tracing::warn!(interface = %iface.name, left, "classes left after clear");
        }
        iface.reservation = None;

        let parts = iface.parts();
        if let Err(e) = parts.discipline.clear(&parts.link, device) {
            first.get_or_insert(e);
        }

        first.map_or(Ok(()), Err)
    }

    /// Validates the class tree with the discipline, then starts scheduling and installs the
    /// token-bucket profile.
    pub fn enable(&mut self, id: InterfaceId) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id)
            .ok_or_else(|| Error::BadInterface(format!("{id:?}")))?;

        let parts = iface.parts();
        parts.discipline.validate_enable(parts.classes)?;
        parts.discipline.enable(&parts.link, &mut self.device)?;

        if let Err(e) = self.tbr.install(&iface.name, &mut self.device) {
            let parts = iface.parts();
            if let Err(disable) = parts.discipline.disable(&parts.link, &mut self.device) {
                tracing::warn!(interface = %iface.name, ?disable, "failed to roll back enable");
            }
            return Err(e);
        }

        iface.enabled = true;
        tracing::debug!(interface = %iface.name, "interface enabled");
        Ok(())
    }

    /// Stops scheduling and restores the token-bucket regulator.
    pub fn disable(&mut self, id: InterfaceId) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id)
            .ok_or_else(|| Error::BadInterface(format!("{id:?}")))?;

        let parts = iface.parts();
        parts.discipline.disable(&parts.link, &mut self.device)?;
        iface.enabled = false;
        self.tbr.restore(&iface.name, &mut self.device)?;

        tracing::debug!(interface = %iface.name, "interface disabled");
        Ok(())
    }

    /// Adds a class under `parent`, or a root class if `parent` is `None`.
    pub fn add_class(
        &mut self,
        iface: InterfaceId,
        parent: Option<ClassId>,
        name: &str,
        request: ClassRequest,
    ) -> Result<ClassId> {
        let iface = self
            .interfaces
            .get_mut(&iface)
            .ok_or_else(|| Error::BadInterface(format!("{iface:?}")))?;
        if let Some(parent) = parent {
            iface.classes.reserve_child(parent)?;
        }

        let parts = iface.parts();
        let classful = classful(&parts.link, parts.discipline)?;
        let has_root = parts.classes.roots().next().is_some();
        if parent.is_none() && !classful.allows_multiple_roots() && has_root {
            let name = parts.link.name;
            return Err(Error::ClassPermission(format!("{name} already has a root class")));
        }

        let id = parts.classes.vacant_id();
        let mut cx = Context { link: parts.link, device: &mut self.device, classes: parts.classes };
        let (handle, params) = classful.add_class(&mut cx, NewClass { id, name, parent, request })?;

        let id = iface.classes.insert(Class::new(id, name, parent, handle, params))?;
        tracing::debug!(interface = %iface.name, class = name, %handle, "class added");
        Ok(id)
    }

    /// Changes the parameters of a class.
    pub fn modify_class(&mut self, id: ClassId, request: ClassRequest) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id.iface)
            .ok_or_else(|| Error::BadClass(format!("{id:?}")))?;
        iface.classes.lookup(id)?;

        let parts = iface.parts();
        let classful = classful(&parts.link, parts.discipline)?;
        let mut cx = Context { link: parts.link, device: &mut self.device, classes: parts.classes };
        classful.modify_class(&mut cx, id, request)?;

        tracing::debug!(interface = %iface.name, class = ?id, "class modified");
        Ok(())
    }

    /// Deletes a leaf class and the filters feeding it.
    pub fn delete_class(&mut self, id: ClassId) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id.iface)
            .ok_or_else(|| Error::BadClass(format!("{id:?}")))?;
        Self::delete_class_in(iface, &mut self.device, id)
    }

    fn delete_class_in(
        iface: &mut Interface,
        device: &mut dyn SchedulerDevice,
        id: ClassId,
    ) -> Result<()> {
        let class = iface.classes.lookup(id)?;
        if !class.is_leaf() {
            return Err(Error::ClassPermission(format!("class {} has children", class.name())));
        }
        let name = class.name().to_owned();
        let filters = class.filters().to_vec();

        let parts = iface.parts();
        if classful(&parts.link, parts.discipline)?.is_referenced(id) {
            return Err(Error::ClassPermission(format!("class {name} is referenced elsewhere")));
        }

        for filter in filters {
            if let Err(e) = Self::delete_filter_in(iface, device, filter) {
                tracing::warn!(interface = %iface.name, class = %name, ?e, "filter not deleted");
            }
        }

        let parts = iface.parts();
        let classful = classful(&parts.link, parts.discipline)?;
        classful.on_delete(parts.classes, id);
        let mut cx = Context { link: parts.link, device, classes: parts.classes };
        let res = classful.delete_class(&mut cx, id);

        iface.classes.remove(id)?;
        if iface.reservation == Some(id) {
            iface.reservation = None;
        }

        tracing::debug!(interface = %iface.name, class = %name, "class deleted");
        res
    }

    /// Designates the class admission-controlled flows are placed in.
    pub fn set_reservation_class(
        &mut self,
        iface: InterfaceId,
        class: Option<ClassId>,
    ) -> Result<()> {
        let iface = self.iface_mut(iface)?;
        if let Some(class) = class {
            iface.classes.lookup(class)?;
        }
        iface.reservation = class;
        Ok(())
    }

    /// Adds a filter feeding `class`.
    ///
    /// The filter is first checked against every filter of the interface: a broader filter
    /// evaluated before a narrower one is rejected with [`Error::FilterShadow`].
    pub fn add_filter(&mut self, class: ClassId, name: &str, spec: FilterSpec) -> Result<FilterId> {
        let iface = self
            .interfaces
            .get_mut(&class.iface)
            .ok_or_else(|| Error::BadClass(format!("{class:?}")))?;
        iface.classes.lookup(class)?;

        let position = rules::insert_position(iface, class, name, &spec)?;
        iface.rules.try_reserve(1)?;
        iface.classes.lookup_mut(class)?.filters_mut().try_reserve(1)?;

        let id = FilterId { iface: iface.id, index: iface.next_filter };
        let parts = iface.parts();
        let classful = classful(&parts.link, parts.discipline)?;
        let mut cx = Context { link: parts.link, device: &mut self.device, classes: parts.classes };
        let handle = classful.add_filter(&mut cx, class, &spec)?;

        iface.next_filter += 1;
        iface.filters.insert(id.index, Filter { id, name: name.to_owned(), class, spec, handle });
        iface.rules.insert(position, id);
        iface.classes.lookup_mut(class)?.filters_mut().push(id);

        let rule = spec.rule;
        tracing::debug!(interface = %iface.name, filter = name, rule, %handle, "filter added");
        Ok(id)
    }

    /// Deletes a filter.
    pub fn delete_filter(&mut self, id: FilterId) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(&id.iface)
            .ok_or_else(|| Error::BadFilter(format!("{id:?}")))?;
        Self::delete_filter_in(iface, &mut self.device, id)
    }

    fn delete_filter_in(
        iface: &mut Interface,
        device: &mut dyn SchedulerDevice,
        id: FilterId,
    ) -> Result<()> {
        let filter =
            iface.filters.remove(&id.index).ok_or_else(|| Error::BadFilter(format!("{id:?}")))?;
        iface.rules.retain(|r| *r != id);
        if let Some(class) = iface.classes.get_mut(filter.class) {
            class.filters_mut().retain(|f| *f != id);
        }

        let parts = iface.parts();
        let classful = classful(&parts.link, parts.discipline)?;
        let mut cx = Context { link: parts.link, device, classes: parts.classes };
        classful.delete_filter(&mut cx, filter.handle)?;

        tracing::debug!(interface = %iface.name, filter = %filter.name, "filter deleted");
        Ok(())
    }
}
