use std::collections::BTreeMap;

use futures::StreamExt as _;
use nix::libc::{EEXIST, EIO, ENOSPC, ENXIO, EOPNOTSUPP};
use qctl::{
    device::{KernelClass, Link, QdiscParams},
    disc::leaf::LeafParams,
    DeviceError, DisciplineKind, Direction, FilterSpec, FlowMatch, KernelHandle, SchedulerDevice,
    TbProfile, TokenBucketDevice,
};
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::RouteNetlinkMessage;
use rustc_hash::FxHashMap;
use tokio::runtime::Runtime;

use crate::{
    tc::{
        self,
        filter::{U32FilterRequest, ETH_P_ALL},
        handle::{
            class_handle, display, leaf_qdisc_handle, minor, QdiscRequestInner,
            FILTER_HANDLE_BASE, ROOT_QDISC,
        },
        hfsc::{ClassHfscRequest, QdiscHfscRequest},
        leaf::{QdiscFifoRequest, QdiscRedRequest},
        prio::{band_class, QdiscPrioRequest},
        Mode,
    },
    Result,
};

/// The highest class minor handed out. Its FIFO takes major `0xffff`.
const MAX_MINOR: u16 = 0xfffe;

#[derive(Debug, Clone, Copy)]
struct InstalledClass {
    /// The tc handle of the parent class, or of the root qdisc.
    parent: u32,
    leaf_qdisc: u32,
}

#[derive(Debug, Clone, Copy)]
struct InstalledFilter {
    pref: u16,
    class: u32,
    flow: FlowMatch,
}

/// What we installed on one interface.
#[derive(Debug)]
struct LinkState {
    index: i32,
    kind: DisciplineKind,
    qdisc: QdiscParams,
    next_minor: u16,
    classes: FxHashMap<u32, InstalledClass>,
    filters: BTreeMap<u32, InstalledFilter>,
    next_filter: u32,
}

impl LinkState {
    fn new(index: i32, kind: DisciplineKind, qdisc: QdiscParams) -> Self {
        Self {
            index,
            kind,
            qdisc,
            next_minor: 1,
            classes: FxHashMap::default(),
            filters: BTreeMap::new(),
            next_filter: 1,
        }
    }

    fn inner(&self) -> QdiscRequestInner {
        QdiscRequestInner::new(self.index)
    }

    fn allocate_minor(&mut self) -> Option<u16> {
        let minor = self.next_minor;
        if minor > MAX_MINOR {
            return None;
        }
        self.next_minor += 1;
        Some(minor)
    }

    fn forget_installed(&mut self) {
        self.classes.clear();
        self.filters.clear();
        self.next_minor = 1;
    }
}

/// The preference a filter with rule number `rule` is installed at. Lower rules are evaluated
/// first, rules past the range of preferences share the last one.
pub(crate) fn pref(rule: u32) -> u16 {
    u16::try_from(rule).unwrap_or(u16::MAX).max(1)
}

/// The errno of a failed rtnetlink request.
fn errno(err: &rtnetlink::Error) -> i32 {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map_or(EIO, |code| -code.get()),
        _ => EIO,
    }
}

/// A [`SchedulerDevice`] and [`TokenBucketDevice`] driving the Linux packet scheduler over
/// rtnetlink.
///
/// Requests are sent and acknowledged one at a time on a private single-threaded runtime, so the
/// device can be used from synchronous code.
///
/// Linux has no token-bucket regulator in front of the root qdisc: the device reports every
/// interface as unshaped and refuses to install a profile.
#[derive(Debug)]
pub struct NetlinkDevice {
    runtime: Runtime,
    handle: rtnetlink::Handle,
    links: FxHashMap<String, LinkState>,
}

impl NetlinkDevice {
    /// Opens a route netlink socket.
    pub fn connect() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

        let (connection, handle, _) = {
            let _guard = runtime.enter();
            rtnetlink::new_connection()?
        };
        runtime.spawn(connection);

        tracing::debug!("rtnetlink connection established");
        Ok(Self { runtime, handle, links: FxHashMap::default() })
    }

    /// Sends `request` and waits for the kernel's acknowledgement.
    fn execute(
        &mut self,
        op: &'static str,
        request: NetlinkMessage<RouteNetlinkMessage>,
    ) -> std::result::Result<(), DeviceError> {
        let handle = &mut self.handle;
        self.runtime.block_on(async move {
            let mut res =
                handle.request(request).map_err(|e| DeviceError::new(op, errno(&e)))?;
            while let Some(msg) = res.next().await {
                if let NetlinkPayload::Error(e) = msg.payload {
                    if let Some(code) = e.code {
                        tracing::debug!(op, ?e, "kernel refused request");
                        return Err(DeviceError::new(op, -code.get()));
                    }
                }
            }
            Ok(())
        })
    }

    fn link(&self, op: &'static str, name: &str) -> std::result::Result<&LinkState, DeviceError> {
        self.links.get(name).ok_or(DeviceError::new(op, ENXIO))
    }

    fn link_mut(
        &mut self,
        op: &'static str,
        name: &str,
    ) -> std::result::Result<&mut LinkState, DeviceError> {
        self.links.get_mut(name).ok_or(DeviceError::new(op, ENXIO))
    }

    /// The request creating or changing the root qdisc of `kind`.
    fn root_qdisc(
        op: &'static str,
        index: i32,
        link: &Link<'_>,
        qdisc: &QdiscParams,
        mode: Mode,
    ) -> std::result::Result<NetlinkMessage<RouteNetlinkMessage>, DeviceError> {
        let inner = QdiscRequestInner::new(index).with_handle(ROOT_QDISC);

        let request = match (link.kind, qdisc) {
            (DisciplineKind::Hfsc, QdiscParams::Hfsc { default_class }) => {
                QdiscHfscRequest::new(inner)
                    .with_default_class(minor(*default_class))
                    .with_mode(mode)
                    .build()
            }
            (DisciplineKind::Hfsc, _) => QdiscHfscRequest::new(inner).with_mode(mode).build(),
            (DisciplineKind::Priq, QdiscParams::Priq { default_class, .. })
                if !default_class.is_none() =>
            {
                let band = minor(*default_class).saturating_sub(1) as u8;
                QdiscPrioRequest::new(inner).with_default_band(band).with_mode(mode).build()
            }
            (DisciplineKind::Priq, _) => QdiscPrioRequest::new(inner).with_mode(mode).build(),
            (_, QdiscParams::Leaf(LeafParams::Red(red))) => {
                QdiscRedRequest::new(inner, red, link.mtu).with_mode(mode).build()
            }
            (_, QdiscParams::Leaf(LeafParams::Fifo(fifo))) => {
                QdiscFifoRequest::new(inner, fifo.qlimit).with_mode(mode).build()
            }
            _ => return Err(DeviceError::new(op, EOPNOTSUPP)),
        };
        Ok(request)
    }

    /// Installs the FIFO carrying a class queue limit.
    fn install_leaf_qdisc(
        &mut self,
        ifname: &str,
        class: u32,
        leaf: u32,
        qlimit: u32,
    ) -> std::result::Result<(), DeviceError> {
        let inner = self.link("add_class", ifname)?.inner().with_parent(class).with_handle(leaf);
        self.execute("add_class", QdiscFifoRequest::new(inner, qlimit).build())
    }
}

impl SchedulerDevice for NetlinkDevice {
    fn attach(
        &mut self,
        link: &Link<'_>,
        qdisc: &QdiscParams,
    ) -> std::result::Result<(), DeviceError> {
        if link.kind == DisciplineKind::None {
            return Ok(());
        }
        if link.direction == Direction::Input {
            return Err(DeviceError::new("attach", EOPNOTSUPP));
        }

        let index = nix::net::if_::if_nametoindex(link.name)
            .map_err(|e| DeviceError::new("attach", e as i32))?;
        let index = i32::try_from(index).map_err(|_| DeviceError::new("attach", ENXIO))?;

        let request = Self::root_qdisc("attach", index, link, qdisc, Mode::Create)?;
        self.execute("attach", request)?;

        tracing::debug!(interface = link.name, index, kind = %link.kind, "root qdisc attached");
        self.links.insert(link.name.to_owned(), LinkState::new(index, link.kind, qdisc.clone()));
        Ok(())
    }

    fn detach(&mut self, link: &Link<'_>) -> std::result::Result<(), DeviceError> {
        let Some(state) = self.links.get(link.name) else {
            return Ok(());
        };
        let request = tc::delete_qdisc(state.inner());
        self.execute("detach", request)?;

        self.links.remove(link.name);
        tracing::debug!(interface = link.name, "root qdisc detached");
        Ok(())
    }

    fn enable(
        &mut self,
        link: &Link<'_>,
        qdisc: &QdiscParams,
    ) -> std::result::Result<(), DeviceError> {
        let Some(state) = self.links.get(link.name) else {
            return Ok(());
        };

        let request = Self::root_qdisc("enable", state.index, link, qdisc, Mode::Change)?;
        self.execute("enable", request)?;

        if let Some(state) = self.links.get_mut(link.name) {
            state.qdisc = qdisc.clone();
        }
        tracing::debug!(interface = link.name, ?qdisc, "root qdisc enabled");
        Ok(())
    }

    fn disable(&mut self, link: &Link<'_>) -> std::result::Result<(), DeviceError> {
        // A Linux qdisc schedules from the moment it is attached.
        tracing::debug!(interface = link.name, "disable leaves the kernel scheduler running");
        Ok(())
    }

    fn clear(&mut self, link: &Link<'_>) -> std::result::Result<(), DeviceError> {
        let Some(state) = self.links.get(link.name) else {
            return Ok(());
        };
        if state.classes.is_empty() && state.filters.is_empty() {
            return Ok(());
        }

        // Recreating the root drops every class, filter and class FIFO in one go.
        let (index, qdisc) = (state.index, state.qdisc.clone());
        let delete = tc::delete_qdisc(state.inner());
        self.execute("clear", delete)?;
        let request = Self::root_qdisc("clear", index, link, &qdisc, Mode::Create)?;
        self.execute("clear", request)?;

        self.link_mut("clear", link.name)?.forget_installed();
        tracing::debug!(interface = link.name, "classes and filters cleared");
        Ok(())
    }

    fn add_class(
        &mut self,
        link: &Link<'_>,
        parent: KernelHandle,
        class: &KernelClass,
    ) -> std::result::Result<KernelHandle, DeviceError> {
        let state = self.link_mut("add_class", link.name)?;
        let kind = state.kind;
        let parent = if parent.is_none() { ROOT_QDISC } else { parent.0 };

        let (classid, leaf, qlimit) = match class {
            KernelClass::Hfsc(request) => {
                let n = state.allocate_minor().ok_or(DeviceError::new("add_class", ENOSPC))?;
                let classid = class_handle(n);
                let inner = state.inner().with_parent(parent).with_handle(classid);
                let add = ClassHfscRequest::new(inner, request.rsc, request.fsc).build();
                self.execute("add_class", add)?;
                (classid, leaf_qdisc_handle(n), request.qlimit)
            }
            KernelClass::Priq(request) => {
                let classid = band_class(request.priority);
                if state.classes.contains_key(&classid) {
                    return Err(DeviceError::new("add_class", EEXIST));
                }
                (classid, leaf_qdisc_handle(minor(KernelHandle(classid))), request.qlimit)
            }
            KernelClass::Cbq(_) | KernelClass::Conditioner(_) => {
                return Err(DeviceError::new("add_class", EOPNOTSUPP));
            }
        };

        if let Err(e) = self.install_leaf_qdisc(link.name, classid, leaf, qlimit) {
            if kind == DisciplineKind::Hfsc {
                let inner = self.link("add_class", link.name)?.inner();
                let undo = tc::delete_class(inner.with_parent(parent).with_handle(classid));
                if let Err(undo) = self.execute("delete_class", undo) {
                    tracing::warn!(interface = link.name, ?undo, "failed to remove class");
                }
            }
            return Err(e);
        }

        self.link_mut("add_class", link.name)?
            .classes
            .insert(classid, InstalledClass { parent, leaf_qdisc: leaf });
        tracing::debug!(
            interface = link.name,
            class = %display(classid),
            parent = %display(parent),
            qlimit,
            "class installed"
        );
        Ok(KernelHandle(classid))
    }

    fn modify_class(
        &mut self,
        link: &Link<'_>,
        handle: KernelHandle,
        class: &KernelClass,
    ) -> std::result::Result<(), DeviceError> {
        let state = self.link("modify_class", link.name)?;
        let installed =
            *state.classes.get(&handle.0).ok_or(DeviceError::new("modify_class", ENXIO))?;

        let qlimit = match class {
            KernelClass::Hfsc(request) => {
                let inner = state.inner().with_parent(installed.parent).with_handle(handle.0);
                let change = ClassHfscRequest::new(inner, request.rsc, request.fsc)
                    .with_mode(Mode::Change)
                    .build();
                self.execute("modify_class", change)?;
                request.qlimit
            }
            // The band, and so the handle, follows the priority.
            KernelClass::Priq(request) if band_class(request.priority) == handle.0 => {
                request.qlimit
            }
            _ => return Err(DeviceError::new("modify_class", EOPNOTSUPP)),
        };

        let inner = self
            .link("modify_class", link.name)?
            .inner()
            .with_parent(handle.0)
            .with_handle(installed.leaf_qdisc);
        let change = QdiscFifoRequest::new(inner, qlimit).with_mode(Mode::Change).build();
        self.execute("modify_class", change)?;

        tracing::debug!(interface = link.name, class = %display(handle.0), "class modified");
        Ok(())
    }

    fn delete_class(
        &mut self,
        link: &Link<'_>,
        handle: KernelHandle,
    ) -> std::result::Result<(), DeviceError> {
        let state = self.link("delete_class", link.name)?;
        let installed =
            *state.classes.get(&handle.0).ok_or(DeviceError::new("delete_class", ENXIO))?;

        let request = if state.kind == DisciplineKind::Hfsc {
            // The class FIFO goes with the class.
            tc::delete_class(state.inner().with_parent(installed.parent).with_handle(handle.0))
        } else {
            // Bands are fixed; only the FIFO hung under one goes away.
            tc::delete_qdisc(state.inner().with_parent(handle.0).with_handle(installed.leaf_qdisc))
        };
        self.execute("delete_class", request)?;

        self.link_mut("delete_class", link.name)?.classes.remove(&handle.0);
        tracing::debug!(interface = link.name, class = %display(handle.0), "class deleted");
        Ok(())
    }

    fn add_filter(
        &mut self,
        link: &Link<'_>,
        class: KernelHandle,
        filter: &FilterSpec,
    ) -> std::result::Result<KernelHandle, DeviceError> {
        let state = self.link("add_filter", link.name)?;
        if !state.classes.contains_key(&class.0) {
            return Err(DeviceError::new("add_filter", ENXIO));
        }

        let installed =
            InstalledFilter { pref: pref(filter.rule), class: class.0, flow: filter.flow };
        let request = U32FilterRequest::new(state.inner().with_parent(ROOT_QDISC), installed.flow)
            .with_class_id(installed.class)
            .with_pref(installed.pref)
            .build();
        self.execute("add_filter", request)?;

        let state = self.link_mut("add_filter", link.name)?;
        let handle = FILTER_HANDLE_BASE | state.next_filter;
        state.next_filter += 1;
        state.filters.insert(handle, installed);

        tracing::debug!(
            interface = link.name,
            class = %display(class.0),
            pref = installed.pref,
            rule = filter.rule,
            "filter installed"
        );
        Ok(KernelHandle(handle))
    }

    fn delete_filter(
        &mut self,
        link: &Link<'_>,
        handle: KernelHandle,
    ) -> std::result::Result<(), DeviceError> {
        let state = self.link("delete_filter", link.name)?;
        let removed =
            *state.filters.get(&handle.0).ok_or(DeviceError::new("delete_filter", ENXIO))?;

        // u32 nodes are addressed by kernel-assigned handles we never learn, so the whole
        // preference is dropped and its other filters put back in their original order.
        let inner = state.inner().with_parent(ROOT_QDISC);
        let survivors: Vec<_> = state
            .filters
            .iter()
            .filter(|(h, f)| **h != handle.0 && f.pref == removed.pref)
            .map(|(_, f)| *f)
            .collect();

        self.execute("delete_filter", tc::delete_filters(inner, removed.pref, ETH_P_ALL))?;
        self.link_mut("delete_filter", link.name)?.filters.remove(&handle.0);

        for filter in survivors {
            let request = U32FilterRequest::new(inner, filter.flow)
                .with_class_id(filter.class)
                .with_pref(filter.pref)
                .build();
            self.execute("delete_filter", request)?;
        }

        tracing::debug!(interface = link.name, pref = removed.pref, "filter deleted");
        Ok(())
    }
}

impl TokenBucketDevice for NetlinkDevice {
    fn token_bucket(&mut self, _ifname: &str) -> std::result::Result<TbProfile, DeviceError> {
        Ok(TbProfile::default())
    }

    fn set_token_bucket(
        &mut self,
        ifname: &str,
        profile: &TbProfile,
    ) -> std::result::Result<(), DeviceError> {
        if profile.rate == 0 {
            return Ok(());
        }
        tracing::warn!(interface = ifname, ?profile, "token-bucket regulator not available");
        Err(DeviceError::new("set_token_bucket", EOPNOTSUPP))
    }
}
