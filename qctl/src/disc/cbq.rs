//! Class-based queueing.
//!
//! A CBQ class is requested in user terms (bandwidth, tolerated delay, burst sizes) and
//! installed in estimator terms: nanoseconds per byte, idle limits and an overlimit penalty,
//! all derived by [`derive_class_spec`] from the class's share of the link. Each class keeps a
//! flat ledger of the bandwidth handed out to its direct children, which is what admission
//! control checks against.

use bitflags::bitflags;

use super::{ClassParams, ClassRequest, Classful, Context, Discipline, DisciplineKind, NewClass};
use crate::{
    device::{KernelClass, KernelHandle, Link, QdiscParams, SchedulerDevice},
    error::{Error, Result},
    tree::{ClassId, ClassTable},
};

/// log2 of the estimator's filter time constant.
const RM_FILTER_GAIN: i32 = 5;
/// Number of priority levels.
pub const CBQ_MAXPRI: u8 = 8;
/// The cluster size of the original mbuf allocator. A default average packet size above it is
/// rounded the way TCP rounds its segment size.
const MCLBYTES: u32 = 2048;

const NS_PER_SEC: f64 = 1_000_000_000.0;
const NS_PER_MS: f64 = 1_000_000.0;
/// Classes idle longer than this between packets get short bursts.
const SLOW_CYCLE_NS: f64 = 10.0 * NS_PER_MS;

const DEFAULT_MAXQ: u32 = 30;
const DEFAULT_MAXQ_RED: u32 = 60;
const MIN_MAXQ: u32 = 4;
const DEFAULT_MAXBURST_SLOW: u32 = 4;
const DEFAULT_MAXBURST: u32 = 16;
const DEFAULT_MINBURST: u32 = 2;

bitflags! {
    /// Flags of a CBQ class.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CbqClassFlags: u32 {
        const RED = 0x0001;
        const ECN = 0x0002;
        const RIO = 0x0004;
        const FLOWVALVE = 0x0008;
        const CLEARDSCP = 0x0010;
        /// Borrow from the parent when idle bandwidth is available.
        const BORROW = 0x0020;
        /// Weighted round-robin among classes of the same priority.
        const WRR = 0x0100;
        /// Let the link run at full speed when only over-limit classes have packets.
        const EFFICIENT = 0x0200;
        const ROOTCLASS = 0x1000;
        const DEFCLASS = 0x2000;
        const CTLCLASS = 0x4000;
    }
}

impl CbqClassFlags {
    /// The flags describing a class's role in the tree rather than its queueing.
    const ROLES: Self = Self::ROOTCLASS.union(Self::DEFCLASS).union(Self::CTLCLASS);
}

/// Interface-wide CBQ options, applied to the root class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CbqOptions {
    pub wrr: bool,
    pub efficient: bool,
}

impl CbqOptions {
    pub const fn with_wrr(mut self, wrr: bool) -> Self {
        self.wrr = wrr;
        self
    }

    pub const fn with_efficient(mut self, efficient: bool) -> Self {
        self.efficient = efficient;
        self
    }

    pub fn flags(&self) -> CbqClassFlags {
        let mut flags = CbqClassFlags::empty();
        flags.set(CbqClassFlags::WRR, self.wrr);
        flags.set(CbqClassFlags::EFFICIENT, self.efficient);
        flags
    }
}

/// A CBQ class in user terms. Zero means "default" for every size and burst field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbqClassRequest {
    /// Priority, `0..CBQ_MAXPRI`. Higher is served first.
    pub priority: u8,
    /// Bits per second.
    pub bandwidth: u64,
    /// Tolerated queueing delay in milliseconds, used to size the queue.
    pub max_delay_ms: u32,
    pub max_burst: u32,
    pub min_burst: u32,
    pub avg_pkt_size: u32,
    pub max_pkt_size: u32,
    /// The class to borrow idle bandwidth from.
    pub borrow: Option<ClassId>,
    pub flags: CbqClassFlags,
}

impl CbqClassRequest {
    pub fn new(bandwidth: u64) -> Self {
        Self {
            priority: 1,
            bandwidth,
            max_delay_ms: 0,
            max_burst: 0,
            min_burst: 0,
            avg_pkt_size: 0,
            max_pkt_size: 0,
            borrow: None,
            flags: CbqClassFlags::empty(),
        }
    }

    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub const fn with_max_delay(mut self, ms: u32) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub const fn with_bursts(mut self, min: u32, max: u32) -> Self {
        self.min_burst = min;
        self.max_burst = max;
        self
    }

    pub const fn with_packet_sizes(mut self, avg: u32, max: u32) -> Self {
        self.avg_pkt_size = avg;
        self.max_pkt_size = max;
        self
    }

    /// Borrows idle bandwidth from `class`, usually the parent.
    pub fn with_borrow(mut self, class: ClassId) -> Self {
        self.borrow = Some(class);
        self.flags |= CbqClassFlags::BORROW;
        self
    }

    pub fn with_flags(mut self, flags: CbqClassFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Marks this class as the one unclassified traffic goes to.
    pub fn default_class(self) -> Self {
        self.with_flags(CbqClassFlags::DEFCLASS)
    }

    /// Marks this class as the one for control traffic.
    pub fn control_class(self) -> Self {
        self.with_flags(CbqClassFlags::CTLCLASS)
    }
}

/// A CBQ class in estimator terms, as installed in the kernel.
///
/// Idle values and the offtime are in the estimator's scaled units, see [`derive_class_spec`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CbqClassSpec {
    pub priority: u8,
    /// Time to send one byte at the class rate.
    pub ns_per_byte: u32,
    /// Queue limit in packets.
    pub maxq: u32,
    pub maxidle: u32,
    pub minidle: i32,
    pub offtime: u32,
    pub pktsize: u32,
    pub flags: CbqClassFlags,
    pub parent: KernelHandle,
    pub borrow: KernelHandle,
}

/// The parameter block of an installed CBQ class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CbqClass {
    pub request: CbqClassRequest,
    pub spec: CbqClassSpec,
    /// Sum of the bandwidth of the direct children.
    pub allocated: u64,
}

impl CbqClass {
    /// Keeps `request` without deriving anything.
    pub(crate) fn unchecked(request: CbqClassRequest) -> Self {
        Self { request, spec: CbqClassSpec::default(), allocated: 0 }
    }

    /// Bandwidth still available to new children.
    pub const fn available(&self) -> u64 {
        self.request.bandwidth.saturating_sub(self.allocated)
    }
}

/// Derives the estimator parameters of a class from its request.
///
/// `link_bandwidth` must be nonzero. The handles of the returned spec are left unset.
pub fn derive_class_spec(link_bandwidth: u64, mtu: u32, request: &CbqClassRequest) -> CbqClassSpec {
    let gain = f64::from(1u32 << RM_FILTER_GAIN);
    let g = 1.0 - 1.0 / gain;
    let f = if request.bandwidth == 0 {
        0.0001
    } else {
        request.bandwidth as f64 / link_bandwidth as f64
    };

    let avg_pkt_size = match request.avg_pkt_size {
        0 if mtu > MCLBYTES => mtu & !MCLBYTES,
        0 => mtu,
        size => size.min(mtu),
    };
    let max_pkt_size = match request.max_pkt_size {
        0 => mtu,
        size => size.min(mtu),
    };

    let if_ns_per_byte = 8.0 * NS_PER_SEC / link_bandwidth as f64;
    let mut ns_per_byte = if_ns_per_byte / f;
    let ptime = f64::from(avg_pkt_size) * if_ns_per_byte;
    let cptime = ptime * (1.0 - f) / f;

    if ns_per_byte * f64::from(max_pkt_size) > f64::from(i32::MAX) {
        if request.bandwidth != 0 {
            tracing::warn!(bandwidth = request.bandwidth, "class is too slow, clamping its rate");
        }
        ns_per_byte = f64::from(i32::MAX as u32 / max_pkt_size);
    }

    let max_burst = match request.max_burst {
        0 if cptime > SLOW_CYCLE_NS => DEFAULT_MAXBURST_SLOW,
        0 => DEFAULT_MAXBURST,
        n => n,
    };
    let min_burst = match request.min_burst {
        0 => DEFAULT_MINBURST,
        n => n,
    }
    .min(max_burst);

    let gton = g.powi(max_burst as i32);
    let gtom = g.powi(min_burst as i32 - 1);

    let maxidle = ((1.0 / f - 1.0) * ((1.0 - gton) / gton)).max(1.0 - g) * ptime;
    let minidle = -(f64::from(max_pkt_size) * ns_per_byte);
    let offtime = cptime * (1.0 + 1.0 / (1.0 - g) * (1.0 - gtom) / gtom);

    let scale = |v: f64| v * 8.0 / ns_per_byte * gain;

    let mut maxq = match request.max_delay_ms {
        0 if request.flags.intersects(CbqClassFlags::RED | CbqClassFlags::RIO) => DEFAULT_MAXQ_RED,
        0 => DEFAULT_MAXQ,
        delay => {
            let q = f64::from(delay) * NS_PER_MS / (ns_per_byte * f64::from(avg_pkt_size));
            if q < f64::from(MIN_MAXQ) {
                tracing::warn!(delay_ms = delay, maxq = q, "queue limit raised to {MIN_MAXQ}");
                MIN_MAXQ
            } else {
                q as u32
            }
        }
    };
    if request.bandwidth == 0 && request.borrow.is_none() {
        maxq = 0;
    }

    CbqClassSpec {
        priority: request.priority,
        ns_per_byte: ns_per_byte as u32,
        maxq,
        maxidle: scale(maxidle).abs() as u32,
        minidle: scale(minidle) as i32,
        offtime: scale(offtime).abs() as u32,
        pktsize: max_pkt_size,
        flags: request.flags,
        parent: KernelHandle::NONE,
        borrow: KernelHandle::NONE,
    }
}

fn cbq_request(request: ClassRequest) -> Result<CbqClassRequest> {
    match request {
        ClassRequest::Cbq(request) => Ok(request),
        other => Err(Error::ClassInvalid(format!("expected cbq parameters, got {other:?}"))),
    }
}

fn cbq_mut(params: &mut ClassParams) -> Result<&mut CbqClass> {
    match params {
        ClassParams::Cbq(class) => Ok(class),
        _ => Err(Error::ClassInvalid("not a cbq class".into())),
    }
}

/// The CBQ discipline of one interface.
#[derive(Debug, Default)]
pub struct CbqDiscipline {
    options: CbqOptions,
    ns_per_byte: u32,
    root: Option<ClassId>,
    default: Option<ClassId>,
    control: Option<ClassId>,
}

impl CbqDiscipline {
    pub fn new(options: CbqOptions) -> Self {
        Self { options, ..Default::default() }
    }

    pub const fn options(&self) -> CbqOptions {
        self.options
    }

    pub const fn root(&self) -> Option<ClassId> {
        self.root
    }

    pub const fn default_class(&self) -> Option<ClassId> {
        self.default
    }

    pub const fn control_class(&self) -> Option<ClassId> {
        self.control
    }

    fn check_roles(&self, flags: CbqClassFlags, except: Option<ClassId>) -> Result<()> {
        let taken = |slot: Option<ClassId>| slot.is_some() && slot != except;
        if flags.contains(CbqClassFlags::DEFCLASS) && taken(self.default) {
            return Err(Error::ClassInvalid("cbq: default class already exists".into()));
        }
        if flags.contains(CbqClassFlags::CTLCLASS) && taken(self.control) {
            return Err(Error::ClassInvalid("cbq: control class already exists".into()));
        }
        Ok(())
    }

    /// Derives the kernel spec of a class, resolving the parent and borrow handles.
    fn spec(
        &self,
        cx: &Context<'_>,
        parent: Option<ClassId>,
        request: &CbqClassRequest,
    ) -> Result<CbqClassSpec> {
        if request.priority >= CBQ_MAXPRI {
            return Err(Error::OutOfRange(format!(
                "cbq priority {} (max {})",
                request.priority,
                CBQ_MAXPRI - 1
            )));
        }

        let handle_of = |id: Option<ClassId>| -> Result<KernelHandle> {
            id.map_or(Ok(KernelHandle::NONE), |id| Ok(cx.classes.lookup(id)?.handle()))
        };

        let mut spec = derive_class_spec(cx.link.bandwidth, cx.link.mtu, request);
        spec.parent = handle_of(parent)?;
        spec.borrow = handle_of(request.borrow)?;
        Ok(spec)
    }
}

impl Discipline for CbqDiscipline {
    fn kind(&self) -> DisciplineKind {
        DisciplineKind::Cbq
    }

    fn qdisc_params(&self) -> QdiscParams {
        QdiscParams::Cbq { ns_per_byte: self.ns_per_byte, options: self.options }
    }

    fn attach(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        if link.bandwidth == 0 {
            return Err(Error::InvalidParameter(format!("{}: cbq needs a bandwidth", link.name)));
        }
        self.ns_per_byte = (8.0 * NS_PER_SEC / link.bandwidth as f64) as u32;
        Ok(device.attach(link, &self.qdisc_params())?)
    }

    fn validate_enable(&self, _classes: &ClassTable) -> Result<()> {
        if self.root.is_none() {
            return Err(Error::ClassPermission("cbq: no root class".into()));
        }
        if self.default.is_none() {
            return Err(Error::ClassPermission("cbq: no default class".into()));
        }
        Ok(())
    }

    fn as_classful(&mut self) -> Option<&mut dyn Classful> {
        Some(self)
    }
}

impl Classful for CbqDiscipline {
    fn add_class(
        &mut self,
        cx: &mut Context<'_>,
        class: NewClass<'_>,
    ) -> Result<(KernelHandle, ClassParams)> {
        let mut request = cbq_request(class.request)?;
        request.flags -= CbqClassFlags::ROOTCLASS;
        if class.parent.is_none() {
            request.flags |= CbqClassFlags::ROOTCLASS | self.options.flags();
        }
        self.check_roles(request.flags, None)?;

        let spec = self.spec(cx, class.parent, &request)?;
        let kernel = KernelClass::Cbq(spec.clone());
        let bandwidth = request.bandwidth;
        let name = class.name;

        let handle = cx.classes.speculate(|tx| {
            if let Some(parent) = class.parent {
                let ledger = cbq_mut(tx.params_mut(parent)?)?;
                if bandwidth > ledger.available() {
                    return Err(Error::AdmissionNoBandwidth(format!(
                        "class {name} wants {bandwidth} bps, parent has {} bps left",
                        ledger.available()
                    )));
                }
                ledger.allocated += bandwidth;
            }
            Ok(cx.device.add_class(&cx.link, spec.parent, &kernel)?)
        })?;

        if request.flags.contains(CbqClassFlags::ROOTCLASS) {
            self.root = Some(class.id);
        }
        if request.flags.contains(CbqClassFlags::DEFCLASS) {
            self.default = Some(class.id);
        }
        if request.flags.contains(CbqClassFlags::CTLCLASS) {
            self.control = Some(class.id);
        }

        tracing::trace!(class = name, ?spec, "cbq class derived");
        Ok((handle, ClassParams::Cbq(CbqClass { request, spec, allocated: 0 })))
    }

    fn modify_class(
        &mut self,
        cx: &mut Context<'_>,
        id: ClassId,
        request: ClassRequest,
    ) -> Result<()> {
        let mut request = cbq_request(request)?;
        let class = cx.classes.lookup(id)?;
        let (name, parent, handle) = (class.name().to_owned(), class.parent(), class.handle());
        let old = match class.params() {
            ClassParams::Cbq(old) => old.clone(),
            _ => return Err(Error::ClassInvalid(format!("{name} is not a cbq class"))),
        };

        // A class keeps its role in the tree.
        let roles = old.request.flags & CbqClassFlags::ROLES;
        request.flags = (request.flags - CbqClassFlags::ROLES) | roles;
        if request.bandwidth < old.allocated {
            return Err(Error::Admission(format!(
                "class {name} has {} bps allocated to its children",
                old.allocated
            )));
        }

        let spec = self.spec(cx, parent, &request)?;
        let kernel = KernelClass::Cbq(spec.clone());
        let bandwidth = request.bandwidth;

        cx.classes.speculate(|tx| {
            if let Some(parent) = parent {
                let ledger = cbq_mut(tx.params_mut(parent)?)?;
                let allocated = ledger.allocated.saturating_sub(old.request.bandwidth);
                let available = ledger.request.bandwidth.saturating_sub(allocated);
                if bandwidth > available {
                    return Err(Error::AdmissionNoBandwidth(format!(
                        "class {name} wants {bandwidth} bps, parent has {available} bps left"
                    )));
                }
                ledger.allocated = allocated + bandwidth;
            }

            let own = cbq_mut(tx.params_mut(id)?)?;
            own.request = request;
            own.spec = spec;
            Ok(cx.device.modify_class(&cx.link, handle, &kernel)?)
        })
    }

    fn on_delete(&mut self, classes: &mut ClassTable, id: ClassId) {
        let Some(class) = classes.get(id) else {
            return;
        };
        let parent = class.parent();
        let bandwidth = match class.params() {
            ClassParams::Cbq(c) => c.request.bandwidth,
            _ => 0,
        };

        let parent = parent.and_then(|p| classes.get_mut(p)).map(|c| c.params_mut());
        if let Some(ClassParams::Cbq(ledger)) = parent {
            ledger.allocated = ledger.allocated.saturating_sub(bandwidth);
        }

        for slot in [&mut self.root, &mut self.default, &mut self.control] {
            if *slot == Some(id) {
                *slot = None;
            }
        }
    }
}
