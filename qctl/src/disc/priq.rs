//! Priority queueing: flat classes served strictly by priority.

use bitflags::bitflags;

use super::{ClassParams, ClassRequest, Classful, Context, Discipline, DisciplineKind, NewClass};
use crate::{
    device::{KernelClass, KernelHandle, QdiscParams},
    error::{Error, Result},
    tree::{ClassId, ClassTable},
};

/// Number of priority levels.
pub const PRIQ_MAXPRI: u8 = 16;
/// Default queue limit in packets.
pub const PRIQ_DEFAULT_QLIMIT: u32 = 50;

bitflags! {
    /// Flags of a PRIQ class.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct PriqClassFlags: u32 {
        const RED = 0x0001;
        const ECN = 0x0002;
        const RIO = 0x0004;
        const CLEARDSCP = 0x0010;
        const DEFAULTCLASS = 0x1000;
    }
}

/// A PRIQ class. Installed in the kernel as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriqClassRequest {
    /// `0..PRIQ_MAXPRI`, higher is served first.
    pub priority: u8,
    pub qlimit: u32,
    pub flags: PriqClassFlags,
}

impl PriqClassRequest {
    /// A class at `priority`, higher is served first.
    pub const fn new(priority: u8) -> Self {
        Self { priority, qlimit: PRIQ_DEFAULT_QLIMIT, flags: PriqClassFlags::empty() }
    }

    pub const fn with_qlimit(mut self, qlimit: u32) -> Self {
        self.qlimit = qlimit;
        self
    }

    pub fn with_flags(mut self, flags: PriqClassFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn default_class(self) -> Self {
        self.with_flags(PriqClassFlags::DEFAULTCLASS)
    }

    /// Returns true if unclassified traffic goes to this class.
    pub fn is_default(&self) -> bool {
        self.flags.contains(PriqClassFlags::DEFAULTCLASS)
    }
}

fn priq_request(request: ClassRequest) -> Result<PriqClassRequest> {
    match request {
        ClassRequest::Priq(request) => Ok(request),
        other => Err(Error::ClassInvalid(format!("expected priq parameters, got {other:?}"))),
    }
}

/// The PRIQ discipline of one interface.
#[derive(Debug, Default)]
pub struct PriqDiscipline {
    /// The class holding each priority level.
    levels: [Option<ClassId>; PRIQ_MAXPRI as usize],
    default: Option<(ClassId, KernelHandle)>,
}

impl PriqDiscipline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The class at `priority`.
    pub fn class_at(&self, priority: u8) -> Option<ClassId> {
        self.levels.get(usize::from(priority)).copied().flatten()
    }

    /// The class unclassified traffic goes to.
    pub fn default_class(&self) -> Option<ClassId> {
        self.default.map(|(id, _)| id)
    }

    /// Number of bands the kernel needs: one past the highest priority in use.
    pub fn bands(&self) -> u8 {
        self.levels.iter().rposition(Option::is_some).map_or(0, |p| p as u8 + 1)
    }

    /// Checks that `id` may take `request`'s priority and role.
    fn check(&self, id: ClassId, request: &PriqClassRequest) -> Result<()> {
        if request.priority >= PRIQ_MAXPRI {
            return Err(Error::OutOfRange(format!(
                "priq priority {} (max {})",
                request.priority,
                PRIQ_MAXPRI - 1
            )));
        }
        if self.class_at(request.priority).is_some_and(|holder| holder != id) {
            return Err(Error::ClassInvalid(format!(
                "priq: priority {} already in use",
                request.priority
            )));
        }
        if request.is_default() && self.default.is_some_and(|(default, _)| default != id) {
            return Err(Error::ClassInvalid("priq: default class already exists".into()));
        }
        Ok(())
    }

    fn release(&mut self, id: ClassId) {
        for level in &mut self.levels {
            if *level == Some(id) {
                *level = None;
            }
        }
        if self.default.is_some_and(|(default, _)| default == id) {
            self.default = None;
        }
    }

    fn take(&mut self, id: ClassId, handle: KernelHandle, request: &PriqClassRequest) {
        self.levels[usize::from(request.priority)] = Some(id);
        if request.is_default() {
            self.default = Some((id, handle));
        }
    }
}

impl Discipline for PriqDiscipline {
    fn kind(&self) -> DisciplineKind {
        DisciplineKind::Priq
    }

    fn qdisc_params(&self) -> QdiscParams {
        QdiscParams::Priq {
            default_class: self.default.map_or(KernelHandle::NONE, |(_, h)| h),
            bands: self.bands(),
        }
    }

    fn validate_enable(&self, _classes: &ClassTable) -> Result<()> {
        if self.default.is_none() {
            return Err(Error::Class("priq: no default class".into()));
        }
        Ok(())
    }

    fn as_classful(&mut self) -> Option<&mut dyn Classful> {
        Some(self)
    }
}

impl Classful for PriqDiscipline {
    fn add_class(
        &mut self,
        cx: &mut Context<'_>,
        class: NewClass<'_>,
    ) -> Result<(KernelHandle, ClassParams)> {
        let request = priq_request(class.request)?;
        if class.parent.is_some() {
            let name = class.name;
            return Err(Error::ClassInvalid(format!("priq class {name} cannot have a parent")));
        }
        self.check(class.id, &request)?;

        let kernel = KernelClass::Priq(request);
        let handle = cx.device.add_class(&cx.link, KernelHandle::NONE, &kernel)?;
        self.take(class.id, handle, &request);
        Ok((handle, ClassParams::Priq(request)))
    }

    fn modify_class(
        &mut self,
        cx: &mut Context<'_>,
        id: ClassId,
        request: ClassRequest,
    ) -> Result<()> {
        let request = priq_request(request)?;
        self.check(id, &request)?;

        let class = cx.classes.lookup_mut(id)?;
        cx.device.modify_class(&cx.link, class.handle(), &KernelClass::Priq(request))?;
        *class.params_mut() = ClassParams::Priq(request);

        let handle = class.handle();
        self.release(id);
        self.take(id, handle, &request);
        Ok(())
    }

    fn on_delete(&mut self, _classes: &mut ClassTable, id: ClassId) {
        self.release(id);
    }

    fn allows_multiple_roots(&self) -> bool {
        true
    }
}
