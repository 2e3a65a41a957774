//! Queueing disciplines.
//!
//! The resource tree only ever talks to a discipline through [`Discipline`] (interface scope)
//! and, for disciplines with classes, [`Classful`] (class and filter scope).
//!
//! ```text
//!                 Discipline
//!   attach / detach / clear / enable / disable / validate_enable
//!                     |
//!                     | as_classful()
//!                     v
//!                  Classful
//!   add_class / modify_class / on_delete / delete_class
//!   add_filter / delete_filter
//! ```

use std::fmt;

use crate::{
    device::{KernelHandle, Link, QdiscParams, SchedulerDevice},
    error::Result,
    filter::FilterSpec,
    tree::{ClassId, ClassTable},
};

pub mod cbq;
pub mod cdnr;
pub mod hfsc;
pub mod leaf;
pub mod nop;
pub mod priq;

/// The discipline variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisciplineKind {
    None,
    Cbq,
    Hfsc,
    Priq,
    Red,
    Rio,
    Blue,
    Wfq,
    Fifo,
    Conditioner,
}

impl DisciplineKind {
    /// The configuration keyword of the discipline.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Cbq => "cbq",
            Self::Hfsc => "hfsc",
            Self::Priq => "priq",
            Self::Red => "red",
            Self::Rio => "rio",
            Self::Blue => "blue",
            Self::Wfq => "wfq",
            Self::Fifo => "fifo",
            Self::Conditioner => "conditioner",
        }
    }
}

impl fmt::Display for DisciplineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A class as requested by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassRequest {
    /// No parameters, for disciplines that need none.
    None,
    Cbq(cbq::CbqClassRequest),
    Hfsc(hfsc::HfscClassRequest),
    Priq(priq::PriqClassRequest),
    Conditioner(cdnr::ConditionerElement),
}

/// The discipline-private parameter block of a class.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassParams {
    None,
    Cbq(cbq::CbqClass),
    Hfsc(hfsc::HfscClass),
    Priq(priq::PriqClassRequest),
    Conditioner(cdnr::ConditionerElement),
}

/// What a discipline needs to act on one interface.
#[allow(missing_debug_implementations)]
pub struct Context<'a> {
    pub link: Link<'a>,
    pub device: &'a mut dyn SchedulerDevice,
    pub classes: &'a mut ClassTable,
}

/// A class about to be added. `id` is the identifier it will receive if the add succeeds.
#[derive(Debug)]
pub struct NewClass<'a> {
    pub id: ClassId,
    pub name: &'a str,
    pub parent: Option<ClassId>,
    pub request: ClassRequest,
}

/// Interface-scope operations of a discipline.
pub trait Discipline: fmt::Debug {
    fn kind(&self) -> DisciplineKind;

    /// Interface parameters as they currently stand.
    fn qdisc_params(&self) -> QdiscParams {
        QdiscParams::None
    }

    fn attach(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(device.attach(link, &self.qdisc_params())?)
    }

    fn detach(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(device.detach(link)?)
    }

    fn clear(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(device.clear(link)?)
    }

    fn enable(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(device.enable(link, &self.qdisc_params())?)
    }

    fn disable(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(device.disable(link)?)
    }

    /// Checks the class tree before the interface is enabled.
    fn validate_enable(&self, _classes: &ClassTable) -> Result<()> {
        Ok(())
    }

    /// The class and filter operations, for disciplines that have classes.
    fn as_classful(&mut self) -> Option<&mut dyn Classful> {
        None
    }
}

/// Class and filter operations of a discipline.
pub trait Classful {
    /// Installs a new class, returning its kernel handle and private parameters.
    ///
    /// Any admission bookkeeping on other classes is done through
    /// [`ClassTable::speculate`] so that a failure leaves the table untouched.
    fn add_class(
        &mut self,
        cx: &mut Context<'_>,
        class: NewClass<'_>,
    ) -> Result<(KernelHandle, ClassParams)>;

    fn modify_class(&mut self, cx: &mut Context<'_>, id: ClassId, request: ClassRequest)
        -> Result<()>;

    /// Undoes the bookkeeping done for `id` when it was added. Runs before the class is unlinked.
    fn on_delete(&mut self, _classes: &mut ClassTable, _id: ClassId) {}

    fn delete_class(&mut self, cx: &mut Context<'_>, id: ClassId) -> Result<()> {
        let handle = cx.classes.lookup(id)?.handle();
        Ok(cx.device.delete_class(&cx.link, handle)?)
    }

    fn add_filter(
        &mut self,
        cx: &mut Context<'_>,
        class: ClassId,
        filter: &FilterSpec,
    ) -> Result<KernelHandle> {
        let handle = cx.classes.lookup(class)?.handle();
        Ok(cx.device.add_filter(&cx.link, handle, filter)?)
    }

    fn delete_filter(&mut self, cx: &mut Context<'_>, handle: KernelHandle) -> Result<()> {
        Ok(cx.device.delete_filter(&cx.link, handle)?)
    }

    /// Returns true if another class depends on `id` beyond the tree structure, which makes it
    /// undeletable for now.
    fn is_referenced(&self, _id: ClassId) -> bool {
        false
    }

    /// Returns true if the interface may have more than one class without a parent.
    fn allows_multiple_roots(&self) -> bool {
        false
    }
}
