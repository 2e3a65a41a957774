//! The `none` discipline: accepts everything, installs nothing.
//!
//! Useful to check a configuration, class tree and filter rules included, without a kernel
//! scheduler.

use super::{
    cbq::CbqClass, hfsc::HfscClass, ClassParams, ClassRequest, Classful, Context, Discipline,
    DisciplineKind, NewClass,
};
use crate::{
    device::{KernelHandle, Link, SchedulerDevice},
    error::Result,
    filter::FilterSpec,
    tree::ClassId,
};

/// The `none` discipline: the tree is kept, the device is never touched.
#[derive(Debug, Default)]
pub struct NopDiscipline;

impl Discipline for NopDiscipline {
    fn kind(&self) -> DisciplineKind {
        DisciplineKind::None
    }

    fn attach(&mut self, _link: &Link<'_>, _device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(())
    }

    fn detach(&mut self, _link: &Link<'_>, _device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self, _link: &Link<'_>, _device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(())
    }

    fn enable(&mut self, _link: &Link<'_>, _device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(())
    }

    fn disable(&mut self, _link: &Link<'_>, _device: &mut dyn SchedulerDevice) -> Result<()> {
        Ok(())
    }

    fn as_classful(&mut self) -> Option<&mut dyn Classful> {
        Some(self)
    }
}

/// Keeps the request so it can be inspected, without admission bookkeeping.
fn params_of(request: ClassRequest) -> ClassParams {
    match request {
        ClassRequest::None => ClassParams::None,
        ClassRequest::Cbq(request) => ClassParams::Cbq(CbqClass::unchecked(request)),
        ClassRequest::Hfsc(request) => ClassParams::Hfsc(HfscClass::new(request)),
        ClassRequest::Priq(request) => ClassParams::Priq(request),
        ClassRequest::Conditioner(element) => ClassParams::Conditioner(element),
    }
}

impl Classful for NopDiscipline {
    fn add_class(
        &mut self,
        _cx: &mut Context<'_>,
        class: NewClass<'_>,
    ) -> Result<(KernelHandle, ClassParams)> {
        Ok((KernelHandle::NONE, params_of(class.request)))
    }

    fn modify_class(
        &mut self,
        cx: &mut Context<'_>,
        id: ClassId,
        request: ClassRequest,
    ) -> Result<()> {
        *cx.classes.lookup_mut(id)?.params_mut() = params_of(request);
        Ok(())
    }

    fn delete_class(&mut self, _cx: &mut Context<'_>, _id: ClassId) -> Result<()> {
        Ok(())
    }

    fn add_filter(
        &mut self,
        _cx: &mut Context<'_>,
        _class: ClassId,
        _filter: &FilterSpec,
    ) -> Result<KernelHandle> {
        Ok(KernelHandle::NONE)
    }

    fn delete_filter(&mut self, _cx: &mut Context<'_>, _handle: KernelHandle) -> Result<()> {
        Ok(())
    }
}
