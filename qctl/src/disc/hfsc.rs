//! Hierarchical fair service curve.
//!
//! Every class is configured with a real-time and a link-sharing [`ServiceCurve`]. A class also
//! keeps, per curve type, the [`GenServiceCurve`] sum of what its children were promised.
//! Admitting a child means adding its curves to the parent's sums and checking that both sums
//! still fit under the parent's own curves.

use bitflags::bitflags;
use qctl_curve::{GenServiceCurve, ServiceCurve};

use super::{ClassParams, ClassRequest, Classful, Context, Discipline, DisciplineKind, NewClass};
use crate::{
    device::{KernelClass, KernelHandle, QdiscParams},
    error::{Error, Result},
    tree::{ClassId, ClassTable},
};

/// Default queue limit in packets.
pub const HFSC_DEFAULT_QLIMIT: u32 = 50;

bitflags! {
    /// Flags of an HFSC class.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct HfscClassFlags: u32 {
        const RED = 0x0001;
        const ECN = 0x0002;
        const RIO = 0x0004;
        const CLEARDSCP = 0x0010;
        /// Unclassified traffic goes to this class.
        const DEFAULTCLASS = 0x1000;
    }
}

/// An HFSC class as requested, and as installed in the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfscClassRequest {
    /// Real-time curve.
    pub rsc: ServiceCurve,
    /// Link-sharing curve.
    pub fsc: ServiceCurve,
    /// Queue limit in packets.
    pub qlimit: u32,
    pub flags: HfscClassFlags,
}

impl HfscClassRequest {
    /// A class with real-time curve `rsc` and link-sharing curve `fsc`.
    pub fn new(rsc: ServiceCurve, fsc: ServiceCurve) -> Self {
        Self { rsc, fsc, qlimit: HFSC_DEFAULT_QLIMIT, flags: HfscClassFlags::empty() }
    }

    /// Both curves linear at `rate` bits per second.
    pub fn linear(rate: u64) -> Self {
        let sc = ServiceCurve::linear(rate);
        Self::new(sc, sc)
    }

    /// A class with a link-sharing curve only.
    pub fn link_sharing(fsc: ServiceCurve) -> Self {
        Self::new(ServiceCurve::NULL, fsc)
    }

    /// Queue limit in packets.
    pub const fn with_qlimit(mut self, qlimit: u32) -> Self {
        self.qlimit = qlimit;
        self
    }

    pub fn with_flags(mut self, flags: HfscClassFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn default_class(self) -> Self {
        self.with_flags(HfscClassFlags::DEFAULTCLASS)
    }

    fn validate(&self) -> Result<()> {
        for (what, sc) in [("real-time", &self.rsc), ("link-sharing", &self.fsc)] {
            if !sc.is_valid() {
                return Err(Error::InvalidParameter(format!(
                    "{what} curve {sc} is convex with a nonzero first slope"
                )));
            }
        }
        if self.rsc.is_null() && self.fsc.is_null() {
            return Err(Error::InvalidParameter("hfsc class without a service curve".into()));
        }
        Ok(())
    }

    /// Returns true if neither curve promises more than a link of `bandwidth` can carry.
    fn fits_link(&self, bandwidth: u64) -> bool {
        let link = ServiceCurve::linear(bandwidth);
        [&self.rsc, &self.fsc].into_iter().all(|sc| {
            let mut promised = GenServiceCurve::new();
            promised.add(sc);
            promised.is_under(&link)
        })
    }

    fn check_link(&self, name: &str, bandwidth: u64) -> Result<()> {
        if self.fits_link(bandwidth) {
            return Ok(());
        }
        Err(Error::AdmissionNoBandwidth(format!(
            "root class {name} ({} rt, {} ls) exceeds the link bandwidth of {bandwidth} bps",
            self.rsc, self.fsc
        )))
    }
}

/// The parameter block of an installed HFSC class.
#[derive(Debug, Clone, PartialEq)]
pub struct HfscClass {
    pub request: HfscClassRequest,
    /// Sum of the children's real-time curves.
    pub gen_rsc: GenServiceCurve,
    /// Sum of the children's link-sharing curves.
    pub gen_fsc: GenServiceCurve,
}

impl HfscClass {
    pub fn new(request: HfscClassRequest) -> Self {
        Self { request, gen_rsc: GenServiceCurve::new(), gen_fsc: GenServiceCurve::new() }
    }

    /// Returns true if what the children were promised fits under the class's own curves.
    pub fn fits_children(&self) -> bool {
        self.gen_rsc.is_under(&self.request.rsc) && self.gen_fsc.is_under(&self.request.fsc)
    }

    fn add_child(&mut self, child: &HfscClassRequest) {
        self.gen_rsc.add(&child.rsc);
        self.gen_fsc.add(&child.fsc);
    }

    fn remove_child(&mut self, child: &HfscClassRequest) {
        self.gen_rsc.sub(&child.rsc);
        self.gen_fsc.sub(&child.fsc);
    }
}

fn hfsc_request(request: ClassRequest) -> Result<HfscClassRequest> {
    match request {
        ClassRequest::Hfsc(request) => Ok(request),
        other => Err(Error::ClassInvalid(format!("expected hfsc parameters, got {other:?}"))),
    }
}

fn hfsc_mut(params: &mut ClassParams) -> Result<&mut HfscClass> {
    match params {
        ClassParams::Hfsc(class) => Ok(class),
        _ => Err(Error::ClassInvalid("not an hfsc class".into())),
    }
}

/// The HFSC discipline of one interface.
#[derive(Debug, Default)]
pub struct HfscDiscipline {
    root: Option<ClassId>,
    default: Option<(ClassId, KernelHandle)>,
}

impl HfscDiscipline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The root class, once created.
    pub const fn root(&self) -> Option<ClassId> {
        self.root
    }

    /// The class unclassified traffic goes to.
    pub fn default_class(&self) -> Option<ClassId> {
        self.default.map(|(id, _)| id)
    }
}

impl Discipline for HfscDiscipline {
    fn kind(&self) -> DisciplineKind {
        DisciplineKind::Hfsc
    }

    fn qdisc_params(&self) -> QdiscParams {
        QdiscParams::Hfsc { default_class: self.default.map_or(KernelHandle::NONE, |(_, h)| h) }
    }

    /// The link-sharing scheduler only ever serves leaves: the default class must be one, and
    /// filters must not feed an internal class.
    fn validate_enable(&self, classes: &ClassTable) -> Result<()> {
        let Some((default, _)) = self.default else {
            return Err(Error::Class("hfsc: no default class".into()));
        };
        let default = classes.lookup(default)?;
        if !default.is_leaf() {
            let name = default.name();
            return Err(Error::Class(format!("hfsc: default class {name} is not a leaf")));
        }

        if let Some(class) = classes.iter().find(|c| !c.is_leaf() && !c.filters().is_empty()) {
            return Err(Error::Class(format!(
                "hfsc: internal class {} has filters, it is never served",
                class.name()
            )));
        }
        Ok(())
    }

    fn as_classful(&mut self) -> Option<&mut dyn Classful> {
        Some(self)
    }
}

impl Classful for HfscDiscipline {
    fn add_class(
        &mut self,
        cx: &mut Context<'_>,
        class: NewClass<'_>,
    ) -> Result<(KernelHandle, ClassParams)> {
        let request = hfsc_request(class.request)?;
        request.validate()?;

        let is_default = request.flags.contains(HfscClassFlags::DEFAULTCLASS);
        if is_default && self.default.is_some() {
            return Err(Error::ClassInvalid("hfsc: default class already exists".into()));
        }

        let parent_handle = match class.parent {
            Some(parent) => cx.classes.lookup(parent)?.handle(),
            None => {
                request.check_link(class.name, cx.link.bandwidth)?;
                KernelHandle::NONE
            }
        };
        let kernel = KernelClass::Hfsc(request.clone());
        let name = class.name;

        let handle = cx.classes.speculate(|tx| {
            if let Some(parent) = class.parent {
                let parent = hfsc_mut(tx.params_mut(parent)?)?;
                parent.add_child(&request);
                if !parent.fits_children() {
                    return Err(Error::AdmissionNoBandwidth(format!(
                        "class {name} ({} rt, {} ls) does not fit under its parent ({} rt, {} ls)",
                        request.rsc, request.fsc, parent.request.rsc, parent.request.fsc
                    )));
                }
            }
            Ok(cx.device.add_class(&cx.link, parent_handle, &kernel)?)
        })?;

        if class.parent.is_none() {
            self.root = Some(class.id);
        }
        if is_default {
            self.default = Some((class.id, handle));
        }

        Ok((handle, ClassParams::Hfsc(HfscClass::new(request))))
    }

    fn modify_class(
        &mut self,
        cx: &mut Context<'_>,
        id: ClassId,
        request: ClassRequest,
    ) -> Result<()> {
        let mut request = hfsc_request(request)?;
        let class = cx.classes.lookup(id)?;
        let (name, parent, handle) = (class.name().to_owned(), class.parent(), class.handle());
        let ClassParams::Hfsc(old) = class.params() else {
            return Err(Error::ClassInvalid(format!("{name} is not an hfsc class")));
        };
        let old = old.clone();

        // The default class stays the default class.
        request.flags.set(
            HfscClassFlags::DEFAULTCLASS,
            old.request.flags.contains(HfscClassFlags::DEFAULTCLASS),
        );
        request.validate()?;

        let shrunk = HfscClass { request: request.clone(), ..old.clone() };
        if !shrunk.fits_children() {
            return Err(Error::Admission(format!(
                "class {name} cannot go below what its children were promised"
            )));
        }

        let kernel = KernelClass::Hfsc(request.clone());
        cx.classes.speculate(|tx| {
            if let Some(parent) = parent {
                let parent = hfsc_mut(tx.params_mut(parent)?)?;
                parent.remove_child(&old.request);
                parent.add_child(&request);
                if !parent.fits_children() {
                    return Err(Error::AdmissionNoBandwidth(format!(
                        "class {name} ({} rt, {} ls) does not fit under its parent",
                        request.rsc, request.fsc
                    )));
                }
            } else {
                request.check_link(&name, cx.link.bandwidth)?;
            }

            hfsc_mut(tx.params_mut(id)?)?.request = request;
            Ok(cx.device.modify_class(&cx.link, handle, &kernel)?)
        })
    }

    fn on_delete(&mut self, classes: &mut ClassTable, id: ClassId) {
        let Some(class) = classes.get(id) else {
            return;
        };
        let parent = class.parent();
        let ClassParams::Hfsc(own) = class.params() else {
            return;
        };
        let request = own.request.clone();

        let parent = parent.and_then(|p| classes.get_mut(p)).map(|c| c.params_mut());
        if let Some(ClassParams::Hfsc(parent)) = parent {
            parent.remove_child(&request);
        }

        if self.root == Some(id) {
            self.root = None;
        }
        if self.default.is_some_and(|(default, _)| default == id) {
            self.default = None;
        }
    }
}
