//! Traffic conditioners on input interfaces.
//!
//! Conditioner elements are stored as classes under a holder class that has no kernel object.
//! Elements pass packets on to each other through [`Action::Element`], which makes the
//! references a directed graph on top of the class tree. The discipline keeps that graph
//! explicitly: an element some other element points at cannot be deleted, so the tree's clear
//! removes referrers before their targets.

use std::fmt;

use rustc_hash::FxHashMap;

use super::{ClassParams, ClassRequest, Classful, Context, Discipline, DisciplineKind, NewClass};
use crate::{
    config::Direction,
    device::{KernelClass, KernelHandle, Link, QdiscParams, SchedulerDevice, TbProfile},
    error::{Error, Result},
    tree::{ClassId, ClassTable},
};

/// The highest DSCP value.
pub const DSCP_MAX: u8 = 0x3f;

/// What an element does with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action<T = ClassId> {
    Pass,
    Drop,
    /// Rewrite the DSCP and pass.
    Mark(u8),
    /// Continue with the next element in the input chain.
    Next,
    /// Return to the caller of this chain.
    Return,
    /// Hand the packet to another element.
    Element(T),
}

impl<T> Action<T> {
    /// The element this action hands packets to, if any.
    pub fn target(&self) -> Option<&T> {
        match self {
            Self::Element(target) => Some(target),
            _ => None,
        }
    }

    pub fn try_map<U, E>(&self, f: &mut impl FnMut(&T) -> std::result::Result<U, E>) -> std::result::Result<Action<U>, E> {
        Ok(match self {
            Self::Pass => Action::Pass,
            Self::Drop => Action::Drop,
            Self::Mark(dscp) => Action::Mark(*dscp),
            Self::Next => Action::Next,
            Self::Return => Action::Return,
            Self::Element(target) => Action::Element(f(target)?),
        })
    }
}

impl<T: fmt::Debug> fmt::Display for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("pass"),
            Self::Drop => f.write_str("drop"),
            Self::Mark(dscp) => write!(f, "mark {dscp:#04x}"),
            Self::Next => f.write_str("next"),
            Self::Return => f.write_str("return"),
            Self::Element(target) => write!(f, "element {target:?}"),
        }
    }
}

/// A conditioner element. `T` is how other elements are referred to: [`ClassId`] in the tree,
/// [`KernelHandle`] on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConditionerElement<T = ClassId> {
    /// Applies the action to every packet.
    Action(Action<T>),
    /// Single-rate meter.
    TokenBucket { profile: TbProfile, in_action: Action<T>, out_action: Action<T> },
    /// Two-rate three-color marker.
    TwoRateThreeColor {
        committed: TbProfile,
        peak: TbProfile,
        green: Action<T>,
        yellow: Action<T>,
        red: Action<T>,
        /// Take the color already carried by the packet into account.
        color_aware: bool,
    },
    /// Time-sliding-window three-color marker. Rates in bits per second.
    TimeSlidingWindow {
        committed_rate: u64,
        peak_rate: u64,
        avg_interval_ms: u32,
        green: Action<T>,
        yellow: Action<T>,
        red: Action<T>,
    },
}

impl<T> ConditionerElement<T> {
    /// Every action of the element.
    pub fn actions(&self) -> Vec<&Action<T>> {
        match self {
            Self::Action(action) => vec![action],
            Self::TokenBucket { in_action, out_action, .. } => vec![in_action, out_action],
            Self::TwoRateThreeColor { green, yellow, red, .. }
            | Self::TimeSlidingWindow { green, yellow, red, .. } => vec![green, yellow, red],
        }
    }

    /// Elements this one hands packets to.
    pub fn targets(&self) -> impl Iterator<Item = &T> + '_ {
        self.actions().into_iter().filter_map(Action::target)
    }

    /// Rewrites every reference to another element with `f`.
    pub fn try_map_targets<U, E>(
        &self,
        mut f: impl FnMut(&T) -> std::result::Result<U, E>,
    ) -> std::result::Result<ConditionerElement<U>, E> {
        Ok(match self {
            Self::Action(action) => ConditionerElement::Action(action.try_map::<U, E>(&mut f)?),
            Self::TokenBucket { profile, in_action, out_action } => {
                ConditionerElement::TokenBucket {
                    profile: *profile,
                    in_action: in_action.try_map::<U, E>(&mut f)?,
                    out_action: out_action.try_map::<U, E>(&mut f)?,
                }
            }
            Self::TwoRateThreeColor { committed, peak, green, yellow, red, color_aware } => {
                ConditionerElement::TwoRateThreeColor {
                    committed: *committed,
                    peak: *peak,
                    green: green.try_map::<U, E>(&mut f)?,
                    yellow: yellow.try_map::<U, E>(&mut f)?,
                    red: red.try_map::<U, E>(&mut f)?,
                    color_aware: *color_aware,
                }
            }
            Self::TimeSlidingWindow {
                committed_rate,
                peak_rate,
                avg_interval_ms,
                green,
                yellow,
                red,
            } => {
                ConditionerElement::TimeSlidingWindow {
                    committed_rate: *committed_rate,
                    peak_rate: *peak_rate,
                    avg_interval_ms: *avg_interval_ms,
                    green: green.try_map::<U, E>(&mut f)?,
                    yellow: yellow.try_map::<U, E>(&mut f)?,
                    red: red.try_map::<U, E>(&mut f)?,
                }
            }
        })
    }

    fn validate(&self) -> Result<()> {
        for action in self.actions() {
            if let Action::Mark(dscp) = action {
                if *dscp > DSCP_MAX {
                    return Err(Error::OutOfRange(format!("dscp {dscp:#x}")));
                }
            }
        }

        match self {
            Self::TokenBucket { profile, .. } if profile.rate == 0 => {
                Err(Error::InvalidParameter("token bucket meter without a rate".into()))
            }
            Self::TwoRateThreeColor { committed, peak, .. } if committed.rate > peak.rate => {
                Err(Error::InvalidParameter("trtcm committed rate above peak rate".into()))
            }
            Self::TimeSlidingWindow { committed_rate, peak_rate, avg_interval_ms, .. }
                if committed_rate > peak_rate || *avg_interval_ms == 0 =>
            {
                Err(Error::InvalidParameter("tswtcm rates or interval out of order".into()))
            }
            _ => Ok(()),
        }
    }
}

fn element_request(request: ClassRequest) -> Result<Option<ConditionerElement>> {
    match request {
        ClassRequest::None => Ok(None),
        ClassRequest::Conditioner(element) => Ok(Some(element)),
        other => Err(Error::ClassInvalid(format!("conditioner expects elements, got {other:?}"))),
    }
}

/// The conditioner discipline of one input interface.
#[derive(Debug, Default)]
pub struct ConditionerDiscipline {
    holder: Option<ClassId>,
    /// Element references, referrer to targets.
    edges: FxHashMap<ClassId, Vec<ClassId>>,
}

impl ConditionerDiscipline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The class all elements hang under.
    pub const fn holder(&self) -> Option<ClassId> {
        self.holder
    }

    /// Elements referring to `id`.
    pub fn referrers(&self, id: ClassId) -> impl Iterator<Item = ClassId> + '_ {
        self.edges.iter().filter(move |(_, targets)| targets.contains(&id)).map(|(from, _)| *from)
    }

    /// Returns true if following references from `from` leads to `to`.
    fn reaches(&self, from: ClassId, to: ClassId) -> bool {
        let mut stack = vec![from];
        let mut seen = Vec::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            stack.extend(self.edges.get(&id).into_iter().flatten().copied());
        }
        false
    }

    /// Checks the targets of `element` and resolves them to kernel handles.
    fn resolve(
        &self,
        classes: &ClassTable,
        id: ClassId,
        element: &ConditionerElement,
    ) -> Result<(Vec<ClassId>, ConditionerElement<KernelHandle>)> {
        element.validate()?;

        let mut targets = Vec::new();
        let kernel = element.try_map_targets(|target: &ClassId| -> Result<KernelHandle> {
            let class = classes.lookup(*target)?;
            if Some(*target) == self.holder {
                return Err(Error::ClassInvalid("the holder class is not an element".into()));
            }
            if *target == id || self.reaches(*target, id) {
                return Err(Error::ClassInvalid(format!(
                    "element {} would refer back to itself",
                    class.name()
                )));
            }
            targets.try_reserve(1)?;
            targets.push(*target);
            Ok(class.handle())
        })?;

        Ok((targets, kernel))
    }
}

impl Discipline for ConditionerDiscipline {
    fn kind(&self) -> DisciplineKind {
        DisciplineKind::Conditioner
    }

    fn qdisc_params(&self) -> QdiscParams {
        QdiscParams::Conditioner
    }

    fn attach(&mut self, link: &Link<'_>, device: &mut dyn SchedulerDevice) -> Result<()> {
        if link.direction != Direction::Input {
            return Err(Error::InvalidParameter(format!(
                "{}: conditioners run on input interfaces",
                link.name
            )));
        }
        Ok(device.attach(link, &self.qdisc_params())?)
    }

    fn as_classful(&mut self) -> Option<&mut dyn Classful> {
        Some(self)
    }
}

impl Classful for ConditionerDiscipline {
    fn add_class(
        &mut self,
        cx: &mut Context<'_>,
        class: NewClass<'_>,
    ) -> Result<(KernelHandle, ClassParams)> {
        let element = element_request(class.request)?;

        let (parent, element) = match (class.parent, element) {
            (None, None) => {
                self.holder = Some(class.id);
                return Ok((KernelHandle::NONE, ClassParams::None));
            }
            (Some(parent), Some(element)) => (parent, element),
            (None, Some(_)) => {
                return Err(Error::ClassInvalid(format!(
                    "element {} needs the holder class as parent",
                    class.name
                )));
            }
            (Some(_), None) => {
                return Err(Error::ClassInvalid(format!("element {} has no action", class.name)));
            }
        };

        let parent_handle = cx.classes.lookup(parent)?.handle();
        let (targets, kernel) = self.resolve(cx.classes, class.id, &element)?;
        self.edges.try_reserve(1)?;

        let handle =
            cx.device.add_class(&cx.link, parent_handle, &KernelClass::Conditioner(kernel))?;
        if !targets.is_empty() {
            self.edges.insert(class.id, targets);
        }
        Ok((handle, ClassParams::Conditioner(element)))
    }

    fn modify_class(
        &mut self,
        cx: &mut Context<'_>,
        id: ClassId,
        request: ClassRequest,
    ) -> Result<()> {
        let Some(element) = element_request(request)? else {
            return Err(Error::ClassInvalid("an element cannot become the holder".into()));
        };
        if Some(id) == self.holder {
            return Err(Error::ClassInvalid("the holder class has no action".into()));
        }

        let (targets, kernel) = self.resolve(cx.classes, id, &element)?;
        self.edges.try_reserve(1)?;

        let class = cx.classes.lookup_mut(id)?;
        cx.device.modify_class(&cx.link, class.handle(), &KernelClass::Conditioner(kernel))?;
        *class.params_mut() = ClassParams::Conditioner(element);

        self.edges.remove(&id);
        if !targets.is_empty() {
            self.edges.insert(id, targets);
        }
        Ok(())
    }

    fn on_delete(&mut self, _classes: &mut ClassTable, id: ClassId) {
        self.edges.remove(&id);
        if self.holder == Some(id) {
            self.holder = None;
        }
    }

    fn delete_class(&mut self, cx: &mut Context<'_>, id: ClassId) -> Result<()> {
        let handle = cx.classes.lookup(id)?.handle();
        if handle.is_none() {
            return Ok(());
        }
        Ok(cx.device.delete_class(&cx.link, handle)?)
    }

    fn is_referenced(&self, id: ClassId) -> bool {
        self.referrers(id).next().is_some()
    }
}
