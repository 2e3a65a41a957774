//! Applying a configuration.
//!
//! The configuration source hands over an ordered list of [`Declaration`]s referring to each
//! other by name. A load is all or nothing: if any declaration fails, or any interface refuses to
//! enable, everything is torn down.

use crate::{
    config::InterfaceConfig,
    device::KernelDevice,
    disc::{
        cbq::{CbqClassRequest, CbqDiscipline, CbqOptions},
        cdnr::{ConditionerDiscipline, ConditionerElement},
        hfsc::{HfscClassRequest, HfscDiscipline},
        leaf::{LeafDiscipline, LeafParams},
        nop::NopDiscipline,
        priq::{PriqClassRequest, PriqDiscipline},
        ClassRequest, Discipline, DisciplineKind,
    },
    error::{Error, Result},
    filter::FilterSpec,
    tree::{ClassId, Interface, InterfaceId, TrafficControlState},
};

/// The name of the class created with every HFSC interface.
pub const HFSC_ROOT: &str = "root";
/// The name of the class conditioner elements hang under.
pub const CONDITIONER_HOLDER: &str = "conditioner";

/// Which discipline an interface is scheduled by, with its interface-wide options.
#[derive(Debug, Clone, PartialEq)]
pub enum DisciplineConfig {
    None,
    Cbq(CbqOptions),
    Hfsc,
    Priq,
    Leaf(LeafParams),
    Conditioner,
}

impl DisciplineConfig {
    /// The kind of discipline this configuration builds.
    pub fn kind(&self) -> DisciplineKind {
        match self {
            Self::None => DisciplineKind::None,
            Self::Cbq(_) => DisciplineKind::Cbq,
            Self::Hfsc => DisciplineKind::Hfsc,
            Self::Priq => DisciplineKind::Priq,
            Self::Leaf(params) => params.kind(),
            Self::Conditioner => DisciplineKind::Conditioner,
        }
    }

    /// Creates a fresh discipline instance.
    pub fn build(&self) -> Box<dyn Discipline> {
        match self {
            Self::None => Box::new(NopDiscipline),
            Self::Cbq(options) => Box::new(CbqDiscipline::new(*options)),
            Self::Hfsc => Box::new(HfscDiscipline::new()),
            Self::Priq => Box::new(PriqDiscipline::new()),
            Self::Leaf(params) => Box::new(LeafDiscipline::new(*params)),
            Self::Conditioner => Box::new(ConditionerDiscipline::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDeclaration {
    pub name: String,
    pub config: InterfaceConfig,
    pub discipline: DisciplineConfig,
}

/// Class parameters with references to other classes by name.
#[derive(Debug, Clone, PartialEq)]
pub enum NamedRequest {
    None,
    /// `borrow` replaces the request's borrow target.
    Cbq { request: CbqClassRequest, borrow: Option<String> },
    Hfsc(HfscClassRequest),
    Priq(PriqClassRequest),
    Conditioner(ConditionerElement<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDeclaration {
    pub interface: String,
    pub name: String,
    /// `None` declares a root class, or for conditioner elements, an element of the holder.
    pub parent: Option<String>,
    pub request: NamedRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterDeclaration {
    pub interface: String,
    pub class: String,
    pub name: String,
    pub filter: FilterSpec,
}

/// One statement of a configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Interface(InterfaceDeclaration),
    Class(ClassDeclaration),
    Filter(FilterDeclaration),
}

impl Declaration {
    /// Declares an interface.
    pub fn interface(
        name: impl Into<String>,
        config: InterfaceConfig,
        discipline: DisciplineConfig,
    ) -> Self {
        Self::Interface(InterfaceDeclaration { name: name.into(), config, discipline })
    }

    /// Declares a class under `parent`, or a root when `parent` is `None`.
    pub fn class(
        interface: impl Into<String>,
        name: impl Into<String>,
        parent: Option<&str>,
        request: NamedRequest,
    ) -> Self {
        Self::Class(ClassDeclaration {
            interface: interface.into(),
            name: name.into(),
            parent: parent.map(str::to_owned),
            request,
        })
    }

    /// Declares a filter attached to `class`.
    pub fn filter(
        interface: impl Into<String>,
        class: impl Into<String>,
        name: impl Into<String>,
        filter: FilterSpec,
    ) -> Self {
        Self::Filter(FilterDeclaration {
            interface: interface.into(),
            class: class.into(),
            name: name.into(),
            filter,
        })
    }
}

impl<D: KernelDevice> TrafficControlState<D> {
    /// Builds the state from a configuration and enables every interface.
    ///
    /// On failure everything applied so far has been torn down.
    pub fn init(device: D, declarations: &[Declaration]) -> Result<Self> {
        let mut state = Self::new(device);
        state.reload(declarations)?;
        Ok(state)
    }

    /// Replaces the whole configuration: tears everything down, applies `declarations` and
    /// enables every interface.
    pub fn reload(&mut self, declarations: &[Declaration]) -> Result<()> {
        if let Err(e) = self.destroy_all() {
            tracing::warn!(?e, "previous configuration not fully removed");
        }

        match self.apply(declarations).and_then(|_| self.enable_all()) {
            Ok(()) => {
                tracing::info!(
                    interfaces = self.interfaces().count(),
                    declarations = declarations.len(),
                    "configuration loaded"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(?e, "configuration failed, removing everything");
                if let Err(teardown) = self.destroy_all() {
                    tracing::warn!(?teardown, "teardown after failed configuration incomplete");
                }
                Err(e)
            }
        }
    }

    /// Applies declarations in order, stopping at the first failure. Nothing is enabled and
    /// nothing is rolled back.
    pub fn apply(&mut self, declarations: &[Declaration]) -> Result<()> {
        for (i, declaration) in declarations.iter().enumerate() {
            if let Err(e) = self.declare(declaration) {
                tracing::error!(index = i, ?declaration, ?e, "declaration failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Enables every interface that is not enabled yet.
    pub fn enable_all(&mut self) -> Result<()> {
        let ids: Vec<_> =
            self.interfaces().filter(|i| !i.is_enabled()).map(Interface::id).collect();
        ids.into_iter().try_for_each(|id| self.enable(id))
    }

    /// Disables every enabled interface, returning the first failure.
    pub fn disable_all(&mut self) -> Result<()> {
        let ids: Vec<_> = self.interfaces().filter(|i| i.is_enabled()).map(Interface::id).collect();
        let mut first = None;
        for id in ids {
            if let Err(e) = self.disable(id) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn declare(&mut self, declaration: &Declaration) -> Result<()> {
        match declaration {
            Declaration::Interface(decl) => self.declare_interface(decl),
            Declaration::Class(decl) => self.declare_class(decl).map(drop),
            Declaration::Filter(decl) => {
                let iface = self.resolve_interface(&decl.interface)?;
                let class = self.resolve_class(iface, &decl.class)?;
                self.add_filter(class, &decl.name, decl.filter).map(drop)
            }
        }
    }

    fn declare_interface(&mut self, decl: &InterfaceDeclaration) -> Result<()> {
        let id = self.add_interface(&decl.name, decl.config, decl.discipline.build())?;

        match decl.discipline {
            DisciplineConfig::Hfsc => {
                let root = HfscClassRequest::linear(decl.config.bandwidth);
                self.add_class(id, None, HFSC_ROOT, ClassRequest::Hfsc(root))?;
            }
            DisciplineConfig::Conditioner => {
                self.add_class(id, None, CONDITIONER_HOLDER, ClassRequest::None)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn declare_class(&mut self, decl: &ClassDeclaration) -> Result<ClassId> {
        let iface = self.resolve_interface(&decl.interface)?;

        let parent = match (&decl.parent, &decl.request) {
            (Some(parent), _) => Some(self.resolve_class(iface, parent)?),
            (None, NamedRequest::Conditioner(_)) => {
                Some(self.resolve_class(iface, CONDITIONER_HOLDER)?)
            }
            (None, _) => None,
        };

        let request = match &decl.request {
            NamedRequest::None => ClassRequest::None,
            NamedRequest::Cbq { request, borrow } => {
                let mut request = request.clone();
                if let Some(borrow) = borrow {
                    request = request.with_borrow(self.resolve_class(iface, borrow)?);
                }
                ClassRequest::Cbq(request)
            }
            NamedRequest::Hfsc(request) => ClassRequest::Hfsc(request.clone()),
            NamedRequest::Priq(request) => ClassRequest::Priq(*request),
            NamedRequest::Conditioner(element) => ClassRequest::Conditioner(
                element.try_map_targets(|target: &String| self.resolve_class(iface, target))?,
            ),
        };

        self.add_class(iface, parent, &decl.name, request)
    }

    fn resolve_interface(&self, name: &str) -> Result<InterfaceId> {
        self.interface_by_name(name)
            .map(Interface::id)
            .ok_or_else(|| Error::BadInterface(name.to_owned()))
    }

    fn resolve_class(&self, iface: InterfaceId, name: &str) -> Result<ClassId> {
        self.find_class(iface, name).ok_or_else(|| Error::BadClass(name.to_owned()))
    }
}
