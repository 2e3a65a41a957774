use std::collections::BTreeMap;

use crate::{
    device::KernelHandle,
    disc::ClassParams,
    error::{Error, Result},
};

/// Identifies an interface within a [`TrafficControlState`](crate::TrafficControlState).
///
/// Identifiers are never reused, so a stale identifier fails lookups instead of aliasing a newer
/// entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub(crate) u32);

/// Identifies a class. Scoped to its interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId {
    pub(crate) iface: InterfaceId,
    pub(crate) index: u32,
}

impl ClassId {
    /// The interface owning the class.
    pub const fn interface(&self) -> InterfaceId {
        self.iface
    }
}

/// Identifies a filter. Scoped to its interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterId {
    pub(crate) iface: InterfaceId,
    pub(crate) index: u32,
}

impl FilterId {
    /// The interface owning the filter.
    pub const fn interface(&self) -> InterfaceId {
        self.iface
    }
}

/// A node of an interface's class tree.
#[derive(Debug, Clone)]
pub struct Class {
    id: ClassId,
    name: String,
    parent: Option<ClassId>,
    children: Vec<ClassId>,
    handle: KernelHandle,
    filters: Vec<FilterId>,
    params: ClassParams,
}

impl Class {
    pub(crate) fn new(
        id: ClassId,
        name: &str,
        parent: Option<ClassId>,
        handle: KernelHandle,
        params: ClassParams,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            parent,
            children: Vec::new(),
            handle,
            filters: Vec::new(),
            params,
        }
    }

    /// The class's identifier.
    pub const fn id(&self) -> ClassId {
        self.id
    }

    /// The configured name. Not unique.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent class, `None` for a root.
    pub const fn parent(&self) -> Option<ClassId> {
        self.parent
    }

    /// Direct children in creation order.
    pub fn children(&self) -> &[ClassId] {
        &self.children
    }

    /// Returns true if the class has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The kernel handle, [`KernelHandle::NONE`] when the discipline installs nothing.
    pub const fn handle(&self) -> KernelHandle {
        self.handle
    }

    /// Filters feeding this class, in the order they were added.
    pub fn filters(&self) -> &[FilterId] {
        &self.filters
    }

    /// Discipline-private parameters.
    pub const fn params(&self) -> &ClassParams {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut ClassParams {
        &mut self.params
    }

    pub(crate) fn filters_mut(&mut self) -> &mut Vec<FilterId> {
        &mut self.filters
    }
}

/// The classes of one interface.
///
/// The table owns the classes; parent and child links are identifiers into it. Only inserting a
/// class creates an edge, and only to a parent already in the table, so the links always form a
/// forest.
#[derive(Debug)]
pub struct ClassTable {
    iface: InterfaceId,
    classes: BTreeMap<u32, Class>,
    next: u32,
}

impl ClassTable {
    pub(crate) const fn new(iface: InterfaceId) -> Self {
        Self { iface, classes: BTreeMap::new(), next: 1 }
    }

    /// The identifier the next inserted class receives.
    pub(crate) const fn vacant_id(&self) -> ClassId {
        ClassId { iface: self.iface, index: self.next }
    }

    /// Looks up a class of this table.
    pub fn get(&self, id: ClassId) -> Option<&Class> {
        if id.iface != self.iface {
            return None;
        }
        self.classes.get(&id.index)
    }

    pub(crate) fn get_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        if id.iface != self.iface {
            return None;
        }
        self.classes.get_mut(&id.index)
    }

    /// Like [`ClassTable::get`], failing with [`Error::BadClass`].
    pub fn lookup(&self, id: ClassId) -> Result<&Class> {
        self.get(id).ok_or_else(|| Error::BadClass(format!("{id:?}")))
    }

    pub(crate) fn lookup_mut(&mut self, id: ClassId) -> Result<&mut Class> {
        self.get_mut(id).ok_or_else(|| Error::BadClass(format!("{id:?}")))
    }

    /// Returns true if `id` names a class of this table.
    pub fn contains(&self, id: ClassId) -> bool {
        self.get(id).is_some()
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns true if the table holds no class.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Classes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Class> + '_ {
        self.classes.values()
    }

    /// Classes without a parent.
    pub fn roots(&self) -> impl Iterator<Item = &Class> + '_ {
        self.iter().filter(|c| c.parent.is_none())
    }

    /// The first class named `name`.
    pub fn find(&self, name: &str) -> Option<&Class> {
        self.iter().find(|c| c.name == name)
    }

    /// Names from the root down to `id`.
    pub fn path(&self, id: ClassId) -> Vec<&str> {
        let mut path = Vec::new();
        let mut cursor = self.get(id);
        while let Some(class) = cursor {
            path.push(class.name());
            cursor = class.parent.and_then(|p| self.get(p));
        }
        path.reverse();
        path
    }

    /// Makes room in `parent`'s child list so that linking a new child cannot fail.
    pub(crate) fn reserve_child(&mut self, parent: ClassId) -> Result<()> {
        Ok(self.lookup_mut(parent)?.children.try_reserve(1)?)
    }

    /// Inserts `class`, which must carry [`ClassTable::vacant_id`], and links it under its parent.
    pub(crate) fn insert(&mut self, class: Class) -> Result<ClassId> {
        let id = class.id;
        debug_assert_eq!(id, self.vacant_id());

        if let Some(parent) = class.parent {
            self.reserve_child(parent)?;
        }

        self.next += 1;
        self.classes.insert(id.index, class);
        if let Some(parent) = self.get(id).and_then(|c| c.parent) {
            self.lookup_mut(parent)?.children.push(id);
        }

        Ok(id)
    }

    /// Unlinks a leaf class from its parent and removes it.
    pub(crate) fn remove(&mut self, id: ClassId) -> Result<Class> {
        let class = self.lookup(id)?;
        if !class.is_leaf() {
            return Err(Error::ClassPermission(format!("class {} has children", class.name)));
        }

        if let Some(parent) = class.parent {
            let siblings = &mut self.lookup_mut(parent)?.children;
            let pos = siblings.iter().position(|c| *c == id);
            debug_assert!(pos.is_some(), "class not linked under its parent");
            if let Some(pos) = pos {
                siblings.remove(pos);
            }
        }

        self.classes.remove(&id.index).ok_or_else(|| Error::BadClass(format!("{id:?}")))
    }

    /// Runs `f` against the table, restoring every class parameter block it touched through
    /// [`Speculation::params_mut`] if it fails.
    pub fn speculate<R>(
        &mut self,
        f: impl FnOnce(&mut Speculation<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut spec = Speculation { table: self, saved: Vec::new() };
        match f(&mut spec) {
            Ok(value) => Ok(value),
            Err(e) => {
                for (id, params) in spec.saved.into_iter().rev() {
                    if let Some(class) = spec.table.get_mut(id) {
                        class.params = params;
                    }
                }
                Err(e)
            }
        }
    }
}

/// Access to a [`ClassTable`] that snapshots parameter blocks before handing them out mutably.
#[derive(Debug)]
pub struct Speculation<'a> {
    table: &'a mut ClassTable,
    saved: Vec<(ClassId, ClassParams)>,
}

impl Speculation<'_> {
    /// Looks up a class, seeing changes made so far.
    pub fn class(&self, id: ClassId) -> Result<&Class> {
        self.table.lookup(id)
    }

    /// Mutable parameters of `id`, saved first so that a failure restores them.
    pub fn params_mut(&mut self, id: ClassId) -> Result<&mut ClassParams> {
        let class = self.table.lookup_mut(id)?;
        if !self.saved.iter().any(|(saved, _)| *saved == id) {
            self.saved.push((id, class.params.clone()));
        }
        Ok(&mut class.params)
    }
}
