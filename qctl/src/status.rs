//! Read-only queries for status reporting.
//!
//! Classes and filters are reported under fully qualified names built from the class tree:
//! `em0:/root/bulk` for a class and `em0:/root/bulk:ssh` for a filter feeding it.

use crate::{
    device::{KernelDevice, KernelHandle},
    disc::DisciplineKind,
    error::{Error, Result},
    tree::{ClassId, FilterId, Interface, TrafficControlState},
};

/// What an [`Entry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A managed interface.
    Interface,
    /// A class, named by its path from the root.
    Class,
    /// A filter, named after its class.
    Filter,
}

/// One object of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// What the entry describes.
    pub kind: EntryKind,
    /// Fully qualified name.
    pub name: String,
    /// The kernel handle, [`KernelHandle::NONE`] for interfaces.
    pub handle: KernelHandle,
}

/// A summary of one managed interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceStatus {
    /// System name of the interface.
    pub name: String,
    /// Kind of the attached discipline.
    pub discipline: DisciplineKind,
    /// Bits per second.
    pub bandwidth: u64,
    /// Whether the discipline is active.
    pub enabled: bool,
}

fn class_path(iface: &Interface, id: ClassId) -> String {
    format!("{}:/{}", iface.name(), iface.classes().path(id).join("/"))
}

impl<D: KernelDevice> TrafficControlState<D> {
    /// Every interface, class and filter. Each interface comes first, followed by its classes in
    /// creation order, then its filters in rule order.
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries = Vec::new();
        for iface in self.interfaces() {
            entries.push(Entry {
                kind: EntryKind::Interface,
                name: iface.name().to_owned(),
                handle: KernelHandle::NONE,
            });
            entries.extend(iface.classes().iter().map(|class| Entry {
                kind: EntryKind::Class,
                name: class_path(iface, class.id()),
                handle: class.handle(),
            }));
            entries.extend(iface.filters().map(|filter| Entry {
                kind: EntryKind::Filter,
                name: format!("{}:{}", class_path(iface, filter.class()), filter.name()),
                handle: filter.handle(),
            }));
        }
        entries
    }

    /// The fully qualified name of the class or filter installed under `handle` on `ifname`.
    pub fn name_of_handle(&self, ifname: &str, handle: KernelHandle) -> Option<String> {
        if handle.is_none() {
            return None;
        }
        let iface = self.interface_by_name(ifname)?;

        if let Some(class) = iface.classes().iter().find(|c| c.handle() == handle) {
            return Some(class_path(iface, class.id()));
        }
        iface
            .filters()
            .find(|f| f.handle() == handle)
            .map(|f| format!("{}:{}", class_path(iface, f.class()), f.name()))
    }

    /// The fully qualified name of a class.
    pub fn class_name(&self, id: ClassId) -> Option<String> {
        let iface = self.interface(id.interface())?;
        iface.classes().get(id).map(|_| class_path(iface, id))
    }

    /// Summarizes the interface named `name`.
    pub fn interface_status(&self, name: &str) -> Result<InterfaceStatus> {
        let iface =
            self.interface_by_name(name).ok_or_else(|| Error::BadInterface(name.to_owned()))?;
        Ok(InterfaceStatus {
            name: iface.name().to_owned(),
            discipline: iface.kind(),
            bandwidth: iface.bandwidth(),
            enabled: iface.is_enabled(),
        })
    }

    /// The match of a filter in human readable form.
    pub fn filter_description(&self, id: FilterId) -> Result<String> {
        self.filter(id)
            .map(|f| f.spec().to_string())
            .ok_or_else(|| Error::BadFilter(format!("{id:?}")))
    }
}
