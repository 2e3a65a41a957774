//! The token-bucket regulator side table.
//!
//! An interface configured with a token-bucket profile registers it here when it is added. The
//! profile is installed when the interface is enabled, after reading whatever the device had
//! before, and that previous value is written back when the interface is disabled or torn down.

use rustc_hash::FxHashMap;

use crate::{
    device::{TbProfile, TokenBucketDevice},
    error::Result,
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    profile: TbProfile,
    /// What the device had before our first install. `Some` while our profile is installed.
    saved: Option<TbProfile>,
}

/// Pending and installed token-bucket profiles, by interface name.
#[derive(Debug, Default)]
pub struct TbrTable {
    entries: FxHashMap<String, Entry>,
}

impl TbrTable {
    /// The profile registered for `ifname`.
    pub fn profile(&self, ifname: &str) -> Option<TbProfile> {
        self.entries.get(ifname).map(|e| e.profile)
    }

    /// Returns true if our profile is currently installed on `ifname`.
    pub fn is_installed(&self, ifname: &str) -> bool {
        self.entries.get(ifname).is_some_and(|e| e.saved.is_some())
    }

    pub(crate) fn register(&mut self, ifname: &str, profile: TbProfile) -> Result<()> {
        self.entries.try_reserve(1)?;
        self.entries.insert(ifname.to_owned(), Entry { profile, saved: None });
        Ok(())
    }

    /// Installs the registered profile, if any.
    pub(crate) fn install(
        &mut self,
        ifname: &str,
        device: &mut dyn TokenBucketDevice,
    ) -> Result<()> {
        let Some(entry) = self.entries.get_mut(ifname) else {
            return Ok(());
        };

        if entry.saved.is_none() {
            entry.saved = Some(device.token_bucket(ifname)?);
        }
        device.set_token_bucket(ifname, &entry.profile)?;

        let Entry { profile, saved } = entry;
        tracing::debug!(interface = ifname, ?profile, ?saved, "token bucket installed");
        Ok(())
    }

    /// Writes back the value the device had before [`TbrTable::install`].
    pub(crate) fn restore(
        &mut self,
        ifname: &str,
        device: &mut dyn TokenBucketDevice,
    ) -> Result<()> {
        let Some(entry) = self.entries.get_mut(ifname) else {
            return Ok(());
        };

        if let Some(saved) = entry.saved {
            device.set_token_bucket(ifname, &saved)?;
            entry.saved = None;
            tracing::debug!(interface = ifname, ?saved, "token bucket restored");
        }
        Ok(())
    }

    /// Restores and forgets the entry of `ifname`. The entry is dropped even if restoring fails.
    pub(crate) fn remove(
        &mut self,
        ifname: &str,
        device: &mut dyn TokenBucketDevice,
    ) -> Result<()> {
        let res = self.restore(ifname, device);
        self.entries.remove(ifname);
        res
    }
}
