//! Resolved device paths for every partition role.
//!
//! A [`PartitionTable`] is produced by applying a partition plan and is then
//! rewritten once by the encryption layer, after which `system` points at the
//! mapped device and `system_crypt` at the raw partition underneath it.
//! Formatting, mounting and the fstab/crypttab renderers all read from it.

use crate::utils::error::{ArchitectError, Result};
use serde::Serialize;

/// Partitions belonging to a Windows installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowsPartitions {
    pub msr: String,
    pub windows: String,
    pub recovery: String,
}

/// Device path for each partition role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTable {
    pub efi: String,
    pub boot: String,
    /// Device holding the root filesystem (the mapped device once encrypted)
    pub system: String,
    /// Raw partition underneath the LUKS mapping
    pub system_crypt: Option<String>,
    pub windows: Option<WindowsPartitions>,
}

impl PartitionTable {
    /// Point `system` at the mapped device and keep the raw partition in
    /// `system_crypt`. Can only be applied once.
    pub fn with_encrypted_system(mut self, mapped: &str) -> Result<Self> {
        if self.system_crypt.is_some() {
            return Err(ArchitectError::Encryption(format!(
                "System partition is already mapped to {}",
                self.system
            )));
        }
        let raw = std::mem::replace(&mut self.system, mapped.to_string());
        self.system_crypt = Some(raw);
        Ok(self)
    }

    pub fn is_encrypted(&self) -> bool {
        self.system_crypt.is_some()
    }

    /// `(role, path)` pairs in partition order
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut entries = vec![("efi", self.efi.as_str())];
        if let Some(win) = &self.windows {
            entries.push(("msr", win.msr.as_str()));
            entries.push(("windows", win.windows.as_str()));
            entries.push(("recovery", win.recovery.as_str()));
        }
        entries.push(("boot", self.boot.as_str()));
        entries.push(("system", self.system.as_str()));
        if let Some(raw) = &self.system_crypt {
            entries.push(("system_crypt", raw.as_str()));
        }
        entries
    }
}
