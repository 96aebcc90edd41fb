//! crypttab generation for the encrypted root

use crate::configure::encryption::LUKS_MAPPER_NAME;
use crate::disk::detection::DiskInfo;
use crate::disk::volumes::PartitionTable;
use crate::install::fstab::lookup_id;
use crate::utils::command::{CommandRunner, IdKind};
use crate::utils::error::{ArchitectError, Result};
use tracing::info;

/// Seconds to wait for the passphrase at boot
const UNLOCK_TIMEOUT: u32 = 180;

/// Options column of the root entry
pub fn crypttab_options(disk: &DiskInfo) -> String {
    let mut options = format!("luks,timeout={}", UNLOCK_TIMEOUT);
    if disk.wants_discard() {
        options.push_str(",discard");
    }
    options
}

/// Build crypttab lines, or `None` when the root is not encrypted
pub fn render_crypttab(
    runner: &CommandRunner,
    table: &PartitionTable,
    disk: &DiskInfo,
) -> Result<Option<Vec<String>>> {
    let Some(container) = table.system_crypt.as_deref() else {
        return Ok(None);
    };

    info!("Generating crypttab entry for {}", container);

    let partuuid = lookup_id(runner, IdKind::PartUuid, container).map_err(|e| {
        ArchitectError::Crypttab(format!("Failed to get PARTUUID for {}: {}", container, e))
    })?;

    Ok(Some(vec![
        "# /etc/crypttab: mappings for encrypted partitions.".to_string(),
        "# Generated by architect".to_string(),
        "#".to_string(),
        "# <name> <device> <password> <options>".to_string(),
        format!(
            "{} PARTUUID={} none {}",
            LUKS_MAPPER_NAME,
            partuuid,
            crypttab_options(disk)
        ),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationParams;
    use crate::utils::size::GIB;

    fn encrypted_table() -> PartitionTable {
        PartitionTable {
            efi: "/dev/nvme0n1p1".to_string(),
            boot: "/dev/nvme0n1p2".to_string(),
            system: "/dev/mapper/luks-root".to_string(),
            system_crypt: Some("/dev/nvme0n1p3".to_string()),
            windows: None,
        }
    }

    #[test]
    fn unencrypted_layout_has_no_crypttab() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let mut table = encrypted_table();
        table.system_crypt = None;
        let disk = DiskInfo::new(500 * GIB, false, true, "test", true, 8);
        assert!(render_crypttab(&runner, &table, &disk).unwrap().is_none());
        assert!(runner.history().is_empty());
    }

    #[test]
    fn entry_uses_partuuid_of_container() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let disk = DiskInfo::new(500 * GIB, false, true, "test", true, 8);
        let lines = render_crypttab(&runner, &encrypted_table(), &disk)
            .unwrap()
            .unwrap();

        let partuuid = lookup_id(&runner, IdKind::PartUuid, "/dev/nvme0n1p3").unwrap();
        assert_eq!(
            lines.last().unwrap(),
            &format!("luks-root PARTUUID={} none luks,timeout=180,discard", partuuid)
        );
    }

    #[test]
    fn discard_only_with_trim_on_solid_state() {
        let hdd = DiskInfo::new(500 * GIB, true, false, "test", false, 8);
        let ssd_no_trim = DiskInfo::new(500 * GIB, false, false, "test", false, 8);
        let ssd = DiskInfo::new(500 * GIB, false, false, "test", true, 8);
        assert_eq!(crypttab_options(&hdd), "luks,timeout=180");
        assert_eq!(crypttab_options(&ssd_no_trim), "luks,timeout=180");
        assert_eq!(crypttab_options(&ssd), "luks,timeout=180,discard");
    }
}
