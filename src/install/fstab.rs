//! fstab generation and table file output

use crate::disk::volumes::PartitionTable;
use crate::install::mount::{mounts, subvolume_options, MountOptionsMap, MountSource};
use crate::utils::command::{CommandKind, CommandRunner, IdKind, Invocation};
use crate::utils::error::{ArchitectError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Files written under `<target>/etc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFile {
    Fstab,
    Crypttab,
}

impl TableFile {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Fstab => "fstab",
            Self::Crypttab => "crypttab",
        }
    }

    fn error(self, message: String) -> ArchitectError {
        match self {
            Self::Fstab => ArchitectError::Fstab(message),
            Self::Crypttab => ArchitectError::Crypttab(message),
        }
    }
}

/// Look up a filesystem UUID or PARTUUID with blkid
pub fn lookup_id(runner: &CommandRunner, kind: IdKind, device: &str) -> Result<String> {
    let query = Invocation::new(
        CommandKind::Identifier(kind),
        "blkid",
        ["-s", kind.blkid_tag(), "-o", "value", device],
    )
    .subject(device);

    let output = runner.execute(&query)?;
    let id = output.stdout.trim();
    if id.is_empty() {
        return Err(ArchitectError::CommandFailed {
            command: query.command_line(),
            status: Some(output.status),
            stdout: output.stdout.clone(),
            stderr: format!("no {} reported for {}", kind.blkid_tag(), device),
        });
    }
    Ok(id.to_string())
}

fn uuid_of(runner: &CommandRunner, device: &str) -> Result<String> {
    lookup_id(runner, IdKind::Uuid, device)
        .map_err(|e| ArchitectError::Fstab(format!("Failed to get UUID for {}: {}", device, e)))
}

/// Build the fstab lines for the mounted layout
pub fn render_fstab(
    runner: &CommandRunner,
    table: &PartitionTable,
    options: &MountOptionsMap,
) -> Result<Vec<String>> {
    info!("Generating fstab entries");

    let system_uuid = uuid_of(runner, &table.system)?;
    let boot_uuid = uuid_of(runner, &table.boot)?;
    let efi_uuid = uuid_of(runner, &table.efi)?;

    let mut lines = vec![
        "# /etc/fstab: static file system information.".to_string(),
        "# Generated by architect".to_string(),
        "#".to_string(),
        "# <file system> <mount point> <type> <options> <dump> <pass>".to_string(),
    ];

    for (source, mount_point) in mounts() {
        let set = options.get(mount_point).ok_or_else(|| {
            ArchitectError::Fstab(format!("No mount options defined for {}", mount_point))
        })?;

        let line = match source {
            MountSource::Subvolume(name) => format!(
                "UUID={} {} btrfs {} 0 0",
                system_uuid,
                mount_point,
                subvolume_options(name, set)
            ),
            MountSource::Boot => format!("UUID={} {} ext4 {} 0 2", boot_uuid, mount_point, set),
            MountSource::Efi => format!("UUID={} {} vfat {} 0 2", efi_uuid, mount_point, set),
        };
        lines.push(line);
    }

    Ok(lines)
}

/// Write `lines` to `<target>/etc/<file>`.
///
/// In simulation the content is only logged. Returns the destination path.
pub fn write_table(
    runner: &CommandRunner,
    target: &Path,
    file: TableFile,
    lines: &[String],
) -> Result<PathBuf> {
    let etc = target.join("etc");
    let path = etc.join(file.file_name());

    if runner.is_simulated() {
        info!("Would write {} with:", path.display());
        for line in lines {
            info!("  {}", line);
        }
        return Ok(path);
    }

    let write = || -> std::io::Result<()> {
        fs::create_dir_all(&etc)?;
        let mut out = fs::File::create(&path)?;
        for line in lines {
            writeln!(out, "{}", line)?;
        }
        out.sync_all()
    };
    write().map_err(|e| file.error(format!("Failed to write {}: {}", path.display(), e)))?;

    info!("Wrote {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayoutRequest, SimulationParams};
    use crate::disk::detection::DiskInfo;
    use crate::install::mount::options_for;
    use crate::utils::size::GIB;

    fn table() -> PartitionTable {
        PartitionTable {
            efi: "/dev/sda1".to_string(),
            boot: "/dev/sda2".to_string(),
            system: "/dev/sda3".to_string(),
            system_crypt: None,
            windows: None,
        }
    }

    fn ssd() -> DiskInfo {
        DiskInfo::new(500 * GIB, false, false, "test", true, 8)
    }

    #[test]
    fn fstab_has_one_line_per_mount() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let options = options_for(&ssd(), &LayoutRequest::new("/dev/sda"));
        let lines = render_fstab(&runner, &table(), &options).unwrap();

        let entries: Vec<&String> = lines.iter().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(entries.len(), mounts().count());
    }

    #[test]
    fn fstab_lines_use_memoized_uuids() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let options = options_for(&ssd(), &LayoutRequest::new("/dev/sda"));
        let lines = render_fstab(&runner, &table(), &options).unwrap();

        let system = lookup_id(&runner, IdKind::Uuid, "/dev/sda3").unwrap();
        let boot = lookup_id(&runner, IdKind::Uuid, "/dev/sda2").unwrap();
        let efi = lookup_id(&runner, IdKind::Uuid, "/dev/sda1").unwrap();

        assert!(lines.contains(&format!(
            "UUID={} / btrfs subvol=@,defaults,noatime,ssd,compress-force=zstd:1,discard=async 0 0",
            system
        )));
        assert!(lines.contains(&format!("UUID={} /home btrfs subvol=@home,defaults,nodev,nosuid 0 0", system)));
        assert!(lines.contains(&format!("UUID={} /boot ext4 defaults,nodev,nosuid,discard 0 2", boot)));
        assert!(lines.contains(&format!(
            "UUID={} /boot/efi vfat umask=0077,nodev,nosuid,noexec,discard 0 2",
            efi
        )));
    }

    #[test]
    fn fstab_requires_options_for_every_mount() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let mut options = options_for(&ssd(), &LayoutRequest::new("/dev/sda"));
        options.remove("/srv");
        let err = render_fstab(&runner, &table(), &options).unwrap_err();
        assert!(matches!(err, ArchitectError::Fstab(_)));
    }

    #[test]
    fn simulated_write_touches_nothing() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let dir = tempfile::tempdir().unwrap();
        let path = write_table(&runner, dir.path(), TableFile::Fstab, &["# x".to_string()]).unwrap();
        assert_eq!(path, dir.path().join("etc/fstab"));
        assert!(!path.exists());
    }

    #[test]
    fn host_write_creates_etc() {
        let runner = CommandRunner::host();
        let dir = tempfile::tempdir().unwrap();
        let lines = vec!["# header".to_string(), "luks-root PARTUUID=x none luks".to_string()];
        let path = write_table(&runner, dir.path(), TableFile::Crypttab, &lines).unwrap();
        assert_eq!(
            fs::read_to_string(path).unwrap(),
            "# header\nluks-root PARTUUID=x none luks\n"
        );
    }
}
