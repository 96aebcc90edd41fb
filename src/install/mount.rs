//! Mount options and the mount sequence for the target tree

use crate::config::LayoutRequest;
use crate::disk::detection::DiskInfo;
use crate::disk::volumes::PartitionTable;
use crate::utils::command::CommandRunner;
use crate::utils::error::{ArchitectError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Ordered, de-duplicated list of mount option tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct MountOptionSet {
    tokens: Vec<String>,
}

impl MountOptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a comma-separated option string
    pub fn parse(options: &str) -> Self {
        let mut set = Self::new();
        set.extend(options);
        set
    }

    /// Add a token unless already present
    pub fn push(&mut self, token: &str) -> &mut Self {
        let token = token.trim();
        if !token.is_empty() && !self.contains(token) {
            self.tokens.push(token.to_string());
        }
        self
    }

    /// Add every token of a comma-separated option string
    pub fn extend(&mut self, options: &str) -> &mut Self {
        for token in options.split(',') {
            self.push(token);
        }
        self
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// True when the set is exactly `defaults`
    pub fn is_defaults_only(&self) -> bool {
        self.tokens.len() == 1 && self.tokens[0] == "defaults"
    }

    pub fn render(&self) -> String {
        self.tokens.join(",")
    }
}

impl fmt::Display for MountOptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<MountOptionSet> for String {
    fn from(set: MountOptionSet) -> String {
        set.render()
    }
}

/// Mount options keyed by absolute mount point
pub type MountOptionsMap = BTreeMap<String, MountOptionSet>;

/// What gets mounted at a mount point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSource {
    /// A btrfs subvolume of the system filesystem
    Subvolume(&'static str),
    Boot,
    Efi,
}

/// One step of building the target tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStep {
    /// Create directories (relative to the target)
    Mkdir(&'static [&'static str]),
    /// Mount a source at an absolute mount point inside the target
    Mount(MountSource, &'static str),
}

/// Order in which the target tree is assembled
pub const MOUNT_SEQUENCE: &[MountStep] = &[
    MountStep::Mkdir(&[""]),
    MountStep::Mount(MountSource::Subvolume("@"), "/"),
    MountStep::Mkdir(&["boot", "home", "opt", "root", "srv", "tmp", "usr", "var"]),
    MountStep::Mount(MountSource::Boot, "/boot"),
    MountStep::Mkdir(&["boot/efi"]),
    MountStep::Mount(MountSource::Efi, "/boot/efi"),
    MountStep::Mount(MountSource::Subvolume("@home"), "/home"),
    MountStep::Mount(MountSource::Subvolume("@opt"), "/opt"),
    MountStep::Mount(MountSource::Subvolume("@root"), "/root"),
    MountStep::Mount(MountSource::Subvolume("@srv"), "/srv"),
    MountStep::Mount(MountSource::Subvolume("@tmp"), "/tmp"),
    MountStep::Mount(MountSource::Subvolume("@usr"), "/usr"),
    MountStep::Mount(MountSource::Subvolume("@var"), "/var"),
    MountStep::Mkdir(&["var/log", "var/tmp"]),
    MountStep::Mount(MountSource::Subvolume("@var_log"), "/var/log"),
    MountStep::Mount(MountSource::Subvolume("@var_tmp"), "/var/tmp"),
];

/// Mounts in sequence order
pub fn mounts() -> impl Iterator<Item = (MountSource, &'static str)> {
    MOUNT_SEQUENCE.iter().filter_map(|step| match step {
        MountStep::Mount(source, mount_point) => Some((*source, *mount_point)),
        MountStep::Mkdir(_) => None,
    })
}

const DEFAULT_OPTIONS: &[(&str, &str)] = &[
    ("/", "defaults,noatime"),
    ("/boot", "defaults,nodev,nosuid"),
    ("/boot/efi", "umask=0077,nodev,nosuid,noexec"),
    ("/home", "defaults,nodev,nosuid"),
    ("/opt", "defaults,nodev,nosuid"),
    ("/root", "defaults,nodev,nosuid"),
    ("/srv", "defaults,nodev,nosuid"),
    ("/tmp", "defaults,nodev,nosuid,noexec"),
    ("/usr", "defaults,nodev"),
    ("/var", "defaults,nosuid,nodev"),
    ("/var/log", "defaults,nodev,nosuid,noexec"),
    ("/var/tmp", "defaults,nodev,nosuid,noexec"),
];

/// Filesystem-wide btrfs options suited to the disk
pub fn btrfs_options(disk: &DiskInfo) -> String {
    if disk.rotational() {
        "autodefrag,compress-force=zstd:2".to_string()
    } else if disk.nvme() && disk.cpu_count() <= 4 {
        if disk.trim_supported() {
            "discard=async".to_string()
        } else {
            String::new()
        }
    } else if disk.trim_supported() {
        "ssd,compress-force=zstd:1,discard=async".to_string()
    } else {
        "ssd,compress-force=zstd:1".to_string()
    }
}

/// Mount options for every mount point in the sequence
pub fn options_for(disk: &DiskInfo, request: &LayoutRequest) -> MountOptionsMap {
    let mut options: MountOptionsMap = DEFAULT_OPTIONS
        .iter()
        .map(|(mp, opts)| (mp.to_string(), MountOptionSet::parse(opts)))
        .collect();

    let mut add = |mount_point: &str, token: &str| {
        if let Some(set) = options.get_mut(mount_point) {
            set.extend(token);
        }
    };

    if request.hardened {
        info!("Applying hardened mount options");
        add("/boot", "noauto");
        add("/var", "noexec");
        warn!("Hardened mode mounts /var noexec; package manager scripts may need special handling");
    }

    if disk.wants_discard() {
        info!("Adding discard mount option for /boot and /boot/efi (TRIM supported)");
        add("/boot", "discard");
        add("/boot/efi", "discard");
    }

    let fs_options = request
        .btrfs_options
        .clone()
        .unwrap_or_else(|| btrfs_options(disk));
    if !fs_options.is_empty() {
        add("/", &fs_options);
    }

    options
}

/// Options for a subvolume mount: `subvol=<name>[,<opts>]`
pub fn subvolume_options(name: &str, options: &MountOptionSet) -> String {
    if options.is_defaults_only() || options.tokens().is_empty() {
        format!("subvol={}", name)
    } else {
        format!("subvol={},{}", name, options)
    }
}

/// Device and `-o` option string for one mount
pub fn mount_spec(
    table: &PartitionTable,
    options: &MountOptionsMap,
    source: MountSource,
    mount_point: &str,
) -> Result<(String, String)> {
    let set = options.get(mount_point).ok_or_else(|| {
        ArchitectError::Mount(format!("No mount options defined for {}", mount_point))
    })?;

    Ok(match source {
        MountSource::Subvolume(name) => (table.system.clone(), subvolume_options(name, set)),
        MountSource::Boot => (table.boot.clone(), set.render()),
        MountSource::Efi => (table.efi.clone(), set.render()),
    })
}

/// Absolute path of `mount_point` inside `target`
pub fn target_path(target: &Path, mount_point: &str) -> PathBuf {
    let relative = mount_point.trim_start_matches('/');
    if relative.is_empty() {
        target.to_path_buf()
    } else {
        target.join(relative)
    }
}

/// Mount every filesystem of the new layout under `target`
pub fn mount_all(
    runner: &CommandRunner,
    table: &PartitionTable,
    options: &MountOptionsMap,
    target: &Path,
) -> Result<()> {
    info!("Mounting filesystems under {}", target.display());

    for step in MOUNT_SEQUENCE {
        match step {
            MountStep::Mkdir(dirs) => {
                for dir in dirs.iter() {
                    let path = target_path(target, dir).to_string_lossy().to_string();
                    runner.run("mkdir", &["-p", &path]).map_err(|e| {
                        ArchitectError::Mount(format!("Failed to create {}: {}", path, e))
                    })?;
                }
            }
            MountStep::Mount(source, mount_point) => {
                let (device, opts) = mount_spec(table, options, *source, mount_point)?;
                let path = target_path(target, mount_point).to_string_lossy().to_string();

                runner
                    .run("mount", &["-o", &opts, &device, &path])
                    .map_err(|e| {
                        ArchitectError::Mount(format!(
                            "Failed to mount {} at {}: {}",
                            device, mount_point, e
                        ))
                    })?;
                info!("Mounted {} to {}", device, path);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationParams;
    use crate::disk::formatting::SUBVOLUMES;
    use crate::utils::size::GIB;

    fn disk(rotational: bool, nvme: bool, trim: bool, cpus: u32) -> DiskInfo {
        DiskInfo::new(500 * GIB, rotational, nvme, "test", trim, cpus)
    }

    fn table() -> PartitionTable {
        PartitionTable {
            efi: "/dev/sda1".to_string(),
            boot: "/dev/sda2".to_string(),
            system: "/dev/sda3".to_string(),
            system_crypt: None,
            windows: None,
        }
    }

    #[test]
    fn option_set_keeps_order_and_skips_duplicates() {
        let mut set = MountOptionSet::parse("defaults,noatime");
        set.push("noatime").extend("ssd,,discard=async");
        assert_eq!(set.render(), "defaults,noatime,ssd,discard=async");
        assert!(MountOptionSet::parse("defaults").is_defaults_only());
    }

    #[test]
    fn ssd_with_trim_options() {
        let opts = options_for(&disk(false, false, true, 8), &LayoutRequest::new("/dev/sda"));
        assert_eq!(
            opts["/"].render(),
            "defaults,noatime,ssd,compress-force=zstd:1,discard=async"
        );
        assert_eq!(opts["/boot"].render(), "defaults,nodev,nosuid,discard");
        assert_eq!(opts["/boot/efi"].render(), "umask=0077,nodev,nosuid,noexec,discard");
        assert_eq!(opts["/home"].render(), "defaults,nodev,nosuid");
    }

    #[test]
    fn hdd_options() {
        let opts = options_for(&disk(true, false, false, 8), &LayoutRequest::new("/dev/sda"));
        assert_eq!(opts["/"].render(), "defaults,noatime,autodefrag,compress-force=zstd:2");
        assert!(!opts["/boot"].contains("discard"));
    }

    #[test]
    fn small_nvme_host_options() {
        assert_eq!(btrfs_options(&disk(false, true, true, 4)), "discard=async");
        assert_eq!(btrfs_options(&disk(false, true, false, 2)), "");
        assert_eq!(
            btrfs_options(&disk(false, true, true, 16)),
            "ssd,compress-force=zstd:1,discard=async"
        );
    }

    #[test]
    fn btrfs_override_replaces_detection() {
        let mut request = LayoutRequest::new("/dev/sda");
        request.btrfs_options = Some("compress=lzo".to_string());
        let opts = options_for(&disk(true, false, false, 8), &request);
        assert_eq!(opts["/"].render(), "defaults,noatime,compress=lzo");
    }

    #[test]
    fn hardening_only_adds_tokens() {
        let d = disk(false, false, true, 8);
        let plain = options_for(&d, &LayoutRequest::new("/dev/sda"));
        let mut request = LayoutRequest::new("/dev/sda");
        request.hardened = true;
        let hardened = options_for(&d, &request);

        for (mount_point, set) in &plain {
            for token in set.tokens() {
                assert!(hardened[mount_point].contains(token), "{} lost {}", mount_point, token);
            }
        }
        assert!(hardened["/boot"].contains("noauto"));
        assert!(hardened["/var"].contains("noexec"));
    }

    #[test]
    fn every_mount_point_has_options() {
        let opts = options_for(&disk(false, false, true, 8), &LayoutRequest::new("/dev/sda"));
        for (_, mount_point) in mounts() {
            assert!(opts.contains_key(mount_point), "missing {}", mount_point);
        }
    }

    #[test]
    fn every_subvolume_is_mounted() {
        let mounted: Vec<&str> = mounts()
            .filter_map(|(source, _)| match source {
                MountSource::Subvolume(name) => Some(name),
                _ => None,
            })
            .collect();
        for (name, _) in SUBVOLUMES {
            assert!(mounted.contains(name), "{} never mounted", name);
        }
    }

    #[test]
    fn subvolume_option_string() {
        assert_eq!(
            subvolume_options("@home", &MountOptionSet::parse("defaults")),
            "subvol=@home"
        );
        assert_eq!(
            subvolume_options("@", &MountOptionSet::parse("defaults,noatime")),
            "subvol=@,defaults,noatime"
        );
    }

    #[test]
    fn parents_are_mounted_before_children() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let opts = options_for(&disk(false, false, true, 8), &LayoutRequest::new("/dev/sda"));
        mount_all(&runner, &table(), &opts, Path::new("/target")).unwrap();

        let history = runner.history();
        let position = |needle: &str| {
            history
                .iter()
                .position(|r| r.command_line() == needle)
                .unwrap_or_else(|| panic!("{} not run", needle))
        };
        let mount_position = |path: &str| {
            history
                .iter()
                .position(|r| r.program == "mount" && r.args.last().map(String::as_str) == Some(path))
                .unwrap_or_else(|| panic!("{} not mounted", path))
        };

        assert_eq!(history[0].command_line(), "mkdir -p /target");
        assert!(mount_position("/target") < position("mkdir -p /target/boot"));
        assert!(mount_position("/target/boot") < position("mkdir -p /target/boot/efi"));
        assert!(position("mkdir -p /target/boot/efi") < mount_position("/target/boot/efi"));
        assert!(mount_position("/target/var") < position("mkdir -p /target/var/log"));
        assert!(position("mkdir -p /target/var/tmp") < mount_position("/target/var/tmp"));

        let root = &history[1];
        assert_eq!(
            root.command_line(),
            "mount -o subvol=@,defaults,noatime,ssd,compress-force=zstd:1,discard=async /dev/sda3 /target"
        );
        let mounts = history.iter().filter(|r| r.program == "mount").count();
        assert_eq!(mounts, 12);
    }
}
