//! Host prerequisite checks: privileges and required tools

use crate::config::LayoutRequest;
use crate::utils::command::CommandRunner;
use crate::utils::error::{ArchitectError, Result};
use std::collections::HashMap;
use tracing::{info, warn};

/// Map binary names to the package that commonly provides them
fn binary_to_package() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    // Partitioning
    map.insert("sfdisk", "util-linux");
    map.insert("wipefs", "util-linux");
    map.insert("blockdev", "util-linux");
    map.insert("lsblk", "util-linux");
    map.insert("blkid", "util-linux");
    map.insert("mount", "util-linux");
    map.insert("umount", "util-linux");
    map.insert("partprobe", "parted");
    map.insert("udevadm", "udev");

    // Filesystems
    map.insert("mkfs.fat", "dosfstools");
    map.insert("mkfs.ext4", "e2fsprogs");
    map.insert("mkfs.btrfs", "btrfs-progs");
    map.insert("btrfs", "btrfs-progs");

    // Encryption
    map.insert("cryptsetup", "cryptsetup");

    // Disk detection
    map.insert("hdparm", "hdparm");

    map
}

/// Binaries needed to carry out the request
pub fn required_binaries(request: &LayoutRequest, probes_real_disk: bool) -> Vec<&'static str> {
    let mut bins = vec![
        "wipefs",
        "sfdisk",
        "udevadm",
        "mkfs.fat",
        "mkfs.ext4",
        "mkfs.btrfs",
        "btrfs",
        "blkid",
        "mount",
        "umount",
    ];

    if request.encryption.is_encrypted() {
        bins.push("cryptsetup");
    }

    if probes_real_disk {
        bins.push("blockdev");
        bins.push("lsblk");
    }

    bins
}

/// Tools that improve detection but are not required
pub fn recommended_binaries() -> Vec<&'static str> {
    vec!["hdparm", "partprobe"]
}

fn describe_missing(bin: &str, bin_to_pkg: &HashMap<&str, &str>) -> String {
    match bin_to_pkg.get(bin) {
        Some(pkg) => format!("{} ({})", bin, pkg),
        None => bin.to_string(),
    }
}

/// Check privileges and tools before a run.
///
/// In pure simulation nothing on the host is touched, so the checks are only
/// logged. With real disk probing (or on the host) root is required.
pub fn check_prerequisites(runner: &CommandRunner, request: &LayoutRequest) -> Result<()> {
    let probes_real_disk = runner.uses_real_disk_info();
    let required = required_binaries(request, probes_real_disk);
    let recommended = recommended_binaries();

    if runner.disk_overrides().is_some() {
        info!("Checking for required tools (simulated)");
        for tool in &required {
            info!("Tool '{}' would be checked", tool);
        }
        for tool in &recommended {
            info!("Optional tool '{}' would be checked", tool);
        }
        return Ok(());
    }

    if !nix::unistd::geteuid().is_root() {
        return Err(ArchitectError::NotRoot);
    }

    let bin_to_pkg = binary_to_package();

    let missing: Vec<String> = required
        .iter()
        .filter(|bin| !runner.tool_available(bin))
        .map(|bin| describe_missing(bin, &bin_to_pkg))
        .collect();
    if !missing.is_empty() {
        return Err(ArchitectError::MissingTools(missing));
    }

    let missing_optional: Vec<String> = recommended
        .iter()
        .filter(|bin| !runner.tool_available(bin))
        .map(|bin| describe_missing(bin, &bin_to_pkg))
        .collect();
    if !missing_optional.is_empty() {
        warn!(
            "Missing optional tools: {}. TRIM detection and partition re-reading may be limited.",
            missing_optional.join(", ")
        );
    }

    info!("All required host tools are installed");
    Ok(())
}
