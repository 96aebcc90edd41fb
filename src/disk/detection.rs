//! Disk detection: enumeration and characteristics of the target device

use crate::utils::command::{
    read_sysfs_attr, CommandKind, CommandRunner, Invocation, DEFAULT_DISK_SIZE,
};
use crate::utils::error::{ArchitectError, Result};
use crate::utils::size::bytes_to_human;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Snapshot of the target disk, taken once per run.
///
/// Only built through [`DiskInfo::new`], so the size is never 0 and the CPU
/// count never below 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    size_bytes: u64,
    rotational: bool,
    nvme: bool,
    model: String,
    trim_supported: bool,
    cpu_count: u32,
}

impl DiskInfo {
    /// A zero size falls back to the default disk size
    pub fn new(
        size_bytes: u64,
        rotational: bool,
        nvme: bool,
        model: impl Into<String>,
        trim_supported: bool,
        cpu_count: u32,
    ) -> Self {
        Self {
            size_bytes: if size_bytes == 0 {
                DEFAULT_DISK_SIZE
            } else {
                size_bytes
            },
            rotational,
            nvme,
            model: model.into(),
            trim_supported,
            cpu_count: cpu_count.max(1),
        }
    }

    /// Size in bytes (never 0)
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Spinning disk
    pub fn rotational(&self) -> bool {
        self.rotational
    }

    pub fn nvme(&self) -> bool {
        self.nvme
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the disk accepts TRIM/discard
    pub fn trim_supported(&self) -> bool {
        self.trim_supported
    }

    /// CPU cores on the host (at least 1)
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// Treat a solid-state disk as TRIM-capable regardless of detection
    pub fn with_forced_trim(mut self) -> Self {
        if !self.rotational {
            self.trim_supported = true;
        }
        self
    }

    /// Non-rotational and TRIM-capable
    pub fn wants_discard(&self) -> bool {
        !self.rotational && self.trim_supported
    }

    /// Short description of the disk kind
    pub fn kind(&self) -> &'static str {
        if self.rotational {
            "HDD"
        } else if self.nvme {
            "NVMe SSD"
        } else {
            "SSD"
        }
    }

    pub fn size_human(&self) -> String {
        bytes_to_human(self.size_bytes)
    }
}

/// Information about a block device
#[derive(Debug, Clone, Serialize)]
pub struct BlockDevice {
    /// Device path (e.g., /dev/sda)
    pub path: String,
    /// Device name (e.g., sda)
    pub name: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Device model (if available)
    pub model: Option<String>,
    /// Device type (disk, usb, nvme, etc.)
    pub device_type: String,
    /// Whether device is removable
    pub removable: bool,
    /// Whether device is read-only
    pub read_only: bool,
}

impl BlockDevice {
    /// Get human-readable size
    pub fn size_human(&self) -> String {
        bytes_to_human(self.size_bytes)
    }
}

/// Read a numeric sysfs attribute
fn read_sysfs_u64(device: &str, attr: &str) -> Option<u64> {
    read_sysfs_attr(device, attr).and_then(|s| s.parse().ok())
}

/// Determine device type from sysfs
fn determine_device_type(device: &str) -> String {
    if device.starts_with("nvme") {
        return "nvme".to_string();
    }
    if device.starts_with("mmcblk") {
        return "mmc".to_string();
    }
    if device.starts_with("loop") {
        return "loop".to_string();
    }

    let removable = read_sysfs_u64(device, "removable").unwrap_or(0);
    if removable == 1 {
        return "usb".to_string();
    }

    match read_sysfs_u64(device, "queue/rotational") {
        Some(0) => "ssd".to_string(),
        Some(_) => "hdd".to_string(),
        None => "disk".to_string(),
    }
}

/// Check if a device is mounted
fn is_device_mounted(device: &str) -> bool {
    let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
    mounts.lines().any(|line| line.starts_with(device))
}

/// List block devices on the host
///
/// If `all` is false, filters to only show suitable targets
/// (excludes mounted devices, read-only devices, loop devices, etc.)
pub fn list_block_devices(all: bool) -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();

    for entry in fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        let device_type = determine_device_type(&name);
        if !all && device_type == "loop" {
            continue;
        }

        let size_sectors = read_sysfs_u64(&name, "size").unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        // sysfs reports size in 512-byte sectors regardless of the logical block size
        let size_bytes = size_sectors * 512;

        if !all && size_bytes < 1024 * 1024 * 1024 {
            continue;
        }

        let removable = read_sysfs_u64(&name, "removable").unwrap_or(0) == 1;
        let read_only = read_sysfs_u64(&name, "ro").unwrap_or(0) == 1;
        if !all && read_only {
            continue;
        }

        let model = read_sysfs_attr(&name, "device/model")
            .or_else(|| read_sysfs_attr(&name, "device/name"));

        let path = format!("/dev/{}", name);
        if !all && is_device_mounted(&path) {
            continue;
        }

        devices.push(BlockDevice {
            path,
            name,
            size_bytes,
            model,
            device_type,
            removable,
            read_only,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(devices)
}

/// Get the partition naming prefix for a device
/// e.g., /dev/sda -> /dev/sda, /dev/nvme0n1 -> /dev/nvme0n1p
///
/// Not only nvme: the kernel also inserts `p` for mmcblk and loop devices,
/// whose names end in a digit (/dev/mmcblk0p1, /dev/loop0p1).
pub fn partition_prefix(device: &str) -> String {
    if device.contains("nvme") || device.contains("mmcblk") || device.contains("loop") {
        format!("{}p", device)
    } else {
        device.to_string()
    }
}

/// Get partition path for a device and partition number
pub fn partition_path(device: &str, partition_num: usize) -> String {
    format!("{}{}", partition_prefix(device), partition_num)
}

fn device_name(device: &str) -> String {
    Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| device.to_string())
}

fn host_cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

/// Whether `device` exists and is a whole disk
pub fn available(runner: &CommandRunner, device: &str) -> bool {
    if runner.disk_overrides().is_some() {
        return true;
    }
    if !Path::new(device).exists() {
        return false;
    }

    let query = Invocation::new(CommandKind::DeviceType, "lsblk", ["-n", "-o", "TYPE", device])
        .subject(device);
    match runner.probe(&query) {
        Ok(out) => out.stdout.to_lowercase().contains("disk"),
        Err(e) => {
            warn!("Error checking if {} is available: {}", device, e);
            false
        }
    }
}

/// Collect the characteristics of `device`
pub fn inspect(runner: &CommandRunner, device: &str) -> Result<DiskInfo> {
    if !available(runner, device) && !runner.is_simulated() {
        return Err(ArchitectError::DiskNotFound(format!(
            "{} not found or is not a block device",
            device
        )));
    }

    let name = device_name(device);
    let overrides = runner.disk_overrides();

    let size_bytes = probe_size(runner, device);
    info!("Disk size: {}", bytes_to_human(size_bytes));

    let rotational = match runner.read_sysfs(&name, "queue/rotational") {
        Some(value) => value == "1",
        None => {
            let default = !runner.is_simulated();
            debug!(
                "Rotational flag unreadable for {}, assuming {}",
                name,
                if default { "rotational" } else { "non-rotational" }
            );
            default
        }
    };

    let nvme = overrides
        .and_then(|p| p.nvme())
        .unwrap_or_else(|| name.to_lowercase().contains("nvme"));

    let model = probe_model(runner, device, nvme);

    let trim_supported = if rotational {
        false
    } else {
        probe_trim(runner, device, nvme)
    };

    Ok(DiskInfo::new(
        size_bytes,
        rotational,
        nvme,
        model,
        trim_supported,
        host_cpu_count(),
    ))
}

fn probe_size(runner: &CommandRunner, device: &str) -> u64 {
    let query = Invocation::new(CommandKind::DeviceSize, "blockdev", ["--getsize64", device])
        .subject(device);

    match runner.probe(&query) {
        Ok(out) => match out.stdout.trim().parse::<u64>() {
            Ok(size) if size > 0 => size,
            _ => {
                warn!(
                    "Unexpected size {:?} reported for {}, assuming {}",
                    out.stdout.trim(),
                    device,
                    bytes_to_human(DEFAULT_DISK_SIZE)
                );
                DEFAULT_DISK_SIZE
            }
        },
        Err(e) => {
            warn!(
                "Error getting disk size: {}. Assuming {}",
                e,
                bytes_to_human(DEFAULT_DISK_SIZE)
            );
            DEFAULT_DISK_SIZE
        }
    }
}

fn probe_model(runner: &CommandRunner, device: &str, nvme: bool) -> String {
    let query = Invocation::new(CommandKind::DeviceModel, "lsblk", ["-n", "-o", "MODEL", device])
        .subject(device);

    match runner.probe(&query) {
        Ok(out) => out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| if nvme { "NVMe" } else { "SSD/HDD" }.to_string()),
        Err(e) => {
            warn!("Error getting disk model: {}", e);
            "Unknown".to_string()
        }
    }
}

fn probe_trim(runner: &CommandRunner, device: &str, nvme: bool) -> bool {
    if let Some(trim) = runner.disk_overrides().and_then(|p| p.trim_supported) {
        info!("Simulated disk configured with TRIM support: {}", trim);
        return trim;
    }

    if nvme {
        info!("NVMe drive detected - assuming TRIM support");
        return true;
    }

    if !runner.tool_available("hdparm") {
        debug!("hdparm not found for TRIM detection, assuming support");
        return true;
    }

    let query = Invocation::new(CommandKind::TrimProbe, "hdparm", ["-I", device]).subject(device);
    match runner.probe(&query) {
        Ok(out) => out.stdout.contains("TRIM supported"),
        Err(e) => {
            warn!("Error checking TRIM support: {}", e);
            true
        }
    }
}
