//! Partition layout planning and sizing calculations

use crate::config::{Architecture, LayoutRequest};
use crate::disk::detection::{partition_path, DiskInfo};
use crate::disk::volumes::{PartitionTable, WindowsPartitions};
use crate::utils::error::{ArchitectError, Result};
use crate::utils::size::{bytes_to_human, GIB, MIB};
use serde::Serialize;

/// GPT partition type GUIDs
pub mod partition_types {
    use crate::config::Architecture;

    pub const EFI: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
    pub const MICROSOFT_RESERVED: &str = "E3C9E316-0B5C-4DB8-817D-F92DF00215AE";
    pub const MICROSOFT_BASIC_DATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";
    pub const WINDOWS_RECOVERY: &str = "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC";
    pub const LINUX_FILESYSTEM: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
    pub const LINUX_LUKS: &str = "CA7D7CCB-63ED-4C53-861C-1742536059CC";
    pub const LINUX_ROOT_X86_64: &str = "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709";
    pub const LINUX_ROOT_ARM64: &str = "B921B045-1DF0-41C3-AF44-4C6F280D3FAE";
    pub const LINUX_ROOT_IA64: &str = "993D8D3D-F80E-4225-855A-9DAF8ED7EA97";
    pub const LINUX_ROOT_ARM: &str = "69DAD710-2CE4-4E3C-B16C-21A1D49ABED3";
    pub const LINUX_ROOT_X86: &str = "44479540-F297-41B2-9AF7-D131D5F0458A";

    /// Discoverable root partition type for an architecture
    pub fn linux_root(arch: Option<Architecture>) -> &'static str {
        match arch {
            Some(Architecture::X86_64) => LINUX_ROOT_X86_64,
            Some(Architecture::Arm64) => LINUX_ROOT_ARM64,
            Some(Architecture::Ia64) => LINUX_ROOT_IA64,
            Some(Architecture::Arm) => LINUX_ROOT_ARM,
            Some(Architecture::X86) => LINUX_ROOT_X86,
            None => LINUX_FILESYSTEM,
        }
    }
}

pub const EFI_SIZE: u64 = 550 * MIB;
pub const MSR_SIZE: u64 = 16 * MIB;
pub const WINDOWS_RECOVERY_SIZE: u64 = 750 * MIB;
pub const BOOT_SIZE: u64 = GIB;
pub const MIN_WINDOWS_SIZE: u64 = 21 * GIB;

/// Space sfdisk keeps outside any partition: 1 MiB before the first
/// (LBA 2048 alignment) and 1 MiB at the end for the backup GPT
pub const GPT_OVERHEAD: u64 = 2 * MIB;

/// Overprovisioning applied to solid-state disks when none is requested
pub const DEFAULT_SSD_OVERPROVISION_PERCENT: f64 = 5.0;

/// What a partition is for. Declaration order is partition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Efi,
    Msr,
    Windows,
    Recovery,
    Boot,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Efi => "efi",
            Self::Msr => "msr",
            Self::Windows => "windows",
            Self::Recovery => "recovery",
            Self::Boot => "boot",
            Self::System => "system",
        }
    }
}

/// Requested partition size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionSize {
    Bytes(u64),
    /// Rest of the disk
    Remaining,
}

/// A single partition definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSpec {
    pub role: Role,
    pub size: PartitionSize,
    /// GPT type GUID
    pub type_id: &'static str,
    /// GPT partition name
    pub name: &'static str,
    /// GPT attribute flags (sfdisk syntax)
    pub attributes: Option<&'static str>,
}

/// Validated partition plan for a specific disk
#[derive(Debug, Clone, Serialize)]
pub struct PartitionPlan {
    device: String,
    disk_size: u64,
    overprovision_bytes: u64,
    partitions: Vec<PartitionSpec>,
}

impl PartitionPlan {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    /// Space left unallocated at the end of the disk
    pub fn overprovision_bytes(&self) -> u64 {
        self.overprovision_bytes
    }

    pub fn partitions(&self) -> &[PartitionSpec] {
        &self.partitions
    }

    pub fn has_windows(&self) -> bool {
        self.partitions.iter().any(|p| p.role == Role::Windows)
    }

    /// 1-based partition number of `role`
    pub fn index_of(&self, role: Role) -> Option<usize> {
        self.partitions
            .iter()
            .position(|p| p.role == role)
            .map(|i| i + 1)
    }

    /// Device path of `role` once the plan is applied
    pub fn path_of(&self, role: Role) -> Option<String> {
        self.index_of(role).map(|i| partition_path(&self.device, i))
    }

    /// The device paths the applied plan will produce
    pub fn partition_table(&self) -> Result<PartitionTable> {
        let require = |role: Role| {
            self.path_of(role).ok_or_else(|| {
                ArchitectError::Partitioning(format!(
                    "Plan for {} has no {} partition",
                    self.device,
                    role.as_str()
                ))
            })
        };

        let windows = if self.has_windows() {
            Some(WindowsPartitions {
                msr: require(Role::Msr)?,
                windows: require(Role::Windows)?,
                recovery: require(Role::Recovery)?,
            })
        } else {
            None
        };

        Ok(PartitionTable {
            efi: require(Role::Efi)?,
            boot: require(Role::Boot)?,
            system: require(Role::System)?,
            system_crypt: None,
            windows,
        })
    }
}

/// Running record of what has been carved out of the disk
struct Allocator {
    remaining: u64,
    allocations: Vec<(&'static str, u64)>,
}

impl Allocator {
    fn new(total: u64) -> Self {
        Self {
            remaining: total,
            allocations: Vec::new(),
        }
    }

    /// Subtract `bytes`, requiring something to be left afterwards
    fn take(&mut self, what: &'static str, bytes: u64) -> Result<()> {
        if bytes >= self.remaining {
            return Err(ArchitectError::NotEnoughSpace(format!(
                "{} needs {} but only {} remain{}",
                what,
                bytes_to_human(bytes),
                bytes_to_human(self.remaining),
                self.describe()
            )));
        }
        self.remaining -= bytes;
        self.allocations.push((what, bytes));
        Ok(())
    }

    fn describe(&self) -> String {
        if self.allocations.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .allocations
            .iter()
            .map(|(what, bytes)| format!("{} {}", what, bytes_to_human(*bytes)))
            .collect();
        format!(" (allocated so far: {})", parts.join(", "))
    }
}

/// Compute the partition plan for `disk` according to `request`
pub fn plan(disk: &DiskInfo, request: &LayoutRequest) -> Result<PartitionPlan> {
    if request.device.is_empty() {
        return Err(ArchitectError::Partitioning(
            "No target device given".to_string(),
        ));
    }

    let total = disk.size_bytes();
    let mut alloc = Allocator::new(total);
    alloc.take("GPT alignment", GPT_OVERHEAD)?;

    let overprovision_bytes = match request.overprovision {
        Some(spec) => spec.resolve(total),
        None if !disk.rotational() => {
            (total as f64 * DEFAULT_SSD_OVERPROVISION_PERCENT / 100.0) as u64
        }
        None => 0,
    };
    if overprovision_bytes > 0 {
        alloc.take("Overprovisioning", overprovision_bytes)?;
    }

    let mut partitions = vec![PartitionSpec {
        role: Role::Efi,
        size: PartitionSize::Bytes(EFI_SIZE),
        type_id: partition_types::EFI,
        name: "EFI System",
        attributes: Some("RequiredPartition"),
    }];
    alloc.take("EFI", EFI_SIZE)?;

    if let Some(spec) = request.windows {
        let windows_bytes = spec.resolve(total);
        if windows_bytes < MIN_WINDOWS_SIZE {
            return Err(ArchitectError::NotEnoughSpace(format!(
                "Windows partition must be at least {}, got {}",
                bytes_to_human(MIN_WINDOWS_SIZE),
                bytes_to_human(windows_bytes)
            )));
        }

        alloc.take("Windows group", MSR_SIZE + windows_bytes + WINDOWS_RECOVERY_SIZE)?;

        partitions.push(PartitionSpec {
            role: Role::Msr,
            size: PartitionSize::Bytes(MSR_SIZE),
            type_id: partition_types::MICROSOFT_RESERVED,
            name: "Microsoft reserved",
            attributes: None,
        });
        partitions.push(PartitionSpec {
            role: Role::Windows,
            size: PartitionSize::Bytes(windows_bytes),
            type_id: partition_types::MICROSOFT_BASIC_DATA,
            name: "Windows",
            attributes: None,
        });
        partitions.push(PartitionSpec {
            role: Role::Recovery,
            size: PartitionSize::Bytes(WINDOWS_RECOVERY_SIZE),
            type_id: partition_types::WINDOWS_RECOVERY,
            name: "Windows Recovery",
            attributes: Some("RequiredPartition GUID:63"),
        });
    }

    alloc.take("Boot", BOOT_SIZE)?;
    partitions.push(PartitionSpec {
        role: Role::Boot,
        size: PartitionSize::Bytes(BOOT_SIZE),
        type_id: partition_types::LINUX_FILESYSTEM,
        name: "Linux boot",
        attributes: None,
    });

    let system_type = if request.encryption.is_encrypted() {
        partition_types::LINUX_LUKS
    } else {
        partition_types::linux_root(request.target_arch.or_else(Architecture::host))
    };

    // With a reserve the tail must stay unallocated, so the size is explicit
    let system_size = if overprovision_bytes > 0 {
        PartitionSize::Bytes(alloc.remaining)
    } else {
        PartitionSize::Remaining
    };

    partitions.push(PartitionSpec {
        role: Role::System,
        size: system_size,
        type_id: system_type,
        name: "Linux root",
        attributes: None,
    });

    Ok(PartitionPlan {
        device: request.device.clone(),
        disk_size: total,
        overprovision_bytes,
        partitions,
    })
}

/// Print a table of the planned partitions
pub fn print_layout_summary(plan: &PartitionPlan) {
    println!(
        "\nPartition layout for {} (total: {}):",
        plan.device(),
        bytes_to_human(plan.disk_size())
    );
    println!(
        "{:<6} {:<20} {:>12} {:<10} {:<20}",
        "NUM", "NAME", "SIZE", "ROLE", "DEVICE"
    );
    println!("{}", "-".repeat(72));

    for (i, part) in plan.partitions().iter().enumerate() {
        let size_str = match part.size {
            PartitionSize::Bytes(b) => bytes_to_human(b),
            PartitionSize::Remaining => "remainder".to_string(),
        };

        println!(
            "{:<6} {:<20} {:>12} {:<10} {:<20}",
            i + 1,
            part.name,
            size_str,
            part.role.as_str(),
            partition_path(plan.device(), i + 1)
        );
    }

    if plan.overprovision_bytes() > 0 {
        println!(
            "{:<6} {:<20} {:>12}",
            "-",
            "(unallocated)",
            bytes_to_human(plan.overprovision_bytes())
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionIntent;
    use crate::utils::size::SizeSpec;

    const DISK_500G: u64 = 500 * GIB;

    fn ssd(size: u64) -> DiskInfo {
        DiskInfo::new(size, false, false, "test", true, 8)
    }

    fn hdd(size: u64) -> DiskInfo {
        DiskInfo::new(size, true, false, "test", false, 8)
    }

    fn request(device: &str) -> LayoutRequest {
        let mut r = LayoutRequest::new(device);
        r.target_arch = Some(Architecture::X86_64);
        r
    }

    fn explicit_total(plan: &PartitionPlan) -> u64 {
        plan.partitions()
            .iter()
            .filter_map(|p| match p.size {
                PartitionSize::Bytes(b) => Some(b),
                PartitionSize::Remaining => None,
            })
            .sum()
    }

    #[test]
    fn ssd_gets_default_overprovisioning() {
        let plan = plan(&ssd(DISK_500G), &request("/dev/sda")).unwrap();

        assert_eq!(plan.overprovision_bytes(), DISK_500G / 20);
        let roles: Vec<Role> = plan.partitions().iter().map(|p| p.role).collect();
        assert_eq!(roles, [Role::Efi, Role::Boot, Role::System]);

        let system = plan.partitions().last().unwrap();
        assert_eq!(
            system.size,
            PartitionSize::Bytes(DISK_500G - DISK_500G / 20 - GPT_OVERHEAD - EFI_SIZE - BOOT_SIZE)
        );
        assert!(explicit_total(&plan) + plan.overprovision_bytes() <= DISK_500G);
    }

    #[test]
    fn small_reserve_stays_inside_usable_sectors() {
        let disk_size = 100 * GIB;
        let mut req = request("/dev/sda");
        req.overprovision = Some(SizeSpec::Bytes(MIB));

        let plan = plan(&ssd(disk_size), &req).unwrap();
        let first_usable = MIB;
        let last_usable = disk_size - 33 * 512;
        assert!(matches!(
            plan.partitions().last().unwrap().size,
            PartitionSize::Bytes(_)
        ));
        assert!(first_usable + explicit_total(&plan) <= last_usable);
        assert!(first_usable + explicit_total(&plan) + plan.overprovision_bytes() <= last_usable);
    }

    #[test]
    fn hdd_without_reserve_uses_remaining() {
        let plan = plan(&hdd(DISK_500G), &request("/dev/sda")).unwrap();
        assert_eq!(plan.overprovision_bytes(), 0);
        assert_eq!(plan.partitions().last().unwrap().size, PartitionSize::Remaining);
        assert_eq!(
            plan.partitions().last().unwrap().type_id,
            partition_types::LINUX_ROOT_X86_64
        );
    }

    #[test]
    fn dual_boot_layout() {
        let mut req = request("/dev/nvme0n1");
        req.windows = Some(SizeSpec::Percent(30.0));
        req.overprovision = Some(SizeSpec::Bytes(0));

        let plan = plan(&ssd(DISK_500G), &req).unwrap();
        let roles: Vec<Role> = plan.partitions().iter().map(|p| p.role).collect();
        assert_eq!(
            roles,
            [Role::Efi, Role::Msr, Role::Windows, Role::Recovery, Role::Boot, Role::System]
        );
        assert_eq!(plan.path_of(Role::System).unwrap(), "/dev/nvme0n1p6");

        let table = plan.partition_table().unwrap();
        assert_eq!(table.efi, "/dev/nvme0n1p1");
        assert_eq!(table.boot, "/dev/nvme0n1p5");
        assert_eq!(table.windows.unwrap().recovery, "/dev/nvme0n1p4");
    }

    #[test]
    fn windows_below_minimum_is_rejected() {
        let mut req = request("/dev/sda");
        req.windows = Some(SizeSpec::Bytes(20 * GIB));
        let err = plan(&ssd(DISK_500G), &req).unwrap_err();
        assert!(matches!(err, ArchitectError::NotEnoughSpace(_)));

        req.windows = Some(SizeSpec::Bytes(21 * GIB));
        assert!(plan(&ssd(DISK_500G), &req).is_ok());
    }

    #[test]
    fn windows_larger_than_disk_lists_allocations() {
        let mut req = request("/dev/sda");
        req.windows = Some(SizeSpec::Percent(99.0));
        let err = plan(&ssd(DISK_500G), &req).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, ArchitectError::NotEnoughSpace(_)));
        assert!(msg.contains("Overprovisioning"));
        assert!(msg.contains("EFI"));
    }

    #[test]
    fn tiny_disk_has_no_room_for_boot() {
        let err = plan(&hdd(GIB), &request("/dev/sda")).unwrap_err();
        assert!(matches!(err, ArchitectError::NotEnoughSpace(_)));
    }

    #[test]
    fn encryption_selects_luks_type_over_architecture() {
        let mut req = request("/dev/sda");
        req.target_arch = Some(Architecture::Arm64);
        assert_eq!(
            plan(&hdd(DISK_500G), &req).unwrap().partitions().last().unwrap().type_id,
            partition_types::LINUX_ROOT_ARM64
        );

        req.encryption = EncryptionIntent::Software {
            passphrase: "pw".to_string(),
        };
        assert_eq!(
            plan(&hdd(DISK_500G), &req).unwrap().partitions().last().unwrap().type_id,
            partition_types::LINUX_LUKS
        );
    }

    #[test]
    fn unknown_architecture_falls_back_to_linux_filesystem() {
        assert_eq!(
            partition_types::linux_root(None),
            partition_types::LINUX_FILESYSTEM
        );
    }

    #[test]
    fn partition_table_for_plain_disk() {
        let table = plan(&hdd(DISK_500G), &request("/dev/sda"))
            .unwrap()
            .partition_table()
            .unwrap();
        assert_eq!(table.efi, "/dev/sda1");
        assert_eq!(table.boot, "/dev/sda2");
        assert_eq!(table.system, "/dev/sda3");
        assert!(table.windows.is_none());
        assert!(table.system_crypt.is_none());
    }
}
