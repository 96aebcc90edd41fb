//! Release whatever a failed or finished run left behind

use crate::configure::encryption::{mapped_device, LUKS_MAPPER_NAME};
use crate::utils::command::CommandRunner;
use crate::utils::error::Result;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Mount points under `target` from `/proc/mounts` text, deepest first
pub fn mounts_under(proc_mounts: &str, target: &Path) -> Vec<String> {
    let mut mount_points: Vec<String> = proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_point)
        .filter(|mp| Path::new(mp).starts_with(target))
        .collect();

    mount_points.sort_by_key(|mp| std::cmp::Reverse(mp.matches('/').count()));
    mount_points.dedup();
    mount_points
}

/// `/proc/mounts` encodes spaces and tabs as octal escapes
fn unescape_mount_point(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\134", "\\")
}

/// Unmounts the target tree and closes the root container
pub struct Cleaner<'a> {
    runner: &'a CommandRunner,
}

impl<'a> Cleaner<'a> {
    pub fn new(runner: &'a CommandRunner) -> Self {
        Self { runner }
    }

    /// Unmount everything under `target`, then close `luks-root` if open.
    ///
    /// Individual failures are logged and skipped.
    pub fn cleanup(&self, target: &Path) -> Result<()> {
        info!("Starting cleanup of {}", target.display());

        let released = self.unmount_all(target);
        self.close_container();

        info!("Cleanup complete ({} filesystem(s) released)", released);
        Ok(())
    }

    fn unmount_all(&self, target: &Path) -> usize {
        let proc_mounts = if self.runner.is_simulated() {
            String::new()
        } else {
            fs::read_to_string("/proc/mounts").unwrap_or_default()
        };

        let mount_points = mounts_under(&proc_mounts, target);
        if mount_points.is_empty() {
            info!("Nothing mounted under {}", target.display());
        }

        let mut released = 0;
        for mp in &mount_points {
            info!("Unmounting {}", mp);
            if self.runner.run_best_effort("umount", &[mp]) {
                released += 1;
            } else {
                warn!("Could not unmount {}", mp);
            }
        }
        released
    }

    fn close_container(&self) {
        if self.runner.is_simulated() || !Path::new(&mapped_device()).exists() {
            return;
        }

        info!("Closing {}", LUKS_MAPPER_NAME);
        if !self.runner.run_best_effort("cryptsetup", &["close", LUKS_MAPPER_NAME]) {
            warn!("Could not close {}", LUKS_MAPPER_NAME);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationParams;

    const PROC_MOUNTS: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda3 /target btrfs rw,noatime,subvol=/@ 0 0
/dev/sda2 /target/boot ext4 rw,nodev,nosuid 0 0
/dev/sda1 /target/boot/efi vfat rw,umask=0077 0 0
/dev/sda3 /target/var/log btrfs rw,subvol=/@var_log 0 0
/dev/sda3 /target/var btrfs rw,subvol=/@var 0 0
/dev/sdb1 /target2 ext4 rw 0 0
/dev/sdc1 /mnt/my\\040disk ext4 rw 0 0
";

    #[test]
    fn selects_target_mounts_deepest_first() {
        let mps = mounts_under(PROC_MOUNTS, Path::new("/target"));
        assert_eq!(
            mps,
            vec![
                "/target/boot/efi",
                "/target/var/log",
                "/target/boot",
                "/target/var",
                "/target",
            ]
        );
    }

    #[test]
    fn decodes_escaped_mount_points() {
        let mps = mounts_under(PROC_MOUNTS, Path::new("/mnt"));
        assert_eq!(mps, vec!["/mnt/my disk"]);
    }

    #[test]
    fn simulated_cleanup_is_a_no_op() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        Cleaner::new(&runner).cleanup(Path::new("/target")).unwrap();
        assert!(runner.history().is_empty());
    }
}
