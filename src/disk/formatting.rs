//! Filesystem formatting and btrfs subvolume layout

use crate::disk::detection::DiskInfo;
use crate::disk::volumes::PartitionTable;
use crate::utils::command::{CommandKind, CommandRunner, Invocation};
use crate::utils::error::{ArchitectError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Scratch mount point used while simulating
pub const SIM_SCRATCH_MOUNT: &str = "/tmp/architect-sim-mount";

/// Btrfs subvolumes in creation order, with the mount point each one serves
pub const SUBVOLUMES: &[(&str, &str)] = &[
    ("@", "/"),
    ("@home", "/home"),
    ("@opt", "/opt"),
    ("@root", "/root"),
    ("@srv", "/srv"),
    ("@tmp", "/tmp"),
    ("@usr", "/usr"),
    ("@var", "/var"),
    ("@var_log", "/var/log"),
    ("@var_tmp", "/var/tmp"),
];

static SUBVOLUME_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Subvolume ID:\s*(\d+)").expect("static regex"));

/// A filesystem to create on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTask {
    pub fs_type: &'static str,
    pub program: &'static str,
    pub args: Vec<String>,
    pub device: String,
}

impl FormatTask {
    fn new(fs_type: &'static str, program: &'static str, flags: &[&str], device: &str) -> Self {
        let mut args: Vec<String> = flags.iter().map(|s| s.to_string()).collect();
        args.push(device.to_string());
        Self {
            fs_type,
            program,
            args,
            device: device.to_string(),
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation::mutation(self.program, self.args.iter().cloned()).subject(&self.device)
    }

    fn describe(&self) -> String {
        format!("{} on {}", self.fs_type, self.device)
    }
}

/// The three filesystems every layout needs
pub fn format_tasks(table: &PartitionTable) -> Vec<FormatTask> {
    vec![
        FormatTask::new("vfat", "mkfs.fat", &["-F32", "-n", "ESP"], &table.efi),
        FormatTask::new("ext4", "mkfs.ext4", &["-F", "-L", "boot"], &table.boot),
        FormatTask::new("btrfs", "mkfs.btrfs", &["-f", "-L", "root"], &table.system),
    ]
}

/// Run `job` over `tasks` with at most `workers` threads.
///
/// Workers pull the next task from a shared index until none remain. Every
/// failure is collected; the result lists them by task index.
pub fn run_pool<T, F>(tasks: &[T], workers: usize, job: F) -> Vec<(usize, ArchitectError)>
where
    T: Sync,
    F: Fn(&T) -> Result<()> + Sync,
{
    let next = AtomicUsize::new(0);
    let failures = Mutex::new(Vec::new());
    let workers = workers.clamp(1, tasks.len().max(1));

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(task) = tasks.get(i) else {
                    break;
                };
                if let Err(e) = job(task) {
                    failures
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((i, e));
                }
            });
        }
    });

    let mut failures = failures.into_inner().unwrap_or_else(|e| e.into_inner());
    failures.sort_by_key(|(i, _)| *i);
    failures
}

/// Create the EFI, boot and root filesystems
pub fn format_all(runner: &CommandRunner, table: &PartitionTable, disk: &DiskInfo) -> Result<()> {
    let tasks = format_tasks(table);
    let workers = if runner.is_simulated() {
        1
    } else {
        tasks.len().min(disk.cpu_count() as usize)
    };

    info!(
        "Formatting {} filesystems with {} worker(s)",
        tasks.len(),
        workers
    );

    let failures = run_pool(&tasks, workers, |task| {
        info!("Formatting {} as {}", task.device, task.fs_type);
        runner.execute(&task.invocation()).map(|_| ())
    });

    if failures.is_empty() {
        info!("All filesystems created");
        return Ok(());
    }

    let details: Vec<String> = failures
        .iter()
        .map(|(i, e)| format!("{} ({})", tasks[*i].describe(), e))
        .collect();
    Err(ArchitectError::Filesystem(format!(
        "Failed to create: {}",
        details.join("; ")
    )))
}

/// Temporary mount of the root filesystem. Unmounted on drop if still mounted.
struct ScratchMount<'a> {
    runner: &'a CommandRunner,
    path: PathBuf,
    mounted: bool,
    _dir: Option<TempDir>,
}

impl<'a> ScratchMount<'a> {
    fn mount(runner: &'a CommandRunner, device: &str) -> Result<Self> {
        let (path, dir) = if runner.is_simulated() {
            (PathBuf::from(SIM_SCRATCH_MOUNT), None)
        } else {
            let dir = tempfile::Builder::new()
                .prefix("architect-mount-")
                .tempdir()?;
            (dir.path().to_path_buf(), Some(dir))
        };

        let target = path.to_string_lossy().to_string();
        runner.run("mount", &[device, &target]).map_err(|e| {
            ArchitectError::Filesystem(format!("Failed to mount {} at {}: {}", device, target, e))
        })?;

        Ok(Self {
            runner,
            path,
            mounted: true,
            _dir: dir,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn unmount(mut self) -> Result<()> {
        self.mounted = false;
        let target = self.path.to_string_lossy().to_string();
        self.runner
            .run("umount", &[&target])
            .map(|_| ())
            .map_err(|e| ArchitectError::Filesystem(format!("Failed to unmount {}: {}", target, e)))
    }
}

impl Drop for ScratchMount<'_> {
    fn drop(&mut self) {
        if self.mounted {
            let target = self.path.to_string_lossy().to_string();
            debug!("Releasing scratch mount {}", target);
            self.runner.run_best_effort("umount", &[&target]);
        }
    }
}

/// Create the subvolume tree on the root filesystem and make `@` the default.
///
/// Returns each subvolume name with the mount point it serves.
pub fn create_subvolumes(
    runner: &CommandRunner,
    table: &PartitionTable,
) -> Result<BTreeMap<String, PathBuf>> {
    info!("Creating btrfs subvolumes on {}", table.system);

    let scratch = ScratchMount::mount(runner, &table.system)?;
    if let Err(e) = populate(runner, scratch.path()) {
        warn!("Subvolume setup failed, releasing scratch mount");
        drop(scratch);
        return Err(match e {
            ArchitectError::Filesystem(_) => e,
            other => ArchitectError::Filesystem(other.to_string()),
        });
    }
    scratch.unmount()?;

    Ok(SUBVOLUMES
        .iter()
        .map(|(name, mount_point)| (name.to_string(), PathBuf::from(mount_point)))
        .collect())
}

fn populate(runner: &CommandRunner, root: &Path) -> Result<()> {
    for (name, _) in SUBVOLUMES {
        let path = root.join(name).to_string_lossy().to_string();
        runner
            .run("btrfs", &["subvolume", "create", &path])
            .map_err(|e| {
                ArchitectError::Filesystem(format!("Failed to create subvolume {}: {}", name, e))
            })?;
    }

    let top = root.join("@").to_string_lossy().to_string();
    let show = Invocation::new(CommandKind::SubvolumeInfo, "btrfs", ["subvolume", "show", top.as_str()])
        .subject(&top);
    let output = runner.execute(&show)?;
    let id = parse_subvolume_id(&output.stdout).ok_or_else(|| {
        ArchitectError::Filesystem(format!("Could not determine subvolume ID of {}", top))
    })?;

    let root_path = root.to_string_lossy().to_string();
    runner
        .run("btrfs", &["subvolume", "set-default", &id.to_string(), &root_path])
        .map_err(|e| ArchitectError::Filesystem(format!("Failed to set default subvolume: {}", e)))?;

    info!("Default subvolume set to @ (ID {})", id);
    Ok(())
}

/// Extract the ID from `btrfs subvolume show` output
pub fn parse_subvolume_id(output: &str) -> Option<u64> {
    SUBVOLUME_ID_RE
        .captures(output)
        .and_then(|c| c[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationParams;

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
    fn pool_runs_every_task_once() {
        let seen = Mutex::new(Vec::new());
        let tasks: Vec<u32> = (0..10).collect();
        let failures = run_pool(&tasks, 3, |t| {
            seen.lock().unwrap().push(*t);
            Ok(())
        });
        assert!(failures.is_empty());
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, tasks);
    }

    #[test]
    fn pool_collects_every_failure() {
        let tasks = ["vfat", "ext4", "btrfs"];
        let failures = run_pool(&tasks, 2, |t| {
            if *t == "ext4" {
                Ok(())
            } else {
                Err(ArchitectError::Filesystem(format!("{} broke", t)))
            }
        });
        let indices: Vec<usize> = failures.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, [0, 2]);
    }

    #[test]
    fn format_commands() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let disk = DiskInfo::new(0, false, false, "x", true, 8);
        format_all(&runner, &table(), &disk).unwrap();

        let lines: Vec<String> = runner.history().iter().map(|r| r.command_line()).collect();
        assert_eq!(
            lines,
            [
                "mkfs.fat -F32 -n ESP /dev/sda1",
                "mkfs.ext4 -F -L boot /dev/sda2",
                "mkfs.btrfs -f -L root /dev/sda3",
            ]
        );
    }

    #[test]
    fn subvolumes_are_created_and_default_set() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let subvols = create_subvolumes(&runner, &table()).unwrap();

        assert_eq!(subvols.len(), 10);
        assert!(!subvols.contains_key("@boot"));
        assert_eq!(subvols["@var_log"], PathBuf::from("/var/log"));

        let lines: Vec<String> = runner.history().iter().map(|r| r.command_line()).collect();
        assert_eq!(lines[0], "mount /dev/sda3 /tmp/architect-sim-mount");
        assert_eq!(lines[1], "btrfs subvolume create /tmp/architect-sim-mount/@");
        assert!(lines.contains(&"btrfs subvolume set-default 256 /tmp/architect-sim-mount".to_string()));
        assert_eq!(lines.last().unwrap(), "umount /tmp/architect-sim-mount");
    }

    #[test]
    fn subvolume_id_parsing() {
        assert_eq!(parse_subvolume_id("\tName: @\n\tSubvolume ID: \t\t256\n"), Some(256));
        assert_eq!(parse_subvolume_id("nothing here"), None);
    }
}
