//! Partition table creation

use crate::disk::layouts::{PartitionPlan, PartitionSize, PartitionSpec, Role};
use crate::disk::volumes::PartitionTable;
use crate::utils::command::{CommandKind, CommandRunner, Invocation};
use crate::utils::error::{ArchitectError, Result};
use crate::utils::size::{bytes_to_human, MIB};
use std::time::Duration;
use tracing::{info, warn};

/// Builder for an sfdisk input script
#[derive(Debug, Clone)]
pub struct SfdiskScript {
    lines: Vec<String>,
}

impl Default for SfdiskScript {
    fn default() -> Self {
        Self::new()
    }
}

impl SfdiskScript {
    pub fn new() -> Self {
        Self {
            lines: vec!["label: gpt".to_string()],
        }
    }

    pub fn comment(mut self, text: &str) -> Self {
        self.lines.push(format!("# {}", text));
        self
    }

    pub fn partition(mut self, spec: &PartitionSpec) -> Self {
        let size = match spec.size {
            PartitionSize::Bytes(b) => format!("{}MiB", b / MIB),
            PartitionSize::Remaining => "+".to_string(),
        };

        let mut line = format!("size={}, type={}", size, spec.type_id);
        if let Some(attrs) = spec.attributes {
            line.push_str(&format!(", attrs=\"{}\"", attrs));
        }
        line.push_str(&format!(", name=\"{}\"", spec.name));

        self.lines.push(line);
        self
    }

    /// Script for a whole plan, with comments marking each group
    pub fn for_plan(plan: &PartitionPlan) -> Self {
        let mut script = Self::new();

        if plan.overprovision_bytes() > 0 {
            script = script.comment(&format!(
                "Overprovisioning: {} left unallocated",
                bytes_to_human(plan.overprovision_bytes())
            ));
        }
        if plan.has_windows() {
            script = script.comment("Dual-boot configuration with Windows");
        }

        for spec in plan.partitions() {
            match spec.role {
                Role::Msr => script = script.comment("Windows partitions"),
                Role::Boot => script = script.comment("Linux partitions"),
                _ => {}
            }
            script = script.partition(spec);
        }

        script
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Wipe `plan.device()` and write the planned GPT partition table to it.
///
/// Returns the device paths of the new partitions.
pub fn apply(runner: &CommandRunner, plan: &PartitionPlan) -> Result<PartitionTable> {
    let device = plan.device();
    info!(
        "Applying {} partition layout to {}",
        plan.partitions().len(),
        device
    );

    info!("Wiping existing signatures on {}...", device);
    runner
        .run("wipefs", &["-a", device])
        .map_err(|e| ArchitectError::Partitioning(format!("Failed to wipe {}: {}", device, e)))?;

    let script = SfdiskScript::for_plan(plan);
    info!("Writing new GPT partition table to {}:", device);
    for line in script.lines() {
        info!("  {}", line);
    }

    let sfdisk = Invocation::new(CommandKind::PartitionApply, "sfdisk", [device])
        .subject(device)
        .stdin(script.render());
    runner.execute(&sfdisk).map_err(|e| {
        ArchitectError::Partitioning(format!("Failed to create partition table: {}", e))
    })?;

    info!("Notifying kernel of partition table changes on {}...", device);
    if let Err(e) = runner.run("partprobe", &[device]) {
        warn!("partprobe {} failed, relying on udev: {}", device, e);
    }

    if let Err(e) = runner.run("udevadm", &["settle"]) {
        warn!("udevadm settle failed, continuing: {}", e);
        std::thread::sleep(Duration::from_secs(2));
    }

    info!(
        "Partitioning of {} complete ({} partitions created)",
        device,
        plan.partitions().len()
    );
    plan.partition_table()
}
