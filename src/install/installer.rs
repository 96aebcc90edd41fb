//! Layout orchestrator: inspect, plan, partition, encrypt, format, mount

use crate::config::LayoutRequest;
use crate::configure::encryption;
use crate::disk::detection::{inspect, DiskInfo};
use crate::disk::formatting::{create_subvolumes, format_all};
use crate::disk::layouts::{plan, print_layout_summary, PartitionPlan};
use crate::disk::partitioning::apply;
use crate::disk::volumes::PartitionTable;
use crate::install::crypttab::render_crypttab;
use crate::install::fstab::{render_fstab, write_table, TableFile};
use crate::install::mount::{mount_all, options_for, MountOptionsMap};
use crate::utils::command::CommandRunner;
use crate::utils::deps::check_prerequisites;
use crate::utils::error::Result;
use crate::utils::prompt::confirm_destruction;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

const PHASES: usize = 6;

/// Everything a finished run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub disk: DiskInfo,
    pub plan: PartitionPlan,
    pub table: PartitionTable,
    pub options: MountOptionsMap,
    /// Subvolume name to mount point
    pub subvolumes: BTreeMap<String, PathBuf>,
    pub fstab: Option<PathBuf>,
    pub crypttab: Option<PathBuf>,
}

/// Drives one layout run against a disk
pub struct Installer<'a> {
    request: LayoutRequest,
    runner: &'a CommandRunner,
    /// Skip the interactive confirmation prompt
    skip_confirm: bool,
}

impl<'a> Installer<'a> {
    pub fn new(request: LayoutRequest, runner: &'a CommandRunner) -> Self {
        Self {
            request,
            runner,
            skip_confirm: false,
        }
    }

    /// Skip the interactive confirmation prompt (`--yes`)
    pub fn with_skip_confirm(mut self, skip: bool) -> Self {
        self.skip_confirm = skip;
        self
    }

    /// Inspect the disk and compute the layout without changing anything
    pub fn preview(&self) -> Result<(DiskInfo, PartitionPlan)> {
        self.request.validate()?;
        let disk = self.inspect()?;
        let plan = plan(&disk, &self.request)?;
        Ok((disk, plan))
    }

    /// Run every stage against the disk
    pub fn run(self) -> Result<RunSummary> {
        let runner = self.runner;
        let request = &self.request;

        info!(
            "Starting layout of {} ({} encryption{})",
            request.device,
            request.encryption,
            if request.hardened { ", hardened" } else { "" }
        );
        if let Some(id) = runner.simulation_id() {
            info!("Simulation {} active, no changes will be made", id);
        }

        // Phase 1: preparation
        info!("[Phase 1/{}] Checking prerequisites", PHASES);
        request.validate()?;
        check_prerequisites(runner, request)?;
        encryption::check_requirements(runner, &request.encryption)?;

        let disk = self.inspect()?;
        info!(
            "Target disk: {} ({}, {}, {}, TRIM {}, {} CPUs)",
            request.device,
            disk.model(),
            disk.size_human(),
            disk.kind(),
            if disk.trim_supported() { "supported" } else { "not supported" },
            disk.cpu_count()
        );

        if !runner.is_simulated() && !self.skip_confirm {
            confirm_destruction(&request.device)?;
        }

        if let Some(psid) = request.encryption.opal().and_then(|o| o.reset_psid()) {
            encryption::reset_opal(runner, &request.device, psid)?;
        }

        // Phase 2: partitioning
        info!("[Phase 2/{}] Partitioning {}", PHASES, request.device);
        let plan = plan(&disk, request)?;
        print_layout_summary(&plan);
        let table = apply(runner, &plan)?;

        // Phase 3: encryption
        info!("[Phase 3/{}] Setting up encryption", PHASES);
        let table = encryption::bind(runner, table, &request.encryption)?;

        // Phase 4: filesystems
        info!("[Phase 4/{}] Creating filesystems", PHASES);
        format_all(runner, &table, &disk)?;
        let subvolumes = create_subvolumes(runner, &table)?;

        // Phase 5: mounting
        info!("[Phase 5/{}] Mounting under {}", PHASES, request.target.display());
        let options = options_for(&disk, request);
        mount_all(runner, &table, &options, &request.target)?;

        // Phase 6: tables
        info!("[Phase 6/{}] Writing mount tables", PHASES);
        let fstab = if request.generate_fstab {
            let lines = render_fstab(runner, &table, &options)?;
            Some(write_table(runner, &request.target, TableFile::Fstab, &lines)?)
        } else {
            None
        };

        let crypttab = if request.generate_crypttab {
            match render_crypttab(runner, &table, &disk)? {
                Some(lines) => Some(write_table(
                    runner,
                    &request.target,
                    TableFile::Crypttab,
                    &lines,
                )?),
                None => {
                    info!("Root is not encrypted, skipping crypttab");
                    None
                }
            }
        } else {
            None
        };

        info!("Layout of {} finished successfully", request.device);

        Ok(RunSummary {
            disk,
            plan,
            table,
            options,
            subvolumes,
            fstab,
            crypttab,
        })
    }

    fn inspect(&self) -> Result<DiskInfo> {
        let disk = inspect(self.runner, &self.request.device)?;
        Ok(if self.request.force_discard {
            disk.with_forced_trim()
        } else {
            disk
        })
    }
}
