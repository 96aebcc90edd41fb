//! architect - Disk layout planner and executor
//!
//! Partitions a disk for a fresh Linux installation (GPT, optional LUKS2 or
//! Opal encryption, btrfs subvolumes) and mounts the result under a target
//! directory. Every step can be simulated.

use anyhow::{Context, Result};
use architect::cleanup::Cleaner;
use architect::config::{Architecture, LayoutConfig, SimDiskType, DEFAULT_TARGET};
use architect::disk::detection::{list_block_devices, DiskInfo};
use architect::disk::layouts::{print_layout_summary, PartitionPlan};
use architect::install::{Installer, RunSummary};
use architect::utils::command::CommandRunner;
use architect::utils::error::ArchitectError;
use architect::utils::signal;
use architect::utils::size::SizeSpec;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use console::Term;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "architect")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition, encrypt, format and mount a disk
    Prepare {
        #[command(flatten)]
        layout: LayoutArgs,

        /// Do not ask for confirmation before wiping the disk
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Inspect a disk and show the layout that would be created
    Plan {
        #[command(flatten)]
        layout: LayoutArgs,

        /// Print the disk info and plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available disks
    ListDisks {
        /// Show all block devices, not just suitable targets
        #[arg(short, long)]
        all: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "architect.toml")]
        output: PathBuf,
    },

    /// Unmount the target tree and close the root container
    Cleanup {
        /// Mount point of the target root
        #[arg(short, long, default_value = DEFAULT_TARGET)]
        target: PathBuf,

        /// Only show what would be done
        #[arg(short, long)]
        simulate: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum YesNo {
    Yes,
    No,
}

/// Flags shared by `prepare` and `plan`. Each overrides the config file.
#[derive(Args)]
struct LayoutArgs {
    /// Target disk device (e.g., /dev/sda)
    device: Option<String>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use hardened mount options
    #[arg(long)]
    hardened: bool,

    /// Space to leave unallocated at the end of the disk (e.g. 10G, 5%)
    #[arg(short = 'o', long)]
    overprovision: Option<SizeSpec>,

    /// Reserve space for Windows (e.g. 100G, 30%)
    #[arg(short = 'w', long)]
    windows: Option<SizeSpec>,

    /// Opal PSID to factory-reset the drive with ("none" to skip)
    #[arg(long)]
    hardware_encryption_psid: Option<String>,

    /// Opal admin password
    #[arg(long)]
    hardware_encryption_admin: Option<String>,

    /// Opal locking range passphrase
    #[arg(long)]
    hardware_encryption_pass: Option<String>,

    /// LUKS2 passphrase for software encryption
    #[arg(long, env = "ARCHITECT_LUKS_PASSPHRASE", hide_env_values = true)]
    software_encryption: Option<String>,

    /// Mount point for the target root
    #[arg(short = 't', long)]
    target: Option<PathBuf>,

    /// Write <target>/etc/fstab
    #[arg(short = 'f', long)]
    fstab: bool,

    /// Write <target>/etc/crypttab
    #[arg(short = 'c', long)]
    crypttab: bool,

    /// btrfs mount options replacing the detected ones
    #[arg(short = 'v', long)]
    btrfs_options: Option<String>,

    /// Treat the disk as TRIM-capable
    #[arg(long)]
    force_discard: bool,

    /// Architecture of the installed system
    #[arg(long, value_enum)]
    target_arch: Option<Architecture>,

    /// Simulate every command
    #[arg(short = 's', long)]
    simulate: bool,

    /// Simulated disk size (e.g. 1T, 256GiB, 5%)
    #[arg(long)]
    sim_disk_size: Option<SizeSpec>,

    /// Simulated disk type
    #[arg(long, value_enum)]
    sim_disk_type: Option<SimDiskType>,

    /// Whether the simulated disk supports TRIM
    #[arg(long, value_enum)]
    sim_disk_trim: Option<YesNo>,

    /// Probe the real disk while simulating
    #[arg(long)]
    sim_use_real: bool,
}

impl LayoutArgs {
    /// Merge the config file (if any) with the command line
    fn resolve(self) -> Result<LayoutConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                LayoutConfig::from_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?
            }
            None => LayoutConfig::default(),
        };

        if self.device.is_some() {
            config.disk.device = self.device;
        }
        if self.overprovision.is_some() {
            config.disk.overprovision = self.overprovision;
        }
        if self.windows.is_some() {
            config.disk.windows = self.windows;
        }
        if self.target_arch.is_some() {
            config.disk.target_arch = self.target_arch;
        }
        config.disk.force_discard |= self.force_discard;

        let secrets = &mut config.encryption;
        if self.hardware_encryption_psid.is_some() {
            secrets.opal_psid = self.hardware_encryption_psid;
        }
        if self.hardware_encryption_admin.is_some() {
            secrets.opal_admin = self.hardware_encryption_admin;
        }
        if self.hardware_encryption_pass.is_some() {
            secrets.opal_passphrase = self.hardware_encryption_pass;
        }
        if self.software_encryption.is_some() {
            secrets.luks_passphrase = self.software_encryption;
        }

        if let Some(target) = self.target {
            config.mount.target = target;
        }
        if self.btrfs_options.is_some() {
            config.mount.btrfs_options = self.btrfs_options;
        }
        config.mount.hardened |= self.hardened;
        config.mount.generate_fstab |= self.fstab;
        config.mount.generate_crypttab |= self.crypttab;

        let sim = &mut config.simulation;
        sim.enabled |= self.simulate;
        sim.use_real_disk |= self.sim_use_real;
        if self.sim_disk_size.is_some() {
            sim.disk_size = self.sim_disk_size;
        }
        if self.sim_disk_type.is_some() {
            sim.disk_type = self.sim_disk_type;
        }
        if let Some(trim) = self.sim_disk_trim {
            sim.trim_supported = Some(matches!(trim, YesNo::Yes));
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    init_logging(cli.debug);
    signal::install_signal_handlers();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<ArchitectError>()
                .map(ArchitectError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Prepare { layout, yes } => cmd_prepare(layout, yes),
        Commands::Plan { layout, json } => cmd_plan(layout, json),
        Commands::ListDisks { all } => cmd_list_disks(all),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::GenerateConfig { output } => cmd_generate_config(&output),
        Commands::Cleanup { target, simulate } => cmd_cleanup(&target, simulate),
    }
}

fn runner_for(config: &LayoutConfig) -> CommandRunner {
    if config.simulation.enabled {
        CommandRunner::simulated(config.simulation.params())
            .with_real_disk_info(config.simulation.use_real_disk)
    } else {
        CommandRunner::host()
    }
}

fn cmd_prepare(layout: LayoutArgs, yes: bool) -> Result<()> {
    let config = layout.resolve()?;
    let request = config.to_request()?;
    let target = request.target.clone();
    let runner = runner_for(&config);

    let result = Installer::new(request, &runner).with_skip_confirm(yes).run();

    match result {
        Ok(summary) => {
            print_summary(&summary);
            if runner.is_simulated() {
                print_simulation_report(&runner);
            }
            Ok(())
        }
        Err(ArchitectError::Interrupted) => {
            let signal = signal::caught_signal().unwrap_or_default();
            warn!("Interrupted by signal {}, releasing {}", signal, target.display());
            if let Err(e) = Cleaner::new(&runner).cleanup(&target) {
                warn!("Cleanup after interrupt failed: {}", e);
            }
            Err(ArchitectError::Interrupted.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Serialize)]
struct PlanReport<'a> {
    disk: &'a DiskInfo,
    plan: &'a PartitionPlan,
}

fn cmd_plan(layout: LayoutArgs, json: bool) -> Result<()> {
    let config = layout.resolve()?;
    let request = config.to_request()?;
    let runner = runner_for(&config);

    let (disk, plan) = Installer::new(request, &runner).preview()?;

    if json {
        let report = PlanReport {
            disk: &disk,
            plan: &plan,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} {} ({}, {}, TRIM {})",
        "Disk:".bold(),
        plan.device(),
        disk.model(),
        disk.size_human(),
        if disk.trim_supported() { "yes" } else { "no" }
    );
    print_layout_summary(&plan);
    Ok(())
}

fn cmd_list_disks(all: bool) -> Result<()> {
    let devices = list_block_devices(all)?;

    if devices.is_empty() {
        println!("No suitable disks found.");
        return Ok(());
    }

    println!("{:<15} {:>12} {:<24} TYPE", "DEVICE", "SIZE", "MODEL");
    println!("{}", "-".repeat(60));

    for dev in devices {
        println!(
            "{:<15} {:>12} {:<24} {}",
            dev.path,
            dev.size_human(),
            dev.model.as_deref().unwrap_or("-"),
            dev.device_type
        );
    }

    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let config = LayoutConfig::from_file(path)?;
    config.validate()?;
    println!("{} Configuration is valid", "✓".green());
    Ok(())
}

fn cmd_generate_config(output: &Path) -> Result<()> {
    let content = LayoutConfig::sample().to_toml()?;
    std::fs::write(output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "{} Sample configuration written to {}",
        "✓".green(),
        output.display()
    );
    Ok(())
}

fn cmd_cleanup(target: &Path, simulate: bool) -> Result<()> {
    let runner = if simulate {
        CommandRunner::simulated(Default::default())
    } else {
        if !nix::unistd::geteuid().is_root() {
            return Err(ArchitectError::NotRoot.into());
        }
        CommandRunner::host()
    };

    Cleaner::new(&runner).cleanup(target)?;
    Ok(())
}

fn rule(ch: char) -> String {
    let width = Term::stdout().size().1.clamp(40, 80) as usize;
    ch.to_string().repeat(width)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", rule('='));
    println!("{}", "Layout complete".green().bold());
    println!("{}", rule('='));

    for (role, device) in summary.table.entries() {
        println!("  {:<14} {}", role, device);
    }
    println!();
    for (mount_point, options) in &summary.options {
        println!("  {:<14} {}", mount_point, options);
    }
    if let Some(path) = &summary.fstab {
        println!("\n  fstab:    {}", path.display());
    }
    if let Some(path) = &summary.crypttab {
        println!("  crypttab: {}", path.display());
    }
}

fn print_simulation_report(runner: &CommandRunner) {
    println!();
    println!("{}", runner.report());
    println!(
        "{}",
        "Simulation complete: no changes were made to any disk."
            .yellow()
            .bold()
    );
}
