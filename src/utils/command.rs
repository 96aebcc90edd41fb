//! Command execution against the host or a simulated disk
//!
//! Every external tool the planner drives goes through [`CommandRunner`].
//! The backend is chosen once per run: [`Backend::Host`] spawns real
//! processes, [`Backend::Simulated`] synthesizes answers from a
//! [`Simulator`] and never touches the machine. Callers describe each
//! command with an [`Invocation`] whose [`CommandKind`] tells the simulator
//! what kind of answer to produce, so no component needs to know which
//! backend is active.

use crate::config::SimulationParams;
use crate::utils::error::{ArchitectError, Result};
use crate::utils::signal;
use crate::utils::size::TIB;
use colored::Colorize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Size reported when a disk size cannot be determined (~465.76 GiB)
pub const DEFAULT_DISK_SIZE: u64 = 500_107_862_016;

/// Reference total used to resolve percentage-based simulated disk sizes
pub const SIM_REFERENCE_SIZE: u64 = 10 * TIB;

/// Which identifier a `blkid` query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Uuid,
    PartUuid,
}

impl IdKind {
    pub fn blkid_tag(self) -> &'static str {
        match self {
            Self::Uuid => "UUID",
            Self::PartUuid => "PARTUUID",
        }
    }
}

/// What a command does, as far as simulation is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Total size of a block device in bytes
    DeviceSize,
    /// Block device type (disk, part, ...)
    DeviceType,
    /// Vendor model string
    DeviceModel,
    /// Filesystem UUID or GPT PARTUUID of a device
    Identifier(IdKind),
    /// TRIM capability listing (hdparm -I)
    TrimProbe,
    /// Version of the encryption tool
    CryptVersion,
    /// Details of a btrfs subvolume
    SubvolumeInfo,
    /// Writing a new partition table
    PartitionApply,
    /// Any other command that changes state
    Mutation,
}

impl CommandKind {
    /// Read-only queries that may be sent to real hardware during simulation
    pub fn is_probe(self) -> bool {
        !matches!(self, Self::PartitionApply | Self::Mutation)
    }
}

/// A single external command to execute
#[derive(Clone)]
pub struct Invocation {
    kind: CommandKind,
    program: String,
    args: Vec<String>,
    subject: Option<String>,
    stdin: Option<String>,
}

impl Invocation {
    pub fn new<I, S>(kind: CommandKind, program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            subject: None,
            stdin: None,
        }
    }

    /// A state-changing command
    pub fn mutation<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandKind::Mutation, program, args)
    }

    /// The device this command is about (used to key simulated identities)
    pub fn subject(mut self, device: &str) -> Self {
        self.subject = Some(device.to_string());
        self
    }

    /// Data piped to the command's stdin. Never logged.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn device(&self) -> Option<&str> {
        self.subject
            .as_deref()
            .or_else(|| self.args.last().map(String::as_str))
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("kind", &self.kind)
            .field("command", &self.command_line())
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Uniform result of a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// A command that was executed (or would have been)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub program: String,
    pub args: Vec<String>,
    pub kind: CommandKind,
    pub simulated: bool,
}

impl CommandRecord {
    pub fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
            .trim_end()
            .to_string()
    }
}

/// Simulated disk state: injected characteristics plus memoized identities
pub struct Simulator {
    id: String,
    params: SimulationParams,
    identities: Mutex<HashMap<(IdKind, String), String>>,
}

impl Simulator {
    pub fn new(params: SimulationParams) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            params,
            identities: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Stable identifier for `device`, generated on first request
    pub fn identifier(&self, kind: IdKind, device: &str) -> String {
        let mut ids = self.identities.lock().unwrap_or_else(|e| e.into_inner());
        ids.entry((kind, device.to_string()))
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    fn respond(&self, inv: &Invocation) -> CommandOutput {
        match inv.kind {
            CommandKind::DeviceSize => {
                let size = self
                    .params
                    .disk_size
                    .map(|s| s.resolve(SIM_REFERENCE_SIZE))
                    .filter(|&s| s > 0)
                    .unwrap_or(DEFAULT_DISK_SIZE);
                CommandOutput::ok(format!("{}\n", size))
            }
            CommandKind::DeviceType => CommandOutput::ok("disk\n"),
            CommandKind::DeviceModel => match self.params.disk_type {
                Some(t) => CommandOutput::ok(format!("SIMULATED {} DISK\n", t.label())),
                None => CommandOutput::ok("SIMULATED DISK\n"),
            },
            CommandKind::Identifier(kind) => {
                let device = inv.device().unwrap_or_default();
                CommandOutput::ok(format!("{}\n", self.identifier(kind, device)))
            }
            CommandKind::TrimProbe => {
                if self.params.trim_supported.unwrap_or(true) {
                    CommandOutput::ok(
                        "Commands/features:\n\t   *\tData Set Management TRIM supported (limit 8 blocks)\n",
                    )
                } else {
                    CommandOutput::ok("Commands/features:\n\t   *\tWrite cache\n")
                }
            }
            CommandKind::CryptVersion => CommandOutput::ok("cryptsetup 2.6.1\n"),
            CommandKind::SubvolumeInfo => CommandOutput::ok(
                "@\n\tName: \t\t\t@\n\tSubvolume ID: \t\t256\n\tParent ID: \t\t5\n\tTop level ID: \t\t5\n",
            ),
            CommandKind::PartitionApply => CommandOutput::ok(
                "Created a new GPT disklabel.\nThe partition table has been altered.\nSyncing disks.\n",
            ),
            CommandKind::Mutation => CommandOutput::default(),
        }
    }
}

/// Where commands actually go
pub enum Backend {
    Host,
    Simulated(Simulator),
}

/// Executes commands for every stage of a run
pub struct CommandRunner {
    backend: Backend,
    use_real_disk_info: bool,
    history: Mutex<Vec<CommandRecord>>,
}

impl CommandRunner {
    /// Runner that executes everything on the host
    pub fn host() -> Self {
        Self {
            backend: Backend::Host,
            use_real_disk_info: true,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Runner that simulates every command
    pub fn simulated(params: SimulationParams) -> Self {
        Self {
            backend: Backend::Simulated(Simulator::new(params)),
            use_real_disk_info: false,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Allow read-only probes of the real disk while simulating
    pub fn with_real_disk_info(mut self, enabled: bool) -> Self {
        if self.is_simulated() {
            self.use_real_disk_info = enabled;
        }
        self
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.backend, Backend::Simulated(_))
    }

    /// True when disk probes reach real hardware
    pub fn uses_real_disk_info(&self) -> bool {
        self.use_real_disk_info
    }

    pub fn simulation_id(&self) -> Option<&str> {
        match &self.backend {
            Backend::Simulated(sim) => Some(sim.id()),
            Backend::Host => None,
        }
    }

    /// Simulated disk characteristics, unless probes go to the real disk
    pub fn disk_overrides(&self) -> Option<&SimulationParams> {
        match &self.backend {
            Backend::Simulated(sim) if !self.use_real_disk_info => Some(sim.params()),
            _ => None,
        }
    }

    /// Execute a command through the active backend
    pub fn execute(&self, inv: &Invocation) -> Result<CommandOutput> {
        if signal::is_interrupted() {
            return Err(ArchitectError::Interrupted);
        }
        self.dispatch(inv)
    }

    /// Execute a read-only probe on the host, even while simulating.
    ///
    /// Only allowed when the runner was built with real disk info enabled.
    pub fn execute_real(&self, inv: &Invocation) -> Result<CommandOutput> {
        if signal::is_interrupted() {
            return Err(ArchitectError::Interrupted);
        }
        match &self.backend {
            Backend::Host => self.dispatch(inv),
            Backend::Simulated(_) => {
                if !inv.kind.is_probe() || !self.use_real_disk_info {
                    return Err(ArchitectError::RealExecutionRefused(inv.command_line()));
                }
                self.record(inv, false);
                run_on_host(inv)
            }
        }
    }

    /// Route a disk probe to real hardware when requested, else to the backend
    pub fn probe(&self, inv: &Invocation) -> Result<CommandOutput> {
        if self.is_simulated() && self.use_real_disk_info {
            self.execute_real(inv)
        } else {
            self.execute(inv)
        }
    }

    /// Run a state-changing command
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.execute(&Invocation::mutation(program, args.iter().copied()))
    }

    /// Run a command for cleanup purposes, ignoring interrupts and failures.
    /// Returns whether it succeeded.
    pub fn run_best_effort(&self, program: &str, args: &[&str]) -> bool {
        match self.dispatch(&Invocation::mutation(program, args.iter().copied())) {
            Ok(_) => true,
            Err(e) => {
                debug!("Ignoring failure of {} {}: {}", program, args.join(" "), e);
                false
            }
        }
    }

    /// Whether a tool is installed on the host (always true in pure simulation)
    pub fn tool_available(&self, name: &str) -> bool {
        if self.disk_overrides().is_some() {
            return true;
        }
        which::which(name).is_ok()
    }

    /// Read `/sys/block/<device_name>/<attr>`, or its simulated equivalent
    pub fn read_sysfs(&self, device_name: &str, attr: &str) -> Option<String> {
        if let Some(params) = self.disk_overrides() {
            return match attr {
                "queue/rotational" => params
                    .rotational()
                    .map(|r| if r { "1" } else { "0" }.to_string()),
                _ => None,
            };
        }
        read_sysfs_attr(device_name, attr)
    }

    /// Every command issued so far, in order
    pub fn history(&self) -> Vec<CommandRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Human-readable list of simulated commands grouped by tool
    pub fn report(&self) -> String {
        let Some(id) = self.simulation_id() else {
            return "Simulation mode is not active.".to_string();
        };

        let records: Vec<CommandRecord> =
            self.history().into_iter().filter(|r| r.simulated).collect();

        let mut groups: Vec<(String, Vec<&CommandRecord>)> = Vec::new();
        for record in &records {
            match groups.iter_mut().find(|(name, _)| *name == record.program) {
                Some((_, list)) => list.push(record),
                None => groups.push((record.program.clone(), vec![record])),
            }
        }

        let mut out = Vec::new();
        out.push("=".repeat(80));
        out.push(format!("SIMULATION REPORT [ID: {}]", id));
        out.push("=".repeat(80));
        out.push(String::new());

        for (program, list) in &groups {
            out.push(format!("{} COMMANDS:", program.to_uppercase()));
            out.push("-".repeat(40));
            for (i, record) in list.iter().enumerate() {
                out.push(format!("{}. {}", i + 1, record.command_line()));
            }
            out.push(String::new());
        }

        out.push("-".repeat(80));
        out.push(format!("Total commands simulated: {}", records.len()));
        out.push("=".repeat(80));
        out.join("\n")
    }

    fn dispatch(&self, inv: &Invocation) -> Result<CommandOutput> {
        match &self.backend {
            Backend::Host => {
                self.record(inv, false);
                run_on_host(inv)
            }
            Backend::Simulated(sim) => {
                self.record(inv, true);
                let prefix = format!("[SIM:{}]", sim.id()).magenta().bold();
                info!("{} Would execute: {}", prefix, inv.command_line());
                Ok(sim.respond(inv))
            }
        }
    }

    fn record(&self, inv: &Invocation, simulated: bool) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CommandRecord {
                program: inv.program.clone(),
                args: inv.args.clone(),
                kind: inv.kind,
                simulated,
            });
    }
}

/// Read `/sys/block/<device_name>/<attr>` from the host, trimmed
pub fn read_sysfs_attr(device_name: &str, attr: &str) -> Option<String> {
    let path = format!("/sys/block/{}/{}", device_name, attr);
    fs::read_to_string(&path).ok().map(|s| s.trim().to_string())
}

/// Spawn the command on the host and capture its output
fn run_on_host(inv: &Invocation) -> Result<CommandOutput> {
    debug!("Running: {}", inv.command_line());

    let mut command = Command::new(&inv.program);
    command
        .args(&inv.args)
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ArchitectError::CommandNotFound(inv.program.clone())
        } else {
            ArchitectError::Io(e)
        }
    })?;

    if let Some(input) = &inv.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
    }

    let output = child.wait_with_output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        warn!(
            "Command failed: {}\n  status: {:?}\n  stderr: {}",
            inv.command_line(),
            output.status.code(),
            stderr.trim()
        );
        return Err(ArchitectError::CommandFailed {
            command: inv.command_line(),
            status: output.status.code(),
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput {
        status: output.status.code().unwrap_or_default(),
        stdout,
        stderr,
    })
}
