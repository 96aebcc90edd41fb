//! Error types for architect

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchitectError {
    #[error("Must be run as root")]
    NotRoot,

    #[error("Disk not found: {0}")]
    DiskNotFound(String),

    #[error("Not enough space: {0}")]
    NotEnoughSpace(String),

    #[error("Partitioning error: {0}")]
    Partitioning(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("fstab error: {0}")]
    Fstab(String),

    #[error("crypttab error: {0}")]
    Crypttab(String),

    #[error("Command failed: {command} (exit status: {})\n{stderr}", describe_status(.status))]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Refusing to run mutating command on the host during simulation: {0}")]
    RealExecutionRefused(String),

    #[error("Invalid size specification: {0}")]
    InvalidSize(String),

    #[error("Missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("User cancelled operation")]
    UserCancelled,

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Nix error: {0}")]
    Nix(#[from] nix::Error),
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

impl ArchitectError {
    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::UserCancelled | Self::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchitectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_maps_to_130() {
        assert_eq!(ArchitectError::UserCancelled.exit_code(), 130);
        assert_eq!(ArchitectError::Interrupted.exit_code(), 130);
        assert_eq!(ArchitectError::Mount("x".into()).exit_code(), 1);
    }

    #[test]
    fn command_failure_carries_status_and_stderr() {
        let err = ArchitectError::CommandFailed {
            command: "sfdisk /dev/sda".to_string(),
            status: Some(1),
            stdout: String::new(),
            stderr: "device busy".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit status: 1"));
        assert!(msg.contains("device busy"));
    }
}
