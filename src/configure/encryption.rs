//! LUKS2 and Opal self-encryption setup

use crate::config::EncryptionIntent;
use crate::disk::volumes::PartitionTable;
use crate::utils::command::{CommandKind, CommandRunner, Invocation};
use crate::utils::error::{ArchitectError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

/// Name of the device-mapper target for the root container
pub const LUKS_MAPPER_NAME: &str = "luks-root";

/// Oldest cryptsetup with Opal support
pub const MIN_OPAL_CRYPTSETUP: (u32, u32, u32) = (2, 6, 0);

const CIPHER_ARGS: &[&str] = &[
    "--cipher",
    "aes-xts-plain64",
    "--key-size",
    "512",
    "--hash",
    "sha512",
    "--pbkdf",
    "argon2id",
    "--iter-time",
    "5000",
];

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("static regex"));

/// Path of the opened root container
pub fn mapped_device() -> String {
    format!("/dev/mapper/{}", LUKS_MAPPER_NAME)
}

/// Parse `X.Y.Z` out of `cryptsetup --version` output
pub fn parse_version(output: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION_RE.captures(output)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

/// Ensure the installed cryptsetup can drive Opal hardware encryption.
///
/// Software-only and unencrypted layouts need no check.
pub fn check_requirements(runner: &CommandRunner, intent: &EncryptionIntent) -> Result<()> {
    if !intent.is_hardware() {
        return Ok(());
    }

    let probe = Invocation::new(CommandKind::CryptVersion, "cryptsetup", ["--version"]);
    let output = runner.execute(&probe).map_err(|e| {
        ArchitectError::Encryption(format!("Could not determine cryptsetup version: {}", e))
    })?;
    let reported = output.stdout.trim();

    let version = parse_version(reported).ok_or_else(|| {
        ArchitectError::Encryption(format!(
            "Could not parse cryptsetup version from {:?}",
            reported
        ))
    })?;

    if version < MIN_OPAL_CRYPTSETUP {
        let (major, minor, patch) = MIN_OPAL_CRYPTSETUP;
        return Err(ArchitectError::Encryption(format!(
            "Opal hardware encryption requires cryptsetup {}.{}.{} or newer, found {}",
            major, minor, patch, reported
        )));
    }

    info!("cryptsetup {}.{}.{} supports Opal", version.0, version.1, version.2);
    Ok(())
}

/// Factory-reset an Opal drive with its PSID. Erases everything on it.
pub fn reset_opal(runner: &CommandRunner, device: &str, psid: &str) -> Result<()> {
    info!("Resetting Opal drive {} with PSID", device);

    let erase = Invocation::mutation("cryptsetup", ["erase", "--hw-opal-factory-reset", device])
        .subject(device)
        .stdin(format!("{}\nYES\n", psid));
    runner
        .execute(&erase)
        .map_err(|e| ArchitectError::Encryption(format!("Failed to reset Opal drive: {}", e)))?;

    info!("Opal drive reset successful");
    Ok(())
}

/// Arguments and stdin for `cryptsetup luksFormat` on `partition`
fn format_invocation(intent: &EncryptionIntent, partition: &str) -> Option<Invocation> {
    let mut args: Vec<&str> = vec!["luksFormat", "--type", "luks2"];

    let stdin = match intent {
        EncryptionIntent::None => return None,
        EncryptionIntent::Software { passphrase } => {
            args.extend_from_slice(CIPHER_ARGS);
            format!("{0}\n{0}\n", passphrase)
        }
        EncryptionIntent::Hardware { opal } => {
            args.push("--hw-opal-only");
            format!("{0}\n{0}\n{1}\n{1}\n", opal.passphrase, opal.admin)
        }
        EncryptionIntent::HardwareAndSoftware { opal } => {
            args.push("--hw-opal");
            args.extend_from_slice(CIPHER_ARGS);
            format!("{0}\n{0}\n{1}\n{1}\n", opal.passphrase, opal.admin)
        }
    };
    args.push(partition);

    Some(
        Invocation::mutation("cryptsetup", args)
            .subject(partition)
            .stdin(stdin),
    )
}

/// Encrypt the system partition and open it.
///
/// Returns the table with `system` pointing at the mapped device.
pub fn bind(
    runner: &CommandRunner,
    table: PartitionTable,
    intent: &EncryptionIntent,
) -> Result<PartitionTable> {
    let Some(format) = format_invocation(intent, &table.system) else {
        return Ok(table);
    };
    let passphrase = intent.passphrase().unwrap_or_default();
    let partition = table.system.clone();

    info!("Setting up {} encryption on {}", intent, partition);

    runner.execute(&format).map_err(|e| {
        ArchitectError::Encryption(format!("Failed to format {}: {}", partition, e))
    })?;

    let open = Invocation::mutation("cryptsetup", ["open", partition.as_str(), LUKS_MAPPER_NAME])
        .subject(&partition)
        .stdin(format!("{}\n", passphrase));
    runner.execute(&open).map_err(|e| {
        ArchitectError::Encryption(format!("Failed to open {}: {}", partition, e))
    })?;

    info!("Encryption set up for {} as {}", partition, mapped_device());
    table.with_encrypted_system(&mapped_device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpalSecrets, SimulationParams};

    fn table() -> PartitionTable {
        PartitionTable {
            efi: "/dev/sda1".to_string(),
            boot: "/dev/sda2".to_string(),
            system: "/dev/sda3".to_string(),
            system_crypt: None,
            windows: None,
        }
    }

    fn opal() -> OpalSecrets {
        OpalSecrets {
            psid: None,
            admin: "admin".to_string(),
            passphrase: "pass".to_string(),
        }
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("cryptsetup 2.6.1"), Some((2, 6, 1)));
        assert_eq!(parse_version("cryptsetup 2.7.0 flags: UDEV BLKID"), Some((2, 7, 0)));
        assert_eq!(parse_version("cryptsetup"), None);
        assert!(parse_version("cryptsetup 2.5.9").unwrap() < MIN_OPAL_CRYPTSETUP);
    }

    #[test]
    fn version_gate_only_for_hardware() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        check_requirements(&runner, &EncryptionIntent::None).unwrap();
        assert!(runner.history().is_empty());

        check_requirements(&runner, &EncryptionIntent::Hardware { opal: opal() }).unwrap();
        assert_eq!(runner.history()[0].command_line(), "cryptsetup --version");
    }

    #[test]
    fn no_encryption_leaves_table_untouched() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let out = bind(&runner, table(), &EncryptionIntent::None).unwrap();
        assert_eq!(out, table());
        assert!(runner.history().is_empty());
    }

    #[test]
    fn software_encryption_formats_and_opens() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        let intent = EncryptionIntent::Software {
            passphrase: "pw".to_string(),
        };
        let out = bind(&runner, table(), &intent).unwrap();

        assert_eq!(out.system, "/dev/mapper/luks-root");
        assert_eq!(out.system_crypt.as_deref(), Some("/dev/sda3"));

        let lines: Vec<String> = runner.history().iter().map(|r| r.command_line()).collect();
        assert_eq!(
            lines[0],
            "cryptsetup luksFormat --type luks2 --cipher aes-xts-plain64 --key-size 512 \
             --hash sha512 --pbkdf argon2id --iter-time 5000 /dev/sda3"
        );
        assert_eq!(lines[1], "cryptsetup open /dev/sda3 luks-root");
    }

    #[test]
    fn hardware_modes_pass_opal_flags() {
        let hw = format_invocation(&EncryptionIntent::Hardware { opal: opal() }, "/dev/sda3").unwrap();
        assert!(hw.args().contains(&"--hw-opal-only".to_string()));
        assert!(!hw.args().contains(&"--cipher".to_string()));

        let both =
            format_invocation(&EncryptionIntent::HardwareAndSoftware { opal: opal() }, "/dev/sda3")
                .unwrap();
        assert!(both.args().contains(&"--hw-opal".to_string()));
        assert!(both.args().contains(&"argon2id".to_string()));
        assert_eq!(both.args().last().unwrap(), "/dev/sda3");
    }

    #[test]
    fn opal_reset_command() {
        let runner = CommandRunner::simulated(SimulationParams::default());
        reset_opal(&runner, "/dev/sda", "PSID").unwrap();
        assert_eq!(
            runner.history()[0].command_line(),
            "cryptsetup erase --hw-opal-factory-reset /dev/sda"
        );
    }
}
