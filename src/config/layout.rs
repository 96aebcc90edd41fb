//! Layout request and its TOML configuration file

use crate::utils::error::{ArchitectError, Result};
use crate::utils::size::SizeSpec;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default mount point for the target root
pub const DEFAULT_TARGET: &str = "/target";

/// Target CPU architecture, used to pick the root partition type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[value(name = "x86_64")]
    X86_64,
    Arm64,
    Ia64,
    Arm,
    X86,
}

impl Architecture {
    /// Architecture of the running host, if it is one we know
    pub fn host() -> Option<Self> {
        Self::normalize(std::env::consts::ARCH)
    }

    /// Map a machine name (`uname -m` or `std::env::consts::ARCH` style)
    pub fn normalize(machine: &str) -> Option<Self> {
        let machine = machine.to_lowercase();
        match machine.as_str() {
            "x86_64" | "amd64" => Some(Self::X86_64),
            "aarch64" | "arm64" => Some(Self::Arm64),
            "ia64" => Some(Self::Ia64),
            "x86" | "i386" | "i486" | "i586" | "i686" => Some(Self::X86),
            m if m.starts_with("arm") => {
                if m.contains("64") {
                    Some(Self::Arm64)
                } else {
                    Some(Self::Arm)
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Arm64 => write!(f, "arm64"),
            Self::Ia64 => write!(f, "ia64"),
            Self::Arm => write!(f, "arm"),
            Self::X86 => write!(f, "x86"),
        }
    }
}

/// Kind of disk to pretend to be during simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SimDiskType {
    Hdd,
    Ssd,
    Nvme,
}

impl SimDiskType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Hdd => "HDD",
            Self::Ssd => "SSD",
            Self::Nvme => "NVME",
        }
    }
}

impl fmt::Display for SimDiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hdd => write!(f, "hdd"),
            Self::Ssd => write!(f, "ssd"),
            Self::Nvme => write!(f, "nvme"),
        }
    }
}

/// Disk characteristics injected into a simulated run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<SizeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<SimDiskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim_supported: Option<bool>,
}

impl SimulationParams {
    pub fn rotational(&self) -> Option<bool> {
        self.disk_type.map(|t| t == SimDiskType::Hdd)
    }

    pub fn nvme(&self) -> Option<bool> {
        self.disk_type.map(|t| t == SimDiskType::Nvme)
    }
}

/// Opal 2.0 secrets for self-encrypting drives
#[derive(Clone, PartialEq, Eq)]
pub struct OpalSecrets {
    /// Physical Security ID printed on the drive, used for the factory reset
    pub psid: Option<String>,
    /// Opal admin password
    pub admin: String,
    /// LUKS passphrase
    pub passphrase: String,
}

impl OpalSecrets {
    /// PSID to factory-reset with, unless absent or the literal "none"
    pub fn reset_psid(&self) -> Option<&str> {
        self.psid
            .as_deref()
            .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case("none"))
    }
}

impl fmt::Debug for OpalSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpalSecrets")
            .field("psid", &self.psid.as_ref().map(|_| "<redacted>"))
            .field("admin", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// How the system partition is encrypted
#[derive(Clone, Default, PartialEq, Eq)]
pub enum EncryptionIntent {
    #[default]
    None,
    /// dm-crypt LUKS2
    Software { passphrase: String },
    /// Opal self-encryption only
    Hardware { opal: OpalSecrets },
    /// Opal self-encryption layered under dm-crypt
    HardwareAndSoftware { opal: OpalSecrets },
}

impl EncryptionIntent {
    /// Select the encryption mode from whichever secrets were supplied.
    ///
    /// Any Opal secret selects a hardware mode, which then requires both the
    /// admin password and the passphrase. When a software passphrase is given
    /// as well the combined mode is used, keyed by the Opal passphrase.
    pub fn from_secrets(
        psid: Option<String>,
        admin: Option<String>,
        hardware_passphrase: Option<String>,
        software_passphrase: Option<String>,
    ) -> Result<Self> {
        let wants_hardware = psid.is_some() || admin.is_some() || hardware_passphrase.is_some();

        if !wants_hardware {
            return match software_passphrase {
                None => Ok(Self::None),
                Some(p) if p.is_empty() => Err(ArchitectError::Validation(
                    "Software encryption passphrase cannot be empty".to_string(),
                )),
                Some(passphrase) => Ok(Self::Software { passphrase }),
            };
        }

        let admin = admin.filter(|a| !a.is_empty()).ok_or_else(|| {
            ArchitectError::Validation(
                "Hardware encryption requires an Opal admin password".to_string(),
            )
        })?;
        let passphrase = hardware_passphrase.filter(|p| !p.is_empty()).ok_or_else(|| {
            ArchitectError::Validation(
                "Hardware encryption requires a LUKS passphrase".to_string(),
            )
        })?;

        let opal = OpalSecrets {
            psid,
            admin,
            passphrase,
        };

        if software_passphrase.is_some() {
            Ok(Self::HardwareAndSoftware { opal })
        } else {
            Ok(Self::Hardware { opal })
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware { .. } | Self::HardwareAndSoftware { .. })
    }

    /// Passphrase used to format and open the LUKS container
    pub fn passphrase(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Software { passphrase } => Some(passphrase),
            Self::Hardware { opal } | Self::HardwareAndSoftware { opal } => {
                Some(&opal.passphrase)
            }
        }
    }

    pub fn opal(&self) -> Option<&OpalSecrets> {
        match self {
            Self::Hardware { opal } | Self::HardwareAndSoftware { opal } => Some(opal),
            _ => None,
        }
    }
}

impl fmt::Display for EncryptionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Software { .. } => write!(f, "software (LUKS2)"),
            Self::Hardware { .. } => write!(f, "hardware (Opal)"),
            Self::HardwareAndSoftware { .. } => write!(f, "hardware (Opal) + software (LUKS2)"),
        }
    }
}

impl fmt::Debug for EncryptionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Software { .. } => write!(f, "Software {{ .. }}"),
            Self::Hardware { opal } => f.debug_struct("Hardware").field("opal", opal).finish(),
            Self::HardwareAndSoftware { opal } => f
                .debug_struct("HardwareAndSoftware")
                .field("opal", opal)
                .finish(),
        }
    }
}

/// Everything the user asked for
#[derive(Debug, Clone)]
pub struct LayoutRequest {
    /// Target block device (e.g., /dev/sda, /dev/nvme0n1)
    pub device: String,
    /// Space left unallocated at the end of the disk
    pub overprovision: Option<SizeSpec>,
    /// Space reserved for a Windows installation
    pub windows: Option<SizeSpec>,
    /// Architecture override for the root partition type
    pub target_arch: Option<Architecture>,
    pub encryption: EncryptionIntent,
    /// Tighter mount options
    pub hardened: bool,
    /// Filesystem-wide btrfs options replacing the detected ones
    pub btrfs_options: Option<String>,
    /// Treat any SSD as TRIM-capable
    pub force_discard: bool,
    /// Mount point for the target root
    pub target: PathBuf,
    pub generate_fstab: bool,
    pub generate_crypttab: bool,
}

impl LayoutRequest {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            overprovision: None,
            windows: None,
            target_arch: None,
            encryption: EncryptionIntent::None,
            hardened: false,
            btrfs_options: None,
            force_discard: false,
            target: PathBuf::from(DEFAULT_TARGET),
            generate_fstab: false,
            generate_crypttab: false,
        }
    }

    /// Validate the request
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(ArchitectError::Validation(
                "Target device cannot be empty".to_string(),
            ));
        }
        if !self.device.starts_with("/dev/") {
            return Err(ArchitectError::Validation(format!(
                "Target device must be a path under /dev: {}",
                self.device
            )));
        }

        if !self.target.is_absolute() {
            return Err(ArchitectError::Validation(format!(
                "Target mount point must be absolute: {}",
                self.target.display()
            )));
        }

        if let Some(opts) = &self.btrfs_options {
            if opts.chars().any(char::is_whitespace) {
                return Err(ArchitectError::Validation(format!(
                    "btrfs options cannot contain whitespace: {:?}",
                    opts
                )));
            }
        }

        if let Some(SizeSpec::Percent(p)) = self.windows {
            if p <= 0.0 {
                return Err(ArchitectError::Validation(
                    "Windows reservation must be greater than 0%".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// `[disk]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskSection {
    /// Target device path (e.g., /dev/sda)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Overprovisioning reserve (e.g., "5%", "32GiB")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overprovision: Option<SizeSpec>,
    /// Windows reservation (e.g., "30%", "128GiB")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<SizeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_arch: Option<Architecture>,
    #[serde(default)]
    pub force_discard: bool,
}

/// `[encryption]` section
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct EncryptionSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opal_psid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opal_admin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opal_passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub luks_passphrase: Option<String>,
}

impl fmt::Debug for EncryptionSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |v: &Option<String>| v.as_ref().map(|_| "<set>");
        f.debug_struct("EncryptionSection")
            .field("opal_psid", &set(&self.opal_psid))
            .field("opal_admin", &set(&self.opal_admin))
            .field("opal_passphrase", &set(&self.opal_passphrase))
            .field("luks_passphrase", &set(&self.luks_passphrase))
            .finish()
    }
}

/// `[mount]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSection {
    #[serde(default = "default_target")]
    pub target: PathBuf,
    #[serde(default)]
    pub hardened: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btrfs_options: Option<String>,
    #[serde(default)]
    pub generate_fstab: bool,
    #[serde(default)]
    pub generate_crypttab: bool,
}

impl Default for MountSection {
    fn default() -> Self {
        Self {
            target: default_target(),
            hardened: false,
            btrfs_options: None,
            generate_fstab: false,
            generate_crypttab: false,
        }
    }
}

/// `[simulation]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationSection {
    /// Simulate every command instead of touching the disk
    #[serde(default)]
    pub enabled: bool,
    /// Probe the real disk even while simulating
    #[serde(default)]
    pub use_real_disk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<SizeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<SimDiskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim_supported: Option<bool>,
}

impl SimulationSection {
    pub fn params(&self) -> SimulationParams {
        SimulationParams {
            disk_size: self.disk_size,
            disk_type: self.disk_type,
            trim_supported: self.trim_supported,
        }
    }
}

fn default_target() -> PathBuf {
    PathBuf::from(DEFAULT_TARGET)
}

/// Layout configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default)]
    pub disk: DiskSection,
    #[serde(default)]
    pub encryption: EncryptionSection,
    #[serde(default)]
    pub mount: MountSection,
    #[serde(default)]
    pub simulation: SimulationSection,
}

impl LayoutConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LayoutConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        LayoutConfig {
            disk: DiskSection {
                device: Some("/dev/sda".to_string()),
                overprovision: Some(SizeSpec::Percent(5.0)),
                windows: None,
                target_arch: None,
                force_discard: false,
            },
            encryption: EncryptionSection {
                luks_passphrase: Some("changeme".to_string()),
                ..Default::default()
            },
            mount: MountSection {
                target: default_target(),
                hardened: true,
                btrfs_options: None,
                generate_fstab: true,
                generate_crypttab: true,
            },
            simulation: SimulationSection {
                enabled: true,
                use_real_disk: false,
                disk_size: None,
                disk_type: Some(SimDiskType::Ssd),
                trim_supported: Some(true),
            },
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the layout request described by this configuration
    pub fn to_request(&self) -> Result<LayoutRequest> {
        let device = self.disk.device.clone().ok_or_else(|| {
            ArchitectError::Config("No target device given ([disk] device)".to_string())
        })?;

        let encryption = EncryptionIntent::from_secrets(
            self.encryption.opal_psid.clone(),
            self.encryption.opal_admin.clone(),
            self.encryption.opal_passphrase.clone(),
            self.encryption.luks_passphrase.clone(),
        )?;

        Ok(LayoutRequest {
            device,
            overprovision: self.disk.overprovision,
            windows: self.disk.windows,
            target_arch: self.disk.target_arch,
            encryption,
            hardened: self.mount.hardened,
            btrfs_options: self.mount.btrfs_options.clone(),
            force_discard: self.disk.force_discard,
            target: self.mount.target.clone(),
            generate_fstab: self.mount.generate_fstab,
            generate_crypttab: self.mount.generate_crypttab,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.to_request()?.validate()?;

        if !self.simulation.enabled
            && (self.simulation.disk_size.is_some()
                || self.simulation.disk_type.is_some()
                || self.simulation.trim_supported.is_some())
        {
            return Err(ArchitectError::Validation(
                "[simulation] disk settings require simulation to be enabled".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::size::GIB;

    #[test]
    fn architecture_normalization() {
        assert_eq!(Architecture::normalize("amd64"), Some(Architecture::X86_64));
        assert_eq!(Architecture::normalize("aarch64"), Some(Architecture::Arm64));
        assert_eq!(Architecture::normalize("armv7l"), Some(Architecture::Arm));
        assert_eq!(Architecture::normalize("i686"), Some(Architecture::X86));
        assert_eq!(Architecture::normalize("riscv64"), None);
    }

    #[test]
    fn encryption_mode_from_secrets() {
        let none = EncryptionIntent::from_secrets(None, None, None, None).unwrap();
        assert_eq!(none, EncryptionIntent::None);

        let sw = EncryptionIntent::from_secrets(None, None, None, Some("pw".into())).unwrap();
        assert_eq!(sw.passphrase(), Some("pw"));
        assert!(!sw.is_hardware());

        let hw = EncryptionIntent::from_secrets(
            Some("none".into()),
            Some("admin".into()),
            Some("opalpw".into()),
            None,
        )
        .unwrap();
        assert!(matches!(hw, EncryptionIntent::Hardware { .. }));
        assert_eq!(hw.opal().unwrap().reset_psid(), None);
    }

    #[test]
    fn combined_mode_uses_opal_passphrase() {
        let both = EncryptionIntent::from_secrets(
            Some("PSID123".into()),
            Some("admin".into()),
            Some("opalpw".into()),
            Some("swpw".into()),
        )
        .unwrap();
        assert!(matches!(both, EncryptionIntent::HardwareAndSoftware { .. }));
        assert_eq!(both.passphrase(), Some("opalpw"));
        assert_eq!(both.opal().unwrap().reset_psid(), Some("PSID123"));
    }

    #[test]
    fn incomplete_opal_secrets_are_rejected() {
        let err = EncryptionIntent::from_secrets(Some("PSID".into()), None, None, None);
        assert!(matches!(err, Err(ArchitectError::Validation(_))));
    }

    #[test]
    fn secrets_never_appear_in_debug_output() {
        let mut request = LayoutRequest::new("/dev/sda");
        request.encryption = EncryptionIntent::from_secrets(
            None,
            Some("adminsecret".into()),
            Some("opalsecret".into()),
            None,
        )
        .unwrap();
        let dbg = format!("{:?}", request);
        assert!(!dbg.contains("adminsecret"));
        assert!(!dbg.contains("opalsecret"));
    }

    #[test]
    fn config_file_builds_request() {
        let toml_src = r#"
            [disk]
            device = "/dev/nvme0n1"
            overprovision = "10%"
            windows = "64GiB"
            target_arch = "arm64"

            [encryption]
            luks_passphrase = "secret"

            [mount]
            hardened = true
            generate_fstab = true

            [simulation]
            enabled = true
            disk_type = "nvme"
            disk_size = "1TiB"
        "#;

        let config: LayoutConfig = toml::from_str(toml_src).unwrap();
        config.validate().unwrap();

        let request = config.to_request().unwrap();
        assert_eq!(request.device, "/dev/nvme0n1");
        assert_eq!(request.overprovision, Some(SizeSpec::Percent(10.0)));
        assert_eq!(request.windows, Some(SizeSpec::Bytes(64 * GIB)));
        assert_eq!(request.target_arch, Some(Architecture::Arm64));
        assert_eq!(request.target, PathBuf::from(DEFAULT_TARGET));
        assert!(request.hardened);
        assert!(request.generate_fstab);
        assert!(!request.generate_crypttab);
        assert!(matches!(request.encryption, EncryptionIntent::Software { .. }));

        let params = config.simulation.params();
        assert_eq!(params.nvme(), Some(true));
        assert_eq!(params.rotational(), Some(false));
    }

    #[test]
    fn sample_config_round_trips() {
        let text = LayoutConfig::sample().to_toml().unwrap();
        let parsed: LayoutConfig = toml::from_str(&text).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.disk.overprovision, Some(SizeSpec::Percent(5.0)));
    }

    #[test]
    fn request_validation() {
        assert!(LayoutRequest::new("/dev/sda").validate().is_ok());
        assert!(LayoutRequest::new("sda").validate().is_err());

        let mut request = LayoutRequest::new("/dev/sda");
        request.target = PathBuf::from("relative/target");
        assert!(request.validate().is_err());

        let mut request = LayoutRequest::new("/dev/sda");
        request.btrfs_options = Some("ssd, noatime".to_string());
        assert!(request.validate().is_err());
    }
}
