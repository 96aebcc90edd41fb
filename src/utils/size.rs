//! Size specifications and human-readable formatting

use crate::utils::error::{ArchitectError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+(?:\.\d+)?)\s*([KMGT]i?B?|B)?$").expect("static regex"));

/// A size given either as an absolute byte count or as a share of the whole disk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SizeSpec {
    Bytes(u64),
    Percent(f64),
}

impl SizeSpec {
    /// Resolve against the total disk size.
    pub fn resolve(&self, total_bytes: u64) -> u64 {
        match self {
            Self::Bytes(b) => *b,
            Self::Percent(p) => (total_bytes as f64 * p / 100.0) as u64,
        }
    }
}

impl FromStr for SizeSpec {
    type Err = ArchitectError;

    fn from_str(spec: &str) -> Result<Self> {
        let spec = spec.trim();

        if let Some(pct) = spec.strip_suffix('%') {
            let value: f64 = pct
                .trim()
                .parse()
                .map_err(|_| ArchitectError::InvalidSize(spec.to_string()))?;
            if !(0.0..=100.0).contains(&value) {
                return Err(ArchitectError::InvalidSize(format!(
                    "{} (percentage must be between 0 and 100)",
                    spec
                )));
            }
            return Ok(Self::Percent(value));
        }

        let caps = SIZE_RE
            .captures(spec)
            .ok_or_else(|| ArchitectError::InvalidSize(spec.to_string()))?;
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| ArchitectError::InvalidSize(spec.to_string()))?;
        let unit = caps
            .get(2)
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_default();

        let multiplier: u64 = match unit.as_str() {
            "" | "B" => 1,
            "K" | "KIB" => KIB,
            "M" | "MIB" => MIB,
            "G" | "GIB" => GIB,
            "T" | "TIB" => TIB,
            "KB" => 1000,
            "MB" => 1000u64.pow(2),
            "GB" => 1000u64.pow(3),
            "TB" => 1000u64.pow(4),
            other => {
                return Err(ArchitectError::InvalidSize(format!(
                    "{} (unknown unit {})",
                    spec, other
                )))
            }
        };

        Ok(Self::Bytes((value * multiplier as f64) as u64))
    }
}

impl TryFrom<String> for SizeSpec {
    type Error = ArchitectError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SizeSpec> for String {
    fn from(spec: SizeSpec) -> String {
        spec.to_string()
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "{}", b),
            Self::Percent(p) => write!(f, "{}%", p),
        }
    }
}

/// Format a byte count with binary units (KiB, MiB, GiB, ...)
pub fn bytes_to_human(size_bytes: u64) -> String {
    if size_bytes < KIB {
        return format!("{} B", size_bytes);
    }

    let mut value = size_bytes as f64;
    for unit in ["KiB", "MiB", "GiB", "TiB", "PiB"] {
        value /= 1024.0;
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
    }
    format!("{:.2} EiB", value / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_units() {
        assert_eq!("64GiB".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(64 * GIB));
        assert_eq!("64G".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(64 * GIB));
        assert_eq!("64gb".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(64_000_000_000));
        assert_eq!("500MiB".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(500 * MIB));
        assert_eq!("1.5T".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(TIB + TIB / 2));
        assert_eq!("4096".parse::<SizeSpec>().unwrap(), SizeSpec::Bytes(4096));
    }

    #[test]
    fn parses_percentages() {
        let spec: SizeSpec = "5%".parse().unwrap();
        assert_eq!(spec, SizeSpec::Percent(5.0));
        assert_eq!(spec.resolve(1000), 50);
        assert!("150%".parse::<SizeSpec>().is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!("lots".parse::<SizeSpec>().is_err());
        assert!("12XB".parse::<SizeSpec>().is_err());
        assert!("".parse::<SizeSpec>().is_err());
    }

    #[test]
    fn human_sizes() {
        assert_eq!(bytes_to_human(512), "512 B");
        assert_eq!(bytes_to_human(550 * MIB), "550.00 MiB");
        assert_eq!(bytes_to_human(500_107_862_016), "465.76 GiB");
    }
}
