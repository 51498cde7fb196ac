//! Core value types shared by every layer of the tracker stack.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Number of trailing hex digits of the hardware UUID kept in a [`LogicalId`].
pub const LOGICAL_ID_LEN: usize = 12;

/// Stable logical identifier of a tracker.
///
/// Derived from the hardware UUID the tag advertises by keeping the last
/// [`LOGICAL_ID_LEN`] hex digits, upper-cased. The same physical tag always
/// yields the same logical id regardless of which platform handle the radio
/// stack assigns to it.
///
/// # Examples
///
/// ```
/// use tagwatch_types::LogicalId;
///
/// let id = LogicalId::from_hardware_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
/// assert_eq!(id.as_str(), "E50E24DCCA9E");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LogicalId(String);

impl LogicalId {
    /// Derive a logical id from an advertised hardware UUID (any hex formatting).
    pub fn from_hardware_uuid(hardware_uuid: &str) -> Result<Self, ParseError> {
        let hex: String = hardware_uuid
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if hex.len() < LOGICAL_ID_LEN {
            return Err(ParseError::InvalidData(format!(
                "hardware id '{}' has fewer than {} hex digits",
                hardware_uuid, LOGICAL_ID_LEN
            )));
        }

        Ok(Self(hex[hex.len() - LOGICAL_ID_LEN..].to_string()))
    }

    /// The id as an upper-case hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id ends with the given short id (case-insensitive).
    ///
    /// Short ids are what users see printed on the tag, usually the last
    /// four to six digits.
    pub fn matches_short(&self, short: &str) -> bool {
        let short = short.trim().to_ascii_uppercase();
        !short.is_empty() && self.0.ends_with(&short)
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LogicalId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hardware_uuid(s)
    }
}

/// Opaque handle the radio stack uses for a peripheral.
///
/// On macOS this is a CoreBluetooth UUID; on Linux and Windows it is the
/// Bluetooth address. The core never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    /// Wrap a platform handle string.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The raw handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How loudly the tag alerts on separation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AlertMode {
    /// Quiet alert.
    #[default]
    Low,
    /// Loud alert.
    High,
}

impl fmt::Display for AlertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertMode::Low => write!(f, "low"),
            AlertMode::High => write!(f, "high"),
        }
    }
}

impl FromStr for AlertMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(AlertMode::Low),
            "high" => Ok(AlertMode::High),
            other => Err(ParseError::InvalidData(format!(
                "unknown alert mode '{}'",
                other
            ))),
        }
    }
}

/// Three-component firmware version reported by the tag.
///
/// Ordering compares major, minor and patch in turn, so `4.4.9 > 4.4.8`
/// and `4.10.0 > 4.9.9`.
///
/// # Examples
///
/// ```
/// use tagwatch_types::FirmwareVersion;
///
/// let v: FirmwareVersion = "4.4.9".parse().unwrap();
/// assert!(v > FirmwareVersion::new(4, 4, 8));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    /// Major component.
    pub major: u16,
    /// Minor component.
    pub minor: u16,
    /// Patch component.
    pub patch: u16,
}

impl FirmwareVersion {
    /// Create a version from its components.
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for FirmwareVersion {
    type Err = ParseError;

    /// Parses `MAJOR.MINOR.PATCH`, tolerating a leading `v` and trailing NULs
    /// (GATT string characteristics are often NUL padded). Missing trailing
    /// components default to zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().trim_end_matches('\0').trim_start_matches(['v', 'V']);
        let mut parts = [0u16; 3];
        let mut count = 0;

        for (i, part) in cleaned.split('.').enumerate() {
            if i >= 3 {
                return Err(ParseError::InvalidVersion(s.to_string()));
            }
            parts[i] = part
                .trim()
                .parse()
                .map_err(|_| ParseError::InvalidVersion(s.to_string()))?;
            count += 1;
        }

        if count == 0 {
            return Err(ParseError::InvalidVersion(s.to_string()));
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(feature = "serde")]
impl Serialize for FirmwareVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for FirmwareVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_id_keeps_trailing_digits() {
        let id = LogicalId::from_hardware_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(id.as_str(), "E50E24DCCA9E");
        assert_eq!(id.to_string(), "E50E24DCCA9E");
    }

    #[test]
    fn test_logical_id_is_stable_across_formatting() {
        let a = LogicalId::from_hardware_uuid("AA:BB:CC:DD:EE:FF:00:11").unwrap();
        let b = LogicalId::from_hardware_uuid("aabbccddeeff0011").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_logical_id_rejects_short_input() {
        assert!(LogicalId::from_hardware_uuid("abc").is_err());
    }

    #[test]
    fn test_short_id_match() {
        let id = LogicalId::from_hardware_uuid("0000e50e24dcca9e").unwrap();
        assert!(id.matches_short("ca9e"));
        assert!(id.matches_short("DCCA9E"));
        assert!(!id.matches_short("1234"));
        assert!(!id.matches_short(""));
    }

    #[test]
    fn test_firmware_version_ordering() {
        let baseline = FirmwareVersion::new(4, 4, 8);
        assert!("4.4.9".parse::<FirmwareVersion>().unwrap() > baseline);
        assert!("4.4.8".parse::<FirmwareVersion>().unwrap() == baseline);
        assert!("4.3.99".parse::<FirmwareVersion>().unwrap() < baseline);
        assert!("4.10.0".parse::<FirmwareVersion>().unwrap() > baseline);
    }

    #[test]
    fn test_firmware_version_tolerates_padding() {
        let v: FirmwareVersion = "v4.4.9\0\0".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(4, 4, 9));

        let v: FirmwareVersion = "5.1".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(5, 1, 0));
    }

    #[test]
    fn test_firmware_version_rejects_garbage() {
        assert!("".parse::<FirmwareVersion>().is_err());
        assert!("4.x.1".parse::<FirmwareVersion>().is_err());
        assert!("1.2.3.4".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn test_alert_mode_parse() {
        assert_eq!("HIGH".parse::<AlertMode>().unwrap(), AlertMode::High);
        assert_eq!("low".parse::<AlertMode>().unwrap(), AlertMode::Low);
        assert!("medium".parse::<AlertMode>().is_err());
    }

    #[test]
    fn test_firmware_version_serde_roundtrip() {
        let v = FirmwareVersion::new(4, 4, 9);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"4.4.9\"");
        let back: FirmwareVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
