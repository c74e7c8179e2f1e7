//! Typed views of enumerated field values. The session engine passes
//! these through unmodified; parsing happens lazily at the accessor
//! layer, never in the codec.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority of a queued job. Lower values are served first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Maximum,
    Interactive,
    SemiInteractive,
    Updatable,
    Bulk,
    Prefetch,
    Minimum,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Maximum => 0,
            Self::Interactive => 1,
            Self::SemiInteractive => 2,
            Self::Updatable => 3,
            Self::Bulk => 4,
            Self::Prefetch => 5,
            Self::Minimum => 6,
        }
    }

    pub fn from_field(value: &str) -> Option<Self> {
        match value.trim().parse::<u8>().ok()? {
            0 => Some(Self::Maximum),
            1 => Some(Self::Interactive),
            2 => Some(Self::SemiInteractive),
            3 => Some(Self::Updatable),
            4 => Some(Self::Bulk),
            5 => Some(Self::Prefetch),
            6 => Some(Self::Minimum),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Bulk
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Bit mask selecting which progress messages the node sends for a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verbosity(u32);

impl Verbosity {
    pub const NONE: Self = Self(0);
    /// Per-block transfer progress.
    pub const PROGRESS: Self = Self(1);
    /// Compression start/finish notifications.
    pub const COMPRESSION: Self = Self(512);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn from_field(value: &str) -> Option<Self> {
        value.trim().parse().ok().map(Self)
    }
}

impl std::ops::BitOr for Verbosity {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the bytes of an upload come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFrom {
    /// Shipped inline with the request.
    Direct,
    /// A path readable by the node.
    Disk,
    /// A redirect to an existing key.
    Redirect,
}

impl UploadFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Disk => "disk",
            Self::Redirect => "redirect",
        }
    }

    pub fn from_field(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "disk" => Some(Self::Disk),
            "redirect" => Some(Self::Redirect),
            _ => None,
        }
    }
}

impl Default for UploadFrom {
    fn default() -> Self {
        Self::Direct
    }
}

impl fmt::Display for UploadFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long the node keeps a job when no client is attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    /// Dropped when this connection goes away.
    Connection,
    /// Survives disconnects, lost on node restart.
    Reboot,
    /// Survives node restarts.
    Forever,
}

impl Persistence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Reboot => "reboot",
            Self::Forever => "forever",
        }
    }

    pub fn from_field(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "connection" => Some(Self::Connection),
            "reboot" => Some(Self::Reboot),
            "forever" => Some(Self::Forever),
            _ => None,
        }
    }
}

impl Default for Persistence {
    fn default() -> Self {
        Self::Forever
    }
}

impl fmt::Display for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How retrieved data is handed back to the requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    /// Shipped inline in the terminal data message.
    Direct,
    /// Written to a node-side path.
    Disk,
    /// Fetched and verified, data discarded.
    None,
}

impl ReturnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Disk => "disk",
            Self::None => "none",
        }
    }

    pub fn from_field(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "disk" => Some(Self::Disk),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl Default for ReturnType {
    fn default() -> Self {
        Self::Direct
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_roundtrip() {
        for value in 0..=6u8 {
            let priority = Priority::from_field(&value.to_string()).unwrap();
            assert_eq!(priority.as_u8(), value);
            assert_eq!(priority.to_string(), value.to_string());
        }
        assert_eq!(Priority::from_field("7"), None);
        assert_eq!(Priority::from_field("fast"), None);
    }

    #[test]
    fn priority_orders_by_urgency() {
        assert!(Priority::Maximum < Priority::Bulk);
        assert!(Priority::Bulk < Priority::Minimum);
    }

    #[test]
    fn verbosity_bit_operations() {
        let mask = Verbosity::PROGRESS | Verbosity::COMPRESSION;
        assert!(mask.contains(Verbosity::PROGRESS));
        assert!(mask.contains(Verbosity::COMPRESSION));
        assert!(!Verbosity::PROGRESS.contains(Verbosity::COMPRESSION));
        assert_eq!(mask.bits(), 513);
        assert_eq!(Verbosity::from_field("513"), Some(mask));
        assert_eq!(Verbosity::from_field("loud"), None);
    }

    #[test]
    fn upload_from_roundtrip() {
        for variant in [UploadFrom::Direct, UploadFrom::Disk, UploadFrom::Redirect] {
            assert_eq!(UploadFrom::from_field(variant.as_str()), Some(variant));
        }
        assert_eq!(UploadFrom::from_field("DIRECT"), Some(UploadFrom::Direct));
        assert_eq!(UploadFrom::from_field("carrier-pigeon"), None);
    }

    #[test]
    fn persistence_roundtrip() {
        for variant in [
            Persistence::Connection,
            Persistence::Reboot,
            Persistence::Forever,
        ] {
            assert_eq!(Persistence::from_field(variant.as_str()), Some(variant));
        }
        assert_eq!(Persistence::default(), Persistence::Forever);
    }

    #[test]
    fn return_type_roundtrip() {
        for variant in [ReturnType::Direct, ReturnType::Disk, ReturnType::None] {
            assert_eq!(ReturnType::from_field(variant.as_str()), Some(variant));
        }
        assert_eq!(ReturnType::from_field("inline"), None);
    }
}
