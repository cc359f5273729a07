//! Object versions.
//!
//! Consumers only ever see coordinator-assigned counters. Producers stamp
//! their own versions as `[epoch_millis, sequence]` pairs, where the epoch is
//! fixed when the producer is created and the sequence grows with each
//! incremental publish.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version of a consumed object, assigned by the coordinator.
///
/// Zero means "nothing known yet".
pub type SlaveVersion = u64;

/// Version of a produced object.
///
/// Serialized as a two-element JSON array `[epoch_millis, sequence]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct MasterVersion {
    /// Wall-clock milliseconds at which the producer was created.
    pub epoch_millis: u64,
    /// Publish counter within the epoch.
    pub sequence: u64,
}

impl MasterVersion {
    /// Creates a version from its parts.
    pub fn new(epoch_millis: u64, sequence: u64) -> Self {
        Self {
            epoch_millis,
            sequence,
        }
    }

    /// Creates a version stamped with the current wall clock and sequence zero.
    pub fn now() -> Self {
        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::new(epoch_millis, 0)
    }

    /// Returns the next version in the same epoch.
    #[must_use]
    pub fn next(&self) -> Self {
        Self::new(self.epoch_millis, self.sequence + 1)
    }
}

impl From<(u64, u64)> for MasterVersion {
    fn from((epoch_millis, sequence): (u64, u64)) -> Self {
        Self::new(epoch_millis, sequence)
    }
}

impl From<MasterVersion> for (u64, u64) {
    fn from(version: MasterVersion) -> Self {
        (version.epoch_millis, version.sequence)
    }
}

impl fmt::Display for MasterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch_millis, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_pair() {
        let version = MasterVersion::new(1_700_000_000_000, 3);
        let json = serde_json::to_string(&version).unwrap();
        assert_eq!(json, "[1700000000000,3]");

        let back: MasterVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, version);
    }

    #[test]
    fn next_keeps_epoch() {
        let version = MasterVersion::new(42, 7);
        let next = version.next();
        assert_eq!(next.epoch_millis, 42);
        assert_eq!(next.sequence, 8);
        assert!(next > version);
    }

    #[test]
    fn now_starts_at_sequence_zero() {
        let version = MasterVersion::now();
        assert_eq!(version.sequence, 0);
        assert!(version.epoch_millis > 0);
    }

    #[test]
    fn display() {
        assert_eq!(MasterVersion::new(5, 1).to_string(), "5.1");
    }
}
