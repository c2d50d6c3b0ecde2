//! Core identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Durable identifier of a cron definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CronId(u64);

impl CronId {
    /// Wrap a raw store identifier.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw numeric value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Name of the engine entry scheduled for this definition.
    pub fn entry_name(self) -> String {
        format!("cron-{}", self.0)
    }
}

impl From<u64> for CronId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl FromStr for CronId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl fmt::Display for CronId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one running replica.
///
/// Written as the value of distributed-lock keys so a held key can be
/// attributed to its holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a random instance id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use a fixed instance id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_id_parse_and_entry_name() {
        let id: CronId = " 42 ".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert_eq!(id.entry_name(), "cron-42");
        assert_eq!(id.to_string(), "42");
        assert!("forty-two".parse::<CronId>().is_err());
    }

    #[test]
    fn test_cron_id_serializes_as_number() {
        let json = serde_json::to_string(&CronId::new(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_instance_ids_are_unique() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
        assert_eq!(InstanceId::new("replica-a").as_str(), "replica-a");
    }
}
