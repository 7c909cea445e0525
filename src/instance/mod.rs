pub mod allocator;
pub mod filesystem;
pub mod gateway_config;
pub mod jsonc;
pub mod manifest;
pub mod orchestrator;
pub mod pairing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FleetError, Result};

/// Last known runtime outcome of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Created,
    Running,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(InstanceStatus::Created),
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "error" => Ok(InstanceStatus::Error),
            other => Err(FleetError::InvalidInput(format!(
                "unknown instance status '{}'",
                other
            ))),
        }
    }
}

/// One registered gateway container. `port` is the pair base: the instance
/// owns both `port` (gateway) and `port + 1` (bridge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(id: &str, name: &str, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            port,
            status: InstanceStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn bridge_port(&self) -> u16 {
        self.port + 1
    }
}

const MAX_ID_LEN: usize = 50;
const MAX_NAME_LEN: usize = 100;
const MAX_PASSWORD_LEN: usize = 200;

/// Instance ids double as compose service keys, container name suffixes and
/// directory names, so they are restricted to `[A-Za-z0-9_-]`.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(FleetError::InvalidInput(format!(
            "instance id must be 1-{} characters",
            MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(FleetError::InvalidInput(format!(
            "instance id '{}' may only contain letters, digits, '-' and '_'",
            id
        )));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if name.trim().is_empty() || len > MAX_NAME_LEN {
        return Err(FleetError::InvalidInput(format!(
            "instance name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if len == 0 || len > MAX_PASSWORD_LEN {
        return Err(FleetError::InvalidInput(format!(
            "password must be 1-{} characters",
            MAX_PASSWORD_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            InstanceStatus::Created,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn instances_sort_by_id_then_status() {
        let mut rows = vec![
            ("b2".to_string(), InstanceStatus::Stopped),
            ("a1".to_string(), InstanceStatus::Running),
            ("a1".to_string(), InstanceStatus::Created),
        ];
        rows.sort();
        assert_eq!(rows[0], ("a1".to_string(), InstanceStatus::Created));
        assert_eq!(rows[1], ("a1".to_string(), InstanceStatus::Running));
        assert_eq!(rows[2].0, "b2");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&InstanceStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn new_instance_starts_created() {
        let inst = Instance::new("a1", "Agent One", 18789);
        assert_eq!(inst.status, InstanceStatus::Created);
        assert_eq!(inst.bridge_port(), 18790);
        assert_eq!(inst.created_at, inst.updated_at);
    }

    #[test]
    fn id_validation() {
        assert!(validate_id("a1").is_ok());
        assert!(validate_id("12345").is_ok());
        assert!(validate_id("team_a-01").is_ok());
        assert_eq!(validate_id("").unwrap_err().kind(), ErrorKind::InvalidInput);
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id(&"x".repeat(51)).is_err());
    }

    #[test]
    fn name_and_password_validation() {
        assert!(validate_name("Agent One").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"n".repeat(101)).is_err());
        assert!(validate_password("s3cret").is_ok());
        assert!(validate_password("").is_err());
    }
}
