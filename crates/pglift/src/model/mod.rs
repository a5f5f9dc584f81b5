//! Data shapes: manifests (desired state) and live entities.

pub mod database;
pub mod dump;
pub mod identifiers;
pub mod instance;
pub mod manifest;
pub mod role;
pub mod services;

use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

pub use database::{CloneSource, Database, DatabaseManifest};
pub use dump::DatabaseDump;
pub use instance::{BaseInstance, Instance, InstanceListItem, PostgreSQLInstance};
pub use manifest::{
    AuthManifest, InstanceManifest, InstanceState, PatroniManifest, PgBackRestManifest,
    PowaManifest, PrometheusManifest, StandbyManifest, StandbyStatus, TemboardManifest,
};
pub use role::{Role, RoleManifest};
pub use services::{SatelliteService, Service, ServiceKind};

/// An opaque password. Never compared, never displayed.
#[derive(Clone)]
pub struct Password(SecretString);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl PartialEq for Password {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Password::new)
    }
}

/// `present` / `absent`, for roles and databases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    #[default]
    Present,
    Absent,
}

/// Outcome of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    Created,
    Changed,
    Dropped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    /// `None` when nothing changed.
    pub change_state: Option<ChangeState>,
    pub pending_restart: bool,
}

impl ApplyResult {
    pub fn new(change_state: Option<ChangeState>) -> Self {
        Self {
            change_state,
            pending_restart: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_masked_and_ignored_in_equality() {
        let a = Password::new("s3cret");
        let b = Password::new("other");
        assert_eq!(format!("{:?}", a), "***");
        assert_eq!(a, b);
        assert_eq!(a.expose(), "s3cret");
    }

    #[test]
    fn test_password_deserialize() {
        let p: Password = serde_json::from_str("\"pw\"").unwrap();
        assert_eq!(p.expose(), "pw");
    }
}
