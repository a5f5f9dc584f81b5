use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifiers::check_identifier;
use super::{Password, PresenceState};
use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

/// Desired state of a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleManifest {
    pub name: String,
    #[serde(default)]
    pub state: PresenceState,
    #[serde(default, skip_serializing)]
    pub password: Option<Password>,
    /// Keep a line for this role in the password file.
    #[serde(default)]
    pub pgpass: bool,
    #[serde(default = "default_true")]
    pub inherit: bool,
    #[serde(default)]
    pub login: bool,
    #[serde(default)]
    pub superuser: bool,
    #[serde(default)]
    pub replication: bool,
    #[serde(default)]
    pub connection_limit: Option<i32>,
    #[serde(default)]
    pub validity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_owned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reassign_owned: Option<String>,
}

impl RoleManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: PresenceState::Present,
            password: None,
            pgpass: false,
            inherit: true,
            login: false,
            superuser: false,
            replication: false,
            connection_limit: None,
            validity: None,
            in_roles: Vec::new(),
            drop_owned: None,
            reassign_owned: None,
        }
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        check_identifier("role", &self.name)?;
        if self.drop_owned.unwrap_or(false) && self.reassign_owned.is_some() {
            return Err(Error::Validation(format!(
                "role {}: 'drop_owned' and 'reassign_owned' are mutually exclusive",
                self.name
            )));
        }
        if self.state != PresenceState::Absent
            && (self.drop_owned.is_some() || self.reassign_owned.is_some())
        {
            return Err(Error::Validation(format!(
                "role {}: 'drop_owned' and 'reassign_owned' are only allowed with state 'absent'",
                self.name
            )));
        }
        if let Some(target) = &self.reassign_owned {
            check_identifier("role", target)?;
        }
        for parent in &self.in_roles {
            check_identifier("role", parent)?;
        }
        Ok(())
    }
}

/// A role as found in `pg_roles`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub has_password: bool,
    pub inherit: bool,
    pub login: bool,
    pub superuser: bool,
    pub replication: bool,
    pub connection_limit: Option<i32>,
    pub validity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_roles: Vec<String>,
    #[serde(default)]
    pub pgpass: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let role: RoleManifest = serde_json::from_str(r#"{"name": "alice"}"#).unwrap();
        assert_eq!(role.state, PresenceState::Present);
        assert!(role.inherit);
        assert!(!role.login);
        assert!(!role.has_password());
        assert!(role.validate().is_ok());
    }

    #[test]
    fn test_drop_owned_requires_absent() {
        let role: RoleManifest =
            serde_json::from_str(r#"{"name": "bob", "drop_owned": true}"#).unwrap();
        assert!(role.validate().is_err());
        let role: RoleManifest =
            serde_json::from_str(r#"{"name": "bob", "state": "absent", "drop_owned": true}"#)
                .unwrap();
        assert!(role.validate().is_ok());
    }

    #[test]
    fn test_drop_and_reassign_exclusive() {
        let role: RoleManifest = serde_json::from_str(
            r#"{"name": "bob", "state": "absent", "drop_owned": true, "reassign_owned": "alice"}"#,
        )
        .unwrap();
        assert!(role.validate().is_err());
    }

    #[test]
    fn test_password_not_serialized() {
        let role: RoleManifest =
            serde_json::from_str(r#"{"name": "bob", "password": "pw"}"#).unwrap();
        assert!(role.has_password());
        let json = serde_json::to_string(&role).unwrap();
        assert!(!json.contains("pw\""));
        assert!(!json.contains("password"));
    }
}
