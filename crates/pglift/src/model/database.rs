use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::identifiers::check_identifier;
use super::PresenceState;
use crate::conf::Value;
use crate::error::{Error, Result};

/// Where to copy a new database from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneSource {
    /// libpq connection string of the source database.
    pub dsn: String,
    #[serde(default)]
    pub schema_only: bool,
}

/// Desired state of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseManifest {
    pub name: String,
    #[serde(default)]
    pub state: PresenceState,
    #[serde(default)]
    pub owner: Option<String>,
    /// `None` leaves settings untouched, an empty map resets them all and a
    /// `null` value resets one parameter.
    #[serde(default)]
    pub settings: Option<BTreeMap<String, Option<Value>>>,
    /// `None` leaves extensions untouched.
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub schemas: Option<Vec<String>>,
    /// Only used when the database gets created.
    #[serde(default, skip_serializing)]
    pub clone_from: Option<CloneSource>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_drop: bool,
}

impl DatabaseManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: PresenceState::Present,
            owner: None,
            settings: None,
            extensions: None,
            schemas: None,
            clone_from: None,
            force_drop: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_identifier("database", &self.name)?;
        if self.force_drop && self.state != PresenceState::Absent {
            return Err(Error::Validation(format!(
                "database {}: 'force_drop' can only be used with state 'absent'",
                self.name
            )));
        }
        if let Some(owner) = &self.owner {
            check_identifier("role", owner)?;
        }
        for name in self.extensions.iter().flatten() {
            check_identifier("extension", name)?;
        }
        for name in self.schemas.iter().flatten() {
            check_identifier("schema", name)?;
        }
        Ok(())
    }
}

/// A database as found in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_null_vs_absent() {
        let db: DatabaseManifest = serde_json::from_str(r#"{"name": "app"}"#).unwrap();
        assert!(db.settings.is_none());
        assert!(db.extensions.is_none());

        let db: DatabaseManifest = serde_json::from_str(
            r#"{"name": "app", "settings": {"work_mem": "4MB", "jit": null}, "extensions": []}"#,
        )
        .unwrap();
        let settings = db.settings.unwrap();
        assert_eq!(settings["work_mem"], Some(Value::Str("4MB".into())));
        assert_eq!(settings["jit"], None);
        assert_eq!(db.extensions, Some(vec![]));
    }

    #[test]
    fn test_force_drop_requires_absent() {
        let mut db = DatabaseManifest::new("app");
        db.force_drop = true;
        assert!(db.validate().is_err());
        db.state = PresenceState::Absent;
        assert!(db.validate().is_ok());
    }

    #[test]
    fn test_reserved_name_rejected() {
        assert!(DatabaseManifest::new("table").validate().is_err());
    }
}
