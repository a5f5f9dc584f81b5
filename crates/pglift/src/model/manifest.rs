//! Desired state of an instance and its satellite services.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::identifiers::check_identifier;
use super::{DatabaseManifest, Password, RoleManifest, ServiceKind};
use crate::conf::Value;
use crate::error::{Error, Result};
use crate::settings::AuthMethod;
use crate::version::Version;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    #[default]
    Started,
    Restarted,
    Absent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthManifest {
    #[serde(default)]
    pub local: Option<AuthMethod>,
    #[serde(default)]
    pub host: Option<AuthMethod>,
    #[serde(default)]
    pub hostssl: Option<AuthMethod>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandbyStatus {
    #[default]
    Demoted,
    Promoted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StandbyManifest {
    pub primary_conninfo: String,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<Password>,
    #[serde(default)]
    pub status: StandbyStatus,
}

// ============================================================================
// Satellite service manifests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatroniRestApi {
    #[serde(default = "default_restapi_listen")]
    pub listen: String,
    #[serde(default)]
    pub connect_address: Option<String>,
}

fn default_restapi_listen() -> String {
    "127.0.0.1:8008".to_string()
}

impl Default for PatroniRestApi {
    fn default() -> Self {
        Self {
            listen: default_restapi_listen(),
            connect_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatroniManifest {
    /// Cluster name, defaults to the instance name.
    #[serde(default)]
    pub cluster: Option<String>,
    /// Member name, defaults to `{hostname}-{qualname}`.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub restapi: PatroniRestApi,
    /// Host other members use to reach this node's PostgreSQL.
    #[serde(default)]
    pub postgresql_connect_host: Option<String>,
    #[serde(default, skip_serializing)]
    pub replication_password: Option<Password>,
    #[serde(default)]
    pub etcd_username: Option<String>,
    #[serde(default, skip_serializing)]
    pub etcd_password: Option<Password>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PgBackRestManifest {
    pub stanza: String,
    #[serde(default, skip_serializing)]
    pub password: Option<Password>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusManifest {
    #[serde(default = "default_exporter_port")]
    pub port: u16,
    #[serde(default, skip_serializing)]
    pub password: Option<Password>,
}

fn default_exporter_port() -> u16 {
    9187
}

impl Default for PrometheusManifest {
    fn default() -> Self {
        Self {
            port: default_exporter_port(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemboardManifest {
    #[serde(default = "default_temboard_port")]
    pub port: u16,
    #[serde(default, skip_serializing)]
    pub password: Option<Password>,
}

fn default_temboard_port() -> u16 {
    2345
}

impl Default for TemboardManifest {
    fn default() -> Self {
        Self {
            port: default_temboard_port(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowaManifest {
    #[serde(default, skip_serializing)]
    pub password: Option<Password>,
}

// ============================================================================
// Instance manifest
// ============================================================================

/// Desired state of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceManifest {
    pub name: String,
    /// Defaults to the site's default version.
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub state: InstanceState,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub auth: Option<AuthManifest>,
    #[serde(default, skip_serializing)]
    pub surole_password: Option<Password>,
    #[serde(default, skip_serializing)]
    pub replrole_password: Option<Password>,
    #[serde(default)]
    pub data_checksums: Option<bool>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub standby: Option<StandbyManifest>,
    /// Output only: a restart is needed for changes to take effect.
    #[serde(default)]
    pub pending_restart: bool,
    #[serde(default)]
    pub restart_on_changes: bool,
    #[serde(default)]
    pub databases: Vec<DatabaseManifest>,
    #[serde(default)]
    pub roles: Vec<RoleManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patroni: Option<PatroniManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<PgBackRestManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temboard: Option<TemboardManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powa: Option<PowaManifest>,
}

pub const DEFAULT_PORT: u16 = 5432;

impl InstanceManifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            port: None,
            state: InstanceState::default(),
            settings: BTreeMap::new(),
            auth: None,
            surole_password: None,
            replrole_password: None,
            data_checksums: None,
            locale: None,
            encoding: None,
            standby: None,
            pending_restart: false,
            restart_on_changes: false,
            databases: Vec::new(),
            roles: Vec::new(),
            patroni: None,
            pgbackrest: None,
            prometheus: None,
            temboard: None,
            powa: None,
        }
    }

    /// Parses and validates a manifest document (YAML or JSON).
    pub fn from_yaml(content: &str) -> Result<Self> {
        let manifest: InstanceManifest = serde_yaml::from_str(content)
            .map_err(|e| Error::Validation(format!("invalid instance manifest: {}", e)))?;
        manifest.validated()
    }

    /// Checks cross-field rules; promotes `settings.port` to `port`.
    pub fn validated(mut self) -> Result<Self> {
        check_identifier("instance", &self.name)?;

        if let Some(value) = self.settings.remove("port") {
            let port = value
                .as_int()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    Error::Validation(format!("invalid port value '{}' in settings", value))
                })?;
            match self.port {
                Some(existing) if existing != port => {
                    return Err(Error::Validation(format!(
                        "'port' field and settings.port ({}) mismatch ({})",
                        port, existing
                    )));
                }
                _ => self.port = Some(port),
            }
        }

        if self.standby.is_some() && self.patroni.is_some() {
            return Err(Error::Validation(
                "'standby' and 'patroni' are mutually exclusive".to_string(),
            ));
        }

        if let Some(value) = self.settings.get("log_directory") {
            if value.as_str().is_none() {
                return Err(Error::Validation(
                    "settings.log_directory must be a string".to_string(),
                ));
            }
        }

        if let Some(standby) = &self.standby {
            if let Some(slot) = &standby.slot {
                check_identifier("replication slot", slot)?;
            }
        }

        for role in &self.roles {
            role.validate()?;
        }
        for database in &self.databases {
            database.validate()?;
        }
        Ok(self)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Service kinds this manifest declares.
    pub fn service_kinds(&self) -> Vec<ServiceKind> {
        let mut kinds = Vec::new();
        if self.patroni.is_some() {
            kinds.push(ServiceKind::Patroni);
        }
        if self.pgbackrest.is_some() {
            kinds.push(ServiceKind::PgBackRest);
        }
        if self.prometheus.is_some() {
            kinds.push(ServiceKind::Prometheus);
        }
        if self.temboard.is_some() {
            kinds.push(ServiceKind::Temboard);
        }
        if self.powa.is_some() {
            kinds.push(ServiceKind::Powa);
        }
        kinds
    }
}
