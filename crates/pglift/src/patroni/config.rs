//! Patroni YAML configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::conf::{Configuration, Value};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::model::{BaseInstance, InstanceManifest, PatroniManifest};
use crate::postgresql::render_hba;

/// Parameters Patroni derives from `postgresql.listen` instead.
const MANAGED_PARAMETERS: &[&str] = &["listen_addresses", "port"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub scope: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Log>,
    pub restapi: RestApi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd3: Option<Etcd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<Bootstrap>,
    pub postgresql: PostgreSQL,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestApi {
    pub listen: String,
    pub connect_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cafile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_client: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Etcd {
    pub hosts: Vec<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub dcs: Dcs,
    #[serde(default)]
    pub initdb: Vec<InitdbOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dcs {
    pub loop_wait: u32,
    pub postgresql: DcsPostgreSQL,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcsPostgreSQL {
    pub use_pg_rewind: bool,
}

/// An `initdb` option: either a flag (`data-checksums`) or `key: value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitdbOption {
    Flag(String),
    Value(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgreSQL {
    pub listen: String,
    pub connect_address: String,
    pub data_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub pgpass: PathBuf,
    #[serde(default)]
    pub use_unix_socket: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub pg_hba: Vec<String>,
    pub authentication: Authentication,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    pub superuser: User,
    pub replication: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Config {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| Error::Configuration {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Server parameters as a PostgreSQL configuration.
    pub fn parameters(&self) -> Configuration {
        self.postgresql
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Port PostgreSQL listens on, from `postgresql.listen`.
    pub fn port(&self) -> Option<u16> {
        self.postgresql
            .listen
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }

    /// Address of the REST API clients should use.
    pub fn api_address(&self) -> &str {
        &self.restapi.connect_address
    }
}

pub fn cluster_name(patroni: &PatroniManifest, instance: &BaseInstance) -> String {
    patroni.cluster.clone().unwrap_or_else(|| instance.name.clone())
}

pub fn node_name(patroni: &PatroniManifest, instance: &BaseInstance) -> String {
    patroni
        .node
        .clone()
        .unwrap_or_else(|| format!("{}-{}", crate::hostname(), instance.qualname()))
}

/// Patroni configuration for `manifest`, with `config` as server parameters.
pub fn build(
    ctx: &Context,
    manifest: &InstanceManifest,
    patroni: &PatroniManifest,
    config: &Configuration,
    instance: &BaseInstance,
) -> Result<Config> {
    let settings = ctx.settings();
    let site = settings
        .patroni
        .as_ref()
        .ok_or_else(|| Error::Unsupported("Patroni is not enabled in site settings".into()))?;
    let port = manifest.port();

    let listen_addresses = config
        .get("listen_addresses")
        .map(Value::as_plain)
        .unwrap_or_else(|| "*".to_string());
    let connect_host = patroni
        .postgresql_connect_host
        .clone()
        .unwrap_or_else(crate::hostname);

    let parameters = config
        .entries()
        .into_iter()
        .filter(|(name, _)| !MANAGED_PARAMETERS.contains(&name.as_str()))
        .collect();
    let pg_hba = render_hba(settings, manifest)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect();

    let mut initdb = Vec::new();
    let locale = manifest
        .locale
        .clone()
        .or_else(|| settings.postgresql.initdb.locale.clone());
    if let Some(locale) = locale {
        initdb.push(InitdbOption::Value(BTreeMap::from([("locale".to_string(), locale)])));
    }
    let encoding = manifest
        .encoding
        .clone()
        .or_else(|| settings.postgresql.initdb.encoding.clone());
    if let Some(encoding) = encoding {
        initdb.push(InitdbOption::Value(BTreeMap::from([(
            "encoding".to_string(),
            encoding,
        )])));
    }
    if manifest
        .data_checksums
        .or(settings.postgresql.initdb.data_checksums)
        .unwrap_or(false)
    {
        initdb.push(InitdbOption::Flag("data-checksums".to_string()));
    }

    let replication_password = patroni
        .replication_password
        .as_ref()
        .or(manifest.replrole_password.as_ref())
        .map(|p| p.expose().to_string());

    Ok(Config {
        scope: cluster_name(patroni, instance),
        name: node_name(patroni, instance),
        log: Some(Log {
            dir: site.logpath.join(instance.qualname()),
        }),
        restapi: RestApi {
            listen: patroni.restapi.listen.clone(),
            connect_address: patroni
                .restapi
                .connect_address
                .clone()
                .unwrap_or_else(|| patroni.restapi.listen.clone()),
            cafile: site.restapi.cafile.clone(),
            certfile: site.restapi.certfile.clone(),
            keyfile: site.restapi.keyfile.clone(),
            verify_client: site.restapi.verify_client.clone(),
        },
        etcd3: Some(Etcd {
            hosts: site.etcd.hosts.clone(),
            protocol: site.etcd.protocol.clone(),
            cacert: site.etcd.cacert.clone(),
            cert: site.etcd.cert.clone(),
            key: site.etcd.key.clone(),
            username: patroni.etcd_username.clone(),
            password: patroni.etcd_password.as_ref().map(|p| p.expose().to_string()),
        }),
        bootstrap: Some(Bootstrap {
            dcs: Dcs {
                loop_wait: site.loop_wait,
                postgresql: DcsPostgreSQL {
                    use_pg_rewind: site.postgresql.use_pg_rewind,
                },
            },
            initdb,
        }),
        postgresql: PostgreSQL {
            listen: format!("{}:{}", listen_addresses, port),
            connect_address: format!("{}:{}", connect_host, port),
            data_dir: instance.datadir(),
            bin_dir: instance.bindir()?,
            pgpass: instance.render(&site.postgresql.passfile),
            use_unix_socket: true,
            parameters,
            pg_hba,
            authentication: Authentication {
                superuser: User {
                    username: settings.postgresql.surole.name.clone(),
                    password: manifest
                        .surole_password
                        .as_ref()
                        .map(|p| p.expose().to_string()),
                },
                replication: User {
                    username: settings
                        .postgresql
                        .replrole
                        .clone()
                        .unwrap_or_else(|| "replication".to_string()),
                    password: replication_password,
                },
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Password;
    use crate::settings::{load_from_sources, SettingsSource};
    use crate::version::Version;
    use std::sync::Arc;

    fn context(dir: &Path) -> Context {
        let value = serde_json::json!({
            "prefix": dir.join("pfx"),
            "run_prefix": dir.join("run"),
            "postgresql": {
                "auth": {"passfile": null},
                "versions": [{"version": "16", "bindir": "/usr/lib/postgresql/16/bin"}],
            },
            "patroni": {"loop_wait": 5},
        });
        let settings = Arc::new(load_from_sources(&[SettingsSource::Value(value)]).unwrap());
        Context::builder(settings)
            .without_default_plugins()
            .build()
            .unwrap()
    }

    #[test]
    fn test_build() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let instance = BaseInstance::new("main", Version::new(16).unwrap(), ctx.settings_arc()).unwrap();
        let mut manifest = InstanceManifest::new("main");
        manifest.port = Some(5433);
        manifest.surole_password = Some(Password::new("su"));
        manifest.data_checksums = Some(true);
        let patroni = PatroniManifest {
            cluster: Some("pgcluster".into()),
            node: Some("node1".into()),
            postgresql_connect_host: Some("db1.example".into()),
            replication_password: Some(Password::new("repl")),
            ..Default::default()
        };
        let mut pgconf = Configuration::new();
        pgconf.set("listen_addresses", Value::Str("*".into()));
        pgconf.set("port", Value::Int(5433));
        pgconf.set("work_mem", Value::Str("8MB".into()));

        let config = build(&ctx, &manifest, &patroni, &pgconf, &instance).unwrap();
        assert_eq!(config.scope, "pgcluster");
        assert_eq!(config.name, "node1");
        assert_eq!(config.postgresql.listen, "*:5433");
        assert_eq!(config.postgresql.connect_address, "db1.example:5433");
        assert_eq!(config.port(), Some(5433));
        assert_eq!(config.api_address(), "127.0.0.1:8008");
        assert_eq!(
            config.postgresql.parameters.keys().collect::<Vec<_>>(),
            vec!["work_mem"]
        );
        assert!(config.postgresql.pg_hba.iter().all(|l| !l.starts_with('#')));
        assert_eq!(config.postgresql.authentication.replication.password.as_deref(), Some("repl"));
        let bootstrap = config.bootstrap.as_ref().unwrap();
        assert_eq!(bootstrap.dcs.loop_wait, 5);
        assert!(bootstrap
            .initdb
            .contains(&InitdbOption::Flag("data-checksums".into())));
        assert_eq!(
            config.log.as_ref().unwrap().dir.file_name().unwrap(),
            "16-main"
        );
    }

    #[test]
    fn test_yaml_round_trip_keeps_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let instance = BaseInstance::new("main", Version::new(16).unwrap(), ctx.settings_arc()).unwrap();
        let manifest = InstanceManifest::new("main");
        let mut pgconf = Configuration::new();
        pgconf.set("max_connections", Value::Int(100));
        pgconf.set("ssl", Value::Bool(true));
        let config = build(&ctx, &manifest, &PatroniManifest::default(), &pgconf, &instance).unwrap();

        let path = dir.path().join("patroni.yaml");
        std::fs::write(&path, config.to_yaml().unwrap()).unwrap();
        let read = Config::read(&path).unwrap();
        assert_eq!(read, config);
        assert_eq!(read.parameters().get("max_connections"), Some(&Value::Int(100)));
        assert!(read.name.ends_with("-16-main"));
        assert_eq!(read.scope, "main");
    }
}
