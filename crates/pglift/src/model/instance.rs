use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::identifiers::check_identifier;
use super::manifest::DEFAULT_PORT;
use super::services::{SatelliteService, Service};
use crate::conf::Configuration;
use crate::error::{Error, Result};
use crate::postgresql::ctl;
use crate::settings::{render_template, Settings};
use crate::version::Version;

/// An instance identity and the paths derived from it. It may not exist yet.
#[derive(Debug, Clone)]
pub struct BaseInstance {
    pub name: String,
    pub version: Version,
    settings: Arc<Settings>,
}

impl PartialEq for BaseInstance {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl BaseInstance {
    pub fn new(name: &str, version: Version, settings: Arc<Settings>) -> Result<Self> {
        check_identifier("instance", name)?;
        Ok(Self {
            name: name.to_string(),
            version,
            settings,
        })
    }

    /// `{version}-{name}`, used in unit names and file names.
    pub fn qualname(&self) -> String {
        format!("{}-{}", self.version, self.name)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn settings_arc(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Expands `{name}` and `{version}` in a settings path.
    pub fn render(&self, path: &Path) -> PathBuf {
        render_template(path, &self.name, &self.version.to_string())
    }

    pub fn datadir(&self) -> PathBuf {
        self.render(&self.settings.postgresql.datadir)
    }

    pub fn waldir(&self) -> PathBuf {
        self.render(&self.settings.postgresql.waldir)
    }

    pub fn dumps_directory(&self) -> PathBuf {
        self.render(&self.settings.postgresql.dumps_directory)
    }

    pub fn logdir(&self) -> PathBuf {
        self.render(&self.settings.postgresql.logpath)
    }

    pub fn ssl_cert_directory(&self) -> PathBuf {
        self.render(&self.settings.postgresql.ssl_cert_directory)
    }

    pub fn bindir(&self) -> Result<PathBuf> {
        self.settings.postgresql.bindir(self.version)
    }

    /// Path of a PostgreSQL program for this instance's version.
    pub fn bin(&self, program: &str) -> Result<PathBuf> {
        Ok(self.bindir()?.join(program))
    }

    pub fn psqlrc(&self) -> PathBuf {
        self.datadir().join(".psqlrc")
    }

    /// Whether the data directory exists and holds this version.
    pub fn exists(&self) -> Result<bool> {
        let pg_version = self.datadir().join("PG_VERSION");
        let content = match std::fs::read_to_string(&pg_version) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(pg_version, e)),
        };
        let found = content.trim();
        if found != self.version.to_string() {
            return Err(Error::InvalidVersion(format!(
                "version mismatch for instance {}: datadir holds {}",
                self.qualname(),
                found
            )));
        }
        Ok(true)
    }

    /// Whether recovery is configured in the data directory.
    pub fn is_standby(&self) -> bool {
        let datadir = self.datadir();
        if self.version.major() >= 12 {
            datadir.join("standby.signal").exists()
        } else {
            datadir.join("recovery.conf").exists()
        }
    }
}

impl std::fmt::Display for BaseInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qualname())
    }
}

/// An existing PostgreSQL instance with its parsed configuration.
#[derive(Debug, Clone)]
pub struct PostgreSQLInstance {
    base: BaseInstance,
    config: Configuration,
}

impl PostgreSQLInstance {
    /// Loads an existing instance, `InstanceNotFound` if absent.
    pub fn system_lookup(base: BaseInstance) -> Result<Self> {
        if !base.exists()? {
            return Err(Error::InstanceNotFound(base.qualname()));
        }
        let config = ctl::read_config(&base.datadir(), false)?;
        Ok(Self { base, config })
    }

    pub fn base(&self) -> &BaseInstance {
        &self.base
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config
            .get("port")
            .and_then(|v| v.as_int())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// First directory of `unix_socket_directories`, else the site default.
    pub fn socket_directory(&self) -> PathBuf {
        self.config
            .get("unix_socket_directories")
            .map(|v| v.as_plain())
            .and_then(|v| {
                v.split(',')
                    .map(str::trim)
                    .find(|d| !d.is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(|| self.base.render(&self.base.settings().postgresql.socket_directory))
    }

    /// Re-reads the configuration from disk.
    pub fn reload_config(&mut self) -> Result<()> {
        self.config = ctl::read_config(&self.base.datadir(), false)?;
        Ok(())
    }
}

impl Deref for PostgreSQLInstance {
    type Target = BaseInstance;

    fn deref(&self) -> &BaseInstance {
        &self.base
    }
}

/// A PostgreSQL instance with its satellite services.
#[derive(Debug, Clone)]
pub struct Instance {
    pub postgresql: PostgreSQLInstance,
    pub services: Vec<Service>,
}

impl Instance {
    pub fn new(postgresql: PostgreSQLInstance, services: Vec<Service>) -> Result<Self> {
        let mut kinds: Vec<_> = services.iter().map(Service::kind).collect();
        kinds.sort();
        if kinds.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::Validation(format!(
                "instance {} has duplicate satellite services",
                postgresql.qualname()
            )));
        }
        Ok(Self {
            postgresql,
            services,
        })
    }

    /// The one service of kind `T` attached to this instance.
    pub fn service<T: SatelliteService>(&self) -> Result<&T> {
        self.services
            .iter()
            .find_map(T::downcast)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "instance {} has no {} service",
                    self.postgresql.qualname(),
                    T::KIND
                ))
            })
    }
}

impl Deref for Instance {
    type Target = PostgreSQLInstance;

    fn deref(&self) -> &PostgreSQLInstance {
        &self.postgresql
    }
}

/// Status summary used in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceListItem {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub datadir: PathBuf,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::services::{Powa, Service};

    fn settings(dir: &Path) -> Arc<Settings> {
        let value = serde_json::json!({
            "prefix": dir.join("pfx"),
            "run_prefix": dir.join("run"),
        });
        Arc::new(
            crate::settings::load_from_sources(&[crate::settings::SettingsSource::Value(value)])
                .unwrap(),
        )
    }

    #[test]
    fn test_paths() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseInstance::new("t1", Version::new(15).unwrap(), settings(dir.path())).unwrap();
        assert_eq!(base.qualname(), "15-t1");
        assert_eq!(base.datadir(), dir.path().join("pfx/srv/pgsql/15-t1/data"));
        assert_eq!(base.waldir(), dir.path().join("pfx/srv/pgsql/15-t1/wal"));
        assert_eq!(base.dumps_directory(), dir.path().join("pfx/srv/dumps/15-t1"));
    }

    #[test]
    fn test_exists_and_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseInstance::new("t1", Version::new(15).unwrap(), settings(dir.path())).unwrap();
        assert!(!base.exists().unwrap());
        std::fs::create_dir_all(base.datadir()).unwrap();
        std::fs::write(base.datadir().join("PG_VERSION"), "15\n").unwrap();
        assert!(base.exists().unwrap());
        std::fs::write(base.datadir().join("PG_VERSION"), "14\n").unwrap();
        assert!(matches!(base.exists(), Err(Error::InvalidVersion(_))));
    }

    #[test]
    fn test_lookup_reads_port_and_standby() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseInstance::new("t1", Version::new(15).unwrap(), settings(dir.path())).unwrap();
        assert!(matches!(
            PostgreSQLInstance::system_lookup(base.clone()),
            Err(Error::InstanceNotFound(_))
        ));
        let datadir = base.datadir();
        std::fs::create_dir_all(&datadir).unwrap();
        std::fs::write(datadir.join("PG_VERSION"), "15\n").unwrap();
        std::fs::write(datadir.join("postgresql.conf"), "port = 5501\n").unwrap();
        let instance = PostgreSQLInstance::system_lookup(base).unwrap();
        assert_eq!(instance.port(), 5501);
        assert!(!instance.is_standby());
        std::fs::write(datadir.join("standby.signal"), "").unwrap();
        assert!(instance.is_standby());
    }

    #[test]
    fn test_service_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseInstance::new("t1", Version::new(15).unwrap(), settings(dir.path())).unwrap();
        std::fs::create_dir_all(base.datadir()).unwrap();
        std::fs::write(base.datadir().join("PG_VERSION"), "15").unwrap();
        std::fs::write(base.datadir().join("postgresql.conf"), "").unwrap();
        let pg = PostgreSQLInstance::system_lookup(base).unwrap();
        let powa = Service::Powa(Powa {
            dbname: "powa".into(),
        });
        let instance = Instance::new(pg.clone(), vec![powa.clone()]).unwrap();
        assert_eq!(instance.service::<Powa>().unwrap().dbname, "powa");
        assert!(instance
            .service::<crate::model::services::PgBackRest>()
            .is_err());
        assert!(Instance::new(pg, vec![powa.clone(), powa]).is_err());
    }
}
