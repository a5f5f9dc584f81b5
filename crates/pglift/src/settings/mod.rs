//! Site settings: a frozen tree loaded once and shared as `Arc<Settings>`.

pub mod loader;
pub mod paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, SettingsError};
use crate::version::Version;

pub use loader::{load, load_from_sources, load_from_str, SettingsSource};
pub use paths::render_template;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Base directory for data, configuration and log files.
    #[serde(default = "default_prefix")]
    pub prefix: PathBuf,

    /// Base directory for runtime files (sockets, pid files, locks).
    #[serde(default = "default_run_prefix")]
    pub run_prefix: PathBuf,

    #[serde(default)]
    pub postgresql: PostgreSQLSettings,

    #[serde(default)]
    pub patroni: Option<PatroniSettings>,

    #[serde(default)]
    pub pgbackrest: Option<PgBackRestSettings>,

    #[serde(default)]
    pub prometheus: Option<PrometheusSettings>,

    #[serde(default)]
    pub powa: Option<PowaSettings>,

    #[serde(default)]
    pub temboard: Option<TemboardSettings>,

    #[serde(default)]
    pub systemd: Option<SystemdSettings>,

    #[serde(default)]
    pub service_manager: Option<ServiceManagerKind>,

    #[serde(default)]
    pub scheduler: Option<SchedulerKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManagerKind {
    Systemd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Systemd,
}

pub(crate) fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

fn default_prefix() -> PathBuf {
    if is_root() {
        return PathBuf::from("/");
    }
    dirs::data_dir()
        .map(|d| d.join("pglift"))
        .unwrap_or_else(|| std::env::temp_dir().join("pglift"))
}

fn default_run_prefix() -> PathBuf {
    if is_root() {
        return PathBuf::from("/run/pglift");
    }
    match dirs::runtime_dir() {
        Some(dir) => dir.join("pglift"),
        // SAFETY: getuid has no preconditions and cannot fail.
        None => std::env::temp_dir().join(format!("pglift-{}", unsafe { libc::getuid() })),
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgreSQLSettings {
    /// Default binary directory template, `{version}` is substituted.
    #[serde(default = "default_bindir")]
    pub bindir: Option<String>,

    /// Explicitly available versions; discovered from `bindir` when empty.
    #[serde(default)]
    pub versions: Vec<PostgreSQLVersionSettings>,

    #[serde(default)]
    pub default_version: Option<Version>,

    #[serde(default)]
    pub initdb: InitdbSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub surole: SuRole,

    #[serde(default = "default_replrole")]
    pub replrole: Option<String>,

    #[serde(default)]
    pub backuprole: BackupRole,

    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,

    #[serde(default = "default_waldir")]
    pub waldir: PathBuf,

    #[serde(default = "default_pg_logpath")]
    pub logpath: PathBuf,

    #[serde(default = "default_socket_directory")]
    pub socket_directory: PathBuf,

    #[serde(default = "default_dumps_directory")]
    pub dumps_directory: PathBuf,

    #[serde(default = "default_ssl_cert_directory")]
    pub ssl_cert_directory: PathBuf,

    #[serde(default = "default_dump_commands")]
    pub dump_commands: Vec<Vec<String>>,

    #[serde(default = "default_restore_commands")]
    pub restore_commands: Vec<Vec<String>>,

    /// Directory holding site templates overriding the bundled ones.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
}

impl Default for PostgreSQLSettings {
    fn default() -> Self {
        Self {
            bindir: default_bindir(),
            versions: Vec::new(),
            default_version: None,
            initdb: InitdbSettings::default(),
            auth: AuthSettings::default(),
            surole: SuRole::default(),
            replrole: default_replrole(),
            backuprole: BackupRole::default(),
            datadir: default_datadir(),
            waldir: default_waldir(),
            logpath: default_pg_logpath(),
            socket_directory: default_socket_directory(),
            dumps_directory: default_dumps_directory(),
            ssl_cert_directory: default_ssl_cert_directory(),
            dump_commands: default_dump_commands(),
            restore_commands: default_restore_commands(),
            templates_dir: None,
        }
    }
}

pub(crate) const DEFAULT_DATADIR: &str = "pgsql/{version}-{name}/data";
pub(crate) const DEFAULT_WALDIR: &str = "pgsql/{version}-{name}/wal";
pub(crate) const DEFAULT_PG_LOGPATH: &str = "postgresql";
pub(crate) const DEFAULT_SOCKET_DIRECTORY: &str = "postgresql";
pub(crate) const DEFAULT_DUMPS_DIRECTORY: &str = "dumps/{version}-{name}";
pub(crate) const DEFAULT_SSL_CERT_DIRECTORY: &str = "postgresql/ssl";

fn default_bindir() -> Option<String> {
    Some("/usr/lib/postgresql/{version}/bin".to_string())
}

fn default_replrole() -> Option<String> {
    Some("replication".to_string())
}

fn default_datadir() -> PathBuf {
    PathBuf::from(DEFAULT_DATADIR)
}

fn default_waldir() -> PathBuf {
    PathBuf::from(DEFAULT_WALDIR)
}

fn default_pg_logpath() -> PathBuf {
    PathBuf::from(DEFAULT_PG_LOGPATH)
}

fn default_socket_directory() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_DIRECTORY)
}

fn default_dumps_directory() -> PathBuf {
    PathBuf::from(DEFAULT_DUMPS_DIRECTORY)
}

fn default_ssl_cert_directory() -> PathBuf {
    PathBuf::from(DEFAULT_SSL_CERT_DIRECTORY)
}

fn default_dump_commands() -> Vec<Vec<String>> {
    vec![[
        "{bindir}/pg_dump",
        "-Fc",
        "-f",
        "{path}/{dbname}_{date}.dump",
        "-d",
        "{conninfo}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()]
}

fn default_restore_commands() -> Vec<Vec<String>> {
    vec![[
        "{bindir}/pg_restore",
        "-d",
        "{conninfo}",
        "{createoption}",
        "{path}/{dbname}_{date}.dump",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()]
}

impl PostgreSQLSettings {
    /// Versions available on this host, newest first.
    pub fn available_versions(&self) -> Vec<PostgreSQLVersionSettings> {
        if !self.versions.is_empty() {
            let mut versions = self.versions.clone();
            versions.sort_by(|a, b| b.version.cmp(&a.version));
            return versions;
        }
        let Some(template) = &self.bindir else {
            return Vec::new();
        };
        Version::all()
            .filter_map(|version| {
                let bindir = PathBuf::from(template.replace("{version}", &version.to_string()));
                bindir
                    .join("pg_ctl")
                    .exists()
                    .then_some(PostgreSQLVersionSettings { version, bindir })
            })
            .collect()
    }

    /// Binary directory for `version`, `InvalidVersion` when not installed.
    pub fn bindir(&self, version: Version) -> Result<PathBuf, Error> {
        self.available_versions()
            .into_iter()
            .find(|v| v.version == version)
            .map(|v| v.bindir)
            .ok_or_else(|| {
                Error::InvalidVersion(format!("PostgreSQL {} is not available", version))
            })
    }

    /// The configured default version, or the newest available one.
    pub fn default_version(&self) -> Result<Version, Error> {
        if let Some(version) = self.default_version {
            return Ok(version);
        }
        self.available_versions()
            .first()
            .map(|v| v.version)
            .ok_or_else(|| Error::InvalidVersion("no PostgreSQL version available".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgreSQLVersionSettings {
    pub version: Version,
    pub bindir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitdbSettings {
    #[serde(default = "default_locale")]
    pub locale: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: Option<String>,
    #[serde(default)]
    pub data_checksums: Option<bool>,
}

fn default_locale() -> Option<String> {
    Some("C".to_string())
}

fn default_encoding() -> Option<String> {
    Some("UTF8".to_string())
}

impl Default for InitdbSettings {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            encoding: default_encoding(),
            data_checksums: None,
        }
    }
}

/// Authentication methods accepted in `pg_hba.conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Trust,
    Reject,
    Md5,
    Password,
    #[serde(rename = "scram-sha-256")]
    ScramSha256,
    Gss,
    Sspi,
    Ident,
    Peer,
    Pam,
    Ldap,
    Radius,
    Cert,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Trust => "trust",
            AuthMethod::Reject => "reject",
            AuthMethod::Md5 => "md5",
            AuthMethod::Password => "password",
            AuthMethod::ScramSha256 => "scram-sha-256",
            AuthMethod::Gss => "gss",
            AuthMethod::Sspi => "sspi",
            AuthMethod::Ident => "ident",
            AuthMethod::Peer => "peer",
            AuthMethod::Pam => "pam",
            AuthMethod::Ldap => "ldap",
            AuthMethod::Radius => "radius",
            AuthMethod::Cert => "cert",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSettings {
    #[serde(default = "default_auth_method")]
    pub local: AuthMethod,
    #[serde(default = "default_auth_method")]
    pub host: AuthMethod,
    #[serde(default)]
    pub hostssl: Option<AuthMethod>,
    /// Password file maintained for managed roles; `None` disables it.
    #[serde(default = "default_passfile")]
    pub passfile: Option<PathBuf>,
    /// Command retrieving a role password, `{instance}` and `{role}` substituted.
    #[serde(default)]
    pub password_command: Vec<String>,
}

fn default_auth_method() -> AuthMethod {
    AuthMethod::Trust
}

fn default_passfile() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pgpass"))
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            local: default_auth_method(),
            host: default_auth_method(),
            hostssl: None,
            passfile: default_passfile(),
            password_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuRole {
    #[serde(default = "default_surole_name")]
    pub name: String,
    #[serde(default)]
    pub pgpass: bool,
}

fn default_surole_name() -> String {
    "postgres".to_string()
}

impl Default for SuRole {
    fn default() -> Self {
        Self {
            name: default_surole_name(),
            pgpass: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupRole {
    #[serde(default = "default_backuprole_name")]
    pub name: String,
    #[serde(default)]
    pub pgpass: bool,
}

fn default_backuprole_name() -> String {
    "backup".to_string()
}

impl Default for BackupRole {
    fn default() -> Self {
        Self {
            name: default_backuprole_name(),
            pgpass: false,
        }
    }
}

// ============================================================================
// Patroni
// ============================================================================

pub(crate) const DEFAULT_PATRONI_CONFIGPATH: &str = "patroni/{version}-{name}.yaml";
pub(crate) const DEFAULT_PATRONI_LOGPATH: &str = "patroni";
pub(crate) const DEFAULT_PATRONI_PID_FILE: &str = "patroni/{version}-{name}.pid";
pub(crate) const DEFAULT_PATRONI_PASSFILE: &str = "patroni/{version}-{name}.pgpass";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatroniSettings {
    #[serde(default = "default_patroni_execpath")]
    pub execpath: PathBuf,
    #[serde(default = "default_patroni_ctlpath")]
    pub ctlpath: PathBuf,
    #[serde(default = "default_patroni_configpath")]
    pub configpath: PathBuf,
    #[serde(default = "default_patroni_logpath")]
    pub logpath: PathBuf,
    #[serde(default = "default_patroni_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default)]
    pub etcd: EtcdSettings,
    #[serde(default)]
    pub restapi: RestApiSettings,
    #[serde(default)]
    pub postgresql: PatroniPostgreSQLSettings,
    #[serde(default = "default_loop_wait")]
    pub loop_wait: u32,
    #[serde(default = "default_true")]
    pub enforce_config_validation: bool,
}

fn default_patroni_execpath() -> PathBuf {
    PathBuf::from("/usr/bin/patroni")
}

fn default_patroni_ctlpath() -> PathBuf {
    PathBuf::from("/usr/bin/patronictl")
}

fn default_patroni_configpath() -> PathBuf {
    PathBuf::from(DEFAULT_PATRONI_CONFIGPATH)
}

fn default_patroni_logpath() -> PathBuf {
    PathBuf::from(DEFAULT_PATRONI_LOGPATH)
}

fn default_patroni_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PATRONI_PID_FILE)
}

fn default_loop_wait() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for PatroniSettings {
    fn default() -> Self {
        Self {
            execpath: default_patroni_execpath(),
            ctlpath: default_patroni_ctlpath(),
            configpath: default_patroni_configpath(),
            logpath: default_patroni_logpath(),
            pid_file: default_patroni_pid_file(),
            etcd: EtcdSettings::default(),
            restapi: RestApiSettings::default(),
            postgresql: PatroniPostgreSQLSettings::default(),
            loop_wait: default_loop_wait(),
            enforce_config_validation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EtcdSettings {
    #[serde(default = "default_etcd_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_etcd_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub cacert: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_etcd_hosts() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_etcd_protocol() -> String {
    "http".to_string()
}

impl Default for EtcdSettings {
    fn default() -> Self {
        Self {
            hosts: default_etcd_hosts(),
            protocol: default_etcd_protocol(),
            cacert: None,
            cert: None,
            key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestApiSettings {
    #[serde(default)]
    pub cafile: Option<PathBuf>,
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default)]
    pub verify_client: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatroniPostgreSQLSettings {
    #[serde(default = "default_patroni_passfile")]
    pub passfile: PathBuf,
    #[serde(default)]
    pub use_pg_rewind: bool,
}

fn default_patroni_passfile() -> PathBuf {
    PathBuf::from(DEFAULT_PATRONI_PASSFILE)
}

impl Default for PatroniPostgreSQLSettings {
    fn default() -> Self {
        Self {
            passfile: default_patroni_passfile(),
            use_pg_rewind: false,
        }
    }
}

// ============================================================================
// pgBackRest
// ============================================================================

pub(crate) const DEFAULT_PGBACKREST_CONFIGPATH: &str = "pgbackrest";
pub(crate) const DEFAULT_PGBACKREST_REPOSITORY: &str = "pgbackrest";
pub(crate) const DEFAULT_PGBACKREST_LOGPATH: &str = "pgbackrest";
pub(crate) const DEFAULT_PGBACKREST_SPOOLPATH: &str = "pgbackrest/spool";
pub(crate) const DEFAULT_PGBACKREST_LOCKPATH: &str = "pgbackrest/lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PgBackRestSettings {
    #[serde(default = "default_pgbackrest_execpath")]
    pub execpath: PathBuf,
    #[serde(default = "default_pgbackrest_configpath")]
    pub configpath: PathBuf,
    #[serde(default = "default_pgbackrest_repository")]
    pub repository: PathBuf,
    #[serde(default = "default_pgbackrest_logpath")]
    pub logpath: PathBuf,
    #[serde(default = "default_pgbackrest_spoolpath")]
    pub spoolpath: PathBuf,
    #[serde(default = "default_pgbackrest_lockpath")]
    pub lockpath: PathBuf,
    #[serde(default = "default_retention")]
    pub retention_full: u32,
}

fn default_pgbackrest_execpath() -> PathBuf {
    PathBuf::from("/usr/bin/pgbackrest")
}

fn default_pgbackrest_configpath() -> PathBuf {
    PathBuf::from(DEFAULT_PGBACKREST_CONFIGPATH)
}

fn default_pgbackrest_repository() -> PathBuf {
    PathBuf::from(DEFAULT_PGBACKREST_REPOSITORY)
}

fn default_pgbackrest_logpath() -> PathBuf {
    PathBuf::from(DEFAULT_PGBACKREST_LOGPATH)
}

fn default_pgbackrest_spoolpath() -> PathBuf {
    PathBuf::from(DEFAULT_PGBACKREST_SPOOLPATH)
}

fn default_pgbackrest_lockpath() -> PathBuf {
    PathBuf::from(DEFAULT_PGBACKREST_LOCKPATH)
}

fn default_retention() -> u32 {
    2
}

impl Default for PgBackRestSettings {
    fn default() -> Self {
        Self {
            execpath: default_pgbackrest_execpath(),
            configpath: default_pgbackrest_configpath(),
            repository: default_pgbackrest_repository(),
            logpath: default_pgbackrest_logpath(),
            spoolpath: default_pgbackrest_spoolpath(),
            lockpath: default_pgbackrest_lockpath(),
            retention_full: default_retention(),
        }
    }
}

// ============================================================================
// Prometheus postgres_exporter
// ============================================================================

pub(crate) const DEFAULT_PROMETHEUS_CONFIGPATH: &str =
    "prometheus/postgres_exporter-{version}-{name}.conf";
pub(crate) const DEFAULT_PROMETHEUS_PID_FILE: &str = "prometheus/{version}-{name}.pid";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusSettings {
    #[serde(default = "default_prometheus_execpath")]
    pub execpath: PathBuf,
    #[serde(default = "default_prometheus_role")]
    pub role: String,
    #[serde(default = "default_prometheus_configpath")]
    pub configpath: PathBuf,
    #[serde(default = "default_prometheus_pid_file")]
    pub pid_file: PathBuf,
}

fn default_prometheus_execpath() -> PathBuf {
    PathBuf::from("/usr/bin/prometheus-postgres-exporter")
}

fn default_prometheus_role() -> String {
    "prometheus".to_string()
}

fn default_prometheus_configpath() -> PathBuf {
    PathBuf::from(DEFAULT_PROMETHEUS_CONFIGPATH)
}

fn default_prometheus_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PROMETHEUS_PID_FILE)
}

impl Default for PrometheusSettings {
    fn default() -> Self {
        Self {
            execpath: default_prometheus_execpath(),
            role: default_prometheus_role(),
            configpath: default_prometheus_configpath(),
            pid_file: default_prometheus_pid_file(),
        }
    }
}

// ============================================================================
// PoWA
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowaSettings {
    #[serde(default = "default_powa_dbname")]
    pub dbname: String,
    #[serde(default = "default_powa_role")]
    pub role: String,
}

fn default_powa_dbname() -> String {
    "powa".to_string()
}

fn default_powa_role() -> String {
    "powa".to_string()
}

impl Default for PowaSettings {
    fn default() -> Self {
        Self {
            dbname: default_powa_dbname(),
            role: default_powa_role(),
        }
    }
}

// ============================================================================
// temBoard agent
// ============================================================================

pub(crate) const DEFAULT_TEMBOARD_CONFIGPATH: &str =
    "temboard-agent/temboard-agent_{version}-{name}.conf";
pub(crate) const DEFAULT_TEMBOARD_PID_FILE: &str = "temboard-agent/temboard-agent-{version}-{name}.pid";
pub(crate) const DEFAULT_TEMBOARD_LOGPATH: &str = "temboard";
pub(crate) const DEFAULT_TEMBOARD_HOME: &str = "temboard-agent/{version}-{name}";
pub(crate) const DEFAULT_TEMBOARD_SIGNING_KEY: &str = "temboard-agent/signing-public.pem";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemboardSettings {
    #[serde(default = "default_temboard_execpath")]
    pub execpath: PathBuf,
    #[serde(default = "default_temboard_role")]
    pub role: String,
    #[serde(default = "default_temboard_configpath")]
    pub configpath: PathBuf,
    #[serde(default = "default_temboard_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_temboard_logpath")]
    pub logpath: PathBuf,
    #[serde(default = "default_temboard_home")]
    pub home: PathBuf,
    #[serde(default = "default_temboard_signing_key")]
    pub signing_key: PathBuf,
    #[serde(default = "default_temboard_ui_url")]
    pub ui_url: String,
    #[serde(default)]
    pub certificate: Option<TemboardCertificate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemboardCertificate {
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_temboard_execpath() -> PathBuf {
    PathBuf::from("/usr/bin/temboard-agent")
}

fn default_temboard_role() -> String {
    "temboardagent".to_string()
}

fn default_temboard_configpath() -> PathBuf {
    PathBuf::from(DEFAULT_TEMBOARD_CONFIGPATH)
}

fn default_temboard_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_TEMBOARD_PID_FILE)
}

fn default_temboard_logpath() -> PathBuf {
    PathBuf::from(DEFAULT_TEMBOARD_LOGPATH)
}

fn default_temboard_home() -> PathBuf {
    PathBuf::from(DEFAULT_TEMBOARD_HOME)
}

fn default_temboard_signing_key() -> PathBuf {
    PathBuf::from(DEFAULT_TEMBOARD_SIGNING_KEY)
}

fn default_temboard_ui_url() -> String {
    "https://0.0.0.0:8888".to_string()
}

impl Default for TemboardSettings {
    fn default() -> Self {
        Self {
            execpath: default_temboard_execpath(),
            role: default_temboard_role(),
            configpath: default_temboard_configpath(),
            pid_file: default_temboard_pid_file(),
            logpath: default_temboard_logpath(),
            home: default_temboard_home(),
            signing_key: default_temboard_signing_key(),
            ui_url: default_temboard_ui_url(),
            certificate: None,
        }
    }
}

// ============================================================================
// systemd
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemdSettings {
    #[serde(default = "default_unit_path")]
    pub unit_path: PathBuf,
    #[serde(default = "default_systemd_user")]
    pub user: bool,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default = "default_systemctl")]
    pub systemctl: PathBuf,
}

fn default_unit_path() -> PathBuf {
    if is_root() {
        return PathBuf::from("/etc/systemd/system");
    }
    dirs::data_dir()
        .map(|d| d.join("systemd").join("user"))
        .unwrap_or_else(|| PathBuf::from("/etc/systemd/user"))
}

fn default_systemd_user() -> bool {
    !is_root()
}

fn default_systemctl() -> PathBuf {
    PathBuf::from("/usr/bin/systemctl")
}

impl Default for SystemdSettings {
    fn default() -> Self {
        Self {
            unit_path: default_unit_path(),
            user: default_systemd_user(),
            sudo: false,
            systemctl: default_systemctl(),
        }
    }
}

impl Settings {
    /// Cross-field rules that serde cannot express.
    pub(crate) fn validate(&self) -> Result<(), SettingsError> {
        for (field, prefix) in [("prefix", &self.prefix), ("run_prefix", &self.run_prefix)] {
            if !prefix.is_absolute() {
                return Err(SettingsError::invalid(field, "must be an absolute path"));
            }
        }

        if let Some(systemd) = &self.systemd {
            if systemd.user && systemd.sudo {
                return Err(SettingsError::invalid(
                    "systemd.sudo",
                    "cannot be used with systemd.user",
                ));
            }
        }

        if self.service_manager == Some(ServiceManagerKind::Systemd) && self.systemd.is_none() {
            return Err(SettingsError::invalid(
                "service_manager",
                "systemd settings are required when service_manager is 'systemd'",
            ));
        }
        if self.scheduler == Some(SchedulerKind::Systemd) && self.systemd.is_none() {
            return Err(SettingsError::invalid(
                "scheduler",
                "systemd settings are required when scheduler is 'systemd'",
            ));
        }

        if let Some(passfile) = &self.postgresql.auth.passfile {
            if !passfile.is_absolute() {
                return Err(SettingsError::invalid(
                    "postgresql.auth.passfile",
                    "must be an absolute path",
                ));
            }
        }

        if let Some(version) = self.postgresql.default_version {
            if !self.postgresql.versions.is_empty()
                && !self.postgresql.versions.iter().any(|v| v.version == version)
            {
                return Err(SettingsError::invalid(
                    "postgresql.default_version",
                    format!("version {} is not among configured versions", version),
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for v in &self.postgresql.versions {
            if !seen.insert(v.version) {
                return Err(SettingsError::invalid(
                    "postgresql.versions",
                    format!("duplicate entry for version {}", v.version),
                ));
            }
        }

        Ok(())
    }

    /// Site templates directory, defaulting to `{config_dir}/pglift/postgresql`.
    pub fn templates_dir(&self) -> Option<PathBuf> {
        self.postgresql.templates_dir.clone().or_else(|| {
            if is_root() {
                Some(Path::new("/etc/pglift/postgresql").to_path_buf())
            } else {
                dirs::config_dir().map(|d| d.join("pglift").join("postgresql"))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_names_match_pg_hba() {
        for method in [AuthMethod::ScramSha256, AuthMethod::Md5, AuthMethod::Peer] {
            let json = serde_json::to_value(method).unwrap();
            assert_eq!(json, serde_json::Value::from(method.as_str()));
            let back: AuthMethod = serde_json::from_value(json).unwrap();
            assert_eq!(back, method);
        }
        let auth: AuthSettings =
            serde_yaml::from_str("local: scram-sha-256\nhost: scram-sha-256\n").unwrap();
        assert_eq!(auth.local, AuthMethod::ScramSha256);
        assert_eq!(auth.host, AuthMethod::ScramSha256);
    }
}
