//! pgBackRest plugin: WAL archiving and physical backups of instances.
//!
//! Each instance gets a stanza whose definition lives in
//! `{configpath}/conf.d/{stanza}.conf`; repository and log locations are
//! shared through `{configpath}/pgbackrest.conf`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cmd::Cmd;
use crate::conf::{ChangeSet, Configuration, Value};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::{Hook, Plugin};
use crate::ini::Ini;
use crate::instances;
use crate::model::services::PgBackRest;
use crate::model::{
    BaseInstance, Instance, InstanceManifest, PostgreSQLInstance, RoleManifest, Service,
    ServiceKind, StandbyStatus,
};
use crate::passfile::libpq_environ;
use crate::postgresql::ctl;
use crate::settings::PgBackRestSettings;

fn site(ctx: &Context) -> Result<&PgBackRestSettings> {
    ctx.settings()
        .pgbackrest
        .as_ref()
        .ok_or_else(|| Error::Unsupported("pgBackRest is not enabled in site settings".into()))
}

pub fn global_config_path(settings: &PgBackRestSettings) -> PathBuf {
    settings.configpath.join("pgbackrest.conf")
}

pub fn stanza_config_path(settings: &PgBackRestSettings, stanza: &str) -> PathBuf {
    settings.configpath.join("conf.d").join(format!("{}.conf", stanza))
}

/// `pgbackrest --config-path=… --stanza=…`
fn command(settings: &PgBackRestSettings, stanza: &str) -> Cmd {
    Cmd::new(&settings.execpath)
        .arg(format!("--config-path={}", settings.configpath.display()))
        .arg(format!("--stanza={}", stanza))
}

fn global_config(settings: &PgBackRestSettings) -> Ini {
    let mut ini = Ini::new();
    ini.set("global", "repo1-path", settings.repository.to_string_lossy());
    ini.set(
        "global",
        "repo1-retention-full",
        settings.retention_full.to_string(),
    );
    ini.set("global", "log-path", settings.logpath.to_string_lossy());
    ini.set("global", "spool-path", settings.spoolpath.to_string_lossy());
    ini.set("global", "lock-path", settings.lockpath.to_string_lossy());
    ini.set("global", "start-fast", "y");
    ini.set("global", "archive-async", "y");
    ini
}

fn stanza_config(ctx: &Context, stanza: &str, manifest: &InstanceManifest, instance: &BaseInstance) -> Ini {
    let settings = ctx.settings();
    let mut ini = Ini::new();
    ini.set(stanza, "pg1-path", instance.datadir().to_string_lossy());
    ini.set(stanza, "pg1-port", manifest.port().to_string());
    ini.set(
        stanza,
        "pg1-socket-path",
        instance
            .render(&settings.postgresql.socket_directory)
            .to_string_lossy(),
    );
    ini.set(stanza, "pg1-user", settings.postgresql.backuprole.name.clone());
    ini
}

fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    match fs::read_to_string(path) {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(path, e)),
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| Error::io(path, e))?;
    Ok(true)
}

/// Settings PostgreSQL needs to archive WAL into the stanza.
fn archive_settings(settings: &PgBackRestSettings, stanza: &str) -> Configuration {
    let archive_command = format!(
        "{} archive-push %p",
        command(settings, stanza).argv().join(" ")
    );
    [
        ("archive_mode".to_string(), Value::Bool(true)),
        ("archive_command".to_string(), Value::Str(archive_command)),
        ("wal_level".to_string(), Value::Str("replica".to_string())),
    ]
    .into_iter()
    .collect()
}

/// Creates (or upgrades) the stanza, with the instance running.
fn init_stanza(
    ctx: &Context,
    settings: &PgBackRestSettings,
    stanza: &str,
    instance: &BaseInstance,
    upgrading: bool,
) -> Result<()> {
    let postgresql = PostgreSQLInstance::system_lookup(instance.clone())?;
    let _running = instances::running(ctx, &postgresql)?;
    let surole = &ctx.settings().postgresql.surole.name;
    let env = libpq_environ(ctx, instance, surole, BTreeMap::new())?;
    let action = if upgrading { "stanza-upgrade" } else { "stanza-create" };
    log::info!("pgBackRest {} for stanza '{}'", action, stanza);
    ctx.run(
        &command(settings, stanza)
            .arg(format!("--pg1-user={}", surole))
            .arg(action)
            .envs(&env),
    )?;
    ctx.run(
        &command(settings, stanza)
            .arg(format!("--pg1-user={}", surole))
            .arg("check")
            .envs(&env),
    )?;
    Ok(())
}

fn setup(
    ctx: &Context,
    manifest: &InstanceManifest,
    stanza: &str,
    instance: &BaseInstance,
    upgrading: bool,
) -> Result<()> {
    let settings = site(ctx)?;
    for dir in [&settings.repository, &settings.logpath, &settings.spoolpath, &settings.lockpath] {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }
    write_if_changed(&global_config_path(settings), &global_config(settings).render())?;
    let path = stanza_config_path(settings, stanza);
    let first = !path.exists();
    if write_if_changed(&path, &stanza_config(ctx, stanza, manifest, instance).render())? {
        log::info!("configured pgBackRest stanza '{}' for {}", stanza, instance);
    }
    let is_standby = manifest
        .standby
        .as_ref()
        .is_some_and(|s| s.status == StandbyStatus::Demoted);
    // Upgraded stanzas are handled once pg_upgrade ran.
    if first && !upgrading && !is_standby {
        init_stanza(ctx, settings, stanza, instance, false)?;
    }
    Ok(())
}

/// Finds the stanza whose `pg1-path` is the instance data directory.
fn lookup(settings: &PgBackRestSettings, instance: &BaseInstance) -> Result<Option<PgBackRest>> {
    let pattern = settings.configpath.join("conf.d").join("*.conf");
    let paths = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| Error::Validation(format!("invalid pgBackRest config path: {}", e)))?;
    let datadir = instance.datadir();
    for path in paths.flatten() {
        let ini = Ini::read(&path)?;
        let stanza = ini
            .section_names()
            .find(|s| ini.get(s, "pg1-path").map(Path::new) == Some(datadir.as_path()));
        if let Some(stanza) = stanza {
            return Ok(Some(PgBackRest {
                stanza: stanza.to_string(),
                configpath: path.clone(),
            }));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
    Incr,
    Diff,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupType::Full => "full",
            BackupType::Incr => "incr",
            BackupType::Diff => "diff",
        })
    }
}

/// Takes a backup of a running instance.
pub fn backup(ctx: &Context, instance: &Instance, backup_type: BackupType) -> Result<()> {
    let settings = site(ctx)?;
    let service = instance.service::<PgBackRest>()?;
    if !ctl::is_running(instance)? {
        return Err(Error::InstanceState(format!(
            "cannot back up {}: instance is not running",
            instance.base()
        )));
    }
    let backuprole = &ctx.settings().postgresql.backuprole.name;
    let env = libpq_environ(ctx, instance, backuprole, BTreeMap::new())?;
    log::info!(
        "backing up instance {} with pgBackRest ({})",
        instance.base(),
        backup_type
    );
    ctx.run(
        &command(settings, &service.stanza)
            .arg(format!("--type={}", backup_type))
            .arg("backup")
            .envs(&env),
    )?;
    Ok(())
}

/// A backup in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub label: String,
    pub backup_type: BackupType,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub size: u64,
    pub repo_size: u64,
}

#[derive(Debug, Deserialize)]
struct InfoStanza {
    #[serde(default)]
    backup: Vec<InfoBackup>,
}

#[derive(Debug, Deserialize)]
struct InfoBackup {
    label: String,
    #[serde(rename = "type")]
    backup_type: BackupType,
    timestamp: InfoTimestamp,
    info: InfoSizes,
}

#[derive(Debug, Deserialize)]
struct InfoTimestamp {
    start: i64,
    stop: i64,
}

#[derive(Debug, Deserialize)]
struct InfoSizes {
    size: u64,
    repository: InfoRepository,
}

#[derive(Debug, Deserialize)]
struct InfoRepository {
    size: u64,
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::Serialization(format!("invalid backup timestamp {}", seconds)))
}

fn parse_info(output: &str) -> Result<Vec<BackupInfo>> {
    let stanzas: Vec<InfoStanza> = serde_json::from_str(output)?;
    let mut backups = stanzas
        .into_iter()
        .flat_map(|s| s.backup)
        .map(|b| {
            Ok(BackupInfo {
                label: b.label,
                backup_type: b.backup_type,
                start: timestamp(b.timestamp.start)?,
                stop: timestamp(b.timestamp.stop)?,
                size: b.info.size,
                repo_size: b.info.repository.size,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    backups.sort_by(|a, b| b.start.cmp(&a.start));
    Ok(backups)
}

/// Backups of the instance stanza, newest first.
pub fn backups(ctx: &Context, instance: &Instance) -> Result<Vec<BackupInfo>> {
    let settings = site(ctx)?;
    let service = instance.service::<PgBackRest>()?;
    let output = ctx.run(
        &command(settings, &service.stanza)
            .arg("--output=json")
            .arg("info"),
    )?;
    parse_info(&output.stdout)
}

fn remove_stanza(ctx: &Context, service: &PgBackRest) -> Result<()> {
    let settings = site(ctx)?;
    log::info!("deleting pgBackRest stanza '{}'", service.stanza);
    ctx.run(&command(settings, &service.stanza).arg("stop").nocheck())?;
    let deleted = ctx.run(
        &command(settings, &service.stanza)
            .arg("--force")
            .arg("stanza-delete")
            .nocheck(),
    )?;
    if !deleted.success() {
        log::warn!(
            "failed to delete pgBackRest stanza '{}': {}",
            service.stanza,
            deleted.stderr.trim()
        );
    }
    ctx.run(&command(settings, &service.stanza).arg("start").nocheck())?;
    match fs::remove_file(&service.configpath) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&service.configpath, e)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PgBackRestPlugin;

impl Plugin for PgBackRestPlugin {
    fn name(&self) -> &'static str {
        "pgbackrest"
    }

    fn implements(&self) -> &'static [Hook] {
        &[
            Hook::InstanceSettings,
            Hook::InstanceConfigure,
            Hook::InstanceDrop,
            Hook::InstanceUpgrade,
            Hook::InstanceEnv,
            Hook::Role,
            Hook::Rolename,
            Hook::SystemLookup,
            Hook::InterfaceModel,
        ]
    }

    fn instance_settings(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        _instance: &BaseInstance,
    ) -> Option<Result<Configuration>> {
        let pgbackrest = manifest.pgbackrest.as_ref()?;
        Some(site(ctx).map(|s| archive_settings(s, &pgbackrest.stanza)))
    }

    fn instance_configure(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
        _config: &Configuration,
        _changes: &ChangeSet,
        _creating: bool,
        upgrading: bool,
    ) -> Option<Result<()>> {
        let pgbackrest = manifest.pgbackrest.as_ref()?;
        Some(setup(ctx, manifest, &pgbackrest.stanza, instance, upgrading))
    }

    fn instance_drop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        let service = instance.service::<PgBackRest>().ok()?;
        Some(remove_stanza(ctx, service))
    }

    fn instance_upgrade(
        &self,
        ctx: &Context,
        _old: &PostgreSQLInstance,
        new: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        let settings = ctx.settings().pgbackrest.as_ref()?;
        let result = lookup(settings, new).and_then(|service| match service {
            Some(service) => init_stanza(ctx, settings, &service.stanza, new, true),
            None => Ok(()),
        });
        Some(result)
    }

    fn instance_env(
        &self,
        ctx: &Context,
        instance: &Instance,
    ) -> Option<Result<BTreeMap<String, String>>> {
        let service = instance.service::<PgBackRest>().ok()?;
        Some(site(ctx).map(|settings| {
            BTreeMap::from([
                (
                    "PGBACKREST_CONFIG_PATH".to_string(),
                    settings.configpath.to_string_lossy().into_owned(),
                ),
                ("PGBACKREST_STANZA".to_string(), service.stanza.clone()),
            ])
        }))
    }

    fn role(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<RoleManifest>>> {
        let pgbackrest = manifest.pgbackrest.as_ref()?;
        let backuprole = &ctx.settings().postgresql.backuprole;
        let mut role = RoleManifest::new(backuprole.name.clone());
        role.login = true;
        role.superuser = true;
        role.password = pgbackrest.password.clone();
        role.pgpass = backuprole.pgpass;
        Some(Ok(vec![role]))
    }

    fn rolename(&self, ctx: &Context) -> Option<Result<Vec<String>>> {
        Some(Ok(vec![ctx.settings().postgresql.backuprole.name.clone()]))
    }

    fn system_lookup(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<Service>> {
        let settings = ctx.settings().pgbackrest.as_ref()?;
        lookup(settings, instance).transpose().map(|r| r.map(Service::PgBackRest))
    }

    fn interface_model(&self, _ctx: &Context) -> Option<Result<ServiceKind>> {
        Some(Ok(ServiceKind::PgBackRest))
    }
}
