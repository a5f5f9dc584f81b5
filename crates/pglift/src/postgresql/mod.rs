//! Built-in PostgreSQL plugin: direct control of instances through the
//! PostgreSQL programs. Its authoritative hooks run last so that a cluster
//! coordinator can take over.

pub mod ctl;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::cmd::CommandRunner;
use crate::conf::{diff, ChangeSet, Configuration};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::{Hook, HookOrder, Plugin};
use crate::model::{
    BaseInstance, Instance, InstanceManifest, PostgreSQLInstance, RoleManifest,
    StandbyManifest, StandbyStatus,
};
use crate::service::Runnable;
use crate::settings::{ServiceManagerKind, Settings};

pub use ctl::{Status, StopMode};

const POSTGRESQL_CONF: &str = include_str!("../../data/postgresql.conf");
const PG_HBA_CONF: &str = include_str!("../../data/pg_hba.conf");
const PG_IDENT_CONF: &str = include_str!("../../data/pg_ident.conf");

/// Content of template `name`: the site's copy when present, else the
/// bundled one.
pub fn template(settings: &Settings, name: &str) -> Result<String> {
    if let Some(dir) = settings.templates_dir() {
        let path = dir.join(name);
        if path.exists() {
            log::debug!("using site template {}", path.display());
            return std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e));
        }
    }
    match name {
        "postgresql.conf" => Ok(POSTGRESQL_CONF.to_string()),
        "pg_hba.conf" => Ok(PG_HBA_CONF.to_string()),
        "pg_ident.conf" => Ok(PG_IDENT_CONF.to_string()),
        other => Err(Error::FileNotFound(PathBuf::from(other))),
    }
}

/// The `postgresql.conf` template rendered for `instance`.
pub fn template_configuration(settings: &Settings, instance: &BaseInstance) -> Result<Configuration> {
    let text = template(settings, "postgresql.conf")?
        .replace("{name}", &instance.name)
        .replace("{version}", &instance.version.to_string())
        .replace(
            "{socket_directory}",
            &instance.render(&settings.postgresql.socket_directory).to_string_lossy(),
        )
        .replace("{logpath}", &instance.logdir().to_string_lossy());
    Ok(Configuration::parse(&text))
}

/// `pg_hba.conf` for `manifest`, manifest auth methods over site ones.
pub fn render_hba(settings: &Settings, manifest: &InstanceManifest) -> Result<String> {
    let auth = manifest.auth.clone().unwrap_or_default();
    let site = &settings.postgresql.auth;
    let local = auth.local.unwrap_or(site.local);
    let host = auth.host.unwrap_or(site.host);
    let mut out = String::new();
    for line in template(settings, "pg_hba.conf")?.lines() {
        if line.contains("{replrole}") && settings.postgresql.replrole.is_none() {
            continue;
        }
        let line = line
            .replace("{surole}", &settings.postgresql.surole.name)
            .replace("{replrole}", settings.postgresql.replrole.as_deref().unwrap_or(""))
            .replace("{auth.local}", local.as_str())
            .replace("{auth.host}", host.as_str());
        out.push_str(&line);
        out.push('\n');
    }
    if let Some(hostssl) = auth.hostssl.or(site.hostssl) {
        out.push_str(&format!(
            "hostssl all             all             0.0.0.0/0               {}\n",
            hostssl.as_str()
        ));
    }
    Ok(out)
}

fn write_if_changed(path: &std::path::Path, content: &str) -> Result<bool> {
    match std::fs::read_to_string(path) {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(path, e)),
    }
    std::fs::write(path, content).map_err(|e| Error::io(path, e))?;
    Ok(true)
}

pub(crate) fn uses_systemd(settings: &Settings) -> bool {
    settings.service_manager == Some(ServiceManagerKind::Systemd)
}

/// PostgreSQL as a supervised process.
pub struct PostgreSQLService {
    instance: PostgreSQLInstance,
    surole: String,
}

impl PostgreSQLService {
    pub fn new(instance: &PostgreSQLInstance, settings: &Settings) -> Self {
        Self {
            instance: instance.clone(),
            surole: settings.postgresql.surole.name.clone(),
        }
    }
}

impl Runnable for PostgreSQLService {
    fn service_name(&self) -> &'static str {
        "postgresql"
    }

    fn qualname(&self) -> String {
        self.instance.qualname()
    }

    fn args(&self) -> Result<Vec<String>> {
        Ok(vec![
            self.instance.bin("postgres")?.to_string_lossy().into_owned(),
            "-D".to_string(),
            self.instance.datadir().to_string_lossy().into_owned(),
        ])
    }

    fn pidfile(&self) -> PathBuf {
        self.instance.datadir().join("postmaster.pid")
    }

    fn is_ready(&self, runner: &dyn CommandRunner) -> bool {
        ctl::pg_isready(&self.instance, &self.surole)
            .and_then(|cmd| crate::cmd::run(runner, &cmd))
            .map(|output| output.success())
            .unwrap_or(false)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgreSQLPlugin;

impl Plugin for PostgreSQLPlugin {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn implements(&self) -> &'static [Hook] {
        &[
            Hook::Initdb,
            Hook::InstanceInitReplication,
            Hook::ConfigurePostgresql,
            Hook::ConfigureAuth,
            Hook::PostgresqlEditableConf,
            Hook::StartPostgresql,
            Hook::StopPostgresql,
            Hook::RestartPostgresql,
            Hook::ReloadPostgresql,
            Hook::PromotePostgresql,
            Hook::StandbyModel,
            Hook::PostgresqlServiceName,
            Hook::InstanceEnv,
            Hook::Role,
            Hook::Rolename,
        ]
    }

    fn order(&self, hook: Hook) -> HookOrder {
        if hook.is_authoritative() {
            HookOrder::TryLast
        } else {
            HookOrder::Normal
        }
    }

    fn initdb(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
    ) -> Option<Result<()>> {
        Some(ctl::initdb(ctx, manifest, instance))
    }

    fn instance_init_replication(
        &self,
        ctx: &Context,
        instance: &BaseInstance,
        standby: &StandbyManifest,
    ) -> Option<Result<()>> {
        Some(ctl::pg_basebackup(ctx, instance, standby))
    }

    fn configure_postgresql(
        &self,
        _ctx: &Context,
        manifest: &InstanceManifest,
        config: &Configuration,
        instance: &BaseInstance,
    ) -> Option<Result<ChangeSet>> {
        let result = (|| -> Result<ChangeSet> {
            let datadir = instance.datadir();
            let path = datadir.join("postgresql.conf");
            let before = if path.exists() {
                Configuration::read(&path)?
            } else {
                Configuration::new()
            };
            let changes = diff(&before, config);
            if !changes.is_empty() || !path.exists() {
                config.write(&path)?;
            }
            let demoted = manifest
                .standby
                .as_ref()
                .is_some_and(|s| s.status == StandbyStatus::Demoted);
            if demoted && instance.version.major() >= 12 {
                let signal = datadir.join("standby.signal");
                if !signal.exists() {
                    std::fs::write(&signal, "").map_err(|e| Error::io(&signal, e))?;
                }
            }
            Ok(changes)
        })();
        Some(result)
    }

    fn configure_auth(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
    ) -> Option<Result<bool>> {
        let result = (|| -> Result<bool> {
            let datadir = instance.datadir();
            let hba = render_hba(ctx.settings(), manifest)?;
            let ident = template(ctx.settings(), "pg_ident.conf")?;
            let hba_changed = write_if_changed(&datadir.join("pg_hba.conf"), &hba)?;
            let ident_changed = write_if_changed(&datadir.join("pg_ident.conf"), &ident)?;
            Ok(hba_changed || ident_changed)
        })();
        Some(result)
    }

    fn postgresql_editable_conf(
        &self,
        _ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<PathBuf>> {
        Some(Ok(instance.datadir().join("postgresql.conf")))
    }

    fn start_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        foreground: bool,
        wait: bool,
    ) -> Option<Result<()>> {
        if uses_systemd(ctx.settings()) && !foreground {
            let service = PostgreSQLService::new(instance, ctx.settings());
            return Some(
                ctl::ensure_log_directory(instance)
                    .and_then(|_| ctx.service_manager().start(ctx.runner(), &service)),
            );
        }
        Some(ctl::start(ctx, instance, foreground, wait))
    }

    fn stop_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        mode: StopMode,
        wait: bool,
    ) -> Option<Result<()>> {
        if uses_systemd(ctx.settings()) {
            let service = PostgreSQLService::new(instance, ctx.settings());
            return Some(ctx.service_manager().stop(ctx.runner(), &service));
        }
        Some(ctl::stop(ctx, instance, mode, wait))
    }

    fn restart_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        mode: StopMode,
        wait: bool,
    ) -> Option<Result<()>> {
        if uses_systemd(ctx.settings()) {
            let service = PostgreSQLService::new(instance, ctx.settings());
            return Some(ctx.service_manager().restart(ctx.runner(), &service));
        }
        Some(ctl::restart(ctx, instance, mode, wait))
    }

    fn reload_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        Some(ctl::reload(ctx, instance))
    }

    fn promote_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        Some(ctl::promote(ctx, instance))
    }

    fn standby_model(
        &self,
        _ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<StandbyManifest>> {
        if !instance.is_standby() {
            return None;
        }
        let config = instance.config();
        let primary_conninfo = config
            .get("primary_conninfo")
            .map(|v| v.as_plain())
            .unwrap_or_default();
        Some(Ok(StandbyManifest {
            primary_conninfo,
            slot: config.get("primary_slot_name").map(|v| v.as_plain()),
            password: None,
            status: StandbyStatus::Demoted,
        }))
    }

    fn postgresql_service_name(
        &self,
        _ctx: &Context,
        _instance: &BaseInstance,
    ) -> Option<Result<String>> {
        Some(Ok("postgresql".to_string()))
    }

    fn instance_env(
        &self,
        ctx: &Context,
        instance: &Instance,
    ) -> Option<Result<BTreeMap<String, String>>> {
        let result = instance.bindir().map(|bindir| {
            let mut env = BTreeMap::new();
            env.insert("PGDATA".to_string(), instance.datadir().to_string_lossy().into_owned());
            env.insert(
                "PGHOST".to_string(),
                instance.socket_directory().to_string_lossy().into_owned(),
            );
            env.insert("PGPORT".to_string(), instance.port().to_string());
            env.insert("PGUSER".to_string(), ctx.settings().postgresql.surole.name.clone());
            env.insert("PSQLRC".to_string(), instance.psqlrc().to_string_lossy().into_owned());
            env.insert(
                "PSQL_HISTORY".to_string(),
                instance
                    .datadir()
                    .join(".psql_history")
                    .to_string_lossy()
                    .into_owned(),
            );
            env.insert("PGBINDIR".to_string(), bindir.to_string_lossy().into_owned());
            env
        });
        Some(result)
    }

    fn role(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<RoleManifest>>> {
        let settings = &ctx.settings().postgresql;
        let mut roles = Vec::new();
        if manifest.surole_password.is_some() {
            let mut surole = RoleManifest::new(settings.surole.name.clone());
            surole.password = manifest.surole_password.clone();
            surole.pgpass = settings.surole.pgpass;
            surole.login = true;
            surole.superuser = true;
            surole.replication = true;
            roles.push(surole);
        }
        if let Some(name) = &settings.replrole {
            let mut replrole = RoleManifest::new(name.clone());
            replrole.password = manifest.replrole_password.clone();
            replrole.login = true;
            replrole.replication = true;
            roles.push(replrole);
        }
        Some(Ok(roles))
    }

    fn rolename(&self, ctx: &Context) -> Option<Result<Vec<String>>> {
        let settings = &ctx.settings().postgresql;
        let mut names = vec![settings.surole.name.clone()];
        names.extend(settings.replrole.clone());
        Some(Ok(names))
    }
}
