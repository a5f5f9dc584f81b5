//! Instance lifecycle: reconciliation of manifests and direct operations.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::cmd::Cmd;
use crate::conf::{classify, merge_libraries, resolve_percent_memory, ChangeSet, Configuration, Value};
use crate::ctx::Context;
use crate::databases;
use crate::db::{self, Session};
use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::lock::lock_instance;
use crate::model::manifest::PatroniRestApi;
use crate::model::{
    ApplyResult, BaseInstance, ChangeState, Instance, InstanceListItem, InstanceManifest,
    InstanceState, PatroniManifest, PgBackRestManifest, PostgreSQLInstance, PowaManifest,
    PrometheusManifest, Service, StandbyStatus, TemboardManifest,
};
use crate::passfile::libpq_environ;
use crate::postgresql::{self, ctl, Status, StopMode};
use crate::roles;
use crate::ssl;
use crate::task::Transaction;
use crate::version::Version;

/// Result of an authoritative hook, `Unsupported` when no plugin answered.
pub(crate) fn authoritative<T>(hook: Hook, result: Option<Result<T>>) -> Result<T> {
    result.unwrap_or_else(|| Err(Error::Unsupported(format!("no plugin implements {}", hook))))
}

fn is_demoted_standby(manifest: &InstanceManifest) -> bool {
    manifest
        .standby
        .as_ref()
        .is_some_and(|s| s.status == StandbyStatus::Demoted)
}

/// Super-user session, with the manifest's password when it has one.
fn session<'a>(
    ctx: &'a Context,
    instance: &'a PostgreSQLInstance,
    manifest: &InstanceManifest,
) -> Session<'a> {
    Session::new(ctx, instance).password(manifest.surole_password.clone())
}

// ----------------------------------------------------------------------------
// Lookup
// ----------------------------------------------------------------------------

/// The instance named `name`, of `version` or else of the newest version
/// having it.
pub fn get_base(ctx: &Context, name: &str, version: Option<Version>) -> Result<BaseInstance> {
    if let Some(version) = version {
        return BaseInstance::new(name, version, ctx.settings_arc());
    }
    for candidate in ctx.settings().postgresql.available_versions() {
        let base = BaseInstance::new(name, candidate.version, ctx.settings_arc())?;
        if matches!(base.exists(), Ok(true)) {
            return Ok(base);
        }
    }
    Err(Error::InstanceNotFound(name.to_string()))
}

/// Loads an existing instance with the services plugins find for it.
pub fn system_lookup(ctx: &Context, base: BaseInstance) -> Result<Instance> {
    let postgresql = PostgreSQLInstance::system_lookup(base)?;
    let services = ctx
        .hooks()
        .all(Hook::SystemLookup, |p| p.system_lookup(ctx, &postgresql))?;
    Instance::new(postgresql, services)
}

pub fn get(ctx: &Context, name: &str, version: Option<Version>) -> Result<Instance> {
    system_lookup(ctx, get_base(ctx, name, version)?)
}

/// Manifest describing an existing instance. Passwords are never read back.
pub fn describe(ctx: &Context, instance: &Instance) -> Result<InstanceManifest> {
    let mut manifest = InstanceManifest::new(&instance.name);
    manifest.version = Some(instance.version);
    manifest.port = Some(instance.port());
    manifest.state = match ctl::status(instance)? {
        Status::Running => InstanceState::Started,
        _ => InstanceState::Stopped,
    };
    manifest.settings = ctl::read_config(&instance.datadir(), true)?
        .entries()
        .into_iter()
        .filter(|(name, _)| name != "port")
        .collect();
    manifest.standby = ctx
        .hooks()
        .first(Hook::StandbyModel, |p| p.standby_model(ctx, &instance.postgresql))
        .transpose()?;
    for service in &instance.services {
        match service {
            Service::Patroni(patroni) => {
                manifest.patroni = Some(PatroniManifest {
                    cluster: Some(patroni.cluster.clone()),
                    node: Some(patroni.node.clone()),
                    restapi: PatroniRestApi {
                        listen: patroni.restapi_listen.clone(),
                        connect_address: None,
                    },
                    ..PatroniManifest::default()
                })
            }
            Service::PgBackRest(pgbackrest) => {
                manifest.pgbackrest = Some(PgBackRestManifest {
                    stanza: pgbackrest.stanza.clone(),
                    password: None,
                })
            }
            Service::Prometheus(exporter) => {
                manifest.prometheus = Some(PrometheusManifest {
                    port: exporter.port,
                    password: None,
                })
            }
            Service::Temboard(agent) => {
                manifest.temboard = Some(TemboardManifest {
                    port: agent.port,
                    password: None,
                })
            }
            Service::Powa(_) => manifest.powa = Some(PowaManifest::default()),
        }
    }
    Ok(manifest)
}

pub fn exists(ctx: &Context, name: &str, version: Option<Version>) -> Result<bool> {
    match get_base(ctx, name, version) {
        Ok(base) => base.exists(),
        Err(Error::InstanceNotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn status(instance: &BaseInstance) -> Result<Status> {
    ctl::status(instance)
}

/// Instances found on disk, by matching data directories against the
/// site's datadir template.
pub fn list(ctx: &Context, version: Option<Version>) -> Result<Vec<InstanceListItem>> {
    let settings = ctx.settings();
    let template = &settings.postgresql.datadir;
    let versions: Vec<Version> = match version {
        Some(v) => vec![v],
        None => settings
            .postgresql
            .available_versions()
            .into_iter()
            .map(|v| v.version)
            .collect(),
    };
    let mut items = Vec::new();
    for version in versions {
        let version_str = version.to_string();
        let pattern = crate::settings::render_template(template, "*", &version_str);
        let with_name = crate::settings::render_template(template, "{name}", &version_str);
        let name_re = regex::Regex::new(&format!(
            "^{}$",
            regex::escape(&with_name.to_string_lossy()).replace(r"\{name\}", "([^/]+)")
        ))
        .map_err(|e| Error::Validation(format!("invalid datadir template: {}", e)))?;
        let paths = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::Validation(format!("invalid datadir template: {}", e)))?;
        for path in paths.flatten() {
            let path_str = path.to_string_lossy();
            let Some(name) = name_re.captures(&path_str).map(|c| c[1].to_string()) else {
                continue;
            };
            let Ok(base) = BaseInstance::new(&name, version, ctx.settings_arc()) else {
                continue;
            };
            if !matches!(base.exists(), Ok(true)) {
                continue;
            }
            let instance = PostgreSQLInstance::system_lookup(base)?;
            let status = match ctl::status(&instance)? {
                Status::Running => "running",
                Status::NotRunning => "not running",
                Status::UnspecifiedDatadir => "unspecified datadir",
            };
            items.push(InstanceListItem {
                name,
                version: version_str.clone(),
                port: instance.port(),
                datadir: instance.datadir(),
                status: status.to_string(),
            });
        }
    }
    items.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| b.version.cmp(&a.version)));
    Ok(items)
}

// ----------------------------------------------------------------------------
// Operations
// ----------------------------------------------------------------------------

pub fn start(ctx: &Context, instance: &Instance, foreground: bool) -> Result<()> {
    log::info!("starting PostgreSQL instance {}", instance.base());
    authoritative(
        Hook::StartPostgresql,
        ctx.hooks().first(Hook::StartPostgresql, |p| {
            p.start_postgresql(ctx, &instance.postgresql, foreground, true)
        }),
    )?;
    if !foreground {
        ctx.hooks()
            .all(Hook::InstanceStart, |p| p.instance_start(ctx, instance))?;
    }
    Ok(())
}

pub fn stop(ctx: &Context, instance: &Instance, mode: StopMode, wait: bool) -> Result<()> {
    log::info!("stopping PostgreSQL instance {}", instance.base());
    ctx.hooks()
        .all(Hook::InstanceStop, |p| p.instance_stop(ctx, instance))?;
    authoritative(
        Hook::StopPostgresql,
        ctx.hooks().first(Hook::StopPostgresql, |p| {
            p.stop_postgresql(ctx, &instance.postgresql, mode, wait)
        }),
    )
}

pub fn restart(ctx: &Context, instance: &Instance, mode: StopMode) -> Result<()> {
    log::info!("restarting PostgreSQL instance {}", instance.base());
    authoritative(
        Hook::RestartPostgresql,
        ctx.hooks().first(Hook::RestartPostgresql, |p| {
            p.restart_postgresql(ctx, &instance.postgresql, mode, true)
        }),
    )
}

pub fn reload(ctx: &Context, instance: &PostgreSQLInstance) -> Result<()> {
    log::info!("reloading PostgreSQL configuration for {}", instance.base());
    authoritative(
        Hook::ReloadPostgresql,
        ctx.hooks()
            .first(Hook::ReloadPostgresql, |p| p.reload_postgresql(ctx, instance)),
    )
}

pub fn promote(ctx: &Context, instance: &PostgreSQLInstance) -> Result<()> {
    if !instance.is_standby() {
        return Err(Error::InstanceState(format!(
            "{} is not a standby",
            instance.qualname()
        )));
    }
    if !ctl::is_running(instance)? {
        return Err(Error::InstanceState(format!(
            "cannot promote {}: instance is not running",
            instance.qualname()
        )));
    }
    log::info!("promoting PostgreSQL instance {}", instance.base());
    authoritative(
        Hook::PromotePostgresql,
        ctx.hooks()
            .first(Hook::PromotePostgresql, |p| p.promote_postgresql(ctx, instance)),
    )
}

/// Keeps PostgreSQL running while alive, stopping it on drop if it was
/// started here.
pub struct Running<'a> {
    ctx: &'a Context,
    instance: &'a PostgreSQLInstance,
    started: bool,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if !self.started {
            return;
        }
        log::debug!("stopping temporarily started instance {}", self.instance.base());
        let result = authoritative(
            Hook::StopPostgresql,
            self.ctx.hooks().first(Hook::StopPostgresql, |p| {
                p.stop_postgresql(self.ctx, self.instance, StopMode::Fast, true)
            }),
        );
        if let Err(e) = result {
            log::error!("failed to stop instance {}: {}", self.instance.base(), e);
        }
    }
}

/// Starts `instance` unless already running.
pub fn running<'a>(ctx: &'a Context, instance: &'a PostgreSQLInstance) -> Result<Running<'a>> {
    let started = if ctl::is_running(instance)? {
        false
    } else {
        log::debug!("starting instance {} temporarily", instance.base());
        authoritative(
            Hook::StartPostgresql,
            ctx.hooks().first(Hook::StartPostgresql, |p| {
                p.start_postgresql(ctx, instance, false, true)
            }),
        )?;
        true
    };
    Ok(Running {
        ctx,
        instance,
        started,
    })
}

fn remove_dir(path: &std::path::Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            log::debug!("removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

pub(crate) fn remove_data(instance: &BaseInstance) -> Result<()> {
    remove_dir(&instance.waldir())?;
    remove_dir(&instance.datadir())
}

/// Drops an instance: stops it, lets plugins clean up, removes its data.
pub fn drop(ctx: &Context, instance: Instance) -> Result<()> {
    let span = tracing::info_span!("drop", instance = %instance.base());
    let _entered = span.enter();
    let _lock = lock_instance(&instance)?;
    drop_locked(ctx, instance)
}

fn drop_locked(ctx: &Context, instance: Instance) -> Result<()> {
    if !ctx.confirm(&format!("Confirm complete deletion of instance {}?", instance.base()), true) {
        return Err(Error::Cancelled(format!("deletion of instance {}", instance.base())));
    }
    purge(ctx, instance)
}

/// Drop without confirmation, the caller holding the instance lock.
pub(crate) fn purge(ctx: &Context, instance: Instance) -> Result<()> {
    if ctl::is_running(&instance)? {
        stop(ctx, &instance, StopMode::Fast, true)?;
    }
    log::info!("dropping instance {}", instance.base());
    ctx.hooks()
        .all(Hook::InstanceDrop, |p| p.instance_drop(ctx, &instance))?;
    if crate::postgresql::uses_systemd(ctx.settings()) {
        let service = postgresql::PostgreSQLService::new(&instance, ctx.settings());
        ctx.service_manager().disable(ctx.runner(), &service)?;
    }
    ssl::remove_certificate(&instance)?;
    remove_data(&instance)
}

/// libpq environment for the instance, completed by plugins.
pub fn env(ctx: &Context, instance: &Instance) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for vars in ctx
        .hooks()
        .all(Hook::InstanceEnv, |p| p.instance_env(ctx, instance))?
    {
        env.extend(vars);
    }
    libpq_environ(ctx, instance, &ctx.settings().postgresql.surole.name, env)
}

/// Log files of the instance, oldest first.
pub fn logs(instance: &PostgreSQLInstance) -> Result<Vec<PathBuf>> {
    let directory = instance
        .config()
        .get("log_directory")
        .map(|v| PathBuf::from(v.as_plain()))
        .unwrap_or_else(|| PathBuf::from("log"));
    let directory = if directory.is_absolute() {
        directory
    } else {
        instance.datadir().join(directory)
    };
    if !directory.is_dir() {
        return Err(Error::FileNotFound(directory));
    }
    let pattern = directory.join("*");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| Error::Validation(format!("invalid log directory: {}", e)))?
        .flatten()
        .filter(|p| p.is_file())
        .collect();
    files.sort_by_key(|p| fs::metadata(p).and_then(|m| m.modified()).ok());
    Ok(files)
}

/// `psql` connected to `dbname` as the super-user, ready to be run.
pub fn psql(ctx: &Context, instance: &PostgreSQLInstance, dbname: Option<&str>) -> Result<Cmd> {
    let session = Session::new(ctx, instance).dbname(dbname.unwrap_or("postgres"));
    Ok(Cmd::new(instance.bin("psql")?)
        .arg("-d")
        .arg(session.conninfo())
        .envs(&session.environ()?))
}

// ----------------------------------------------------------------------------
// Reconciliation
// ----------------------------------------------------------------------------

/// Effective `postgresql.conf` for `manifest`: the site template, locale
/// defaults, manifest settings, SSL material, then plugin settings.
pub fn configuration(
    ctx: &Context,
    manifest: &InstanceManifest,
    instance: &BaseInstance,
) -> Result<Configuration> {
    let settings = ctx.settings();
    let mut config = postgresql::template_configuration(settings, instance)?;

    let locale = manifest
        .locale
        .as_ref()
        .or(settings.postgresql.initdb.locale.as_ref());
    if let Some(locale) = locale {
        for name in ["lc_messages", "lc_monetary", "lc_numeric", "lc_time"] {
            if !config.contains(name) {
                config.set(name, Value::Str(locale.clone()));
            }
        }
    }

    for (name, value) in &manifest.settings {
        config.set(name, value.clone());
    }
    for (name, value) in config.entries() {
        if let Some(resolved) = resolve_percent_memory(&name, &value)? {
            config.set(&name, resolved);
        }
    }

    ssl::configure(ctx, &mut config, instance)?;

    let mut libraries: Vec<String> = config
        .get("shared_preload_libraries")
        .map(Value::as_plain)
        .into_iter()
        .collect();
    for extra in ctx
        .hooks()
        .all(Hook::InstanceSettings, |p| p.instance_settings(ctx, manifest, instance))?
    {
        for (name, value) in extra.entries() {
            if name == "shared_preload_libraries" {
                libraries.push(value.as_plain());
            } else {
                config.set(&name, value);
            }
        }
    }
    let libraries = merge_libraries(libraries.iter().map(String::as_str));
    if !libraries.is_empty() {
        config.set("shared_preload_libraries", Value::Str(libraries));
    }

    config.set("port", Value::Int(i64::from(manifest.port())));

    if let Some(standby) = manifest.standby.as_ref().filter(|_| is_demoted_standby(manifest)) {
        if instance.version.major() < 12 {
            return Err(Error::Unsupported(format!(
                "standby setup requires PostgreSQL 12 or later ({} requested)",
                instance.version
            )));
        }
        let mut conninfo = standby.primary_conninfo.clone();
        if let Some(password) = &standby.password {
            conninfo.push(' ');
            conninfo.push_str(&db::conninfo(&[("password", password.expose())]));
        }
        config.set("primary_conninfo", Value::Str(conninfo));
        if let Some(slot) = &standby.slot {
            config.set("primary_slot_name", Value::Str(slot.clone()));
        }
    }
    Ok(config)
}

fn ensure_log_directory(instance: &BaseInstance, config: &Configuration) -> Result<()> {
    if let Some(value) = config.get("log_directory") {
        let path = PathBuf::from(value.as_plain());
        let path = if path.is_absolute() {
            path
        } else {
            instance.datadir().join(path)
        };
        fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
    }
    Ok(())
}

/// What [`configure`] changed, and what the changes require.
#[derive(Debug, Default)]
pub(crate) struct Configured {
    pub changes: ChangeSet,
    pub auth_changed: bool,
    pub reload: Vec<String>,
    pub restart: Vec<String>,
}

impl Configured {
    fn changed(&self) -> bool {
        !self.changes.is_empty() || self.auth_changed
    }
}

fn setting_contexts(session: &Session<'_>) -> Result<HashMap<String, String>> {
    #[derive(Deserialize)]
    struct Row {
        name: String,
        context: String,
    }
    let rows: Vec<Row> = session.query("SELECT name, context FROM pg_catalog.pg_settings")?;
    Ok(rows.into_iter().map(|r| (r.name, r.context)).collect())
}

/// Writes authentication and server configuration, then lets plugins
/// follow. `running` is the instance as it runs before the change.
pub(crate) fn configure(
    ctx: &Context,
    manifest: &InstanceManifest,
    instance: &BaseInstance,
    creating: bool,
    upgrading: bool,
    running: Option<&PostgreSQLInstance>,
) -> Result<Configured> {
    let config = configuration(ctx, manifest, instance)?;
    ensure_log_directory(instance, &config)?;

    let auth_changed = authoritative(
        Hook::ConfigureAuth,
        ctx.hooks()
            .first(Hook::ConfigureAuth, |p| p.configure_auth(ctx, manifest, instance)),
    )?;
    let changes = authoritative(
        Hook::ConfigurePostgresql,
        ctx.hooks().first(Hook::ConfigurePostgresql, |p| {
            p.configure_postgresql(ctx, manifest, &config, instance)
        }),
    )?;
    ctx.hooks().all(Hook::InstanceConfigure, |p| {
        p.instance_configure(ctx, manifest, instance, &config, &changes, creating, upgrading)
    })?;

    let (reload, restart) = if creating || changes.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        let contexts = match running {
            Some(current) => Some(setting_contexts(&session(ctx, current, manifest))?),
            None => None,
        };
        classify(&changes, contexts.as_ref())
    };
    if !changes.is_empty() {
        log::info!(
            "configuration of {} changed: {}",
            instance,
            changes.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(Configured {
        changes,
        auth_changed,
        reload,
        restart,
    })
}

/// Creates the data directory, from scratch or from a primary.
pub(crate) fn init(ctx: &Context, manifest: &InstanceManifest, instance: &BaseInstance) -> Result<()> {
    log::info!("initializing PostgreSQL instance {}", instance);
    match &manifest.standby {
        Some(standby) => authoritative(
            Hook::InstanceInitReplication,
            ctx.hooks().first(Hook::InstanceInitReplication, |p| {
                p.instance_init_replication(ctx, instance, standby)
            }),
        ),
        None => authoritative(
            Hook::Initdb,
            ctx.hooks()
                .first(Hook::Initdb, |p| p.initdb(ctx, manifest, instance)),
        ),
    }
}

/// Roles then databases, from plugins (`with_plugin_objects`) and the
/// manifest; `true` when any changed.
fn apply_children(
    ctx: &Context,
    manifest: &InstanceManifest,
    instance: &PostgreSQLInstance,
    with_plugin_objects: bool,
) -> Result<bool> {
    let mut role_manifests = Vec::new();
    let mut database_manifests = Vec::new();
    if with_plugin_objects {
        role_manifests.extend(
            ctx.hooks()
                .all(Hook::Role, |p| p.role(ctx, manifest))?
                .into_iter()
                .flatten(),
        );
        database_manifests.extend(
            ctx.hooks()
                .all(Hook::Database, |p| p.database(ctx, manifest))?
                .into_iter()
                .flatten(),
        );
    }
    role_manifests.extend(manifest.roles.iter().cloned());
    database_manifests.extend(manifest.databases.iter().cloned());
    if role_manifests.is_empty() && database_manifests.is_empty() {
        return Ok(false);
    }

    // A temporary start is undone so that the requested state is reached
    // through `start`, with its hooks.
    let _guard = running(ctx, instance)?;
    let session = session(ctx, instance, manifest);
    let mut changed = false;
    for role in &role_manifests {
        changed |= roles::apply(&session, role)?.change_state.is_some();
    }
    for database in &database_manifests {
        changed |= databases::apply(&session, database)?.change_state.is_some();
    }
    Ok(changed)
}

fn sync_data_checksums(ctx: &Context, instance: &PostgreSQLInstance, enabled: bool) -> Result<bool> {
    if ctl::data_checksums(ctx, instance)? == enabled {
        return Ok(false);
    }
    ctl::set_data_checksums(ctx, instance, enabled)?;
    Ok(true)
}

/// Brings the server to the requested state; `(changed, restarted)`.
fn enforce_state(ctx: &Context, manifest: &InstanceManifest, instance: &Instance) -> Result<(bool, bool)> {
    let is_running = ctl::is_running(instance)?;
    let mut changed = false;
    let mut restarted = false;
    match manifest.state {
        InstanceState::Started if !is_running => {
            start(ctx, instance, false)?;
            changed = true;
        }
        InstanceState::Stopped if is_running => {
            stop(ctx, instance, StopMode::Fast, true)?;
            changed = true;
        }
        InstanceState::Restarted => {
            if is_running {
                stop(ctx, instance, StopMode::Fast, true)?;
            }
            start(ctx, instance, false)?;
            changed = true;
            restarted = true;
        }
        _ => {}
    }
    if let Some(standby) = &manifest.standby {
        if standby.status == StandbyStatus::Promoted && instance.is_standby() {
            promote(ctx, instance)?;
            changed = true;
        }
    }
    Ok((changed, restarted))
}

/// Services declared by `manifest` must belong to enabled plugins.
fn check_interfaces(ctx: &Context, manifest: &InstanceManifest) -> Result<()> {
    let enabled = ctx
        .hooks()
        .all(Hook::InterfaceModel, |p| p.interface_model(ctx))?;
    for kind in manifest.service_kinds() {
        if !enabled.contains(&kind) {
            return Err(Error::Validation(format!(
                "'{}' is not enabled in site settings",
                kind
            )));
        }
    }
    Ok(())
}

fn base_for(ctx: &Context, manifest: &InstanceManifest) -> Result<BaseInstance> {
    match manifest.version {
        Some(version) => BaseInstance::new(&manifest.name, version, ctx.settings_arc()),
        None => match get_base(ctx, &manifest.name, None) {
            Ok(base) => Ok(base),
            Err(Error::InstanceNotFound(_)) => BaseInstance::new(
                &manifest.name,
                ctx.settings().postgresql.default_version()?,
                ctx.settings_arc(),
            ),
            Err(e) => Err(e),
        },
    }
}

/// Creates, reconfigures or drops an instance to match `manifest`.
pub fn apply(ctx: &Context, manifest: &InstanceManifest) -> Result<ApplyResult> {
    let manifest = manifest.clone().validated()?;
    check_interfaces(ctx, &manifest)?;
    let base = base_for(ctx, &manifest)?;
    let span = tracing::info_span!("apply", instance = %base);
    let _entered = span.enter();
    let _lock = lock_instance(&base)?;
    apply_locked(ctx, &manifest, base, false)
}

pub(crate) fn apply_locked(
    ctx: &Context,
    manifest: &InstanceManifest,
    base: BaseInstance,
    upgrading: bool,
) -> Result<ApplyResult> {
    if manifest.state == InstanceState::Absent {
        if base.exists()? {
            drop_locked(ctx, system_lookup(ctx, base)?)?;
            return Ok(ApplyResult::new(Some(ChangeState::Dropped)));
        }
        return Ok(ApplyResult::new(None));
    }

    let creating = !base.exists()?;
    let mut tx = Transaction::new(format!("creation of instance {}", base));
    let previous = if creating {
        None
    } else {
        Some(PostgreSQLInstance::system_lookup(base.clone())?)
    };
    let was_running = match &previous {
        Some(instance) => ctl::is_running(instance)?,
        None => false,
    };

    if creating {
        let created = base.clone();
        tx.on_rollback(format!("remove data of instance {}", base), move || {
            remove_data(&created)
        });
        init(ctx, manifest, &base)?;
    }

    let configured = configure(
        ctx,
        manifest,
        &base,
        creating,
        upgrading,
        previous.as_ref().filter(|_| was_running),
    )?;
    let mut changed = configured.changed();

    let instance = PostgreSQLInstance::system_lookup(base.clone())?;
    if !creating {
        if let Some(enabled) = manifest.data_checksums {
            changed |= sync_data_checksums(ctx, &instance, enabled)?;
        }
    }
    if !is_demoted_standby(manifest) {
        changed |= apply_children(ctx, manifest, &instance, creating || upgrading)?;
    }

    let instance = system_lookup(ctx, base.clone())?;
    let (state_changed, restarted) = enforce_state(ctx, manifest, &instance)?;
    changed |= state_changed;

    let mut pending_restart = false;
    if was_running && !restarted && ctl::is_running(&instance)? {
        let mut needs_restart = configured.restart.clone();
        if configured.auth_changed {
            needs_restart.push("authentication".to_string());
        }
        let mut restarted_now = false;
        if !needs_restart.is_empty() {
            let message = format!(
                "Instance {} needs to be restarted; restart now?",
                instance.base()
            );
            if manifest.restart_on_changes && ctx.confirm(&message, false) {
                restart(ctx, &instance, StopMode::Fast)?;
                restarted_now = true;
            } else {
                log::warn!(
                    "instance {} needs a restart for changes to take effect: {}",
                    instance.base(),
                    needs_restart.join(", ")
                );
                pending_restart = true;
            }
        }
        // Reloadable changes still apply when the restart is deferred.
        if !restarted_now && !configured.reload.is_empty() {
            reload(ctx, &instance)?;
        }
    }

    tx.commit();
    let change_state = if creating {
        Some(ChangeState::Created)
    } else if changed {
        Some(ChangeState::Changed)
    } else {
        None
    };
    Ok(ApplyResult {
        change_state,
        pending_restart,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookOrder, Plugin};
    use crate::model::ServiceKind;
    use crate::settings::{load_from_sources, SettingsSource};
    use std::sync::Arc;

    fn context(dir: &std::path::Path, plugins: Vec<Box<dyn Plugin>>) -> Context {
        let value = serde_json::json!({
            "prefix": dir.join("pfx"),
            "run_prefix": dir.join("run"),
            "postgresql": {
                "auth": {"passfile": null},
                "versions": [{"version": "16", "bindir": "/usr/lib/postgresql/16/bin"}],
            },
        });
        let settings = Arc::new(load_from_sources(&[SettingsSource::Value(value)]).unwrap());
        let mut builder = Context::builder(settings);
        for plugin in plugins {
            builder = builder.plugin(plugin);
        }
        builder.build().unwrap()
    }

    struct Preloader;

    impl Plugin for Preloader {
        fn name(&self) -> &'static str {
            "preloader"
        }

        fn implements(&self) -> &'static [Hook] {
            &[Hook::InstanceSettings]
        }

        fn order(&self, _hook: Hook) -> HookOrder {
            HookOrder::Normal
        }

        fn instance_settings(
            &self,
            _ctx: &Context,
            _manifest: &InstanceManifest,
            _instance: &BaseInstance,
        ) -> Option<Result<Configuration>> {
            Some(Ok([
                (
                    "shared_preload_libraries".to_string(),
                    Value::Str("pg_stat_statements, passwordcheck".into()),
                ),
                ("wal_level".to_string(), Value::Str("replica".into())),
            ]
            .into_iter()
            .collect()))
        }
    }

    fn base(ctx: &Context) -> BaseInstance {
        BaseInstance::new("main", Version::new(16).unwrap(), ctx.settings_arc()).unwrap()
    }

    #[test]
    fn test_configuration_layers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![Box::new(Preloader)]);
        let mut manifest = InstanceManifest::new("main");
        manifest.port = Some(5455);
        manifest.locale = Some("fr_FR.UTF-8".into());
        manifest.settings.insert(
            "shared_preload_libraries".into(),
            Value::Str("passwordcheck".into()),
        );
        manifest.settings.insert("work_mem".into(), Value::Str("8MB".into()));

        let config = configuration(&ctx, &manifest, &base(&ctx)).unwrap();
        assert_eq!(config.get("port"), Some(&Value::Int(5455)));
        assert_eq!(config.get("work_mem"), Some(&Value::Str("8MB".into())));
        assert_eq!(config.get("wal_level"), Some(&Value::Str("replica".into())));
        assert_eq!(
            config.get("shared_preload_libraries").map(Value::as_plain),
            Some("passwordcheck, pg_stat_statements".to_string())
        );
        // Template value wins over the locale default.
        assert_eq!(config.get("lc_messages").map(Value::as_plain), Some("C".into()));
        assert_eq!(
            config.get("lc_time").map(Value::as_plain),
            Some("fr_FR.UTF-8".into())
        );
        assert!(config
            .get("shared_buffers")
            .and_then(Value::as_str)
            .is_some_and(|v| !v.ends_with('%')));
    }

    #[test]
    fn test_standby_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![]);
        let mut manifest = InstanceManifest::new("main");
        manifest.standby = Some(crate::model::StandbyManifest {
            primary_conninfo: "host=primary port=5432 user=replication".into(),
            slot: Some("main_slot".into()),
            password: Some(crate::model::Password::new("s3cret")),
            status: StandbyStatus::Demoted,
        });
        let config = configuration(&ctx, &manifest, &base(&ctx)).unwrap();
        assert_eq!(
            config.get("primary_conninfo").map(Value::as_plain),
            Some("host=primary port=5432 user=replication password=s3cret".into())
        );
        assert_eq!(
            config.get("primary_slot_name").map(Value::as_plain),
            Some("main_slot".into())
        );

        manifest.standby.as_mut().unwrap().status = StandbyStatus::Promoted;
        let config = configuration(&ctx, &manifest, &base(&ctx)).unwrap();
        assert!(!config.contains("primary_conninfo"));
    }

    #[test]
    fn test_disabled_service_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![]);
        let mut manifest = InstanceManifest::new("main");
        manifest.powa = Some(Default::default());
        let err = check_interfaces(&ctx, &manifest).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err}");
        assert_eq!(manifest.service_kinds(), vec![ServiceKind::Powa]);
    }

    #[test]
    fn test_missing_instance() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), vec![]);
        assert!(!exists(&ctx, "nope", None).unwrap());
        assert!(matches!(
            get(&ctx, "nope", None),
            Err(Error::InstanceNotFound(_))
        ));
        assert!(list(&ctx, None).unwrap().is_empty());
    }
}
