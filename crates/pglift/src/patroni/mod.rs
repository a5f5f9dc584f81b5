//! Patroni plugin: PostgreSQL runs as a member of a Patroni cluster.
//!
//! When an instance manifest carries a `patroni` section, Patroni takes over
//! bootstrap, configuration and process control from the built-in
//! PostgreSQL plugin; the authoritative hooks here run first and decline for
//! instances Patroni does not manage.

pub mod api;
pub mod config;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use crate::cmd::Cmd;
use crate::conf::{diff, ChangeSet, Configuration, Value};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::{Hook, HookOrder, Plugin};
use crate::instances;
use crate::model::services::Patroni;
use crate::model::{
    BaseInstance, Instance, InstanceManifest, PatroniManifest, PostgreSQLInstance, Service,
    ServiceKind,
};
use crate::postgresql::{ctl, uses_systemd, StopMode};
use crate::service::Runnable;
use crate::settings::PatroniSettings;

pub use api::{Api, Member};
pub use config::Config;

const MAX_RETRIES: u32 = 6;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_JITTER: Duration = Duration::from_millis(150);

fn site(ctx: &Context) -> Result<&PatroniSettings> {
    ctx.settings()
        .patroni
        .as_ref()
        .ok_or_else(|| Error::Unsupported("Patroni is not enabled in site settings".into()))
}

/// Path of the Patroni configuration file of `instance`.
pub fn configpath(settings: &PatroniSettings, instance: &BaseInstance) -> PathBuf {
    instance.render(&settings.configpath)
}

pub fn logdir(settings: &PatroniSettings, instance: &BaseInstance) -> PathBuf {
    settings.logpath.join(instance.qualname())
}

fn is_managed(ctx: &Context, instance: &BaseInstance) -> bool {
    ctx.settings()
        .patroni
        .as_ref()
        .is_some_and(|s| configpath(s, instance).exists())
}

/// Patroni as a supervised process.
pub struct PatroniService {
    qualname: String,
    execpath: PathBuf,
    configpath: PathBuf,
    pidfile: PathBuf,
    logfile: PathBuf,
}

impl PatroniService {
    pub fn new(settings: &PatroniSettings, instance: &BaseInstance) -> Self {
        Self {
            qualname: instance.qualname(),
            execpath: settings.execpath.clone(),
            configpath: configpath(settings, instance),
            pidfile: instance.render(&settings.pid_file),
            logfile: logdir(settings, instance).join("patroni.log"),
        }
    }
}

impl Runnable for PatroniService {
    fn service_name(&self) -> &'static str {
        "patroni"
    }

    fn qualname(&self) -> String {
        self.qualname.clone()
    }

    fn args(&self) -> Result<Vec<String>> {
        Ok(vec![
            self.execpath.to_string_lossy().into_owned(),
            self.configpath.to_string_lossy().into_owned(),
        ])
    }

    fn pidfile(&self) -> PathBuf {
        self.pidfile.clone()
    }

    fn logfile(&self) -> Option<PathBuf> {
        Some(self.logfile.clone())
    }
}

/// Writes `config` to `path` once `patroni --validate-config` accepted it;
/// `true` when the file changed.
///
/// Rejected configurations fail when validation is enforced and are
/// written with a warning otherwise.
pub fn write_config(
    ctx: &Context,
    settings: &PatroniSettings,
    config: &Config,
    path: &Path,
) -> Result<bool> {
    let content = config.to_yaml()?;
    match fs::read_to_string(path) {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(path, e)),
    }
    let parent = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("invalid Patroni config path {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| Error::io(tmp.path(), e))?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::io(tmp.path(), e))?;

    let output = ctx.run(
        &Cmd::new(&settings.execpath)
            .arg("--validate-config")
            .arg(tmp.path())
            .nocheck(),
    )?;
    if !output.success() {
        let message = format!("{}{}", output.stdout, output.stderr).trim().to_string();
        if settings.enforce_config_validation {
            return Err(Error::Configuration {
                path: path.to_path_buf(),
                message,
            });
        }
        log::warn!("invalid Patroni configuration {}: {}", path.display(), message);
    }
    tmp.persist(path)
        .map_err(|e| Error::io(path, e.error))?;
    log::debug!("wrote Patroni configuration {}", path.display());
    Ok(true)
}

fn check_ready(ctx: &Context, instance: &BaseInstance, api: &Api) -> Result<()> {
    if !instance.datadir().join("PG_VERSION").exists() {
        return Err(Error::InstanceState(format!(
            "data directory of {} is not bootstrapped yet",
            instance
        )));
    }
    let postgresql = PostgreSQLInstance::system_lookup(instance.clone())?;
    if !ctl::is_ready(ctx, &postgresql)? {
        return Err(Error::InstanceState(format!(
            "PostgreSQL instance {} is not accepting connections",
            instance
        )));
    }
    if !api.readiness()? {
        return Err(Error::InstanceState(format!(
            "Patroni at {} is not ready",
            api.base_url()
        )));
    }
    Ok(())
}

/// Retries the readiness check with exponential backoff, a bounded number
/// of times.
pub fn wait_ready(ctx: &Context, instance: &BaseInstance, api: &Api) -> Result<()> {
    let mut last_error = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = RETRY_BASE_DELAY * (1 << (attempt - 1)) + RETRY_JITTER;
            log::info!(
                "waiting {}ms for Patroni to be ready (attempt {}/{})",
                delay.as_millis(),
                attempt,
                MAX_RETRIES
            );
            thread::sleep(delay);
        }
        match check_ready(ctx, instance, api) {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::debug!("{}", e);
                last_error = Some(e);
            }
        }
    }
    Err(Error::InstanceState(format!(
        "Patroni member for {} not ready after {} attempts: {}",
        instance,
        MAX_RETRIES + 1,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn api(ctx: &Context, instance: &BaseInstance) -> Result<Api> {
    let settings = site(ctx)?;
    let config = Config::read(&configpath(settings, instance))?;
    Api::new(config.api_address(), &settings.restapi)
}

/// Writes the configuration, starts Patroni and waits for it to bring up
/// PostgreSQL.
fn bootstrap(
    ctx: &Context,
    manifest: &InstanceManifest,
    patroni: &PatroniManifest,
    instance: &BaseInstance,
) -> Result<()> {
    let settings = site(ctx)?;
    let pgconfig = instances::configuration(ctx, manifest, instance)?;
    let config = config::build(ctx, manifest, patroni, &pgconfig, instance)?;
    let path = configpath(settings, instance);
    write_config(ctx, settings, &config, &path)?;
    let logdir = logdir(settings, instance);
    fs::create_dir_all(&logdir).map_err(|e| Error::io(&logdir, e))?;

    log::info!(
        "bootstrapping {} as member {} of Patroni cluster {}",
        instance,
        config.name,
        config.scope
    );
    let service = PatroniService::new(settings, instance);
    let started = ctx
        .service_manager()
        .start(ctx.runner(), &service)
        .and_then(|()| Api::new(config.api_address(), &settings.restapi))
        .and_then(|api| wait_ready(ctx, instance, &api));
    if let Err(e) = started {
        if let Err(stop) = ctx.service_manager().stop(ctx.runner(), &service) {
            log::error!("failed to stop Patroni for {}: {}", instance, stop);
        }
        if let Err(remove) = fs::remove_file(&path) {
            log::warn!("failed to remove {}: {}", path.display(), remove);
        }
        return Err(e);
    }
    Ok(())
}

/// Writes the new configuration and reloads Patroni when it runs.
fn configure(
    ctx: &Context,
    manifest: &InstanceManifest,
    patroni: &PatroniManifest,
    pgconfig: &Configuration,
    instance: &BaseInstance,
) -> Result<ChangeSet> {
    let settings = site(ctx)?;
    let path = configpath(settings, instance);
    let config = config::build(ctx, manifest, patroni, pgconfig, instance)?;
    let previous = if path.exists() {
        Some(Config::read(&path)?)
    } else {
        None
    };
    let mut changes = diff(
        &previous.as_ref().map(Config::parameters).unwrap_or_default(),
        &config.parameters(),
    );
    let old_port = previous.as_ref().and_then(Config::port);
    if old_port != config.port() {
        changes.insert(
            "port".to_string(),
            (
                old_port.map(|p| Value::Int(i64::from(p))),
                config.port().map(|p| Value::Int(i64::from(p))),
            ),
        );
    }
    let written = write_config(ctx, settings, &config, &path)?;
    if written && previous.is_some() && ctl::is_running(instance)? {
        Api::new(config.api_address(), &settings.restapi)?.reload()?;
    }
    Ok(changes)
}

#[derive(Debug, Deserialize)]
struct ListedMember {
    #[serde(rename = "Member")]
    member: String,
}

/// Other members of the cluster, as seen by `patronictl` through the DCS.
fn other_members(ctx: &Context, settings: &PatroniSettings, service: &Patroni) -> Result<Vec<String>> {
    let output = ctx.run(
        &Cmd::new(&settings.ctlpath)
            .arg("-c")
            .arg(&service.configpath)
            .args(["list", "-f", "json"])
            .nocheck(),
    )?;
    if !output.success() {
        return Err(Error::InstanceState(format!(
            "could not list members of Patroni cluster {}: {}",
            service.cluster,
            output.stderr.trim()
        )));
    }
    let members: Vec<ListedMember> = serde_json::from_str(&output.stdout)?;
    Ok(members
        .into_iter()
        .map(|m| m.member)
        .filter(|m| *m != service.node)
        .collect())
}

/// `{stem}-{timestamp}.{ext}` next to `path`.
fn backup_path(path: &Path, now: chrono::DateTime<chrono::Local>) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{}-{}{}", stem, now.format("%Y%m%dT%H%M%S"), extension))
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn drop_member(ctx: &Context, instance: &Instance, service: &Patroni) -> Result<()> {
    let settings = site(ctx)?;
    let last = match other_members(ctx, settings, service) {
        Ok(others) => others.is_empty(),
        Err(e) => {
            log::warn!("{}; keeping a copy of the Patroni configuration", e);
            true
        }
    };
    if last && service.configpath.exists() {
        let backup = backup_path(&service.configpath, chrono::Local::now());
        log::warn!(
            "{} is the last member of cluster {}; saving its configuration to {}",
            service.node,
            service.cluster,
            backup.display()
        );
        fs::copy(&service.configpath, &backup).map_err(|e| Error::io(&backup, e))?;
    }
    let runnable = PatroniService::new(settings, instance);
    if uses_systemd(ctx.settings()) {
        ctx.service_manager().disable(ctx.runner(), &runnable)?;
    }
    remove_file(&service.configpath)?;
    remove_file(&instance.render(&settings.postgresql.passfile))?;
    let logdir = logdir(settings, instance);
    match fs::remove_dir_all(&logdir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&logdir, e)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PatroniPlugin;

impl Plugin for PatroniPlugin {
    fn name(&self) -> &'static str {
        "patroni"
    }

    fn implements(&self) -> &'static [Hook] {
        &[
            Hook::Initdb,
            Hook::ConfigurePostgresql,
            Hook::ConfigureAuth,
            Hook::PostgresqlEditableConf,
            Hook::StartPostgresql,
            Hook::StopPostgresql,
            Hook::RestartPostgresql,
            Hook::ReloadPostgresql,
            Hook::PromotePostgresql,
            Hook::PostgresqlServiceName,
            Hook::InstanceDrop,
            Hook::InstanceEnv,
            Hook::SystemLookup,
            Hook::InterfaceModel,
        ]
    }

    fn order(&self, hook: Hook) -> HookOrder {
        if hook.is_authoritative() && self.implements().contains(&hook) {
            HookOrder::TryFirst
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
        let patroni = manifest.patroni.as_ref()?;
        Some(bootstrap(ctx, manifest, patroni, instance))
    }

    fn configure_postgresql(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        config: &Configuration,
        instance: &BaseInstance,
    ) -> Option<Result<ChangeSet>> {
        let patroni = manifest.patroni.as_ref()?;
        Some(configure(ctx, manifest, patroni, config, instance))
    }

    /// Authentication lives in the Patroni configuration.
    fn configure_auth(
        &self,
        _ctx: &Context,
        manifest: &InstanceManifest,
        _instance: &BaseInstance,
    ) -> Option<Result<bool>> {
        manifest.patroni.as_ref().map(|_| Ok(false))
    }

    fn postgresql_editable_conf(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<PathBuf>> {
        if !is_managed(ctx, instance) {
            return None;
        }
        Some(site(ctx).map(|s| configpath(s, instance)))
    }

    fn start_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        foreground: bool,
        wait: bool,
    ) -> Option<Result<()>> {
        if !is_managed(ctx, instance) {
            return None;
        }
        let result = site(ctx).and_then(|settings| {
            let service = PatroniService::new(settings, instance);
            if foreground {
                ctx.run(&service.command()?)?;
                return Ok(());
            }
            ctx.service_manager().start(ctx.runner(), &service)?;
            if wait {
                wait_ready(ctx, instance, &api(ctx, instance)?)?;
            }
            Ok(())
        });
        Some(result)
    }

    fn stop_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        _mode: StopMode,
        _wait: bool,
    ) -> Option<Result<()>> {
        if !is_managed(ctx, instance) {
            return None;
        }
        Some(site(ctx).and_then(|settings| {
            ctx.service_manager()
                .stop(ctx.runner(), &PatroniService::new(settings, instance))
        }))
    }

    fn restart_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        _mode: StopMode,
        wait: bool,
    ) -> Option<Result<()>> {
        if !is_managed(ctx, instance) {
            return None;
        }
        let result = api(ctx, instance).and_then(|api| {
            api.restart()?;
            if wait {
                wait_ready(ctx, instance, &api)?;
            }
            Ok(())
        });
        Some(result)
    }

    fn reload_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        if !is_managed(ctx, instance) {
            return None;
        }
        Some(api(ctx, instance).and_then(|api| api.reload()))
    }

    fn promote_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        if !is_managed(ctx, instance) {
            return None;
        }
        Some(Err(Error::Unsupported(format!(
            "{} is managed by Patroni; use a switchover or failover instead",
            instance.base()
        ))))
    }

    fn postgresql_service_name(
        &self,
        ctx: &Context,
        instance: &BaseInstance,
    ) -> Option<Result<String>> {
        is_managed(ctx, instance).then(|| Ok("patroni".to_string()))
    }

    fn instance_drop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        let service = instance.service::<Patroni>().ok()?;
        Some(drop_member(ctx, instance, service))
    }

    fn instance_env(
        &self,
        _ctx: &Context,
        instance: &Instance,
    ) -> Option<Result<BTreeMap<String, String>>> {
        let service = instance.service::<Patroni>().ok()?;
        Some(Ok(BTreeMap::from([
            (
                "PATRONICTL_CONFIG_FILE".to_string(),
                service.configpath.to_string_lossy().into_owned(),
            ),
            ("PATRONI_NAME".to_string(), service.node.clone()),
            ("PATRONI_SCOPE".to_string(), service.cluster.clone()),
        ])))
    }

    fn system_lookup(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<Service>> {
        let settings = ctx.settings().patroni.as_ref()?;
        let path = configpath(settings, instance);
        if !path.exists() {
            return None;
        }
        Some(Config::read(&path).map(|config| {
            Service::Patroni(Patroni {
                cluster: config.scope,
                node: config.name,
                restapi_listen: config.restapi.listen,
                configpath: path,
            })
        }))
    }

    fn interface_model(&self, _ctx: &Context) -> Option<Result<ServiceKind>> {
        Some(Ok(ServiceKind::Patroni))
    }
}
