//! Major version upgrades with `pg_upgrade`.

use std::collections::BTreeMap;

use crate::cmd::Cmd;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::Hook;
use crate::instances::{self, apply_locked, configure, init, purge, remove_data};
use crate::lock::lock_instance;
use crate::model::{BaseInstance, Instance, InstanceManifest, InstanceState, Password, PostgreSQLInstance};
use crate::passfile::{libpq_environ, Passfile};
use crate::postgresql::ctl;
use crate::version::Version;

/// Target of an upgrade; unset fields keep the source instance's value,
/// except `version` which defaults to the site's default version.
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    pub version: Option<Version>,
    pub name: Option<String>,
    pub port: Option<u16>,
    pub jobs: Option<u32>,
}

/// Super-user password of `instance` as recorded in the password file.
fn surole_password(ctx: &Context, instance: &PostgreSQLInstance) -> Result<Option<Password>> {
    let postgresql = &ctx.settings().postgresql;
    let Some(path) = postgresql.auth.passfile.as_deref() else {
        return Ok(None);
    };
    if !postgresql.surole.pgpass {
        return Ok(None);
    }
    Ok(Passfile::read(path)?
        .get(instance.port(), &postgresql.surole.name)
        .map(|entry| Password::new(entry.password.clone())))
}

fn pg_upgrade(
    ctx: &Context,
    old: &PostgreSQLInstance,
    new: &PostgreSQLInstance,
    password: Option<&Password>,
    jobs: Option<u32>,
) -> Result<()> {
    let surole = &ctx.settings().postgresql.surole.name;
    let mut env = BTreeMap::new();
    if let Some(password) = password {
        env.insert("PGPASSWORD".to_string(), password.expose().to_string());
    }
    let env = libpq_environ(ctx, old, surole, env)?;
    let scratch = tempfile::tempdir().map_err(|e| Error::io(std::env::temp_dir(), e))?;
    let mut cmd = Cmd::new(new.bin("pg_upgrade")?)
        .arg(format!("--old-bindir={}", old.bindir()?.display()))
        .arg(format!("--new-bindir={}", new.bindir()?.display()))
        .arg(format!("--old-datadir={}", old.datadir().display()))
        .arg(format!("--new-datadir={}", new.datadir().display()))
        .arg(format!("--username={}", surole))
        .cwd(scratch.path())
        .envs(&env);
    if let Some(jobs) = jobs {
        cmd = cmd.arg(format!("--jobs={}", jobs));
    }
    log::info!("upgrading instance {} to {}", old.base(), new.base());
    ctx.run(&cmd)?;
    Ok(())
}

/// Everything after the new data directory was created.
fn upgrade_into(
    ctx: &Context,
    old: &Instance,
    manifest: &InstanceManifest,
    base: &BaseInstance,
    jobs: Option<u32>,
) -> Result<Instance> {
    configure(ctx, manifest, base, true, true, None)?;
    let new = PostgreSQLInstance::system_lookup(base.clone())?;
    pg_upgrade(ctx, old, &new, manifest.surole_password.as_ref(), jobs)?;
    ctx.hooks()
        .all(Hook::InstanceUpgrade, |p| p.instance_upgrade(ctx, old, &new))?;
    apply_locked(ctx, manifest, base.clone(), true)?;
    instances::system_lookup(ctx, base.clone())
}

fn rollback(ctx: &Context, base: &BaseInstance) {
    log::warn!("upgrade to {} failed, dropping the new instance", base);
    let result = match instances::system_lookup(ctx, base.clone()) {
        Ok(instance) => purge(ctx, instance),
        Err(_) => remove_data(base),
    };
    if let Err(e) = result {
        log::error!("failed to drop instance {}: {}", base, e);
    }
}

/// Upgrades `old` into a new, stopped instance. The source instance is
/// left untouched; it must be stopped and must not be a standby.
pub fn upgrade(ctx: &Context, old: &Instance, options: &UpgradeOptions) -> Result<Instance> {
    let span = tracing::info_span!("upgrade", instance = %old.base());
    let _entered = span.enter();

    if old.is_standby() {
        return Err(Error::InstanceReadOnly(format!(
            "{} (standby instances cannot be upgraded)",
            old.base()
        )));
    }
    let version = match options.version {
        Some(version) => version,
        None => ctx.settings().postgresql.default_version()?,
    };
    let name = options.name.clone().unwrap_or_else(|| old.name.clone());
    if name == old.name && version == old.version {
        return Err(Error::InvalidVersion(format!(
            "could not upgrade {} using same name and same version",
            old.base()
        )));
    }
    let base = BaseInstance::new(&name, version, ctx.settings_arc())?;
    if base.exists()? {
        return Err(Error::InstanceAlreadyExists(base.qualname()));
    }
    if ctl::is_running(old)? {
        return Err(Error::InstanceState(format!(
            "instance {} is running, stop it before upgrading",
            old.base()
        )));
    }

    let mut manifest = instances::describe(ctx, old)?;
    manifest.name = name;
    manifest.version = Some(version);
    manifest.port = Some(options.port.unwrap_or_else(|| old.port()));
    manifest.state = InstanceState::Stopped;
    manifest.surole_password = surole_password(ctx, old)?;
    let manifest = manifest.validated()?;

    let _lock = lock_instance(&base)?;
    let result = init(ctx, &manifest, &base)
        .and_then(|()| upgrade_into(ctx, old, &manifest, &base, options.jobs));
    match result {
        Ok(instance) => Ok(instance),
        Err(e) => {
            rollback(ctx, &base);
            Err(e)
        }
    }
}
