//! Thin wrappers over the PostgreSQL programs (`initdb`, `pg_ctl`,
//! `pg_isready`, `pg_checksums`, `pg_basebackup`).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::cmd::Cmd;
use crate::conf::Configuration;
use crate::ctx::Context;
use crate::db::Session;
use crate::error::{Error, Result};
use crate::model::{BaseInstance, InstanceManifest, PostgreSQLInstance, StandbyManifest};
use crate::service::pidfile;

/// Default bound of [`wait_ready`].
pub const WAIT_READY_TIMEOUT: Duration = Duration::from_secs(60);

const WAIT_READY_INTERVAL: Duration = Duration::from_secs(1);

/// `pg_ctl stop --mode`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopMode {
    Smart,
    #[default]
    Fast,
    Immediate,
}

impl StopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopMode::Smart => "smart",
            StopMode::Fast => "fast",
            StopMode::Immediate => "immediate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    NotRunning,
    UnspecifiedDatadir,
}

/// Parsed `postgresql.conf`, with `postgresql.auto.conf` on top unless
/// `managed_only`.
pub fn read_config(datadir: &Path, managed_only: bool) -> Result<Configuration> {
    let mut config = Configuration::read(&datadir.join("postgresql.conf"))?;
    if !managed_only {
        let auto = datadir.join("postgresql.auto.conf");
        if auto.exists() {
            config.merge(&Configuration::read(&auto)?);
        }
    }
    Ok(config)
}

/// Server status from `postmaster.pid` and a signal-0 check.
pub fn status(instance: &BaseInstance) -> Result<Status> {
    let datadir = instance.datadir();
    if !datadir.join("PG_VERSION").exists() {
        return Ok(Status::UnspecifiedDatadir);
    }
    match pidfile::read_pid(&datadir.join("postmaster.pid"))? {
        Some(pid) if pidfile::is_process_alive(pid) => Ok(Status::Running),
        _ => Ok(Status::NotRunning),
    }
}

pub fn is_running(instance: &BaseInstance) -> Result<bool> {
    Ok(status(instance)? == Status::Running)
}

pub(crate) fn pg_isready(instance: &PostgreSQLInstance, surole: &str) -> Result<Cmd> {
    Ok(Cmd::new(instance.bin("pg_isready")?)
        .arg("-h")
        .arg(instance.socket_directory())
        .arg("-p")
        .arg(instance.port().to_string())
        .args(["-d", "postgres", "-U", surole])
        .nocheck())
}

/// Whether the server accepts connections.
pub fn is_ready(ctx: &Context, instance: &PostgreSQLInstance) -> Result<bool> {
    let cmd = pg_isready(instance, &ctx.settings().postgresql.surole.name)?;
    Ok(ctx.run(&cmd)?.success())
}

/// Polls [`is_ready`] every second until `timeout`.
pub fn wait_ready(ctx: &Context, instance: &PostgreSQLInstance, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if is_ready(ctx, instance)? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::InstanceState(format!(
                "PostgreSQL instance {} not ready after {}s",
                instance.qualname(),
                timeout.as_secs()
            )));
        }
        thread::sleep(WAIT_READY_INTERVAL);
    }
}

/// Creates the data directory of `instance` with `initdb`.
pub fn initdb(ctx: &Context, manifest: &InstanceManifest, instance: &BaseInstance) -> Result<()> {
    let settings = &ctx.settings().postgresql;
    let auth = manifest.auth.clone().unwrap_or_default();
    let mut cmd = Cmd::new(instance.bin("initdb")?)
        .arg("--pgdata")
        .arg(instance.datadir())
        .arg("--waldir")
        .arg(instance.waldir())
        .arg(format!("--username={}", settings.surole.name))
        .arg(format!(
            "--auth-local={}",
            auth.local.unwrap_or(settings.auth.local).as_str()
        ))
        .arg(format!(
            "--auth-host={}",
            auth.host.unwrap_or(settings.auth.host).as_str()
        ));
    if let Some(locale) = manifest.locale.as_ref().or(settings.initdb.locale.as_ref()) {
        cmd = cmd.arg(format!("--locale={}", locale));
    }
    if let Some(encoding) = manifest.encoding.as_ref().or(settings.initdb.encoding.as_ref()) {
        cmd = cmd.arg(format!("--encoding={}", encoding));
    }
    if manifest
        .data_checksums
        .or(settings.initdb.data_checksums)
        .unwrap_or(false)
    {
        cmd = cmd.arg("--data-checksums");
    }
    // Kept alive until initdb has read it.
    let mut pwfile = None;
    if let Some(password) = &manifest.surole_password {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        file.write_all(password.expose().as_bytes())
            .map_err(|e| Error::io(file.path(), e))?;
        cmd = cmd.arg(format!("--pwfile={}", file.path().display()));
        pwfile = Some(file);
    }
    log::info!("initializing PostgreSQL instance {}", instance);
    ctx.run(&cmd)?;
    drop(pwfile);
    Ok(())
}

fn pg_ctl(instance: &BaseInstance, action: &str) -> Result<Cmd> {
    Ok(Cmd::new(instance.bin("pg_ctl")?)
        .arg(action)
        .arg("--pgdata")
        .arg(instance.datadir()))
}

/// File receiving the server output while `pg_ctl` starts it.
pub fn startup_logfile(instance: &BaseInstance) -> PathBuf {
    instance.logdir().join(format!("{}-startup.log", instance.qualname()))
}

/// Creates `log_directory` (relative to the data directory) if set.
pub fn ensure_log_directory(instance: &PostgreSQLInstance) -> Result<()> {
    if let Some(dir) = instance.config().get("log_directory").and_then(|v| v.as_str()) {
        let dir = instance.datadir().join(dir);
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    }
    Ok(())
}

pub fn start(ctx: &Context, instance: &PostgreSQLInstance, foreground: bool, wait: bool) -> Result<()> {
    ensure_log_directory(instance)?;
    if foreground {
        let cmd = Cmd::new(instance.bin("postgres")?)
            .arg("-D")
            .arg(instance.datadir());
        ctx.run(&cmd)?;
        return Ok(());
    }
    let logfile = startup_logfile(instance);
    if let Some(parent) = logfile.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let cmd = pg_ctl(instance, "start")?
        .arg(if wait { "--wait" } else { "--no-wait" })
        .arg(format!("--log={}", logfile.display()));
    ctx.run(&cmd)?;
    if wait {
        wait_ready(ctx, instance, WAIT_READY_TIMEOUT)?;
    }
    Ok(())
}

pub fn stop(ctx: &Context, instance: &BaseInstance, mode: StopMode, wait: bool) -> Result<()> {
    let cmd = pg_ctl(instance, "stop")?
        .arg(format!("--mode={}", mode.as_str()))
        .arg(if wait { "--wait" } else { "--no-wait" });
    ctx.run(&cmd)?;
    Ok(())
}

pub fn restart(ctx: &Context, instance: &PostgreSQLInstance, mode: StopMode, wait: bool) -> Result<()> {
    let logfile = startup_logfile(instance);
    let cmd = pg_ctl(instance, "restart")?
        .arg(format!("--mode={}", mode.as_str()))
        .arg(if wait { "--wait" } else { "--no-wait" })
        .arg(format!("--log={}", logfile.display()));
    ctx.run(&cmd)?;
    if wait {
        wait_ready(ctx, instance, WAIT_READY_TIMEOUT)?;
    }
    Ok(())
}

pub fn reload(ctx: &Context, instance: &BaseInstance) -> Result<()> {
    ctx.run(&pg_ctl(instance, "reload")?)?;
    Ok(())
}

pub fn promote(ctx: &Context, instance: &BaseInstance) -> Result<()> {
    ctx.run(&pg_ctl(instance, "promote")?.arg("--wait"))?;
    Ok(())
}

/// Whether data checksums are enabled.
pub fn data_checksums(ctx: &Context, instance: &PostgreSQLInstance) -> Result<bool> {
    if is_running(instance)? {
        return Ok(Session::new(ctx, instance).show("data_checksums")? == "on");
    }
    if instance.version.major() >= 12 {
        let cmd = Cmd::new(instance.bin("pg_checksums")?)
            .arg("--check")
            .arg("--pgdata")
            .arg(instance.datadir())
            .nocheck();
        let output = ctx.run(&cmd)?;
        if output.success() {
            return Ok(true);
        }
        if output.stderr.contains("checksums are not enabled") {
            return Ok(false);
        }
        return Err(Error::InstanceState(format!(
            "could not check data checksums of {}: {}",
            instance.qualname(),
            output.stderr.trim()
        )));
    }
    let cmd = Cmd::new(instance.bin("pg_controldata")?).arg(instance.datadir());
    let output = ctx.run(&cmd)?;
    let version = output
        .stdout
        .lines()
        .find_map(|l| l.strip_prefix("Data page checksum version:"))
        .map(str::trim)
        .unwrap_or("0");
    Ok(version != "0")
}

/// Enables or disables data checksums of a stopped instance.
pub fn set_data_checksums(ctx: &Context, instance: &PostgreSQLInstance, enabled: bool) -> Result<()> {
    if instance.version.major() < 12 {
        return Err(Error::Unsupported(format!(
            "changing data checksums requires PostgreSQL 12 or later, {} runs {}",
            instance.qualname(),
            instance.version
        )));
    }
    if is_running(instance)? {
        return Err(Error::InstanceState(format!(
            "could not alter data checksums of {}: instance is running",
            instance.qualname()
        )));
    }
    let cmd = Cmd::new(instance.bin("pg_checksums")?)
        .arg(if enabled { "--enable" } else { "--disable" })
        .arg("--pgdata")
        .arg(instance.datadir());
    log::info!(
        "{} data checksums of {}",
        if enabled { "enabling" } else { "disabling" },
        instance.qualname()
    );
    ctx.run(&cmd)?;
    Ok(())
}

/// Populates the data directory of a standby from its primary.
pub fn pg_basebackup(ctx: &Context, instance: &BaseInstance, standby: &StandbyManifest) -> Result<()> {
    let mut cmd = Cmd::new(instance.bin("pg_basebackup")?)
        .arg("--pgdata")
        .arg(instance.datadir())
        .arg("--waldir")
        .arg(instance.waldir())
        .args(["--write-recovery-conf", "--checkpoint=fast", "--no-password"])
        .arg("--dbname")
        .arg(&standby.primary_conninfo);
    if let Some(slot) = &standby.slot {
        cmd = cmd.arg(format!("--slot={}", slot));
    }
    if let Some(password) = &standby.password {
        cmd = cmd.env("PGPASSWORD", password.expose());
    }
    log::info!("initializing standby {} from its primary", instance);
    ctx.run(&cmd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_config_auto_conf() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postgresql.conf"), "port = 5433\nwork_mem = 4MB\n").unwrap();
        std::fs::write(dir.path().join("postgresql.auto.conf"), "work_mem = '8MB'\n").unwrap();
        let full = read_config(dir.path(), false).unwrap();
        assert_eq!(full.get("work_mem").unwrap().as_plain(), "8MB");
        let managed = read_config(dir.path(), true).unwrap();
        assert_eq!(managed.get("work_mem").unwrap().as_plain(), "4MB");
        assert!(read_config(&dir.path().join("nope"), false).is_err());
    }

    #[test]
    fn test_stop_mode() {
        assert_eq!(StopMode::default().as_str(), "fast");
        assert_eq!(StopMode::Immediate.as_str(), "immediate");
    }
}
