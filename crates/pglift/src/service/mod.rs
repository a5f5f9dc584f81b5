//! Supervision of long-running processes (PostgreSQL, Patroni, exporters).

pub mod pidfile;
pub mod systemd;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crate::cmd::{self, Cmd, CommandRunner};
use crate::error::{Error, Result};

pub use pidfile::PidFileManager;
pub use systemd::SystemdManager;

/// Default bound for start/stop polling.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A process a [`ServiceManager`] can supervise.
pub trait Runnable {
    /// Service name, e.g. `postgresql`, `patroni`.
    fn service_name(&self) -> &'static str;

    /// Instance the process belongs to.
    fn qualname(&self) -> String;

    /// Full command line, program first.
    fn args(&self) -> Result<Vec<String>>;

    fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn pidfile(&self) -> PathBuf;

    fn logfile(&self) -> Option<PathBuf> {
        None
    }

    /// Whether the started process is ready to serve.
    fn is_ready(&self, _runner: &dyn CommandRunner) -> bool {
        true
    }

    fn command(&self) -> Result<Cmd> {
        let args = self.args()?;
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| Error::Validation(format!("empty command for {}", self.service_name())))?;
        Ok(Cmd::new(program).args(rest).envs(&self.env()))
    }
}

/// Start/stop capabilities over a [`Runnable`].
pub trait ServiceManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns once the service is ready.
    fn start(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()>;

    /// Returns once the service is not running.
    fn stop(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()>;

    fn restart(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        self.stop(runner, service)?;
        self.start(runner, service)
    }

    fn reload(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()>;

    fn enable(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()>;

    fn disable(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()>;

    fn is_active(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<bool>;

    fn is_enabled(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<bool>;
}

/// `pglift-{service}@{qualname}.service`
pub fn unit_name(service: &str, qualname: &str) -> String {
    format!("pglift-{}@{}.service", service, qualname)
}

/// `pglift-{service}-{qualname}.service`, for non-templated units.
pub fn simple_unit_name(service: &str, qualname: &str) -> String {
    format!("pglift-{}-{}.service", service, qualname)
}

/// `pglift-backup@{qualname}.timer`
pub fn backup_timer_name(qualname: &str) -> String {
    format!("pglift-backup@{}.timer", qualname)
}

/// Polls `check` until it holds, failing with `InstanceState` after `timeout`.
pub fn wait_until(
    what: &str,
    timeout: Duration,
    mut check: impl FnMut() -> Result<bool>,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::InstanceState(format!(
                "timed out after {}s waiting for {}",
                timeout.as_secs(),
                what
            )));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// No supervisor: the process runs in the foreground of the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupervised;

impl ServiceManager for Unsupervised {
    fn name(&self) -> &'static str {
        "none"
    }

    fn start(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        log::info!(
            "running {} for {} in foreground",
            service.service_name(),
            service.qualname()
        );
        cmd::run(runner, &service.command()?)?;
        Ok(())
    }

    fn stop(&self, _runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        Err(Error::Unsupported(format!(
            "cannot stop unsupervised {} service",
            service.service_name()
        )))
    }

    fn reload(&self, _runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        Err(Error::Unsupported(format!(
            "cannot reload unsupervised {} service",
            service.service_name()
        )))
    }

    fn enable(&self, _runner: &dyn CommandRunner, _service: &dyn Runnable) -> Result<()> {
        Ok(())
    }

    fn disable(&self, _runner: &dyn CommandRunner, _service: &dyn Runnable) -> Result<()> {
        Ok(())
    }

    fn is_active(&self, _runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<bool> {
        pidfile::is_running(&service.pidfile())
    }

    fn is_enabled(&self, _runner: &dyn CommandRunner, _service: &dyn Runnable) -> Result<bool> {
        Ok(false)
    }
}
