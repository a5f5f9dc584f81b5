//! Supervision through `systemctl`.

use super::{unit_name, wait_until, Runnable, ServiceManager, DEFAULT_TIMEOUT};
use crate::cmd::{self, Cmd, CommandRunner};
use crate::error::Result;
use crate::settings::SystemdSettings;

#[derive(Debug, Clone)]
pub struct SystemdManager {
    settings: SystemdSettings,
}

impl SystemdManager {
    pub fn new(settings: SystemdSettings) -> Self {
        Self { settings }
    }

    /// `[sudo] systemctl [--user] {action} {unit}`
    pub fn systemctl(&self, action: &str, unit: &str) -> Cmd {
        let mut cmd = if self.settings.sudo {
            Cmd::new("sudo").arg(&self.settings.systemctl)
        } else {
            Cmd::new(&self.settings.systemctl)
        };
        if self.settings.user {
            cmd = cmd.arg("--user");
        }
        cmd.arg(action).arg(unit)
    }

    fn query(&self, runner: &dyn CommandRunner, action: &str, unit: &str) -> Result<bool> {
        let cmd = self.systemctl(action, unit).arg("-q").nocheck();
        Ok(cmd::run(runner, &cmd)?.success())
    }

    fn unit(service: &dyn Runnable) -> String {
        unit_name(service.service_name(), &service.qualname())
    }
}

impl ServiceManager for SystemdManager {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn start(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        let unit = Self::unit(service);
        cmd::run(runner, &self.systemctl("start", &unit))?;
        wait_until(&unit, DEFAULT_TIMEOUT, || {
            Ok(self.query(runner, "is-active", &unit)? && service.is_ready(runner))
        })
    }

    fn stop(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        let unit = Self::unit(service);
        cmd::run(runner, &self.systemctl("stop", &unit))?;
        wait_until(&format!("{} to stop", unit), DEFAULT_TIMEOUT, || {
            Ok(!self.query(runner, "is-active", &unit)?)
        })
    }

    fn restart(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        let unit = Self::unit(service);
        cmd::run(runner, &self.systemctl("restart", &unit))?;
        wait_until(&unit, DEFAULT_TIMEOUT, || {
            Ok(self.query(runner, "is-active", &unit)? && service.is_ready(runner))
        })
    }

    fn reload(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        cmd::run(runner, &self.systemctl("reload", &Self::unit(service)))?;
        Ok(())
    }

    fn enable(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        let unit = Self::unit(service);
        if self.query(runner, "is-enabled", &unit)? {
            return Ok(());
        }
        cmd::run(runner, &self.systemctl("enable", &unit))?;
        Ok(())
    }

    fn disable(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<()> {
        let unit = Self::unit(service);
        if !self.query(runner, "is-enabled", &unit)? {
            return Ok(());
        }
        cmd::run(runner, &self.systemctl("disable", &unit))?;
        Ok(())
    }

    fn is_active(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<bool> {
        self.query(runner, "is-active", &Self::unit(service))
    }

    fn is_enabled(&self, runner: &dyn CommandRunner, service: &dyn Runnable) -> Result<bool> {
        self.query(runner, "is-enabled", &Self::unit(service))
    }
}
