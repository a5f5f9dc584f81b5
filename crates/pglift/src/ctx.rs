//! Execution context shared by every operation.

use std::fmt;
use std::sync::Arc;

use crate::cmd::{self, Cmd, CommandRunner, Output, SystemRunner};
use crate::error::Result;
use crate::hooks::{HookManager, Plugin};
use crate::service::{PidFileManager, ServiceManager, SystemdManager};
use crate::settings::{ServiceManagerKind, Settings};

/// Answers yes/no questions on behalf of the operator.
pub trait Confirm: Send + Sync {
    fn confirm(&self, message: &str, default: bool) -> bool;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, message: &str, _default: bool) -> bool {
        log::debug!("{} -> yes", message);
        true
    }
}

/// Declines everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeNo;

impl Confirm for AssumeNo {
    fn confirm(&self, message: &str, _default: bool) -> bool {
        log::debug!("{} -> no", message);
        false
    }
}

pub struct Context {
    settings: Arc<Settings>,
    runner: Arc<dyn CommandRunner>,
    hooks: HookManager,
    confirm: Arc<dyn Confirm>,
    service_manager: Arc<dyn ServiceManager>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("hooks", &self.hooks)
            .field("service_manager", &self.service_manager.name())
            .finish()
    }
}

impl Context {
    /// Context running commands on the host with the plugins enabled by `settings`.
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        ContextBuilder::new(settings).build()
    }

    pub fn builder(settings: Arc<Settings>) -> ContextBuilder {
        ContextBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_arc(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn service_manager(&self) -> &dyn ServiceManager {
        self.service_manager.as_ref()
    }

    pub fn confirm(&self, message: &str, default: bool) -> bool {
        self.confirm.confirm(message, default)
    }

    /// Runs `cmd` through the context's runner.
    pub fn run(&self, cmd: &Cmd) -> Result<Output> {
        cmd::run(self.runner(), cmd)
    }
}

/// Plugins enabled by the site settings, the built-in PostgreSQL one last.
fn default_plugins(settings: &Settings) -> Vec<Box<dyn Plugin>> {
    let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();
    if settings.postgresql.auth.passfile.is_some() {
        plugins.push(Box::new(crate::passfile::PassfilePlugin));
    }
    if settings.patroni.is_some() {
        plugins.push(Box::new(crate::patroni::PatroniPlugin));
    }
    if settings.pgbackrest.is_some() {
        plugins.push(Box::new(crate::pgbackrest::PgBackRestPlugin));
    }
    if settings.prometheus.is_some() {
        plugins.push(Box::new(crate::prometheus::PrometheusPlugin));
    }
    if settings.temboard.is_some() {
        plugins.push(Box::new(crate::temboard::TemboardPlugin));
    }
    if settings.powa.is_some() {
        plugins.push(Box::new(crate::powa::PowaPlugin));
    }
    plugins.push(Box::new(crate::postgresql::PostgreSQLPlugin));
    plugins
}

pub struct ContextBuilder {
    settings: Arc<Settings>,
    runner: Option<Arc<dyn CommandRunner>>,
    confirm: Option<Arc<dyn Confirm>>,
    service_manager: Option<Arc<dyn ServiceManager>>,
    default_plugins: bool,
    plugins: Vec<Box<dyn Plugin>>,
}

impl ContextBuilder {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            runner: None,
            confirm: None,
            service_manager: None,
            default_plugins: true,
            plugins: Vec::new(),
        }
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = Some(confirm);
        self
    }

    pub fn service_manager(mut self, manager: Arc<dyn ServiceManager>) -> Self {
        self.service_manager = Some(manager);
        self
    }

    /// Registers only the plugins added with [`plugin`](Self::plugin).
    pub fn without_default_plugins(mut self) -> Self {
        self.default_plugins = false;
        self
    }

    pub fn plugin(mut self, plugin: Box<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn build(self) -> Result<Context> {
        let mut hooks = HookManager::new();
        for plugin in self.plugins {
            hooks.register(plugin)?;
        }
        if self.default_plugins {
            for plugin in default_plugins(&self.settings) {
                hooks.register(plugin)?;
            }
        }
        let service_manager = self.service_manager.unwrap_or_else(|| {
            match (&self.settings.service_manager, &self.settings.systemd) {
                (Some(ServiceManagerKind::Systemd), Some(systemd)) => {
                    Arc::new(SystemdManager::new(systemd.clone()))
                }
                _ => Arc::new(PidFileManager),
            }
        });
        Ok(Context {
            settings: self.settings,
            runner: self.runner.unwrap_or_else(|| Arc::new(SystemRunner)),
            hooks,
            confirm: self.confirm.unwrap_or_else(|| Arc::new(AssumeYes)),
            service_manager,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hook;
    use crate::settings::{load_from_sources, SettingsSource};

    fn settings(extra: serde_json::Value) -> Arc<Settings> {
        let dir = std::env::temp_dir();
        let mut value = serde_json::json!({
            "prefix": dir.join("pglift-ctx-test"),
            "run_prefix": dir.join("pglift-ctx-test/run"),
            "postgresql": {"auth": {"passfile": null}},
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        Arc::new(load_from_sources(&[SettingsSource::Value(value)]).unwrap())
    }

    #[test]
    fn test_plugins_follow_settings() {
        let ctx = Context::new(settings(serde_json::json!({}))).unwrap();
        assert_eq!(ctx.hooks().names(), vec!["postgresql"]);
        assert_eq!(ctx.service_manager().name(), "pidfile");

        let ctx = Context::new(settings(serde_json::json!({
            "patroni": {},
            "powa": {},
        })))
        .unwrap();
        assert!(ctx.hooks().is_registered("patroni"));
        assert!(ctx.hooks().is_registered("powa"));
        let start: Vec<_> = ctx
            .hooks()
            .implementations(Hook::StartPostgresql)
            .map(|p| p.name())
            .collect();
        assert_eq!(start, vec!["patroni", "postgresql"]);
        assert!(!ctx.hooks().is_registered("pgbackrest"));
    }

    #[test]
    fn test_confirm_collaborators() {
        let ctx = Context::builder(settings(serde_json::json!({})))
            .confirm(Arc::new(AssumeNo))
            .build()
            .unwrap();
        assert!(!ctx.confirm("restart?", true));
        assert!(AssumeYes.confirm("restart?", false));
    }
}
