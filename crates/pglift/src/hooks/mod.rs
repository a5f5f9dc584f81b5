//! Plugin registry and hook dispatch.
//!
//! Optional components contribute to the instance lifecycle by implementing
//! [`Plugin`] methods. Every hook method declines by returning `None`.
//! Authoritative hooks go through [`HookManager::first`], where the first
//! non-declining result wins; broadcast hooks go through
//! [`HookManager::all`], which collects every result.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use crate::conf::{ChangeSet, Configuration};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::model::{
    BaseInstance, DatabaseManifest, Instance, InstanceManifest, PostgreSQLInstance,
    RoleManifest, Service, ServiceKind, StandbyManifest,
};
use crate::postgresql::ctl::StopMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hook {
    Initdb,
    InstanceInitReplication,
    ConfigurePostgresql,
    ConfigureAuth,
    InstanceSettings,
    PostgresqlEditableConf,
    StartPostgresql,
    StopPostgresql,
    RestartPostgresql,
    ReloadPostgresql,
    PromotePostgresql,
    StandbyModel,
    PostgresqlServiceName,
    InstanceStart,
    InstanceStop,
    InstanceDrop,
    InstanceUpgrade,
    InstanceConfigure,
    InstanceEnv,
    RoleChange,
    Role,
    Rolename,
    Database,
    SystemLookup,
    InterfaceModel,
}

impl Hook {
    pub const ALL: &'static [Hook] = &[
        Hook::Initdb,
        Hook::InstanceInitReplication,
        Hook::ConfigurePostgresql,
        Hook::ConfigureAuth,
        Hook::InstanceSettings,
        Hook::PostgresqlEditableConf,
        Hook::StartPostgresql,
        Hook::StopPostgresql,
        Hook::RestartPostgresql,
        Hook::ReloadPostgresql,
        Hook::PromotePostgresql,
        Hook::StandbyModel,
        Hook::PostgresqlServiceName,
        Hook::InstanceStart,
        Hook::InstanceStop,
        Hook::InstanceDrop,
        Hook::InstanceUpgrade,
        Hook::InstanceConfigure,
        Hook::InstanceEnv,
        Hook::RoleChange,
        Hook::Role,
        Hook::Rolename,
        Hook::Database,
        Hook::SystemLookup,
        Hook::InterfaceModel,
    ];

    /// Whether the first non-declining implementation settles the call.
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            Hook::Initdb
                | Hook::InstanceInitReplication
                | Hook::ConfigurePostgresql
                | Hook::ConfigureAuth
                | Hook::StartPostgresql
                | Hook::StopPostgresql
                | Hook::RestartPostgresql
                | Hook::ReloadPostgresql
                | Hook::PromotePostgresql
                | Hook::PostgresqlServiceName
                | Hook::PostgresqlEditableConf
                | Hook::StandbyModel
        )
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Position of an implementation among those of the same hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookOrder {
    TryFirst,
    #[default]
    Normal,
    TryLast,
}

/// A component contributing to the instance lifecycle.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hooks this plugin implements. Only these are dispatched to it.
    fn implements(&self) -> &'static [Hook];

    fn order(&self, hook: Hook) -> HookOrder {
        HookOrder::Normal
    }

    /// Initializes the data directory of a new instance.
    fn initdb(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
    ) -> Option<Result<()>> {
        None
    }

    /// Populates the data directory of a new standby from its primary.
    fn instance_init_replication(
        &self,
        ctx: &Context,
        instance: &BaseInstance,
        standby: &StandbyManifest,
    ) -> Option<Result<()>> {
        None
    }

    /// Writes the effective configuration and returns what changed.
    fn configure_postgresql(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        config: &Configuration,
        instance: &BaseInstance,
    ) -> Option<Result<ChangeSet>> {
        None
    }

    /// Writes authentication files; `true` when they changed.
    fn configure_auth(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
    ) -> Option<Result<bool>> {
        None
    }

    /// Settings this plugin needs in the instance configuration.
    fn instance_settings(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
    ) -> Option<Result<Configuration>> {
        None
    }

    /// File users should edit to change the configuration.
    fn postgresql_editable_conf(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<PathBuf>> {
        None
    }

    fn start_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        foreground: bool,
        wait: bool,
    ) -> Option<Result<()>> {
        None
    }

    fn stop_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        mode: StopMode,
        wait: bool,
    ) -> Option<Result<()>> {
        None
    }

    fn restart_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
        mode: StopMode,
        wait: bool,
    ) -> Option<Result<()>> {
        None
    }

    fn reload_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        None
    }

    fn promote_postgresql(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        None
    }

    /// Replication setup of a standby instance.
    fn standby_model(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<StandbyManifest>> {
        None
    }

    /// Name of the service supervising PostgreSQL for this instance.
    fn postgresql_service_name(
        &self,
        ctx: &Context,
        instance: &BaseInstance,
    ) -> Option<Result<String>> {
        None
    }

    fn instance_start(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        None
    }

    fn instance_stop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        None
    }

    fn instance_drop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        None
    }

    fn instance_upgrade(
        &self,
        ctx: &Context,
        old: &PostgreSQLInstance,
        new: &PostgreSQLInstance,
    ) -> Option<Result<()>> {
        None
    }

    /// Called after the instance configuration was written.
    fn instance_configure(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
        config: &Configuration,
        changes: &ChangeSet,
        creating: bool,
        upgrading: bool,
    ) -> Option<Result<()>> {
        None
    }

    /// Environment variables describing the instance for this plugin.
    fn instance_env(
        &self,
        ctx: &Context,
        instance: &Instance,
    ) -> Option<Result<BTreeMap<String, String>>> {
        None
    }

    /// Reacts to a role change; `true` when something changed.
    fn role_change(
        &self,
        ctx: &Context,
        role: &RoleManifest,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<bool>> {
        None
    }

    /// Roles this plugin needs in the instance.
    fn role(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<RoleManifest>>> {
        None
    }

    /// Names of roles this plugin manages.
    fn rolename(&self, ctx: &Context) -> Option<Result<Vec<String>>> {
        None
    }

    /// Databases this plugin needs in the instance.
    fn database(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<DatabaseManifest>>> {
        None
    }

    /// Looks up this plugin's service for an existing instance.
    fn system_lookup(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<Service>> {
        None
    }

    /// Manifest field this plugin adds to instance manifests.
    fn interface_model(&self, ctx: &Context) -> Option<Result<ServiceKind>> {
        None
    }
}

/// Registered plugins and, per hook, their call order.
#[derive(Default)]
pub struct HookManager {
    plugins: Vec<Box<dyn Plugin>>,
    ordered: HashMap<Hook, Vec<usize>>,
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookManager")
            .field("plugins", &self.names())
            .finish()
    }
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin. Fails on a duplicate name or an ordering hint for a
    /// hook the plugin does not implement.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        let name = plugin.name();
        if self.plugins.iter().any(|p| p.name() == name) {
            return Err(Error::Validation(format!(
                "plugin '{}' is already registered",
                name
            )));
        }
        let implemented = plugin.implements();
        for hook in Hook::ALL {
            if plugin.order(*hook) != HookOrder::Normal && !implemented.contains(hook) {
                return Err(Error::Validation(format!(
                    "plugin '{}' declares an ordering hint for hook {} it does not implement",
                    name, hook
                )));
            }
        }

        let index = self.plugins.len();
        for hook in implemented {
            let entries = self.ordered.entry(*hook).or_default();
            entries.push(index);
        }
        log::debug!("registered plugin {}", name);
        self.plugins.push(plugin);

        for (hook, entries) in self.ordered.iter_mut() {
            let plugins = &self.plugins;
            // Stable: registration order is kept within each bucket.
            entries.sort_by_key(|i| plugins[*i].order(*hook));
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    /// Implementations of `hook`, in call order.
    pub fn implementations(&self, hook: Hook) -> impl Iterator<Item = &dyn Plugin> {
        self.ordered
            .get(&hook)
            .into_iter()
            .flatten()
            .map(move |i| self.plugins[*i].as_ref())
    }

    /// Calls `hook` until an implementation returns a result.
    pub fn first<T>(
        &self,
        hook: Hook,
        mut call: impl FnMut(&dyn Plugin) -> Option<Result<T>>,
    ) -> Option<Result<T>> {
        debug_assert!(hook.is_authoritative(), "{} is a broadcast hook", hook);
        for plugin in self.implementations(hook) {
            if let Some(result) = call(plugin) {
                log::trace!("hook {} answered by plugin {}", hook, plugin.name());
                return Some(result);
            }
        }
        None
    }

    /// Calls every implementation of `hook`, collecting results and
    /// stopping at the first error.
    pub fn all<T>(
        &self,
        hook: Hook,
        mut call: impl FnMut(&dyn Plugin) -> Option<Result<T>>,
    ) -> Result<Vec<T>> {
        let mut results = Vec::new();
        for plugin in self.implementations(hook) {
            match call(plugin) {
                Some(Ok(value)) => results.push(value),
                Some(Err(e)) => {
                    log::debug!("hook {} failed in plugin {}: {}", hook, plugin.name(), e);
                    return Err(e);
                }
                None => {}
            }
        }
        Ok(results)
    }
}
