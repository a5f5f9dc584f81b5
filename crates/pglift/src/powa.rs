//! PoWA plugin: statistics extensions preloaded, a repository database and
//! the role owning it.

use crate::conf::{Configuration, Value};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::{Hook, Plugin};
use crate::model::services::Powa;
use crate::model::{
    BaseInstance, DatabaseManifest, InstanceManifest, PostgreSQLInstance, RoleManifest, Service,
    ServiceKind,
};
use crate::settings::PowaSettings;

const PRELOAD_LIBRARIES: &[&str] = &["pg_stat_statements", "pg_qualstats", "pg_stat_kcache"];

/// Creation order matters: powa depends on the others.
const EXTENSIONS: &[&str] = &[
    "btree_gist",
    "pg_qualstats",
    "pg_stat_statements",
    "pg_stat_kcache",
    "powa",
];

fn site(ctx: &Context) -> Result<&PowaSettings> {
    ctx.settings()
        .powa
        .as_ref()
        .ok_or_else(|| Error::Unsupported("PoWA is not enabled in site settings".into()))
}

fn preloaded(config: &Configuration) -> bool {
    let Some(value) = config.get("shared_preload_libraries") else {
        return false;
    };
    let loaded: Vec<String> = value
        .as_plain()
        .split(',')
        .map(|l| l.trim().to_string())
        .collect();
    ["pg_qualstats", "pg_stat_kcache"]
        .iter()
        .all(|lib| loaded.iter().any(|l| l == lib))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PowaPlugin;

impl Plugin for PowaPlugin {
    fn name(&self) -> &'static str {
        "powa"
    }

    fn implements(&self) -> &'static [Hook] {
        &[
            Hook::InstanceSettings,
            Hook::Role,
            Hook::Rolename,
            Hook::Database,
            Hook::SystemLookup,
            Hook::InterfaceModel,
        ]
    }

    fn instance_settings(
        &self,
        _ctx: &Context,
        manifest: &InstanceManifest,
        _instance: &BaseInstance,
    ) -> Option<Result<Configuration>> {
        manifest.powa.as_ref()?;
        Some(Ok(Configuration::from_iter([(
            "shared_preload_libraries".to_string(),
            Value::Str(PRELOAD_LIBRARIES.join(", ")),
        )])))
    }

    fn role(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<RoleManifest>>> {
        let powa = manifest.powa.as_ref()?;
        Some(site(ctx).map(|settings| {
            let mut role = RoleManifest::new(settings.role.clone());
            role.login = true;
            role.superuser = true;
            role.password = powa.password.clone();
            vec![role]
        }))
    }

    fn rolename(&self, ctx: &Context) -> Option<Result<Vec<String>>> {
        Some(site(ctx).map(|s| vec![s.role.clone()]))
    }

    fn database(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<DatabaseManifest>>> {
        manifest.powa.as_ref()?;
        Some(site(ctx).map(|settings| {
            let mut database = DatabaseManifest::new(settings.dbname.clone());
            database.owner = Some(settings.role.clone());
            database.extensions = Some(EXTENSIONS.iter().map(|e| e.to_string()).collect());
            vec![database]
        }))
    }

    fn system_lookup(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<Service>> {
        let settings = ctx.settings().powa.as_ref()?;
        if !preloaded(instance.config()) {
            return None;
        }
        Some(Ok(Service::Powa(Powa {
            dbname: settings.dbname.clone(),
        })))
    }

    fn interface_model(&self, _ctx: &Context) -> Option<Result<ServiceKind>> {
        Some(Ok(ServiceKind::Powa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preloaded() {
        let config: Configuration = [(
            "shared_preload_libraries".to_string(),
            Value::Str("pg_stat_statements,pg_qualstats, pg_stat_kcache".into()),
        )]
        .into_iter()
        .collect();
        assert!(preloaded(&config));

        let partial: Configuration = [(
            "shared_preload_libraries".to_string(),
            Value::Str("pg_stat_statements".into()),
        )]
        .into_iter()
        .collect();
        assert!(!preloaded(&partial));
        assert!(!preloaded(&Configuration::default()));
    }

    #[test]
    fn test_extensions_end_with_powa() {
        assert_eq!(EXTENSIONS.last(), Some(&"powa"));
        for lib in PRELOAD_LIBRARIES {
            assert!(EXTENSIONS.contains(lib));
        }
    }
}
