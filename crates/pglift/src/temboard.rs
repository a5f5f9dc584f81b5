//! temBoard agent plugin.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::conf::{ChangeSet, Configuration};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::{Hook, Plugin};
use crate::ini::Ini;
use crate::model::services::TemboardAgent;
use crate::model::{
    BaseInstance, Instance, InstanceManifest, PostgreSQLInstance, RoleManifest, Service,
    ServiceKind,
};
use crate::postgresql::uses_systemd;
use crate::service::Runnable;
use crate::settings::TemboardSettings;

fn site(ctx: &Context) -> Result<&TemboardSettings> {
    ctx.settings()
        .temboard
        .as_ref()
        .ok_or_else(|| Error::Unsupported("temBoard is not enabled in site settings".into()))
}

pub fn configpath(settings: &TemboardSettings, instance: &BaseInstance) -> PathBuf {
    instance.render(&settings.configpath)
}

fn agent_config(
    ctx: &Context,
    settings: &TemboardSettings,
    manifest: &InstanceManifest,
    instance: &BaseInstance,
) -> Ini {
    let agent = manifest.temboard.clone().unwrap_or_default();
    let mut ini = Ini::new();
    ini.set("temboard", "ui_url", settings.ui_url.clone());
    ini.set(
        "temboard",
        "signing_public_key",
        settings.signing_key.to_string_lossy(),
    );
    ini.set("temboard", "home", instance.render(&settings.home).to_string_lossy());
    ini.set("temboard", "hostname", crate::hostname());
    ini.set("temboard", "port", agent.port.to_string());
    if let Some(certificate) = &settings.certificate {
        ini.set("temboard", "ssl_cert_file", certificate.cert.to_string_lossy());
        ini.set("temboard", "ssl_key_file", certificate.key.to_string_lossy());
        if let Some(ca_cert) = &certificate.ca_cert {
            ini.set("temboard", "ssl_ca_cert_file", ca_cert.to_string_lossy());
        }
    }
    ini.set(
        "postgresql",
        "host",
        instance
            .render(&ctx.settings().postgresql.socket_directory)
            .to_string_lossy(),
    );
    ini.set("postgresql", "port", manifest.port().to_string());
    ini.set("postgresql", "user", settings.role.clone());
    if let Some(password) = &agent.password {
        ini.set("postgresql", "password", password.expose());
    }
    ini.set("postgresql", "instance", instance.qualname());
    ini.set("logging", "method", "file");
    ini.set(
        "logging",
        "destination",
        settings
            .logpath
            .join(format!("temboard-agent-{}.log", instance.qualname()))
            .to_string_lossy(),
    );
    ini
}

/// temBoard agent as a supervised process.
pub struct AgentService {
    qualname: String,
    execpath: PathBuf,
    configpath: PathBuf,
    pidfile: PathBuf,
}

impl AgentService {
    pub fn new(settings: &TemboardSettings, instance: &BaseInstance) -> Self {
        Self {
            qualname: instance.qualname(),
            execpath: settings.execpath.clone(),
            configpath: configpath(settings, instance),
            pidfile: instance.render(&settings.pid_file),
        }
    }
}

impl Runnable for AgentService {
    fn service_name(&self) -> &'static str {
        "temboard_agent"
    }

    fn qualname(&self) -> String {
        self.qualname.clone()
    }

    fn args(&self) -> Result<Vec<String>> {
        Ok(vec![
            self.execpath.to_string_lossy().into_owned(),
            "--config".to_string(),
            self.configpath.to_string_lossy().into_owned(),
        ])
    }

    fn pidfile(&self) -> PathBuf {
        self.pidfile.clone()
    }
}

fn setup(ctx: &Context, manifest: &InstanceManifest, instance: &BaseInstance) -> Result<()> {
    let settings = site(ctx)?;
    let content = agent_config(ctx, settings, manifest, instance).render();
    let path = configpath(settings, instance);
    let unchanged = fs::read_to_string(&path).is_ok_and(|existing| existing == content);
    if !unchanged {
        let dirs = [
            path.parent().map(PathBuf::from),
            Some(instance.render(&settings.home)),
            Some(settings.logpath.clone()),
        ];
        for dir in dirs.into_iter().flatten() {
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(&path, e))?;
        log::info!("configured temBoard agent for {}", instance);
    }
    if uses_systemd(ctx.settings()) {
        ctx.service_manager()
            .enable(ctx.runner(), &AgentService::new(settings, instance))?;
    }
    Ok(())
}

fn remove(ctx: &Context, instance: &Instance, agent: &TemboardAgent) -> Result<()> {
    let settings = site(ctx)?;
    let service = AgentService::new(settings, instance);
    ctx.service_manager().stop(ctx.runner(), &service)?;
    if uses_systemd(ctx.settings()) {
        ctx.service_manager().disable(ctx.runner(), &service)?;
    }
    match fs::remove_file(&agent.configpath) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(&agent.configpath, e)),
    }
    let home = instance.render(&settings.home);
    match fs::remove_dir_all(&home) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&home, e)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TemboardPlugin;

impl Plugin for TemboardPlugin {
    fn name(&self) -> &'static str {
        "temboard"
    }

    fn implements(&self) -> &'static [Hook] {
        &[
            Hook::InstanceConfigure,
            Hook::InstanceStart,
            Hook::InstanceStop,
            Hook::InstanceDrop,
            Hook::Role,
            Hook::Rolename,
            Hook::SystemLookup,
            Hook::InterfaceModel,
        ]
    }

    fn instance_configure(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
        instance: &BaseInstance,
        _config: &Configuration,
        _changes: &ChangeSet,
        _creating: bool,
        _upgrading: bool,
    ) -> Option<Result<()>> {
        manifest.temboard.as_ref()?;
        Some(setup(ctx, manifest, instance))
    }

    fn instance_start(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        instance.service::<TemboardAgent>().ok()?;
        Some(site(ctx).and_then(|settings| {
            log::info!("starting temBoard agent for {}", instance.base());
            ctx.service_manager()
                .start(ctx.runner(), &AgentService::new(settings, instance))
        }))
    }

    fn instance_stop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        instance.service::<TemboardAgent>().ok()?;
        Some(site(ctx).and_then(|settings| {
            log::info!("stopping temBoard agent for {}", instance.base());
            ctx.service_manager()
                .stop(ctx.runner(), &AgentService::new(settings, instance))
        }))
    }

    fn instance_drop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        let agent = instance.service::<TemboardAgent>().ok()?;
        Some(remove(ctx, instance, agent))
    }

    fn role(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<RoleManifest>>> {
        let agent = manifest.temboard.as_ref()?;
        Some(site(ctx).map(|settings| {
            let mut role = RoleManifest::new(settings.role.clone());
            role.login = true;
            role.superuser = true;
            role.password = agent.password.clone();
            vec![role]
        }))
    }

    fn rolename(&self, ctx: &Context) -> Option<Result<Vec<String>>> {
        Some(site(ctx).map(|s| vec![s.role.clone()]))
    }

    fn system_lookup(
        &self,
        ctx: &Context,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<Service>> {
        let settings = ctx.settings().temboard.as_ref()?;
        let path = configpath(settings, instance);
        if !path.exists() {
            return None;
        }
        let result = Ini::read(&path).and_then(|ini| {
            let port = ini
                .get("temboard", "port")
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::Configuration {
                    path: path.clone(),
                    message: "missing or invalid temboard.port".into(),
                })?;
            Ok(Service::Temboard(TemboardAgent {
                port,
                configpath: path.clone(),
            }))
        });
        Some(result)
    }

    fn interface_model(&self, _ctx: &Context) -> Option<Result<ServiceKind>> {
        Some(Ok(ServiceKind::Temboard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TemboardManifest;
    use crate::settings::{load_from_sources, SettingsSource};
    use std::sync::Arc;

    #[test]
    fn test_agent_config() {
        let dir = tempfile::tempdir().unwrap();
        let value = serde_json::json!({
            "prefix": dir.path().join("pfx"),
            "run_prefix": dir.path().join("run"),
            "postgresql": {"auth": {"passfile": null}},
            "temboard": {"ui_url": "https://ui.example:8888"},
        });
        let site = Arc::new(load_from_sources(&[SettingsSource::Value(value)]).unwrap());
        let ctx = Context::builder(Arc::clone(&site))
            .without_default_plugins()
            .build()
            .unwrap();
        let instance =
            BaseInstance::new("main", crate::version::Version::new(16).unwrap(), site).unwrap();
        let mut manifest = InstanceManifest::new("main");
        manifest.port = Some(5440);
        manifest.temboard = Some(TemboardManifest {
            port: 2400,
            password: Some(crate::model::Password::new("agentpw")),
        });
        let settings = ctx.settings().temboard.clone().unwrap();
        let ini = agent_config(&ctx, &settings, &manifest, &instance);
        assert_eq!(ini.get("temboard", "ui_url"), Some("https://ui.example:8888"));
        assert_eq!(ini.get("temboard", "port"), Some("2400"));
        assert_eq!(ini.get("postgresql", "port"), Some("5440"));
        assert_eq!(ini.get("postgresql", "user"), Some("temboardagent"));
        assert_eq!(ini.get("postgresql", "password"), Some("agentpw"));
        assert_eq!(ini.get("postgresql", "instance"), Some("16-main"));
        assert!(ini
            .get("logging", "destination")
            .is_some_and(|d| d.ends_with("temboard-agent-16-main.log")));
    }
}
