//! Prometheus postgres_exporter plugin: one exporter per instance, started
//! and stopped along with it.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::conf::{ChangeSet, Configuration};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::{Hook, Plugin};
use crate::model::services::PostgresExporter;
use crate::model::{
    BaseInstance, Instance, InstanceManifest, PostgreSQLInstance, RoleManifest, Service,
    ServiceKind,
};
use crate::postgresql::uses_systemd;
use crate::service::Runnable;
use crate::settings::PrometheusSettings;

fn site(ctx: &Context) -> Result<&PrometheusSettings> {
    ctx.settings()
        .prometheus
        .as_ref()
        .ok_or_else(|| Error::Unsupported("Prometheus is not enabled in site settings".into()))
}

pub fn configpath(settings: &PrometheusSettings, instance: &BaseInstance) -> PathBuf {
    instance.render(&settings.configpath)
}

/// `KEY=value` lines of the exporter environment file.
fn parse_config(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('\'').to_string()))
        .collect()
}

fn render_config(vars: &BTreeMap<String, String>) -> String {
    vars.iter()
        .map(|(k, v)| {
            if v.contains(' ') {
                format!("{}='{}'\n", k, v)
            } else {
                format!("{}={}\n", k, v)
            }
        })
        .collect()
}

fn listen_port(opts: &str) -> Option<u16> {
    let mut words = opts.split_whitespace();
    while let Some(word) = words.next() {
        let address = match word.strip_prefix("--web.listen-address=") {
            Some(address) => address,
            None if word == "--web.listen-address" => words.next()?,
            None => continue,
        };
        return address.rsplit_once(':').and_then(|(_, p)| p.parse().ok());
    }
    None
}

/// Environment of the exporter connecting to `instance`.
fn config_vars(
    settings: &PrometheusSettings,
    instance: &BaseInstance,
    socket_directory: &Path,
    pg_port: u16,
    port: u16,
    password: Option<&str>,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::from([
        (
            "DATA_SOURCE_NAME".to_string(),
            format!(
                "postgresql://{}@:{}/postgres?host={}&sslmode=disable",
                settings.role,
                pg_port,
                socket_directory.display()
            ),
        ),
        (
            "POSTGRES_EXPORTER_OPTS".to_string(),
            format!("--web.listen-address :{} --log.level info", port),
        ),
        ("INSTANCE".to_string(), instance.qualname()),
    ]);
    if let Some(password) = password {
        vars.insert("PGPASSWORD".to_string(), password.to_string());
    }
    vars
}

fn write_config(path: &Path, vars: &BTreeMap<String, String>) -> Result<bool> {
    let content = render_config(vars);
    match fs::read_to_string(path) {
        Ok(existing) if existing == content => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(path, e)),
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| Error::io(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| Error::io(path, e))?;
    Ok(true)
}

/// postgres_exporter as a supervised process.
pub struct ExporterService {
    qualname: String,
    execpath: PathBuf,
    pidfile: PathBuf,
    vars: BTreeMap<String, String>,
}

impl ExporterService {
    pub fn new(settings: &PrometheusSettings, instance: &BaseInstance) -> Result<Self> {
        let path = configpath(settings, instance);
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Ok(Self {
            qualname: instance.qualname(),
            execpath: settings.execpath.clone(),
            pidfile: instance.render(&settings.pid_file),
            vars: parse_config(&content),
        })
    }
}

impl Runnable for ExporterService {
    fn service_name(&self) -> &'static str {
        "prometheus_postgres_exporter"
    }

    fn qualname(&self) -> String {
        self.qualname.clone()
    }

    fn args(&self) -> Result<Vec<String>> {
        let mut args = vec![self.execpath.to_string_lossy().into_owned()];
        if let Some(opts) = self.vars.get("POSTGRES_EXPORTER_OPTS") {
            args.extend(opts.split_whitespace().map(String::from));
        }
        Ok(args)
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .filter(|(k, _)| *k != "POSTGRES_EXPORTER_OPTS")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn pidfile(&self) -> PathBuf {
        self.pidfile.clone()
    }
}

fn setup(ctx: &Context, manifest: &InstanceManifest, instance: &BaseInstance) -> Result<()> {
    let settings = site(ctx)?;
    let Some(exporter) = &manifest.prometheus else {
        return Ok(());
    };
    let vars = config_vars(
        settings,
        instance,
        &instance.render(&ctx.settings().postgresql.socket_directory),
        manifest.port(),
        exporter.port,
        exporter.password.as_ref().map(|p| p.expose()),
    );
    let path = configpath(settings, instance);
    if write_config(&path, &vars)? {
        log::info!("configured postgres_exporter for {} on port {}", instance, exporter.port);
    }
    if uses_systemd(ctx.settings()) {
        let service = ExporterService::new(settings, instance)?;
        ctx.service_manager().enable(ctx.runner(), &service)?;
    }
    Ok(())
}

fn start(ctx: &Context, instance: &Instance) -> Result<()> {
    let service = ExporterService::new(site(ctx)?, instance)?;
    log::info!("starting postgres_exporter for {}", instance.base());
    ctx.service_manager().start(ctx.runner(), &service)
}

fn stop(ctx: &Context, instance: &Instance) -> Result<()> {
    let service = ExporterService::new(site(ctx)?, instance)?;
    log::info!("stopping postgres_exporter for {}", instance.base());
    ctx.service_manager().stop(ctx.runner(), &service)
}

fn remove(ctx: &Context, instance: &Instance, exporter: &PostgresExporter) -> Result<()> {
    let service = ExporterService::new(site(ctx)?, instance)?;
    ctx.service_manager().stop(ctx.runner(), &service)?;
    if uses_systemd(ctx.settings()) {
        ctx.service_manager().disable(ctx.runner(), &service)?;
    }
    match fs::remove_file(&exporter.configpath) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&exporter.configpath, e)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusPlugin;

impl Plugin for PrometheusPlugin {
    fn name(&self) -> &'static str {
        "prometheus"
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
        manifest.prometheus.as_ref()?;
        Some(setup(ctx, manifest, instance))
    }

    fn instance_start(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        instance.service::<PostgresExporter>().ok()?;
        Some(start(ctx, instance))
    }

    fn instance_stop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        instance.service::<PostgresExporter>().ok()?;
        Some(stop(ctx, instance))
    }

    fn instance_drop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        let exporter = instance.service::<PostgresExporter>().ok()?;
        Some(remove(ctx, instance, exporter))
    }

    fn role(
        &self,
        ctx: &Context,
        manifest: &InstanceManifest,
    ) -> Option<Result<Vec<RoleManifest>>> {
        let exporter = manifest.prometheus.as_ref()?;
        Some(site(ctx).map(|settings| {
            let mut role = RoleManifest::new(settings.role.clone());
            role.login = true;
            role.password = exporter.password.clone();
            role.in_roles = vec!["pg_monitor".to_string()];
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
        let settings = ctx.settings().prometheus.as_ref()?;
        let path = configpath(settings, instance);
        if !path.exists() {
            return None;
        }
        let result = fs::read_to_string(&path)
            .map_err(|e| Error::io(&path, e))
            .and_then(|content| {
                let vars = parse_config(&content);
                let port = vars
                    .get("POSTGRES_EXPORTER_OPTS")
                    .and_then(|opts| listen_port(opts))
                    .ok_or_else(|| Error::Configuration {
                        path: path.clone(),
                        message: "no listen address in POSTGRES_EXPORTER_OPTS".into(),
                    })?;
                Ok(Service::Prometheus(PostgresExporter {
                    name: instance.qualname(),
                    port,
                    configpath: path.clone(),
                }))
            });
        Some(result)
    }

    fn interface_model(&self, _ctx: &Context) -> Option<Result<ServiceKind>> {
        Some(Ok(ServiceKind::Prometheus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let value = serde_json::json!({
            "prefix": dir.path().join("pfx"),
            "run_prefix": dir.path().join("run"),
            "postgresql": {"auth": {"passfile": null}},
            "prometheus": {},
        });
        let site = std::sync::Arc::new(
            crate::settings::load_from_sources(&[crate::settings::SettingsSource::Value(value)])
                .unwrap(),
        );
        let settings = site.prometheus.clone().unwrap();
        let instance =
            BaseInstance::new("main", crate::version::Version::new(16).unwrap(), site).unwrap();
        let vars = config_vars(&settings, &instance, Path::new("/run/pg"), 5433, 9188, Some("pw"));
        let path = dir.path().join("exporter.conf");
        assert!(write_config(&path, &vars).unwrap());
        assert!(!write_config(&path, &vars).unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let read = parse_config(&fs::read_to_string(&path).unwrap());
        assert_eq!(read, vars);
        assert_eq!(
            read["DATA_SOURCE_NAME"],
            "postgresql://prometheus@:5433/postgres?host=/run/pg&sslmode=disable"
        );
        assert_eq!(listen_port(&read["POSTGRES_EXPORTER_OPTS"]), Some(9188));
    }

    #[test]
    fn test_listen_port_forms() {
        assert_eq!(listen_port("--web.listen-address=:9187"), Some(9187));
        assert_eq!(listen_port("--log.level info --web.listen-address 0.0.0.0:9200"), Some(9200));
        assert_eq!(listen_port("--log.level info"), None);
    }
}
