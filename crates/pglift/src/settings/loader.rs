use std::path::{Path, PathBuf};

use serde_json::Value;

use super::Settings;
use crate::error::SettingsError;

pub const SETTINGS_ENV: &str = "SETTINGS";

/// One layer of the settings chain. Earlier layers win; later ones only
/// fill fields left unset.
#[derive(Debug, Clone)]
pub enum SettingsSource {
    /// Values supplied by the caller.
    Value(Value),
    /// The `SETTINGS` environment variable: a JSON literal or `@path`.
    Env,
    /// A YAML file, skipped when absent.
    File(PathBuf),
}

/// Loads settings from the standard chain: `overrides`, `SETTINGS`,
/// `$XDG_CONFIG_HOME/pglift/settings.yaml`, `/etc/pglift/settings.yaml`.
pub fn load(overrides: Option<Value>) -> Result<Settings, SettingsError> {
    let mut sources = Vec::new();
    if let Some(value) = overrides {
        sources.push(SettingsSource::Value(value));
    }
    sources.push(SettingsSource::Env);
    if let Some(config_dir) = dirs::config_dir() {
        sources.push(SettingsSource::File(
            config_dir.join("pglift").join("settings.yaml"),
        ));
    }
    sources.push(SettingsSource::File(PathBuf::from(
        "/etc/pglift/settings.yaml",
    )));
    load_from_sources(&sources)
}

pub fn load_from_sources(sources: &[SettingsSource]) -> Result<Settings, SettingsError> {
    let mut merged = Value::Object(Default::default());
    for source in sources {
        if let Some(value) = read_source(source)? {
            fill_missing(&mut merged, value);
        }
    }
    from_value(merged, "merged sources")
}

/// Loads settings from a single YAML (or JSON) document.
pub fn load_from_str(content: &str) -> Result<Settings, SettingsError> {
    let value = parse_document(content, "string")?;
    from_value(value, "string")
}

fn from_value(value: Value, origin: &str) -> Result<Settings, SettingsError> {
    let mut settings: Settings =
        serde_json::from_value(value).map_err(|e| SettingsError::Parse {
            origin: origin.to_string(),
            message: e.to_string(),
        })?;
    settings.validate()?;
    settings.resolve_paths()?;
    Ok(settings)
}

fn read_source(source: &SettingsSource) -> Result<Option<Value>, SettingsError> {
    match source {
        SettingsSource::Value(value) => Ok(Some(value.clone())),
        SettingsSource::Env => {
            let Ok(raw) = std::env::var(SETTINGS_ENV) else {
                return Ok(None);
            };
            if let Some(path) = raw.strip_prefix('@') {
                let content = read_file(Path::new(path))?;
                return parse_document(&content, path).map(Some);
            }
            parse_document(&raw, SETTINGS_ENV).map(Some)
        }
        SettingsSource::File(path) => {
            if !path.exists() {
                return Ok(None);
            }
            log::debug!("loading settings from {}", path.display());
            let content = read_file(path)?;
            parse_document(&content, &path.display().to_string()).map(Some)
        }
    }
}

fn read_file(path: &Path) -> Result<String, SettingsError> {
    std::fs::read_to_string(path).map_err(|e| SettingsError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

fn parse_document(content: &str, origin: &str) -> Result<Value, SettingsError> {
    // YAML is a superset of JSON, one parser serves both forms.
    let value: Value = serde_yaml::from_str(content).map_err(|e| SettingsError::Parse {
        origin: origin.to_string(),
        message: e.to_string(),
    })?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Default::default())),
        _ => Err(SettingsError::Parse {
            origin: origin.to_string(),
            message: "expecting a mapping at top level".to_string(),
        }),
    }
}

/// Deep merge where `target` keeps every value it already has.
fn fill_missing(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => fill_missing(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target @ Value::Null, source) => *target = source,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn base() -> Value {
        json!({"prefix": "/srv/test", "run_prefix": "/run/test"})
    }

    #[test]
    fn test_fill_missing_keeps_earlier_values() {
        let mut target = json!({"postgresql": {"auth": {"local": "peer"}}});
        fill_missing(
            &mut target,
            json!({"postgresql": {"auth": {"local": "md5", "host": "md5"}, "replrole": "repl"}}),
        );
        assert_eq!(
            target,
            json!({"postgresql": {"auth": {"local": "peer", "host": "md5"}, "replrole": "repl"}})
        );
    }

    #[test]
    fn test_load_resolves_prefixed_paths() {
        let settings = load_from_sources(&[SettingsSource::Value(base())]).unwrap();
        assert_eq!(
            settings.postgresql.datadir,
            PathBuf::from("/srv/test/srv/pgsql/{version}-{name}/data")
        );
        assert_eq!(
            settings.postgresql.socket_directory,
            PathBuf::from("/run/test/postgresql")
        );
        assert_eq!(
            settings.postgresql.ssl_cert_directory,
            PathBuf::from("/srv/test/etc/postgresql/ssl")
        );
    }

    #[test]
    fn test_relative_prefix_rejected() {
        let err = load_from_sources(&[SettingsSource::Value(json!({"prefix": "rel"}))])
            .unwrap_err();
        assert!(err.to_string().contains("prefix"));
    }

    #[test]
    fn test_systemd_user_and_sudo_exclusive() {
        let mut value = base();
        value["systemd"] = json!({"user": true, "sudo": true});
        let err = load_from_sources(&[SettingsSource::Value(value)]).unwrap_err();
        assert!(err.to_string().contains("systemd.sudo"));
    }

    #[test]
    fn test_service_manager_requires_systemd_section() {
        let mut value = base();
        value["service_manager"] = json!("systemd");
        let err = load_from_sources(&[SettingsSource::Value(value.clone())]).unwrap_err();
        assert!(err.to_string().contains("service_manager"));

        value["systemd"] = json!({"user": true});
        assert!(load_from_sources(&[SettingsSource::Value(value)]).is_ok());
    }

    #[test]
    fn test_extra_template_variable_rejected() {
        let mut value = base();
        value["postgresql"] = json!({"logpath": "/var/log/pg/{name}"});
        let err = load_from_sources(&[SettingsSource::Value(value)]).unwrap_err();
        assert!(err.to_string().contains("postgresql.logpath"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut value = base();
        value["nope"] = json!(1);
        assert!(load_from_sources(&[SettingsSource::Value(value)]).is_err());
    }

    #[test]
    #[serial]
    fn test_env_source_json_literal() {
        std::env::set_var(SETTINGS_ENV, r#"{"postgresql": {"replrole": "fromenv"}}"#);
        let settings =
            load_from_sources(&[SettingsSource::Value(base()), SettingsSource::Env]).unwrap();
        std::env::remove_var(SETTINGS_ENV);
        assert_eq!(settings.postgresql.replrole.as_deref(), Some("fromenv"));
    }

    #[test]
    #[serial]
    fn test_env_source_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "postgresql:\n  surole:\n    name: admin\n").unwrap();
        std::env::set_var(SETTINGS_ENV, format!("@{}", path.display()));
        let settings =
            load_from_sources(&[SettingsSource::Value(base()), SettingsSource::Env]).unwrap();
        std::env::remove_var(SETTINGS_ENV);
        assert_eq!(settings.postgresql.surole.name, "admin");
    }

    #[test]
    fn test_file_source_fills_unset_only() {
        use assert_fs::prelude::*;

        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("settings.yaml");
        file.write_str("prefix: /ignored\npostgresql:\n  replrole: fromfile\n")
            .unwrap();
        let settings = load_from_sources(&[
            SettingsSource::Value(base()),
            SettingsSource::File(file.path().to_path_buf()),
            SettingsSource::File(dir.child("missing.yaml").path().to_path_buf()),
        ])
        .unwrap();
        assert_eq!(settings.prefix, PathBuf::from("/srv/test"));
        assert_eq!(settings.postgresql.replrole.as_deref(), Some("fromfile"));
    }

    #[test]
    fn test_load_from_str() {
        let settings = load_from_str("prefix: /p\nrun_prefix: /r\npatroni: {}\n").unwrap();
        let patroni = settings.patroni.unwrap();
        assert_eq!(
            patroni.configpath,
            PathBuf::from("/p/etc/patroni/{version}-{name}.yaml")
        );
        assert_eq!(patroni.loop_wait, 10);
    }
}
