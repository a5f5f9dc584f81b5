//! Prefixed path resolution and `{name}`/`{version}` template handling.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::*;
use crate::error::SettingsError;

static RE_TEMPLATE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("valid template regex"));

/// Which prefix a relative path is resolved against, and under which base directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Data,
    Config,
    Log,
    Run,
}

impl PathKind {
    fn basedir(&self) -> Option<&'static str> {
        match self {
            PathKind::Data => Some("srv"),
            PathKind::Config => Some("etc"),
            PathKind::Log => Some("log"),
            PathKind::Run => None,
        }
    }
}

/// Variables (`{name}`, `{version}`, ...) used in a template string.
pub fn template_variables(value: &str) -> BTreeSet<String> {
    RE_TEMPLATE_VAR
        .captures_iter(value)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Rejects a user value using variables its declared default does not use.
pub fn check_template(field: &str, value: &str, default: &str) -> Result<(), SettingsError> {
    let allowed = template_variables(default);
    let extra: Vec<String> = template_variables(value)
        .into_iter()
        .filter(|v| !allowed.contains(v))
        .collect();
    if extra.is_empty() {
        return Ok(());
    }
    Err(SettingsError::invalid(
        field,
        format!(
            "template variable(s) {} not allowed, expecting a subset of {{{}}}",
            extra
                .iter()
                .map(|v| format!("'{}'", v))
                .collect::<Vec<_>>()
                .join(", "),
            allowed.into_iter().collect::<Vec<_>>().join(", ")
        ),
    ))
}

/// Resolves `path` against the prefix matching `kind`, keeping absolute paths as is.
pub fn resolve(path: &Path, kind: PathKind, prefix: &Path, run_prefix: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match kind.basedir() {
        Some(basedir) => prefix.join(basedir).join(path),
        None => run_prefix.join(path),
    }
}

/// Substitutes `{name}` and `{version}` in a resolved path template.
pub fn render_template(path: &Path, name: &str, version: &str) -> PathBuf {
    PathBuf::from(
        path.to_string_lossy()
            .replace("{name}", name)
            .replace("{version}", version),
    )
}

impl Settings {
    /// Checks template variables then makes every prefixed path absolute.
    pub(crate) fn resolve_paths(&mut self) -> Result<(), SettingsError> {
        let prefix = self.prefix.clone();
        let run_prefix = self.run_prefix.clone();
        let fix = |field: &str, path: &mut PathBuf, default: &str, kind: PathKind| {
            check_template(field, &path.to_string_lossy(), default)?;
            *path = resolve(path, kind, &prefix, &run_prefix);
            Ok::<(), SettingsError>(())
        };

        let pg = &mut self.postgresql;
        fix("postgresql.datadir", &mut pg.datadir, DEFAULT_DATADIR, PathKind::Data)?;
        fix("postgresql.waldir", &mut pg.waldir, DEFAULT_WALDIR, PathKind::Data)?;
        fix("postgresql.logpath", &mut pg.logpath, DEFAULT_PG_LOGPATH, PathKind::Log)?;
        fix(
            "postgresql.socket_directory",
            &mut pg.socket_directory,
            DEFAULT_SOCKET_DIRECTORY,
            PathKind::Run,
        )?;
        fix(
            "postgresql.dumps_directory",
            &mut pg.dumps_directory,
            DEFAULT_DUMPS_DIRECTORY,
            PathKind::Data,
        )?;
        fix(
            "postgresql.ssl_cert_directory",
            &mut pg.ssl_cert_directory,
            DEFAULT_SSL_CERT_DIRECTORY,
            PathKind::Config,
        )?;

        if let Some(patroni) = self.patroni.as_mut() {
            fix(
                "patroni.configpath",
                &mut patroni.configpath,
                DEFAULT_PATRONI_CONFIGPATH,
                PathKind::Config,
            )?;
            fix("patroni.logpath", &mut patroni.logpath, DEFAULT_PATRONI_LOGPATH, PathKind::Log)?;
            fix("patroni.pid_file", &mut patroni.pid_file, DEFAULT_PATRONI_PID_FILE, PathKind::Run)?;
            fix(
                "patroni.postgresql.passfile",
                &mut patroni.postgresql.passfile,
                DEFAULT_PATRONI_PASSFILE,
                PathKind::Config,
            )?;
        }

        if let Some(pgbackrest) = self.pgbackrest.as_mut() {
            fix(
                "pgbackrest.configpath",
                &mut pgbackrest.configpath,
                DEFAULT_PGBACKREST_CONFIGPATH,
                PathKind::Config,
            )?;
            fix(
                "pgbackrest.repository",
                &mut pgbackrest.repository,
                DEFAULT_PGBACKREST_REPOSITORY,
                PathKind::Data,
            )?;
            fix(
                "pgbackrest.logpath",
                &mut pgbackrest.logpath,
                DEFAULT_PGBACKREST_LOGPATH,
                PathKind::Log,
            )?;
            fix(
                "pgbackrest.spoolpath",
                &mut pgbackrest.spoolpath,
                DEFAULT_PGBACKREST_SPOOLPATH,
                PathKind::Data,
            )?;
            fix(
                "pgbackrest.lockpath",
                &mut pgbackrest.lockpath,
                DEFAULT_PGBACKREST_LOCKPATH,
                PathKind::Run,
            )?;
        }

        if let Some(prometheus) = self.prometheus.as_mut() {
            fix(
                "prometheus.configpath",
                &mut prometheus.configpath,
                DEFAULT_PROMETHEUS_CONFIGPATH,
                PathKind::Config,
            )?;
            fix(
                "prometheus.pid_file",
                &mut prometheus.pid_file,
                DEFAULT_PROMETHEUS_PID_FILE,
                PathKind::Run,
            )?;
        }

        if let Some(temboard) = self.temboard.as_mut() {
            fix(
                "temboard.configpath",
                &mut temboard.configpath,
                DEFAULT_TEMBOARD_CONFIGPATH,
                PathKind::Config,
            )?;
            fix(
                "temboard.pid_file",
                &mut temboard.pid_file,
                DEFAULT_TEMBOARD_PID_FILE,
                PathKind::Run,
            )?;
            fix("temboard.logpath", &mut temboard.logpath, DEFAULT_TEMBOARD_LOGPATH, PathKind::Log)?;
            fix("temboard.home", &mut temboard.home, DEFAULT_TEMBOARD_HOME, PathKind::Data)?;
            fix(
                "temboard.signing_key",
                &mut temboard.signing_key,
                DEFAULT_TEMBOARD_SIGNING_KEY,
                PathKind::Config,
            )?;
        }

        Ok(())
    }
}
