//! Logical dumps of databases, kept in the instance's dumps directory.

use std::fs;
use std::path::Path;

use chrono::{DateTime, FixedOffset, Local, Timelike};

use crate::cmd::Cmd;
use crate::databases;
use crate::db::Session;
use crate::error::{Error, Result};
use crate::model::dump::DATE_FORMAT;
use crate::model::{DatabaseDump, PostgreSQLInstance};

/// Renders one configured command, dropping arguments that end up empty.
fn render_command(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        })
        .filter(|arg| !arg.is_empty())
        .collect()
}

fn command(argv: Vec<String>) -> Result<Cmd> {
    let mut parts = argv.into_iter();
    let program = parts
        .next()
        .ok_or_else(|| Error::Validation("empty dump or restore command".into()))?;
    Ok(Cmd::new(program).args(parts))
}

fn now() -> DateTime<FixedOffset> {
    let now = Local::now().fixed_offset();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Dumps `dbname` with the configured commands and records a manifest.
pub fn dump(session: &Session<'_>, dbname: &str) -> Result<DatabaseDump> {
    if !databases::exists(session, dbname)? {
        return Err(Error::DatabaseNotFound(dbname.to_string()));
    }
    let instance = session.instance();
    let settings = session.ctx().settings();
    let directory = instance.dumps_directory();
    fs::create_dir_all(&directory).map_err(|e| Error::io(&directory, e))?;

    let date = now();
    let formatted = date.format(DATE_FORMAT).to_string();
    let bindir = instance.bindir()?;
    let bindir = bindir.to_string_lossy();
    let path = directory.to_string_lossy();
    let target = session.connect_to(dbname);
    let conninfo = target.conninfo();
    let env = target.environ()?;

    log::info!("backing up database '{}' on instance {}", dbname, instance.base());
    for template in &settings.postgresql.dump_commands {
        let argv = render_command(
            template,
            &[
                ("bindir", &bindir),
                ("path", &path),
                ("dbname", dbname),
                ("date", &formatted),
                ("conninfo", &conninfo),
            ],
        );
        session.ctx().run(&command(argv)?.envs(&env))?;
    }

    let stem = DatabaseDump::stem(dbname, &date);
    let dump = DatabaseDump::new(dbname, date, directory.join(format!("{}.manifest", stem)));
    fs::write(&dump.path, dump.manifest_content()).map_err(|e| Error::io(&dump.path, e))?;
    Ok(dump)
}

fn manifests(directory: &Path) -> Result<Vec<DatabaseDump>> {
    let pattern = directory.join("*.manifest");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern)
        .map_err(|e| Error::Validation(format!("invalid dumps directory pattern: {}", e)))?;
    let mut dumps = Vec::new();
    for path in paths.flatten() {
        match DatabaseDump::from_manifest_path(&path) {
            Ok(dump) => dumps.push(dump),
            Err(e) => log::warn!("ignoring {}: {}", path.display(), e),
        }
    }
    Ok(dumps)
}

/// Dumps of the instance, newest first, optionally restricted to `dbnames`.
pub fn list(instance: &PostgreSQLInstance, dbnames: &[String]) -> Result<Vec<DatabaseDump>> {
    let mut dumps: Vec<DatabaseDump> = manifests(&instance.dumps_directory())?
        .into_iter()
        .filter(|d| dbnames.is_empty() || dbnames.contains(&d.dbname))
        .collect();
    dumps.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.dbname.cmp(&b.dbname)));
    Ok(dumps)
}

/// Restores dump `id`, into `targetdbname` when given (which must exist),
/// else into a database re-created with the dumped name.
pub fn restore(session: &Session<'_>, id: &str, targetdbname: Option<&str>) -> Result<()> {
    let instance = session.instance();
    let dump = list(instance, &[])?
        .into_iter()
        .find(|d| d.id == id)
        .ok_or_else(|| Error::DatabaseDumpNotFound(id.to_string()))?;

    let (target, createoption) = match targetdbname {
        Some(name) => {
            if !databases::exists(session, name)? {
                return Err(Error::DatabaseNotFound(name.to_string()));
            }
            (session.connect_to(name), "")
        }
        None => (session.connect_to("postgres"), "-C"),
    };
    let formatted = dump.date.format(DATE_FORMAT).to_string();
    let bindir = instance.bindir()?;
    let bindir = bindir.to_string_lossy();
    let directory = instance.dumps_directory();
    let path = directory.to_string_lossy();
    let conninfo = target.conninfo();
    let env = target.environ()?;

    log::info!(
        "restoring dump {} of database '{}' on instance {}",
        dump.id,
        dump.dbname,
        instance.base()
    );
    for template in &session.ctx().settings().postgresql.restore_commands {
        let argv = render_command(
            template,
            &[
                ("bindir", &bindir),
                ("path", &path),
                ("dbname", &dump.dbname),
                ("date", &formatted),
                ("conninfo", &conninfo),
                ("createoption", createoption),
            ],
        );
        session.ctx().run(&command(argv)?.envs(&env))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_render_command_substitutes_and_drops_empty() {
        let argv = render_command(
            &template("{bindir}/pg_restore -d {conninfo} {createoption} {path}/{dbname}_{date}.dump"),
            &[
                ("bindir", "/usr/lib/postgresql/16/bin"),
                ("path", "/srv/dumps"),
                ("dbname", "app"),
                ("date", "2024-03-01T10:20:30+01:00"),
                ("conninfo", "host=/run port=5432 dbname=app"),
                ("createoption", ""),
            ],
        );
        assert_eq!(
            argv,
            vec![
                "/usr/lib/postgresql/16/bin/pg_restore",
                "-d",
                "host=/run port=5432 dbname=app",
                "/srv/dumps/app_2024-03-01T10:20:30+01:00.dump",
            ]
        );
    }

    #[test]
    fn test_manifests_skip_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        for (db, date) in [
            ("app", "2024-03-01T10:20:30+01:00"),
            ("app", "2024-03-02T10:20:30+01:00"),
            ("other", "2024-03-01T09:00:00+00:00"),
        ] {
            let date = DateTime::parse_from_rfc3339(date).unwrap();
            let stem = DatabaseDump::stem(db, &date);
            let dump = DatabaseDump::new(db, date, dir.path().join(format!("{}.manifest", stem)));
            fs::write(&dump.path, dump.manifest_content()).unwrap();
        }
        fs::write(dir.path().join("garbage.manifest"), "").unwrap();

        let dumps = manifests(dir.path()).unwrap();
        assert_eq!(dumps.len(), 3);
        assert!(dumps.iter().all(|d| d.id.len() == d.dbname.len() + 11));
    }

    #[test]
    fn test_command_requires_program() {
        assert!(command(Vec::new()).is_err());
        assert_eq!(
            command(vec!["pg_dump".into(), "-Fc".into()]).unwrap().argv(),
            vec!["pg_dump", "-Fc"]
        );
    }
}
