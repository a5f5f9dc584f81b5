//! Databases of an instance.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::cmd::{self, Cmd};
use crate::conf::{values_equal, Value};
use crate::db::{self, quote_ident, quote_literal, quote_setting_name, Session};
use crate::error::{Error, Result};
use crate::model::{ApplyResult, ChangeState, CloneSource, Database, DatabaseManifest, PresenceState};

/// Extensions never dropped when syncing a database's extension list.
const PINNED_EXTENSIONS: &[&str] = &["plpgsql"];

#[derive(Deserialize)]
struct DatabaseRow {
    name: String,
    owner: String,
    encoding: Option<String>,
    size: Option<i64>,
    #[serde(default)]
    settings: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct NameRow {
    name: String,
}

const DATABASE_QUERY: &str = "SELECT d.datname AS name, r.rolname AS owner, \
    pg_catalog.pg_encoding_to_char(d.encoding) AS encoding, \
    pg_catalog.pg_database_size(d.oid) AS size, \
    coalesce((SELECT json_object_agg(split_part(c, '=', 1), substring(c FROM position('=' IN c) + 1)) \
              FROM pg_catalog.pg_db_role_setting s, unnest(s.setconfig) c \
              WHERE s.setdatabase = d.oid AND s.setrole = 0), '{}'::json) AS settings \
    FROM pg_catalog.pg_database d JOIN pg_catalog.pg_roles r ON r.oid = d.datdba";

pub fn exists(session: &Session<'_>, name: &str) -> Result<bool> {
    let row: Option<NameRow> = session.query_one(&format!(
        "SELECT datname AS name FROM pg_catalog.pg_database WHERE datname = {}",
        quote_literal(name)
    ))?;
    Ok(row.is_some())
}

fn extensions(session: &Session<'_>, dbname: &str) -> Result<Vec<String>> {
    let rows: Vec<NameRow> = session
        .connect_to(dbname)
        .query("SELECT extname AS name FROM pg_catalog.pg_extension ORDER BY extname")?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}

fn schemas(session: &Session<'_>, dbname: &str) -> Result<Vec<String>> {
    let rows: Vec<NameRow> = session.connect_to(dbname).query(
        "SELECT nspname AS name FROM pg_catalog.pg_namespace \
         WHERE nspname NOT LIKE 'pg\\_%' AND nspname <> 'information_schema' \
         ORDER BY nspname",
    )?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}

fn to_database(session: &Session<'_>, row: DatabaseRow) -> Result<Database> {
    Ok(Database {
        extensions: extensions(session, &row.name)?,
        schemas: schemas(session, &row.name)?,
        settings: row
            .settings
            .into_iter()
            .map(|(k, v)| (k, Value::parse(&v)))
            .collect(),
        name: row.name,
        owner: row.owner,
        encoding: row.encoding,
        size: row.size,
    })
}

pub fn get(session: &Session<'_>, name: &str) -> Result<Database> {
    let row: Option<DatabaseRow> = session.query_one(&format!(
        "{} WHERE d.datname = {}",
        DATABASE_QUERY,
        quote_literal(name)
    ))?;
    let row = row.ok_or_else(|| Error::DatabaseNotFound(name.to_string()))?;
    to_database(session, row)
}

/// Names of connectable, non-template databases.
fn names(session: &Session<'_>) -> Result<Vec<String>> {
    let rows: Vec<NameRow> = session.query(
        "SELECT datname AS name FROM pg_catalog.pg_database \
         WHERE datallowconn AND NOT datistemplate ORDER BY datname",
    )?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}

/// Databases matching `dbnames` (all when empty), minus `exclude`.
fn selection(session: &Session<'_>, dbnames: &[String], exclude: &[String]) -> Result<Vec<String>> {
    let all = names(session)?;
    if let Some(missing) = dbnames.iter().find(|n| !all.contains(n)) {
        return Err(Error::DatabaseNotFound(missing.clone()));
    }
    Ok(all
        .into_iter()
        .filter(|n| dbnames.is_empty() || dbnames.contains(n))
        .filter(|n| !exclude.contains(n))
        .collect())
}

pub fn list(session: &Session<'_>, dbnames: &[String], exclude: &[String]) -> Result<Vec<Database>> {
    selection(session, dbnames, exclude)?
        .iter()
        .map(|name| get(session, name))
        .collect()
}

fn create(session: &Session<'_>, manifest: &DatabaseManifest) -> Result<()> {
    log::info!("creating '{}' database", manifest.name);
    let mut sql = format!("CREATE DATABASE {}", quote_ident(&manifest.name));
    if let Some(owner) = &manifest.owner {
        sql.push_str(&format!(" OWNER {}", quote_ident(owner)));
    }
    session.execute(&sql)
}

/// Statements bringing `current` settings to the desired ones.
fn settings_statements(
    dbname: &str,
    current: &BTreeMap<String, Value>,
    desired: &BTreeMap<String, Option<Value>>,
) -> Vec<String> {
    let db = quote_ident(dbname);
    if desired.is_empty() {
        if current.is_empty() {
            return Vec::new();
        }
        return vec![format!("ALTER DATABASE {} RESET ALL", db)];
    }
    let mut statements = Vec::new();
    for (name, value) in desired {
        match value {
            None if current.contains_key(name) => {
                statements.push(format!(
                    "ALTER DATABASE {} RESET {}",
                    db,
                    quote_setting_name(name)
                ));
            }
            None => {}
            Some(value) => {
                if current.get(name).is_some_and(|c| values_equal(c, value)) {
                    continue;
                }
                statements.push(format!(
                    "ALTER DATABASE {} SET {} TO {}",
                    db,
                    quote_setting_name(name),
                    quote_literal(&value.as_plain())
                ));
            }
        }
    }
    statements
}

/// `(create, drop)` lists syncing installed extensions with the desired ones.
fn extension_changes(current: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let create = desired
        .iter()
        .filter(|e| !current.contains(e))
        .cloned()
        .collect();
    let drop = current
        .iter()
        .filter(|e| !desired.contains(e) && !PINNED_EXTENSIONS.contains(&e.as_str()))
        .cloned()
        .collect();
    (create, drop)
}

/// Brings settings, extensions and schemas in line; `true` on change.
fn sync(session: &Session<'_>, manifest: &DatabaseManifest, current: &Database) -> Result<bool> {
    let mut changed = false;
    if let Some(desired) = &manifest.settings {
        let statements = settings_statements(&manifest.name, &current.settings, desired);
        if !statements.is_empty() {
            log::info!("setting configuration of '{}' database", manifest.name);
            session.execute_all(&statements)?;
            changed = true;
        }
    }
    let target = session.connect_to(&manifest.name);
    if let Some(desired) = &manifest.extensions {
        let (create, drop) = extension_changes(&current.extensions, desired);
        for name in &create {
            log::info!("creating extension '{}' in '{}' database", name, manifest.name);
            target.execute(&format!(
                "CREATE EXTENSION IF NOT EXISTS {} CASCADE",
                quote_ident(name)
            ))?;
        }
        for name in &drop {
            log::info!("dropping extension '{}' from '{}' database", name, manifest.name);
            target.execute(&format!("DROP EXTENSION IF EXISTS {} CASCADE", quote_ident(name)))?;
        }
        changed |= !create.is_empty() || !drop.is_empty();
    }
    for schema in manifest.schemas.iter().flatten() {
        if !current.schemas.contains(schema) {
            log::info!("creating schema '{}' in '{}' database", schema, manifest.name);
            target.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))?;
            changed = true;
        }
    }
    Ok(changed)
}

/// Creates, alters or drops a database to match `manifest`.
pub fn apply(session: &Session<'_>, manifest: &DatabaseManifest) -> Result<ApplyResult> {
    manifest.validate()?;
    let existing = exists(session, &manifest.name)?;
    match (manifest.state, existing) {
        (PresenceState::Absent, true) => {
            drop(session, &manifest.name, manifest.force_drop)?;
            Ok(ApplyResult::new(Some(ChangeState::Dropped)))
        }
        (PresenceState::Absent, false) => Ok(ApplyResult::new(None)),
        (PresenceState::Present, false) => {
            create(session, manifest)?;
            if let Some(source) = &manifest.clone_from {
                clone(session, &manifest.name, source)?;
            }
            let current = get(session, &manifest.name)?;
            sync(session, manifest, &current)?;
            Ok(ApplyResult::new(Some(ChangeState::Created)))
        }
        (PresenceState::Present, true) => {
            let current = get(session, &manifest.name)?;
            let mut changed = false;
            if let Some(owner) = &manifest.owner {
                if owner != &current.owner {
                    log::info!("altering '{}' database owner", manifest.name);
                    session.execute(&format!(
                        "ALTER DATABASE {} OWNER TO {}",
                        quote_ident(&manifest.name),
                        quote_ident(owner)
                    ))?;
                    changed = true;
                }
            }
            changed |= sync(session, manifest, &current)?;
            Ok(ApplyResult::new(changed.then_some(ChangeState::Changed)))
        }
    }
}

pub fn drop(session: &Session<'_>, name: &str, force: bool) -> Result<()> {
    if !exists(session, name)? {
        return Err(Error::DatabaseNotFound(name.to_string()));
    }
    let mut sql = format!("DROP DATABASE {}", quote_ident(name));
    if force {
        if session.instance().version.major() < 13 {
            return Err(Error::Unsupported(format!(
                "force drop of a database requires PostgreSQL 13 or later (instance is {})",
                session.instance().version
            )));
        }
        sql.push_str(" WITH (FORCE)");
    }
    log::info!("dropping '{}' database", name);
    session.execute(&sql)
}

/// Runs `sql` in each selected database, collecting rows per database.
///
/// Statements not returning rows yield an empty list.
pub fn run(
    session: &Session<'_>,
    sql: &str,
    dbnames: &[String],
    exclude: &[String],
) -> Result<BTreeMap<String, Vec<serde_json::Value>>> {
    let mut results = BTreeMap::new();
    for dbname in selection(session, dbnames, exclude)? {
        log::info!("running \"{}\" on {} database", crate::sanitize::redact_sql(sql), dbname);
        let target = session.connect_to(&dbname);
        let rows = if db::returns_rows(sql) {
            target.query(sql)?
        } else {
            target.execute(sql)?;
            Vec::new()
        };
        results.insert(dbname, rows);
    }
    Ok(results)
}

/// Copies `source` into the (empty, freshly created) `target` database.
///
/// The target is dropped when the copy fails.
pub fn clone(session: &Session<'_>, target: &str, source: &CloneSource) -> Result<()> {
    log::info!("cloning '{}' database from {}", target, crate::sanitize::redact_conninfo(&source.dsn));
    let instance = session.instance();
    let mut dump = Cmd::new(instance.bin("pg_dump")?);
    if source.schema_only {
        dump = dump.arg("--schema-only");
    }
    let dump = dump.arg("-d").arg(&source.dsn);
    let target_session = session.connect_to(target);
    let restore = Cmd::new(instance.bin("psql")?)
        .args(["-X", "-q", "-v", "ON_ERROR_STOP=1"])
        .arg("-d")
        .arg(target_session.conninfo())
        .envs(&target_session.environ()?);
    if let Err(e) = cmd::pipe(session.ctx().runner(), &dump, &restore) {
        log::warn!("clone of '{}' failed, dropping it", target);
        if let Err(drop_error) = drop(session, target, false) {
            log::error!("failed to drop '{}' database: {}", target, drop_error);
        }
        return Err(e);
    }
    Ok(())
}
