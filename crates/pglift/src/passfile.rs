//! The libpq password file and role password lookup.
//!
//! Entries written by the engine are keyed by `(port, username)` with `*`
//! for host and database.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::cmd::Cmd;
use crate::conf::{ChangeSet, Configuration};
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::hooks::{Hook, Plugin};
use crate::lock::FileLock;
use crate::model::{
    BaseInstance, Instance, InstanceManifest, Password, PostgreSQLInstance, PresenceState,
    RoleManifest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassfileEntry {
    pub hostname: String,
    pub port: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

fn split_fields(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    if let Some(last) = fields.last_mut() {
                        last.push(next);
                    }
                }
            }
            ':' => fields.push(String::new()),
            c => {
                if let Some(last) = fields.last_mut() {
                    last.push(c);
                }
            }
        }
    }
    fields
}

fn escape(field: &str) -> String {
    field.replace('\\', "\\\\").replace(':', "\\:")
}

impl PassfileEntry {
    pub fn new(port: u16, username: &str, password: &str) -> Self {
        Self {
            hostname: "*".to_string(),
            port: port.to_string(),
            database: "*".to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let fields = split_fields(line);
        let [hostname, port, database, username, password]: [String; 5] =
            fields.try_into().ok()?;
        Some(Self {
            hostname,
            port,
            database,
            username,
            password,
        })
    }

    pub fn render(&self) -> String {
        [
            &self.hostname,
            &self.port,
            &self.database,
            &self.username,
            &self.password,
        ]
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(":")
    }

    /// Whether the entry has the shape written by [`Passfile::set`].
    pub fn is_managed(&self) -> bool {
        self.hostname == "*" && self.database == "*"
    }

    fn matches(&self, port: u16, username: &str) -> bool {
        self.port == port.to_string() && self.username == username
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry(PassfileEntry),
    Other(String),
}

/// A password file, comments and foreign entries preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Passfile {
    lines: Vec<Line>,
}

impl Passfile {
    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|line| {
                if line.trim_start().starts_with('#') || line.trim().is_empty() {
                    return Line::Other(line.to_string());
                }
                match PassfileEntry::parse(line) {
                    Some(entry) => Line::Entry(entry),
                    None => Line::Other(line.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    pub fn read(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry(entry) => out.push_str(&entry.render()),
                Line::Other(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }

    /// Replaces the file atomically with mode 0600, or removes it when no
    /// entry is left.
    pub fn write(&self, path: &Path) -> Result<()> {
        if self.entries().next().is_none() {
            return match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::io(path, e)),
            };
        }
        let parent = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.write_all(self.render().as_bytes())
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = &PassfileEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Other(_) => None,
        })
    }

    pub fn get(&self, port: u16, username: &str) -> Option<&PassfileEntry> {
        self.entries().find(|e| e.matches(port, username))
    }

    /// Adds or updates the entry for `(port, username)`; `true` on change.
    pub fn set(&mut self, port: u16, username: &str, password: &str) -> bool {
        let wanted = PassfileEntry::new(port, username, password);
        for line in &mut self.lines {
            if let Line::Entry(entry) = line {
                if entry.matches(port, username) {
                    if entry.password == password {
                        return false;
                    }
                    entry.password = password.to_string();
                    return true;
                }
            }
        }
        self.lines.push(Line::Entry(wanted));
        true
    }

    pub fn remove(&mut self, port: u16, username: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|l| !matches!(l, Line::Entry(e) if e.matches(port, username)));
        before != self.lines.len()
    }

    /// Removes the managed entries of `port`, foreign entries are kept.
    pub fn remove_port(&mut self, port: u16) -> bool {
        let before = self.lines.len();
        let port = port.to_string();
        self.lines
            .retain(|l| !matches!(l, Line::Entry(e) if e.port == port && e.is_managed()));
        before != self.lines.len()
    }

    /// Moves managed entries from `from` to `to`; `true` on change.
    pub fn move_port(&mut self, from: u16, to: u16) -> bool {
        let (from, to) = (from.to_string(), to.to_string());
        let mut changed = false;
        for line in &mut self.lines {
            if let Line::Entry(entry) = line {
                if entry.port == from && entry.is_managed() {
                    entry.port = to.clone();
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Edits the password file at `path` under its lock, writing it back only
/// when `edit` reports a change.
pub fn edit(path: &Path, edit: impl FnOnce(&mut Passfile) -> bool) -> Result<bool> {
    let lock_path = PathBuf::from(format!("{}.lock", path.display()));
    let _lock = FileLock::acquire(&lock_path)?;
    let mut passfile = Passfile::read(path)?;
    if !edit(&mut passfile) {
        return Ok(false);
    }
    passfile.write(path)?;
    log::debug!("updated password file {}", path.display());
    Ok(true)
}

/// Password of `role` from the site's `password_command`, if configured.
/// An empty output means no password.
pub fn password_command(
    ctx: &Context,
    instance: &BaseInstance,
    role: &str,
) -> Result<Option<Password>> {
    let template = &ctx.settings().postgresql.auth.password_command;
    let Some((program, args)) = template.split_first() else {
        return Ok(None);
    };
    let render = |s: &str| {
        s.replace("{instance}", &instance.qualname())
            .replace("{role}", role)
    };
    let cmd = Cmd::new(render(program)).args(args.iter().map(|a| render(a)));
    let output = ctx.run(&cmd)?;
    let password = output.stdout.trim();
    if password.is_empty() {
        return Ok(None);
    }
    Ok(Some(Password::new(password)))
}

/// libpq environment for connecting to `instance` as `role`, built on top
/// of `base` without touching the process environment.
pub fn libpq_environ(
    ctx: &Context,
    instance: &BaseInstance,
    role: &str,
    base: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut env = base;
    if let Some(passfile) = &ctx.settings().postgresql.auth.passfile {
        env.entry("PGPASSFILE".to_string())
            .or_insert_with(|| passfile.to_string_lossy().into_owned());
    }
    if !env.contains_key("PGPASSWORD") {
        if let Some(password) = password_command(ctx, instance, role)? {
            env.insert("PGPASSWORD".to_string(), password.expose().to_string());
        }
    }
    Ok(env)
}

fn port_change(changes: &ChangeSet) -> Option<(u16, u16)> {
    let (old, new) = changes.get("port")?;
    let as_port = |v: &Option<crate::conf::Value>| {
        v.as_ref()
            .and_then(|v| v.as_int())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(crate::model::manifest::DEFAULT_PORT)
    };
    Some((as_port(old), as_port(new)))
}

/// Keeps the password file in sync with managed roles.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassfilePlugin;

impl PassfilePlugin {
    fn path(ctx: &Context) -> Option<&Path> {
        ctx.settings().postgresql.auth.passfile.as_deref()
    }
}

impl Plugin for PassfilePlugin {
    fn name(&self) -> &'static str {
        "passfile"
    }

    fn implements(&self) -> &'static [Hook] {
        &[Hook::RoleChange, Hook::InstanceConfigure, Hook::InstanceDrop]
    }

    fn role_change(
        &self,
        ctx: &Context,
        role: &RoleManifest,
        instance: &PostgreSQLInstance,
    ) -> Option<Result<bool>> {
        let path = Self::path(ctx)?;
        let port = instance.port();
        let result = if role.state == PresenceState::Absent || !role.pgpass {
            edit(path, |pf| pf.remove(port, &role.name))
        } else if let Some(password) = &role.password {
            edit(path, |pf| pf.set(port, &role.name, password.expose()))
        } else {
            Ok(false)
        };
        Some(result)
    }

    /// Follows port changes of existing instances.
    fn instance_configure(
        &self,
        ctx: &Context,
        _manifest: &InstanceManifest,
        _instance: &BaseInstance,
        _config: &Configuration,
        changes: &ChangeSet,
        creating: bool,
        _upgrading: bool,
    ) -> Option<Result<()>> {
        let path = Self::path(ctx)?;
        match port_change(changes) {
            Some((old, new)) if !creating && old != new => {
                Some(edit(path, |pf| pf.move_port(old, new)).map(|_| ()))
            }
            _ => Some(Ok(())),
        }
    }

    fn instance_drop(&self, ctx: &Context, instance: &Instance) -> Option<Result<()>> {
        let path = Self::path(ctx)?;
        let port = instance.port();
        Some(edit(path, |pf| pf.remove_port(port)).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_escaping() {
        let entry = PassfileEntry::parse(r"*:5432:*:bob:pa\:ss\\w").unwrap();
        assert_eq!(entry.password, r"pa:ss\w");
        assert_eq!(entry.render(), r"*:5432:*:bob:pa\:ss\\w");
        assert!(PassfileEntry::parse("not:enough").is_none());
    }

    #[test]
    fn test_set_remove_move() {
        let mut pf = Passfile::parse("# managed\nhost:1:db:other:x\n");
        assert!(pf.set(5432, "alice", "a"));
        assert!(!pf.set(5432, "alice", "a"));
        assert!(pf.set(5432, "alice", "b"));
        assert_eq!(pf.get(5432, "alice").unwrap().password, "b");
        assert!(pf.move_port(5432, 5433));
        assert!(pf.get(5432, "alice").is_none());
        assert!(pf.get(5433, "alice").is_some());
        assert!(pf.remove(5433, "alice"));
        assert_eq!(pf.render(), "# managed\nhost:1:db:other:x\n");
    }

    #[test]
    fn test_port_edits_keep_foreign_entries() {
        let mut pf = Passfile::parse("localhost:5432:app:bob:x\n*:5432:*:alice:a\n");
        assert!(pf.move_port(5432, 5433));
        assert_eq!(pf.get(5432, "bob").map(|e| e.password.as_str()), Some("x"));
        assert!(pf.get(5433, "alice").is_some());

        assert!(pf.remove_port(5433));
        assert!(!pf.remove_port(5432));
        assert_eq!(pf.render(), "localhost:5432:app:bob:x\n");
    }

    #[test]
    fn test_edit_writes_0600_and_removes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".pgpass");
        assert!(edit(&path, |pf| pf.set(5432, "alice", "s3cret")).unwrap());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "*:5432:*:alice:s3cret\n"
        );
        assert!(!edit(&path, |pf| pf.set(5432, "alice", "s3cret")).unwrap());
        assert!(edit(&path, |pf| pf.remove(5432, "alice")).unwrap());
        assert!(!path.exists());
    }
}
