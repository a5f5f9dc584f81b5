//! Scripted stand-in for the PostgreSQL client and server programs.
//!
//! `FakeRunner` answers the commands the engine runs the way the real
//! programs would, as far as the engine can observe:
//! - `initdb` creates the data and WAL directories with `PG_VERSION`
//! - `pg_ctl start|stop|restart` writes or removes `postmaster.pid`, holding
//!   the test process id so liveness checks succeed
//! - `psql` keeps a tiny catalog of roles and databases and answers the
//!   catalog queries issued by the role and database reconcilers

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use regex::Regex;
use serde_json::json;

use pglift::{Cmd, CommandRunner, Output};

static CREATE_ROLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"CREATE ROLE "([^"]+)"([^;]*)"#).expect("valid regex"));
static DROP_ROLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"DROP ROLE "([^"]+)""#).expect("valid regex"));
static CREATE_DATABASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"CREATE DATABASE "([^"]+)"(?: OWNER "([^"]+)")?"#).expect("valid regex")
});
static DROP_DATABASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"DROP DATABASE "([^"]+)""#).expect("valid regex"));
static ROLNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"rolname = '([^']+)'").expect("valid regex"));
static DATNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"datname = '([^']+)'").expect("valid regex"));

/// Role attributes as given to `CREATE ROLE`.
#[derive(Debug, Clone, Copy)]
struct RoleAttrs {
    login: bool,
    superuser: bool,
    replication: bool,
    inherit: bool,
}

impl RoleAttrs {
    fn parse(options: &str) -> Self {
        let has = |flag: &str| options.split_whitespace().any(|t| t == flag);
        Self {
            login: has("LOGIN"),
            superuser: has("SUPERUSER"),
            replication: has("REPLICATION"),
            inherit: !has("NOINHERIT"),
        }
    }
}

#[derive(Debug, Default)]
struct Catalog {
    roles: BTreeMap<String, RoleAttrs>,
    /// Database name to owner.
    databases: BTreeMap<String, String>,
}

impl Catalog {
    fn new() -> Self {
        let mut catalog = Self::default();
        catalog.roles.insert(
            "postgres".to_string(),
            RoleAttrs {
                login: true,
                superuser: true,
                replication: true,
                inherit: true,
            },
        );
        catalog
            .databases
            .insert("postgres".to_string(), "postgres".to_string());
        catalog
    }

    fn apply(&mut self, sql: &str) {
        for c in CREATE_ROLE.captures_iter(sql) {
            self.roles.insert(c[1].to_string(), RoleAttrs::parse(&c[2]));
        }
        for c in DROP_ROLE.captures_iter(sql) {
            self.roles.remove(&c[1]);
        }
        for c in CREATE_DATABASE.captures_iter(sql) {
            let owner = c.get(2).map_or("postgres", |m| m.as_str());
            self.databases.insert(c[1].to_string(), owner.to_string());
        }
        for c in DROP_DATABASE.captures_iter(sql) {
            self.databases.remove(&c[1]);
        }
    }

    fn query(&self, sql: &str) -> serde_json::Value {
        if sql.contains("FROM pg_catalog.pg_roles WHERE rolname") {
            let found = ROLNAME
                .captures(sql)
                .is_some_and(|c| self.roles.contains_key(&c[1]));
            return if found { json!([{"one": 1}]) } else { json!([]) };
        }
        if sql.contains("FROM pg_catalog.pg_authid r WHERE r.rolname") {
            return match ROLNAME
                .captures(sql)
                .and_then(|c| self.roles.get_key_value(&c[1]))
            {
                Some((name, attrs)) => json!([{
                    "name": name,
                    "has_password": false,
                    "inherit": attrs.inherit,
                    "login": attrs.login,
                    "superuser": attrs.superuser,
                    "replication": attrs.replication,
                    "connection_limit": null,
                    "validity": null,
                    "in_roles": [],
                }]),
                None => json!([]),
            };
        }
        if sql.contains("WHERE d.datname") {
            return match DATNAME
                .captures(sql)
                .and_then(|c| self.databases.get_key_value(&c[1]))
            {
                Some((name, owner)) => json!([{
                    "name": name,
                    "owner": owner,
                    "encoding": "UTF8",
                    "size": 7_000_000,
                    "settings": {},
                }]),
                None => json!([]),
            };
        }
        if sql.contains("FROM pg_catalog.pg_database WHERE datname") {
            return match DATNAME.captures(sql) {
                Some(c) if self.databases.contains_key(&c[1]) => json!([{"name": &c[1]}]),
                _ => json!([]),
            };
        }
        if sql.contains("FROM pg_catalog.pg_settings") {
            return json!([
                {"name": "work_mem", "context": "user"},
                {"name": "log_min_duration_statement", "context": "superuser"},
                {"name": "shared_buffers", "context": "postmaster"},
            ]);
        }
        if sql.contains("current_setting('data_checksums')") {
            return json!([{"value": "off"}]);
        }
        if sql.contains("WHERE datallowconn") {
            let names: Vec<_> = self.databases.keys().map(|n| json!({"name": n})).collect();
            return serde_json::Value::Array(names);
        }
        json!([])
    }
}

#[derive(Debug)]
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    catalog: Mutex<Catalog>,
    failing: Mutex<BTreeSet<String>>,
    /// Programs failing after doing their work, as when killed midway.
    interrupted: Mutex<BTreeSet<String>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn program(cmd: &Cmd) -> String {
    cmd.program_name().to_string()
}

fn option(argv: &[String], name: &str) -> Option<PathBuf> {
    let prefix = format!("{}=", name);
    argv.iter().enumerate().find_map(|(i, a)| {
        if a == name {
            argv.get(i + 1).map(PathBuf::from)
        } else {
            a.strip_prefix(&prefix).map(PathBuf::from)
        }
    })
}

/// `16` for `/somewhere/16/bin/initdb`.
fn version_of(argv0: &str) -> String {
    Path::new(argv0)
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn ok(stdout: impl Into<String>) -> Output {
    Output {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            catalog: Mutex::new(Catalog::new()),
            failing: Mutex::new(BTreeSet::new()),
            interrupted: Mutex::new(BTreeSet::new()),
        }
    }

    /// Makes every later run of `program` do its work, then exit with
    /// status 1.
    pub fn interrupt(&self, program: &str) {
        self.interrupted.lock().unwrap().insert(program.to_string());
    }

    /// Makes every later run of `program` exit with status 1.
    pub fn fail(&self, program: &str) {
        self.failing.lock().unwrap().insert(program.to_string());
    }

    /// Command lines run so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines of `program` run so far.
    pub fn calls_of(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| {
                argv.first()
                    .and_then(|p| Path::new(p).file_name())
                    .is_some_and(|n| n == program)
            })
            .collect()
    }

    /// SQL passed to `psql -c`.
    pub fn statements(&self) -> Vec<String> {
        self.calls_of("psql")
            .into_iter()
            .filter_map(|argv| {
                argv.iter()
                    .position(|a| a == "-c")
                    .and_then(|i| argv.get(i + 1).cloned())
            })
            .collect()
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.catalog.lock().unwrap().roles.contains_key(name)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.catalog.lock().unwrap().databases.contains_key(name)
    }

    fn initdb(&self, argv: &[String]) -> io::Result<Output> {
        let datadir = option(argv, "--pgdata")
            .ok_or_else(|| io::Error::other("initdb: missing --pgdata"))?;
        std::fs::create_dir_all(&datadir)?;
        if let Some(waldir) = option(argv, "--waldir") {
            std::fs::create_dir_all(waldir)?;
        }
        std::fs::write(datadir.join("PG_VERSION"), format!("{}\n", version_of(&argv[0])))?;
        Ok(ok(""))
    }

    fn pg_ctl(&self, argv: &[String]) -> io::Result<Output> {
        let datadir = option(argv, "--pgdata")
            .ok_or_else(|| io::Error::other("pg_ctl: missing --pgdata"))?;
        let pidfile = datadir.join("postmaster.pid");
        match argv.get(1).map(String::as_str) {
            Some("start") | Some("restart") => {
                std::fs::write(&pidfile, format!("{}\n{}\n", std::process::id(), datadir.display()))?
            }
            Some("stop") => match std::fs::remove_file(&pidfile) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Output {
                        exit_code: 3,
                        stdout: String::new(),
                        stderr: "pg_ctl: PID file does not exist\n".to_string(),
                    })
                }
                Err(e) => return Err(e),
            },
            _ => {}
        }
        Ok(ok(""))
    }

    fn psql(&self, cmd: &Cmd, argv: &[String]) -> Output {
        let mut catalog = self.catalog.lock().unwrap();
        if let Some(sql) = argv
            .iter()
            .position(|a| a == "-c")
            .and_then(|i| argv.get(i + 1))
        {
            if sql.contains("json_agg") {
                return ok(catalog.query(sql).to_string());
            }
            catalog.apply(sql);
        }
        if let Some(script) = cmd.stdin.as_deref() {
            catalog.apply(script);
        }
        ok("")
    }
}

impl CommandRunner for FakeRunner {
    fn output(&self, cmd: &Cmd) -> io::Result<Output> {
        let argv = cmd.argv();
        self.calls.lock().unwrap().push(argv.clone());
        let name = program(cmd);
        if self.failing.lock().unwrap().contains(&name) {
            return Ok(Output {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("{}: simulated failure\n", name),
            });
        }
        let output = match name.as_str() {
            "initdb" => self.initdb(&argv)?,
            "pg_ctl" => self.pg_ctl(&argv)?,
            "psql" => self.psql(cmd, &argv),
            _ => ok(""),
        };
        if self.interrupted.lock().unwrap().contains(&name) {
            return Ok(Output {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("{}: interrupted\n", name),
            });
        }
        Ok(output)
    }

    fn pipeline(&self, a: &Cmd, b: &Cmd) -> io::Result<(Output, Output)> {
        Ok((self.output(a)?, self.output(b)?))
    }

    /// Satellite daemons are stood in for by a `sleep`, reaped in the
    /// background once signalled.
    fn spawn(&self, cmd: &Cmd, _logfile: Option<&Path>) -> io::Result<u32> {
        self.calls.lock().unwrap().push(cmd.argv());
        let mut child = std::process::Command::new("sleep")
            .arg("300")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        let pid = child.id();
        std::thread::spawn(move || child.wait());
        Ok(pid)
    }
}
