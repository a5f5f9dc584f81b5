//! SQL sessions over `psql`.
//!
//! Queries are wrapped in `json_agg` so every result set comes back as one
//! JSON array, deserialized with serde.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::cmd::Cmd;
use crate::ctx::Context;
use crate::error::{Error, Result};
use crate::model::{Password, PostgreSQLInstance};
use crate::passfile::libpq_environ;
use crate::sanitize::redact_sql;

/// Receives server NOTICE and WARNING messages.
pub type NoticeHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub fn log_notice(message: &str) {
    log::info!("{}", message);
}

/// `"name"`, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A run-time parameter name, each dotted part quoted.
pub fn quote_setting_name(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// `'value'`, doubling embedded quotes (`E'...'` when backslashes occur).
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// libpq keyword/value connection string.
pub fn conninfo(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| {
            if v.is_empty() || v.contains([' ', '\'', '\\']) {
                format!("{}='{}'", k, v.replace('\\', "\\\\").replace('\'', "\\'"))
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct Session<'a> {
    ctx: &'a Context,
    instance: &'a PostgreSQLInstance,
    dbname: String,
    user: String,
    password: Option<Password>,
    notice: NoticeHandler,
}

impl<'a> Session<'a> {
    /// Session as the super-user role on the `postgres` database.
    pub fn new(ctx: &'a Context, instance: &'a PostgreSQLInstance) -> Self {
        Self {
            ctx,
            instance,
            dbname: "postgres".to_string(),
            user: ctx.settings().postgresql.surole.name.clone(),
            password: None,
            notice: Arc::new(log_notice),
        }
    }

    pub fn dbname(mut self, dbname: &str) -> Self {
        self.dbname = dbname.to_string();
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    /// Explicit password, taking precedence over the password file.
    pub fn password(mut self, password: Option<Password>) -> Self {
        self.password = password;
        self
    }

    pub fn on_notice(mut self, handler: NoticeHandler) -> Self {
        self.notice = handler;
        self
    }

    pub fn ctx(&self) -> &'a Context {
        self.ctx
    }

    pub fn instance(&self) -> &'a PostgreSQLInstance {
        self.instance
    }

    pub fn current_dbname(&self) -> &str {
        &self.dbname
    }

    /// Same role and password, another database.
    pub fn connect_to(&self, dbname: &str) -> Session<'a> {
        Session {
            ctx: self.ctx,
            instance: self.instance,
            dbname: dbname.to_string(),
            user: self.user.clone(),
            password: self.password.clone(),
            notice: Arc::clone(&self.notice),
        }
    }

    /// Connection string of this session (password excluded).
    pub fn conninfo(&self) -> String {
        let host = self.instance.socket_directory().to_string_lossy().into_owned();
        let port = self.instance.port().to_string();
        conninfo(&[
            ("host", &host),
            ("port", &port),
            ("user", &self.user),
            ("dbname", &self.dbname),
        ])
    }

    /// libpq environment for this session's role.
    pub fn environ(&self) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        if let Some(password) = &self.password {
            env.insert("PGPASSWORD".to_string(), password.expose().to_string());
        }
        libpq_environ(self.ctx, self.instance, &self.user, env)
    }

    fn psql(&self) -> Result<Cmd> {
        Ok(Cmd::new(self.instance.bin("psql")?)
            .args(["-X", "-A", "-t", "-v", "ON_ERROR_STOP=1"])
            .arg("-h")
            .arg(self.instance.socket_directory())
            .arg("-p")
            .arg(self.instance.port().to_string())
            .arg("-U")
            .arg(&self.user)
            .arg("-d")
            .arg(&self.dbname)
            .envs(&self.environ()?))
    }

    fn run(&self, cmd: Cmd) -> Result<String> {
        let output = self.ctx.run(&cmd)?;
        for line in output.stderr.lines() {
            let line = line.trim();
            if line.starts_with("NOTICE:") || line.starts_with("WARNING:") || line.starts_with("INFO:") {
                (self.notice)(line);
            }
        }
        Ok(output.stdout)
    }

    /// Rows of `sql`, a query returning a result set.
    pub fn query<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        log::debug!("{}: {}", self.dbname, redact_sql(sql));
        let wrapped = format!(
            "SELECT coalesce(json_agg(t), '[]'::json) FROM ({}) t",
            sql.trim().trim_end_matches(';')
        );
        let stdout = self.run(self.psql()?.arg("-c").arg(wrapped))?;
        let body = stdout.trim();
        if body.is_empty() {
            return Err(Error::Serialization(format!(
                "no result returned by query on database {}",
                self.dbname
            )));
        }
        Ok(serde_json::from_str(body)?)
    }

    /// First row of `sql`, if any.
    pub fn query_one<T: DeserializeOwned>(&self, sql: &str) -> Result<Option<T>> {
        Ok(self.query(sql)?.into_iter().next())
    }

    /// Runs one statement.
    pub fn execute(&self, sql: &str) -> Result<()> {
        log::debug!("{}: {}", self.dbname, redact_sql(sql));
        self.run(self.psql()?.arg("-c").arg(sql))?;
        Ok(())
    }

    /// Runs statements in a single transaction.
    pub fn execute_all(&self, statements: &[String]) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        let mut script = String::new();
        for statement in statements {
            log::debug!("{}: {}", self.dbname, redact_sql(statement));
            script.push_str(statement.trim().trim_end_matches(';'));
            script.push_str(";\n");
        }
        self.run(self.psql()?.arg("--single-transaction").stdin(script))?;
        Ok(())
    }

    /// Current value of a run-time parameter.
    pub fn show(&self, name: &str) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Row {
            value: String,
        }
        let row: Option<Row> = self.query_one(&format!(
            "SELECT current_setting({}) AS value",
            quote_literal(name)
        ))?;
        row.map(|r| r.value)
            .ok_or_else(|| Error::Serialization(format!("no value for parameter {}", name)))
    }
}

/// Whether `sql` returns rows (and can be wrapped as a sub-query).
pub fn returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(first.as_str(), "SELECT" | "WITH" | "VALUES" | "TABLE")
}
