//! `postgresql.conf` parsing, editing and value normalization.

pub mod diff;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use diff::{classify, diff, ChangeSet};

/// A configuration parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Parses the raw (possibly quoted) right-hand side of a conf line.
    pub fn parse(raw: &str) -> Value {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            return Value::Str(inner.replace("''", "'").replace("\\'", "'"));
        }
        match raw.to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" => return Value::Bool(true),
            "off" | "false" | "no" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Int(i);
        }
        if raw.contains('.') {
            if let Ok(f) = raw.parse::<f64>() {
                return Value::Float(f);
            }
        }
        Value::Str(raw.to_string())
    }

    /// Renders the value for a conf file, quoting strings.
    pub fn to_conf_string(&self) -> String {
        match self {
            Value::Bool(true) => "on".to_string(),
            Value::Bool(false) => "off".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Renders the value as used in SQL `SET` statements and CLI options.
    pub fn as_plain(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_conf_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, accepting numeric strings.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            Value::Str(s) => match Value::parse(s) {
                Value::Bool(b) => Some(b),
                Value::Int(0) => Some(false),
                Value::Int(1) => Some(true),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_plain())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

// ============================================================================
// Normalization
// ============================================================================

static RE_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?[0-9]+(?:\.[0-9]+)?)\s*(us|ms|s|min|h|d|B|kB|MB|GB|TB)\s*$")
        .expect("valid unit regex")
});

/// Canonical form used to compare values semantically.
#[derive(Debug, Clone, PartialEq)]
pub enum Canonical {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Durations become milliseconds, memory sizes bytes, boolean spellings
/// `on`/`off`, numeric strings numbers.
pub fn normalize(value: &Value) -> Canonical {
    match value {
        Value::Bool(b) => Canonical::Bool(*b),
        Value::Int(i) => Canonical::Number(*i as f64),
        Value::Float(f) => Canonical::Number(*f),
        Value::Str(s) => normalize_str(s),
    }
}

fn normalize_str(s: &str) -> Canonical {
    let trimmed = s.trim();
    if let Some(caps) = RE_WITH_UNIT.captures(trimmed) {
        let number: f64 = caps[1].parse().unwrap_or(0.0);
        let factor = match &caps[2] {
            "us" => 0.001,
            "ms" => 1.0,
            "s" => 1_000.0,
            "min" => 60_000.0,
            "h" => 3_600_000.0,
            "d" => 86_400_000.0,
            "B" => 1.0,
            "kB" => 1024.0,
            "MB" => 1024.0 * 1024.0,
            "GB" => 1024.0 * 1024.0 * 1024.0,
            "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            _ => 1.0,
        };
        return Canonical::Number(number * factor);
    }
    match Value::parse(trimmed) {
        Value::Bool(b) => Canonical::Bool(b),
        Value::Int(i) => Canonical::Number(i as f64),
        Value::Float(f) => Canonical::Number(f),
        _ => Canonical::Text(trimmed.to_string()),
    }
}

/// Semantic equality of two values; `1`/`0` match `on`/`off`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (normalize(a), normalize(b)) {
        (Canonical::Bool(x), Canonical::Number(n)) | (Canonical::Number(n), Canonical::Bool(x)) => {
            (n == 1.0 && x) || (n == 0.0 && !x)
        }
        (x, y) => x == y,
    }
}

/// Memory parameters accepting a percentage of the host's physical memory.
pub const PERCENT_MEMORY_PARAMETERS: &[&str] = &[
    "shared_buffers",
    "effective_cache_size",
    "maintenance_work_mem",
    "work_mem",
    "wal_buffers",
];

fn total_memory_bytes() -> Option<u64> {
    // SAFETY: sysconf has no preconditions; negative results mean unsupported.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    Some(pages as u64 * page_size as u64)
}

/// Turns `'25%'` into an absolute `kB` amount for memory parameters.
pub fn resolve_percent_memory(name: &str, value: &Value) -> Result<Option<Value>> {
    let Some(raw) = value.as_str() else {
        return Ok(None);
    };
    let Some(percent) = raw.trim().strip_suffix('%') else {
        return Ok(None);
    };
    if !PERCENT_MEMORY_PARAMETERS.contains(&name) {
        return Err(Error::Validation(format!(
            "percent value '{}' is not supported for parameter '{}'",
            raw, name
        )));
    }
    let percent: f64 = percent.trim().parse().map_err(|_| {
        Error::Validation(format!("invalid percent value '{}' for '{}'", raw, name))
    })?;
    let total = total_memory_bytes()
        .ok_or_else(|| Error::Unsupported("cannot determine total memory".to_string()))?;
    let kb = (total as f64 * percent / 100.0 / 1024.0).floor() as u64;
    Ok(Some(Value::Str(format!("{}kB", kb))))
}

// ============================================================================
// Configuration file
// ============================================================================

static RE_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(#\s*)?([a-z_][a-z0-9_.]*)\s*(?:=\s*|\s+)('(?:[^'\\]|''|\\.)*'|[^#\s]+)\s*(?:#\s*(.*))?$",
    )
    .expect("valid conf entry regex")
});

/// One `name = value` line.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub value: Value,
    pub commented: bool,
    pub comment: Option<String>,
    raw: Option<String>,
}

impl Entry {
    fn render(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let mut line = format!(
            "{}{} = {}",
            if self.commented { "#" } else { "" },
            self.name,
            self.value.to_conf_string()
        );
        if let Some(comment) = &self.comment {
            line.push_str(&format!("\t# {}", comment));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Line {
    Entry(Entry),
    Other(String),
}

/// An ordered `postgresql.conf` document preserving comments and
/// commented-out entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    lines: Vec<Line>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|line| match RE_ENTRY.captures(line) {
                Some(caps) if !(caps.get(1).is_some() && is_prose(line)) => Line::Entry(Entry {
                    name: caps[2].to_string(),
                    value: Value::parse(&caps[3]),
                    commented: caps.get(1).is_some(),
                    comment: caps.get(4).map(|m| m.as_str().trim().to_string()),
                    raw: Some(line.to_string()),
                }),
                _ => Line::Other(line.to_string()),
            })
            .collect();
        Self { lines }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::parse(&content))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render()).map_err(|e| Error::io(path, e))
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

    /// Effective value of `name` (last uncommented occurrence).
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry(e) if !e.commented && e.name == name => Some(&e.value),
            _ => None,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets `name`, replacing its effective entry, else uncommenting the
    /// first commented one, else appending.
    pub fn set(&mut self, name: &str, value: Value) {
        let idx = self
            .lines
            .iter()
            .rposition(|l| matches!(l, Line::Entry(e) if !e.commented && e.name == name))
            .or_else(|| {
                self.lines
                    .iter()
                    .position(|l| matches!(l, Line::Entry(e) if e.commented && e.name == name))
            });
        match idx {
            Some(i) => {
                if let Line::Entry(entry) = &mut self.lines[i] {
                    if entry.commented || entry.value != value {
                        entry.value = value;
                        entry.commented = false;
                        entry.raw = None;
                    }
                }
            }
            None => self.lines.push(Line::Entry(Entry {
                name: name.to_string(),
                value,
                commented: false,
                comment: None,
                raw: None,
            })),
        }
    }

    /// Comments out every effective occurrence of `name`.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let previous = self.get(name).cloned();
        for line in &mut self.lines {
            if let Line::Entry(e) = line {
                if !e.commented && e.name == name {
                    e.commented = true;
                    e.raw = None;
                }
            }
        }
        previous
    }

    /// Effective parameters, first-seen order, last value wins.
    pub fn entries(&self) -> Vec<(String, Value)> {
        let mut order: Vec<String> = Vec::new();
        let mut values: BTreeMap<String, Value> = BTreeMap::new();
        for line in &self.lines {
            if let Line::Entry(e) = line {
                if e.commented {
                    continue;
                }
                if !values.contains_key(&e.name) {
                    order.push(e.name.clone());
                }
                values.insert(e.name.clone(), e.value.clone());
            }
        }
        order
            .into_iter()
            .filter_map(|name| values.remove(&name).map(|v| (name, v)))
            .collect()
    }

    pub fn as_map(&self) -> BTreeMap<String, Value> {
        self.entries().into_iter().collect()
    }

    /// Applies every effective entry of `other` on top of `self`.
    pub fn merge(&mut self, other: &Configuration) {
        for (name, value) in other.entries() {
            self.set(&name, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

fn is_prose(line: &str) -> bool {
    // "# connection settings" style comments happen to look like entries.
    let body = line.trim_start().trim_start_matches('#').trim_start();
    !body.contains('=') && body.split_whitespace().count() > 2
}

impl FromIterator<(String, Value)> for Configuration {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut conf = Configuration::new();
        for (name, value) in iter {
            conf.set(&name, value);
        }
        conf
    }
}

/// Merges comma separated `shared_preload_libraries` tokens as an ordered
/// set where the first occurrence wins.
pub fn merge_libraries<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    let mut seen: Vec<String> = Vec::new();
    for value in values {
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if !seen.iter().any(|s| s == token) {
                seen.push(token.to_string());
            }
        }
    }
    seen.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# PostgreSQL configuration
listen_addresses = '*'
port = 5432\t# (change requires restart)
#max_connections = 100
shared_buffers = 128MB
# Add settings for extensions here
log_line_prefix = '%m [%p] %q%u@%d '
autovacuum = on
";

    #[test]
    fn test_parse_and_get() {
        let conf = Configuration::parse(SAMPLE);
        assert_eq!(conf.get("port"), Some(&Value::Int(5432)));
        assert_eq!(conf.get("listen_addresses"), Some(&Value::Str("*".into())));
        assert_eq!(conf.get("autovacuum"), Some(&Value::Bool(true)));
        assert_eq!(conf.get("max_connections"), None);
        assert_eq!(
            conf.get("log_line_prefix"),
            Some(&Value::Str("%m [%p] %q%u@%d ".into()))
        );
        assert!(!conf.contains("Add"));
    }

    #[test]
    fn test_render_preserves_untouched_lines() {
        let conf = Configuration::parse(SAMPLE);
        assert_eq!(conf.render(), SAMPLE);
    }

    #[test]
    fn test_set_uncomments_and_appends() {
        let mut conf = Configuration::parse(SAMPLE);
        conf.set("max_connections", Value::Int(50));
        conf.set("work_mem", Value::Str("8MB".into()));
        let rendered = conf.render();
        assert!(rendered.contains("\nmax_connections = 50\n"));
        assert!(rendered.ends_with("work_mem = '8MB'\n"));
        assert_eq!(conf.get("max_connections"), Some(&Value::Int(50)));
    }

    #[test]
    fn test_remove_comments_out() {
        let mut conf = Configuration::parse(SAMPLE);
        assert_eq!(conf.remove("autovacuum"), Some(Value::Bool(true)));
        assert_eq!(conf.get("autovacuum"), None);
        assert!(conf.render().contains("#autovacuum = on"));
    }

    #[test]
    fn test_entries_last_wins() {
        let conf = Configuration::parse("port = 1\nwork_mem = 1MB\nport = 2\n");
        assert_eq!(
            conf.entries(),
            vec![
                ("port".to_string(), Value::Int(2)),
                ("work_mem".to_string(), Value::Str("1MB".into())),
            ]
        );
    }

    #[test]
    fn test_value_quoting() {
        assert_eq!(Value::Str("it's".into()).to_conf_string(), "'it''s'");
        assert_eq!(Value::parse("'it''s'"), Value::Str("it's".into()));
        assert_eq!(Value::Bool(false).to_conf_string(), "off");
    }

    #[test]
    fn test_normalization() {
        assert!(values_equal(&Value::Str("1min".into()), &Value::Str("60s".into())));
        assert!(values_equal(&Value::Str("1GB".into()), &Value::Str("1024MB".into())));
        assert!(values_equal(&Value::Bool(true), &Value::Str("on".into())));
        assert!(values_equal(&Value::Str("off".into()), &Value::Int(0)));
        assert!(values_equal(&Value::Int(5432), &Value::Str("5432".into())));
        assert!(!values_equal(&Value::Str("128MB".into()), &Value::Str("256MB".into())));
    }

    #[test]
    fn test_merge_libraries_first_occurrence_wins() {
        assert_eq!(
            merge_libraries(["pg_stat_statements, auto_explain", "powa,pg_stat_statements"]),
            "pg_stat_statements, auto_explain, powa"
        );
        assert_eq!(merge_libraries(["", " "]), "");
    }

    #[test]
    fn test_percent_memory() {
        let value = resolve_percent_memory("shared_buffers", &Value::Str("25%".into()))
            .unwrap()
            .unwrap();
        assert!(value.as_str().unwrap().ends_with("kB"));
        assert!(resolve_percent_memory("port", &Value::Str("10%".into())).is_err());
        assert_eq!(
            resolve_percent_memory("shared_buffers", &Value::Str("1GB".into())).unwrap(),
            None
        );
    }
}
