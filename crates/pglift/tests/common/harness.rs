//! Isolated site for integration tests.
//!
//! Each `TestHarness` owns a temporary directory holding the site prefix,
//! the runtime directory and fake PostgreSQL binary directories, plus a
//! `Context` wired to a [`FakeRunner`].

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use pglift::{
    instances, load_from_sources, BaseInstance, Context, Instance, Settings, SettingsSource,
    Version,
};

use super::fake::FakeRunner;

pub const VERSIONS: &[&str] = &["12", "15", "16"];

pub struct TestHarness {
    temp_dir: TempDir,
    pub prefix: PathBuf,
    pub settings: Arc<Settings>,
    pub runner: Arc<FakeRunner>,
    pub ctx: Context,
}

fn merge(base: &mut serde_json::Value, extra: serde_json::Value) {
    match (base, extra) {
        (serde_json::Value::Object(base), serde_json::Value::Object(extra)) => {
            for (key, value) in extra {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, extra) => *base = extra,
    }
}

impl TestHarness {
    /// Site with PostgreSQL 12, 15 and 16, no password file, no satellite.
    pub fn new() -> Self {
        Self::with_settings(serde_json::json!({}))
    }

    /// Site settings merged over the defaults of [`TestHarness::new`].
    pub fn with_settings(extra: serde_json::Value) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let base = temp_dir.path();
        let versions: Vec<_> = VERSIONS
            .iter()
            .map(|v| {
                serde_json::json!({
                    "version": v,
                    "bindir": base.join("pgsql").join(v).join("bin"),
                })
            })
            .collect();
        let mut value = serde_json::json!({
            "prefix": base.join("srv"),
            "run_prefix": base.join("run"),
            "postgresql": {
                "auth": {"passfile": null},
                "versions": versions,
            },
        });
        merge(&mut value, extra);
        let settings = Arc::new(
            load_from_sources(&[SettingsSource::Value(value)]).expect("valid test settings"),
        );
        let runner = Arc::new(FakeRunner::new());
        let ctx = Context::builder(Arc::clone(&settings))
            .runner(runner.clone())
            .build()
            .expect("context");
        Self {
            prefix: base.join("srv"),
            temp_dir,
            settings,
            runner,
            ctx,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn base(&self, name: &str, version: &str) -> BaseInstance {
        let version: Version = version.parse().expect("valid version");
        BaseInstance::new(name, version, Arc::clone(&self.settings)).expect("valid instance")
    }

    pub fn instance(&self, name: &str, version: &str) -> Instance {
        instances::system_lookup(&self.ctx, self.base(name, version)).expect("instance exists")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
