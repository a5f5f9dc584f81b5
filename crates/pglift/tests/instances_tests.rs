//! Instance lifecycle scenarios against scripted PostgreSQL programs.

mod common;

use std::sync::Arc;

use common::{login_role, owned_database, ManifestBuilder, TestHarness};
use pglift::model::{AuthManifest, ChangeState, Password, PrometheusManifest};
use pglift::postgresql::Status;
use pglift::settings::AuthMethod;
use pglift::{
    instances, AssumeNo, Context, Error, InstanceManifest, InstanceState, ServiceKind, Value,
};

fn app_manifest() -> ManifestBuilder {
    ManifestBuilder::new("main")
        .version("16")
        .port(5433)
        .role(login_role("alice"))
        .database(owned_database("app", "alice"))
}

#[test]
fn test_create_then_apply_again() {
    let harness = TestHarness::new();
    let manifest = app_manifest().build();

    let result = instances::apply(&harness.ctx, &manifest).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Created));
    assert!(!result.pending_restart);

    let instance = harness.instance("main", "16");
    assert_eq!(instance.port(), 5433);
    assert_eq!(instances::status(&instance).unwrap(), Status::Running);
    assert!(harness.runner.has_role("alice"));
    assert!(harness.runner.has_role("replication"));
    assert!(harness.runner.has_database("app"));
    assert_eq!(harness.runner.calls_of("initdb").len(), 1);

    let result = instances::apply(&harness.ctx, &manifest).unwrap();
    assert_eq!(result.change_state, None);
    assert_eq!(harness.runner.calls_of("initdb").len(), 1);
}

#[test]
fn test_create_stopped() {
    let harness = TestHarness::new();
    let manifest = ManifestBuilder::new("main")
        .state(InstanceState::Stopped)
        .build();

    let result = instances::apply(&harness.ctx, &manifest).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Created));
    // Newest configured version by default.
    let instance = harness.instance("main", "16");
    assert_eq!(instances::status(&instance).unwrap(), Status::NotRunning);
    // Started for the replication role, then stopped again.
    assert_eq!(harness.runner.calls_of("pg_ctl").len(), 2);
}

#[test]
fn test_state_changes() {
    let harness = TestHarness::new();
    let manifest = ManifestBuilder::new("main").version("15").build();
    instances::apply(&harness.ctx, &manifest).unwrap();
    let datadir = harness.base("main", "15").datadir();
    assert!(datadir.join("postmaster.pid").exists());

    let stopped = ManifestBuilder::new("main")
        .version("15")
        .state(InstanceState::Stopped)
        .build();
    let result = instances::apply(&harness.ctx, &stopped).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Changed));
    assert!(!datadir.join("postmaster.pid").exists());

    let result = instances::apply(&harness.ctx, &stopped).unwrap();
    assert_eq!(result.change_state, None);

    let absent = ManifestBuilder::new("main")
        .version("15")
        .state(InstanceState::Absent)
        .build();
    let result = instances::apply(&harness.ctx, &absent).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Dropped));
    assert!(!datadir.exists());
    assert!(!instances::exists(&harness.ctx, "main", None).unwrap());

    let result = instances::apply(&harness.ctx, &absent).unwrap();
    assert_eq!(result.change_state, None);
}

fn pg_ctl_actions(harness: &TestHarness) -> Vec<String> {
    harness
        .runner
        .calls_of("pg_ctl")
        .into_iter()
        .filter_map(|argv| argv.get(1).cloned())
        .collect()
}

#[test]
fn test_setting_change_reloads() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();

    let changed = ManifestBuilder::new("main")
        .setting("work_mem", Value::Str("16MB".into()))
        .build();
    let result = instances::apply(&harness.ctx, &changed).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Changed));
    assert!(!result.pending_restart);
    assert_eq!(pg_ctl_actions(&harness).last().map(String::as_str), Some("reload"));
    let instance = harness.instance("main", "16");
    assert_eq!(
        instance.config().get("work_mem").map(Value::as_plain),
        Some("16MB".to_string())
    );
}

#[test]
fn test_setting_change_needs_restart() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();
    let before = pg_ctl_actions(&harness).len();

    let changed = ManifestBuilder::new("main")
        .setting("shared_buffers", Value::Str("1GB".into()))
        .build();
    let result = instances::apply(&harness.ctx, &changed).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Changed));
    assert!(result.pending_restart);
    assert_eq!(pg_ctl_actions(&harness).len(), before);
}

#[test]
fn test_deferred_restart_still_reloads() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();

    let changed = ManifestBuilder::new("main")
        .setting("shared_buffers", Value::Str("1GB".into()))
        .setting("work_mem", Value::Str("16MB".into()))
        .build();
    let result = instances::apply(&harness.ctx, &changed).unwrap();
    assert!(result.pending_restart);
    assert_eq!(pg_ctl_actions(&harness).last().map(String::as_str), Some("reload"));
}

#[test]
fn test_restart_on_changes() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();

    let mut changed = ManifestBuilder::new("main")
        .setting("shared_buffers", Value::Str("1GB".into()))
        .setting("work_mem", Value::Str("16MB".into()))
        .build();
    changed.restart_on_changes = true;
    let result = instances::apply(&harness.ctx, &changed).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Changed));
    assert!(!result.pending_restart);
    let actions = pg_ctl_actions(&harness);
    assert_eq!(actions.last().map(String::as_str), Some("restart"));
    assert!(!actions.iter().any(|a| a == "reload"));
}

fn with_local_auth(method: AuthMethod) -> InstanceManifest {
    let mut manifest = ManifestBuilder::new("main").build();
    manifest.auth = Some(AuthManifest {
        local: Some(method),
        ..AuthManifest::default()
    });
    manifest
}

#[test]
fn test_auth_change_needs_restart() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();
    let before = pg_ctl_actions(&harness).len();

    let result = instances::apply(&harness.ctx, &with_local_auth(AuthMethod::ScramSha256)).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Changed));
    assert!(result.pending_restart);
    assert_eq!(pg_ctl_actions(&harness).len(), before);
    let hba = std::fs::read_to_string(harness.base("main", "16").datadir().join("pg_hba.conf"))
        .unwrap();
    assert!(hba.contains("scram-sha-256"));

    let mut manifest = with_local_auth(AuthMethod::Md5);
    manifest.restart_on_changes = true;
    let result = instances::apply(&harness.ctx, &manifest).unwrap();
    assert!(!result.pending_restart);
    assert_eq!(pg_ctl_actions(&harness).last().map(String::as_str), Some("restart"));
}

#[test]
fn test_port_change_moves_passfile_entries() {
    let home = tempfile::tempdir().unwrap();
    let passfile = home.path().join(".pgpass");
    let harness = TestHarness::with_settings(serde_json::json!({
        "postgresql": {"auth": {"passfile": passfile}},
    }));
    let mut alice = login_role("alice");
    alice.password = Some(Password::new("alice-pw"));
    alice.pgpass = true;
    let manifest = |port| {
        ManifestBuilder::new("main")
            .version("16")
            .port(port)
            .role(alice.clone())
            .build()
    };

    instances::apply(&harness.ctx, &manifest(5433)).unwrap();
    assert_eq!(
        std::fs::read_to_string(&passfile).unwrap(),
        "*:5433:*:alice:alice-pw\n"
    );

    let result = instances::apply(&harness.ctx, &manifest(5434)).unwrap();
    assert!(result.pending_restart);
    assert_eq!(
        std::fs::read_to_string(&passfile).unwrap(),
        "*:5434:*:alice:alice-pw\n"
    );

    instances::drop(&harness.ctx, harness.instance("main", "16")).unwrap();
    assert!(!passfile.exists());
}

#[test]
fn test_data_checksums_change() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();

    let mut running = ManifestBuilder::new("main").build();
    running.data_checksums = Some(true);
    let err = instances::apply(&harness.ctx, &running).unwrap_err();
    assert!(matches!(err, Error::InstanceState(_)), "{err}");
    assert!(harness.runner.calls_of("pg_checksums").is_empty());

    let mut stopped = ManifestBuilder::new("main")
        .state(InstanceState::Stopped)
        .build();
    instances::apply(&harness.ctx, &stopped).unwrap();
    // The scripted pg_checksums reports checksums as enabled.
    stopped.data_checksums = Some(false);
    let result = instances::apply(&harness.ctx, &stopped).unwrap();
    assert_eq!(result.change_state, Some(ChangeState::Changed));
    let calls = harness.runner.calls_of("pg_checksums");
    assert!(calls.last().is_some_and(|argv| argv.contains(&"--disable".to_string())));
}

#[test]
fn test_role_password_kept_out_of_arguments() {
    let harness = TestHarness::new();
    let mut alice = login_role("alice");
    alice.password = Some(Password::new("s3cret-pw"));
    instances::apply(
        &harness.ctx,
        &ManifestBuilder::new("main").role(alice).build(),
    )
    .unwrap();
    assert!(harness.runner.has_role("alice"));
    assert!(!harness
        .runner
        .calls()
        .iter()
        .flatten()
        .any(|arg| arg.contains("s3cret-pw")));
}

#[test]
fn test_list_env_describe() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &app_manifest().build()).unwrap();
    instances::apply(
        &harness.ctx,
        &ManifestBuilder::new("other")
            .version("15")
            .port(5434)
            .state(InstanceState::Stopped)
            .build(),
    )
    .unwrap();

    let items = instances::list(&harness.ctx, None).unwrap();
    let summary: Vec<_> = items
        .iter()
        .map(|i| (i.name.as_str(), i.version.as_str(), i.port, i.status.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("main", "16", 5433, "running"),
            ("other", "15", 5434, "not running"),
        ]
    );
    let only_15 = instances::list(&harness.ctx, Some("15".parse().unwrap())).unwrap();
    assert_eq!(only_15.len(), 1);

    let instance = harness.instance("main", "16");
    let env = instances::env(&harness.ctx, &instance).unwrap();
    assert_eq!(env.get("PGPORT").map(String::as_str), Some("5433"));
    assert_eq!(env.get("PGUSER").map(String::as_str), Some("postgres"));
    assert_eq!(
        env.get("PGDATA").map(String::as_str),
        Some(instance.datadir().to_string_lossy().as_ref())
    );

    let described = instances::describe(&harness.ctx, &instance).unwrap();
    assert_eq!(described.name, "main");
    assert_eq!(described.port, Some(5433));
    assert_eq!(described.state, InstanceState::Started);
    assert!(!described.settings.contains_key("port"));
    assert!(described.standby.is_none());
    assert!(described.surole_password.is_none());
}

#[test]
fn test_logs() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();
    let instance = harness.instance("main", "16");
    let logdir = instance.logdir();
    std::fs::create_dir_all(&logdir).unwrap();
    std::fs::write(logdir.join("16-main-2024-01-01_000000.log"), "LOG: ready\n").unwrap();
    let files = instances::logs(&instance).unwrap();
    assert!(files
        .iter()
        .any(|f| f.ends_with("16-main-2024-01-01_000000.log")));
}

#[test]
fn test_drop_declined() {
    let harness = TestHarness::new();
    instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap();
    let ctx = Context::builder(Arc::clone(&harness.settings))
        .runner(harness.runner.clone())
        .confirm(Arc::new(AssumeNo))
        .build()
        .unwrap();
    let instance = harness.instance("main", "16");
    let err = instances::drop(&ctx, instance).unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "{err}");
    assert!(harness.base("main", "16").exists().unwrap());
}

#[test]
fn test_failed_creation_removes_data() {
    let harness = TestHarness::new();
    harness.runner.fail("pg_ctl");
    let err = instances::apply(&harness.ctx, &app_manifest().build()).unwrap_err();
    assert!(matches!(err, Error::Command(_)), "{err}");
    assert!(!harness.base("main", "16").datadir().exists());
}

#[test]
fn test_interrupted_initdb_removes_data() {
    let harness = TestHarness::new();
    harness.runner.interrupt("initdb");
    let err = instances::apply(&harness.ctx, &ManifestBuilder::new("main").build()).unwrap_err();
    assert!(matches!(err, Error::Command(_)), "{err}");
    assert!(!harness.base("main", "16").datadir().exists());
    assert!(!instances::exists(&harness.ctx, "main", None).unwrap());
}

fn bad_instance_name() -> InstanceManifest {
    ManifestBuilder::new("bad/name").build()
}

fn conflicting_port_setting() -> InstanceManifest {
    ManifestBuilder::new("main")
        .port(5433)
        .setting("port", Value::Int(5434))
        .build()
}

fn disabled_satellite() -> InstanceManifest {
    let mut manifest = ManifestBuilder::new("main").build();
    manifest.prometheus = Some(PrometheusManifest {
        port: 9187,
        password: None,
    });
    manifest
}

/// A manifest rejected before anything runs.
struct InvalidManifestCase {
    name: &'static str,
    manifest: fn() -> InstanceManifest,
}

const INVALID_MANIFESTS: &[InvalidManifestCase] = &[
    InvalidManifestCase {
        name: "bad_instance_name",
        manifest: bad_instance_name,
    },
    InvalidManifestCase {
        name: "conflicting_port_setting",
        manifest: conflicting_port_setting,
    },
    InvalidManifestCase {
        name: "disabled_satellite",
        manifest: disabled_satellite,
    },
];

#[test]
fn test_invalid_manifests() {
    for case in INVALID_MANIFESTS {
        let harness = TestHarness::new();
        let result = instances::apply(&harness.ctx, &(case.manifest)());
        assert!(
            matches!(result, Err(Error::Validation(_))),
            "case '{}': {:?}",
            case.name,
            result
        );
        assert!(
            harness.runner.calls().is_empty(),
            "case '{}' ran commands",
            case.name
        );
    }
}

#[test]
fn test_prometheus_exporter_lifecycle() {
    let harness = TestHarness::with_settings(serde_json::json!({"prometheus": {}}));
    let mut manifest = ManifestBuilder::new("main").build();
    manifest.prometheus = Some(PrometheusManifest {
        port: 9188,
        password: None,
    });
    instances::apply(&harness.ctx, &manifest).unwrap();

    let instance = harness.instance("main", "16");
    assert_eq!(
        instance.services.iter().map(|s| s.kind()).collect::<Vec<_>>(),
        vec![ServiceKind::Prometheus]
    );
    assert!(harness.runner.has_role("prometheus"));
    let exporter = instance
        .service::<pglift::model::services::PostgresExporter>()
        .unwrap();
    assert_eq!(exporter.port, 9188);
    let configpath = exporter.configpath.clone();
    assert!(configpath.exists());

    let described = instances::describe(&harness.ctx, &instance).unwrap();
    assert_eq!(described.prometheus.map(|p| p.port), Some(9188));

    instances::drop(&harness.ctx, instance).unwrap();
    assert!(!configpath.exists());
}
