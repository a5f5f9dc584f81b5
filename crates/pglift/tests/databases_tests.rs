//! Databases and their dumps against scripted PostgreSQL programs.

mod common;

use sha2::{Digest, Sha256};

use common::{owned_database, ManifestBuilder, TestHarness};
use pglift::db::Session;
use pglift::model::dump::{DATE_FORMAT, MANIFEST_HEADER};
use pglift::model::CloneSource;
use pglift::{databases, dumps, instances, DatabaseManifest, Error};

fn with_app_database(harness: &TestHarness, version: &str) -> pglift::Instance {
    let manifest = ManifestBuilder::new("main")
        .version(version)
        .database(owned_database("app", "postgres"))
        .build();
    instances::apply(&harness.ctx, &manifest).unwrap();
    harness.instance("main", version)
}

#[test]
fn test_dump_list_restore() {
    let harness = TestHarness::new();
    let instance = with_app_database(&harness, "16");
    let session = Session::new(&harness.ctx, &instance);

    let dump = dumps::dump(&session, "app").unwrap();
    let date = dump.date.format(DATE_FORMAT).to_string();
    let digest = hex::encode(Sha256::digest(format!("app{}", date).as_bytes()));
    assert_eq!(dump.id, format!("app_{}", &digest[..10]));
    assert_eq!(
        dump.path,
        instance.dumps_directory().join(format!("app_{}.manifest", date))
    );
    let content = std::fs::read_to_string(&dump.path).unwrap();
    assert_eq!(
        content,
        format!("{}\n# database: app\n# date: {}\n", MANIFEST_HEADER, date)
    );
    let pg_dump = harness.runner.calls_of("pg_dump");
    assert!(pg_dump[0]
        .iter()
        .any(|a| a.ends_with(&format!("app_{}.dump", date))));

    let listed = dumps::list(&instance, &[]).unwrap();
    assert_eq!(listed, vec![dump.clone()]);
    assert!(dumps::list(&instance, &["other".to_string()]).unwrap().is_empty());

    dumps::restore(&session, &dump.id, None).unwrap();
    let pg_restore = harness.runner.calls_of("pg_restore");
    assert_eq!(pg_restore.len(), 1);
    assert!(pg_restore[0].contains(&"-C".to_string()));

    dumps::restore(&session, &dump.id, Some("app")).unwrap();
    let pg_restore = harness.runner.calls_of("pg_restore");
    assert!(!pg_restore[1].contains(&"-C".to_string()));

    let err = dumps::restore(&session, "app_0000000000", None).unwrap_err();
    assert!(matches!(err, Error::DatabaseDumpNotFound(_)), "{err}");
    let err = dumps::restore(&session, &dump.id, Some("missing")).unwrap_err();
    assert!(matches!(err, Error::DatabaseNotFound(_)), "{err}");
    let err = dumps::dump(&session, "missing").unwrap_err();
    assert!(matches!(err, Error::DatabaseNotFound(_)), "{err}");
}

#[test]
fn test_force_drop_needs_postgresql_13() {
    let harness = TestHarness::new();
    let old = with_app_database(&harness, "12");
    let session = Session::new(&harness.ctx, &old);
    let err = databases::drop(&session, "app", true).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)), "{err}");
    assert!(harness.runner.has_database("app"));
    instances::drop(&harness.ctx, old).unwrap();

    let instance = with_app_database(&harness, "16");
    let session = Session::new(&harness.ctx, &instance);
    databases::drop(&session, "app", true).unwrap();
    assert!(!harness.runner.has_database("app"));
    assert!(harness
        .runner
        .statements()
        .iter()
        .any(|sql| sql == "DROP DATABASE \"app\" WITH (FORCE)"));
}

#[test]
fn test_failed_clone_drops_target() {
    let harness = TestHarness::new();
    let instance = with_app_database(&harness, "16");
    let session = Session::new(&harness.ctx, &instance);
    harness.runner.fail("pg_dump");

    let mut copy = DatabaseManifest::new("copy");
    copy.clone_from = Some(CloneSource {
        dsn: "host=primary dbname=app password=secret".into(),
        schema_only: false,
    });
    let err = databases::apply(&session, &copy).unwrap_err();
    assert!(matches!(err, Error::Command(_)), "{err}");
    assert!(!harness.runner.has_database("copy"));
    assert!(harness
        .runner
        .statements()
        .iter()
        .any(|sql| sql == "DROP DATABASE \"copy\""));
}
