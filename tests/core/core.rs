use cephalon::core::broker::{BrokerEvent, DbBroker};
use cephalon::core::config::{CephalonConfig, FileMatchPolicy};
use cephalon::core::db;
use cephalon::core::error::CephalonError;
use cephalon::core::store::{Store, StoreKind};
use rusqlite::params;
use std::fs;
use tempfile::tempdir;

fn store_at(root: &std::path::Path) -> Store {
    Store {
        kind: StoreKind::Repo,
        root: root.to_path_buf(),
    }
}

#[test]
fn db_init_creates_all_bins() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    db::initialize_all(root).expect("init all bins");

    assert!(db::graph_db_path(root).exists());
    assert!(db::memory_db_path(root).exists());
    assert!(db::task_db_path(root).exists());
}

#[test]
fn db_connect_enables_foreign_keys() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    db::initialize_graph_db(root).unwrap();

    let conn = db::db_connect(&db::graph_db_path(root).to_string_lossy()).unwrap();
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(fk_on, 1);
}

#[test]
fn broker_round_trip_and_audit() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    db::initialize_graph_db(root).unwrap();

    let broker = DbBroker::new(root);
    let value: i64 = broker
        .with_conn(
            &db::graph_db_path(root),
            "tester",
            Some("intent:test"),
            "core.test",
            |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO meta(key, value) VALUES(?1, ?2)",
                    params!["probe", "42"],
                )?;
                let v: String =
                    conn.query_row("SELECT value FROM meta WHERE key = 'probe'", [], |row| {
                        row.get(0)
                    })?;
                Ok(v.parse::<i64>().unwrap())
            },
        )
        .unwrap();
    assert_eq!(value, 42);

    let audit = fs::read_to_string(root.join("broker.events.jsonl")).unwrap();
    let line = audit
        .lines()
        .find(|l| l.contains("core.test"))
        .expect("audit event for op");
    let event: BrokerEvent = serde_json::from_str(line).unwrap();
    assert_eq!(event.actor, "tester");
    assert_eq!(event.op, "core.test");
    assert_eq!(event.status, "success");
    assert_eq!(event.intent_ref.as_deref(), Some("intent:test"));
}

#[test]
fn broker_logs_errors_too() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    db::initialize_graph_db(root).unwrap();

    let broker = DbBroker::new(root);
    let result: Result<(), CephalonError> = broker.with_conn(
        &db::graph_db_path(root),
        "tester",
        None,
        "core.failing",
        |_conn| Err(CephalonError::ValidationError("boom".to_string())),
    );
    assert!(result.is_err());

    let audit = fs::read_to_string(root.join("broker.events.jsonl")).unwrap();
    assert!(audit
        .lines()
        .any(|l| l.contains("core.failing") && l.contains("\"error\"")));
}

#[test]
fn config_defaults_and_file_override() {
    let tmp = tempdir().unwrap();
    let repo = tmp.path();

    let cfg = CephalonConfig::load(repo).unwrap();
    assert_eq!(cfg.graph_staleness_secs, 3600);
    assert_eq!(cfg.max_subtask_retries, 3);
    assert_eq!(cfg.file_match, FileMatchPolicy::BasenameAlias);

    fs::create_dir_all(repo.join(".cephalon")).unwrap();
    fs::write(
        repo.join(".cephalon/config.toml"),
        "graph_staleness_secs = 60\nfile_match = \"exact\"\nignore_dirs = [\"vendor\"]\n",
    )
    .unwrap();
    let cfg = CephalonConfig::load(repo).unwrap();
    assert_eq!(cfg.graph_staleness_secs, 60);
    assert_eq!(cfg.file_match, FileMatchPolicy::Exact);
    assert_eq!(cfg.ignore_dirs, vec!["vendor".to_string()]);
    // Unset keys keep defaults.
    assert_eq!(cfg.max_subtask_retries, 3);
}

#[test]
fn config_malformed_is_config_error() {
    let tmp = tempdir().unwrap();
    let repo = tmp.path();
    fs::create_dir_all(repo.join(".cephalon")).unwrap();
    fs::write(repo.join(".cephalon/config.toml"), "graph_staleness_secs = \"soon\"\n").unwrap();
    match CephalonConfig::load(repo) {
        Err(CephalonError::ConfigError(_)) => {}
        other => panic!("expected ConfigError, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn store_handle_is_plain_data() {
    let tmp = tempdir().unwrap();
    let store = store_at(tmp.path());
    assert_eq!(store.kind, StoreKind::Repo);
    assert_eq!(store.root, tmp.path());
}
