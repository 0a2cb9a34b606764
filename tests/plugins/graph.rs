use cephalon::core::config::CephalonConfig;
use cephalon::core::error::CephalonError;
use cephalon::core::store::{Store, StoreKind};
use cephalon::plugins::graph::{
    build_graph, graph_stats, load_graph, SyncMode, KIND_FILE, KIND_FUNCTION,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn store_at(root: &Path) -> Store {
    Store {
        kind: StoreKind::Repo,
        root: root.to_path_buf(),
    }
}

fn write_project(dir: &Path) {
    fs::create_dir_all(dir.join("src/auth")).unwrap();
    fs::write(
        dir.join("src/auth/login.ts"),
        "import { session } from './session';\nexport function login(user) {\n  return validate(user);\n}\nfunction validate(u) {\n  return u != null;\n}\n",
    )
    .unwrap();
    fs::write(
        dir.join("src/auth/session.ts"),
        "export function session(id) {\n  return id;\n}\n",
    )
    .unwrap();
    fs::create_dir_all(dir.join("app")).unwrap();
    fs::write(
        dir.join("app/views.py"),
        "import os\ndef handler(request):\n    return render(request)\ndef render(request):\n    return request\n",
    )
    .unwrap();
    // Junk that must be ignored.
    fs::create_dir_all(dir.join("node_modules/lib")).unwrap();
    fs::write(dir.join("node_modules/lib/index.js"), "export function hidden() {}\n").unwrap();
    fs::write(dir.join("README.md"), "# not source\n").unwrap();
}

fn entity_set(store: &Store, project: &str) -> BTreeSet<String> {
    load_graph(store, project)
        .unwrap()
        .expect("graph present")
        .entities
        .keys()
        .cloned()
        .collect()
}

#[test]
fn build_extracts_entities_and_skips_ignored_dirs() {
    let tmp = tempdir().unwrap();
    let project_dir = tempdir().unwrap();
    write_project(project_dir.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    let result = build_graph(&store, "demo", project_dir.path(), SyncMode::Full, &config).unwrap();
    assert_eq!(result.files_processed, 3);
    assert!(result.errors.is_empty());

    let graph = load_graph(&store, "demo").unwrap().unwrap();
    let files = graph.file_paths();
    assert!(files.contains("src/auth/login.ts"));
    assert!(files.contains("app/views.py"));
    assert!(!files.iter().any(|f| f.contains("node_modules")));
    assert!(!files.iter().any(|f| f.ends_with(".md")));

    assert!(graph.entities.contains_key("function.src/auth/login.ts:login"));
    assert!(graph
        .entities
        .values()
        .any(|e| e.kind == KIND_FUNCTION && e.name == "handler"));
}

#[test]
fn rebuild_without_changes_is_idempotent() {
    let tmp = tempdir().unwrap();
    let project_dir = tempdir().unwrap();
    write_project(project_dir.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    build_graph(&store, "demo", project_dir.path(), SyncMode::Full, &config).unwrap();
    let first = entity_set(&store, "demo");
    let first_relations = load_graph(&store, "demo").unwrap().unwrap().relation_count;

    let second_sync =
        build_graph(&store, "demo", project_dir.path(), SyncMode::Incremental, &config).unwrap();
    assert_eq!(second_sync.files_processed, 0);
    assert_eq!(second_sync.files_skipped, 3);

    let second = entity_set(&store, "demo");
    let second_relations = load_graph(&store, "demo").unwrap().unwrap().relation_count;
    assert_eq!(first, second);
    assert_eq!(first_relations, second_relations);

    // Full rebuilds converge on the same sets too.
    build_graph(&store, "demo", project_dir.path(), SyncMode::Full, &config).unwrap();
    assert_eq!(first, entity_set(&store, "demo"));
}

#[test]
fn resync_replaces_prior_generation() {
    let tmp = tempdir().unwrap();
    let project_dir = tempdir().unwrap();
    write_project(project_dir.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    let first = build_graph(&store, "demo", project_dir.path(), SyncMode::Full, &config).unwrap();
    fs::remove_file(project_dir.path().join("src/auth/session.ts")).unwrap();
    let second =
        build_graph(&store, "demo", project_dir.path(), SyncMode::Incremental, &config).unwrap();
    assert!(second.generation > first.generation);

    let graph = load_graph(&store, "demo").unwrap().unwrap();
    assert!(!graph.file_paths().contains("src/auth/session.ts"));
    assert!(graph.file_paths().contains("src/auth/login.ts"));
}

#[test]
fn unreadable_project_path_is_fatal_build_error() {
    let tmp = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    let missing = tmp.path().join("no-such-dir");
    match build_graph(&store, "demo", &missing, SyncMode::Full, &config) {
        Err(CephalonError::BuildError(_)) => {}
        other => panic!("expected BuildError, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn timed_out_build_is_discarded_entirely() {
    let tmp = tempdir().unwrap();
    let project_dir = tempdir().unwrap();
    write_project(project_dir.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    let first = build_graph(&store, "demo", project_dir.path(), SyncMode::Full, &config).unwrap();

    let mut strict = CephalonConfig::default();
    strict.build_timeout_ms = 0;
    fs::write(project_dir.path().join("src/auth/extra.ts"), "export function extra() {}\n")
        .unwrap();
    match build_graph(&store, "demo", project_dir.path(), SyncMode::Incremental, &strict) {
        Err(CephalonError::Timeout(_)) => {}
        other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
    }

    // The prior generation is still what readers see.
    let stats = graph_stats(&store, "demo").unwrap();
    let graph = load_graph(&store, "demo").unwrap().unwrap();
    assert!(!graph.file_paths().contains("src/auth/extra.ts"));
    assert_eq!(stats.file_count, first.files_processed);
}

#[test]
fn reachability_spans_files_through_containment() {
    let tmp = tempdir().unwrap();
    let project_dir = tempdir().unwrap();
    write_project(project_dir.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    build_graph(&store, "demo", project_dir.path(), SyncMode::Full, &config).unwrap();

    let graph = load_graph(&store, "demo").unwrap().unwrap();
    let reached = graph.reachable_from(&["file.src/auth/login.ts".to_string()]);
    let names: BTreeSet<&str> = reached.iter().map(|e| e.name.as_str()).collect();
    // Members of the file are pulled in through belongs_to containment.
    assert!(names.contains("login"));
    assert!(names.contains("validate"));
    // Unrelated files are not.
    assert!(reached
        .iter()
        .all(|e| e.kind != KIND_FILE || e.qualified_path != "app/views.py"));
}

#[test]
fn stats_reflect_current_graph() {
    let tmp = tempdir().unwrap();
    let project_dir = tempdir().unwrap();
    write_project(project_dir.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    let empty = graph_stats(&store, "demo").unwrap();
    assert_eq!(empty.entity_count, 0);
    assert!(empty.last_sync.is_none());

    build_graph(&store, "demo", project_dir.path(), SyncMode::Full, &config).unwrap();
    let stats = graph_stats(&store, "demo").unwrap();
    assert_eq!(stats.file_count, 3);
    assert!(stats.entity_count > 3);
    assert!(stats.relation_count > 0);
    assert!(stats.last_sync.is_some());
}
