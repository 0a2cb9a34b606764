use cephalon::core::config::CephalonConfig;
use cephalon::core::store::{Store, StoreKind};
use cephalon::plugins::context::{format_context_for_agent, get_full_context};
use cephalon::plugins::drift::{check_drift, latest_report};
use cephalon::plugins::graph::{last_sync, KIND_FILE};
use cephalon::plugins::memory::{store_memory, HashEmbedder};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn store_at(root: &Path) -> Store {
    Store {
        kind: StoreKind::Repo,
        root: root.to_path_buf(),
    }
}

fn write_file(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn seed_project(dir: &Path) {
    write_file(
        dir,
        "src/auth/login.ts",
        "export function login(user) {\n  return validate(user);\n}\nfunction validate(u) {\n  return u != null;\n}\n",
    );
    write_file(
        dir,
        "src/billing/invoice.py",
        "def invoice(amount):\n    return amount\n",
    );
    write_file(
        dir,
        ".cephalon/SKILL.md",
        "## Flow: auth\nLogin and session handling.\n- `src/auth/login.ts`\n- Tokens expire after one hour\n\n## Flow: billing\nInvoices.\n- `src/billing/invoice.py`\n",
    );
}

#[test]
fn composes_all_three_layers() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    seed_project(project.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    let embedder = HashEmbedder::default();

    for i in 0..7 {
        store_memory(
            &store,
            &embedder,
            "pattern",
            &format!("auth lesson {}", i),
            "login and session handling detail",
            "demo",
            5.0,
            &config,
        )
        .unwrap();
    }
    // A record in another project must never appear.
    store_memory(
        &store,
        &embedder,
        "pattern",
        "other-project lesson",
        "login and session handling detail",
        "elsewhere",
        9.9,
        &config,
    )
    .unwrap();

    let ctx = get_full_context(
        &store,
        &embedder,
        "flow.auth",
        "demo",
        project.path(),
        &config,
    )
    .unwrap();

    assert_eq!(ctx.flow_id, "flow.auth");
    let skill = ctx.skill.as_ref().expect("skill section");
    assert_eq!(skill.files, vec!["src/auth/login.ts"]);
    assert_eq!(skill.behaviors, vec!["Tokens expire after one hour"]);

    // Graph slice is scoped to the flow, not the whole project.
    assert!(ctx
        .graph
        .entities
        .iter()
        .any(|e| e.qualified_path == "src/auth/login.ts"));
    assert!(!ctx
        .graph
        .entities
        .iter()
        .any(|e| e.kind == KIND_FILE && e.qualified_path == "src/billing/invoice.py"));
    assert!(ctx
        .graph
        .entities
        .iter()
        .any(|e| e.qualified_path == "src/auth/login.ts:login"));

    // The documented layer is overlaid: the flow node documents its files.
    assert!(ctx
        .graph
        .entities
        .iter()
        .any(|e| e.kind == "flow" && e.id == "flow.auth"));
    assert!(ctx
        .graph
        .relations
        .iter()
        .any(|r| r.kind == "documents"
            && r.source_id == "flow.auth"
            && r.target_id == "file.src/auth/login.ts"));

    // Memory layer: capped and project-scoped.
    assert!(ctx.memories.len() <= config.context_memory_limit);
    assert!(!ctx.memories.is_empty());
    assert!(ctx.memories.iter().all(|m| m.project == "demo"));
}

#[test]
fn bare_flow_name_resolves() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    seed_project(project.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    let embedder = HashEmbedder::default();

    let ctx =
        get_full_context(&store, &embedder, "auth", "demo", project.path(), &config).unwrap();
    assert_eq!(ctx.flow_id, "flow.auth");
    assert!(ctx.skill.is_some());
}

#[test]
fn builds_graph_when_absent_but_never_runs_drift() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    seed_project(project.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    let embedder = HashEmbedder::default();

    assert!(last_sync(&store, "demo").is_err() || last_sync(&store, "demo").unwrap().is_none());

    let ctx =
        get_full_context(&store, &embedder, "flow.auth", "demo", project.path(), &config).unwrap();
    assert!(!ctx.graph.entities.is_empty());

    // The facade rebuilt the graph synchronously...
    assert!(last_sync(&store, "demo").unwrap().is_some());
    // ...but did not trigger a drift check.
    assert!(ctx.drift.is_none());
    assert!(latest_report(&store, "demo").unwrap().is_none());
}

#[test]
fn fresh_graph_is_not_rebuilt() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    seed_project(project.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    let embedder = HashEmbedder::default();

    get_full_context(&store, &embedder, "flow.auth", "demo", project.path(), &config).unwrap();
    let synced = last_sync(&store, "demo").unwrap().unwrap();

    // Changing the tree without passing the staleness window leaves the
    // snapshot as-is (callers opt into freshness via sync).
    write_file(project.path(), "src/auth/extra.ts", "export function extra() {}\n");
    let ctx =
        get_full_context(&store, &embedder, "flow.auth", "demo", project.path(), &config).unwrap();
    assert_eq!(last_sync(&store, "demo").unwrap().unwrap(), synced);
    assert!(!ctx
        .graph
        .entities
        .iter()
        .any(|e| e.qualified_path == "src/auth/extra.ts"));
}

#[test]
fn surfaces_last_stored_drift_report_for_the_flow() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    seed_project(project.path());
    // billing file missing -> drift for flow.billing only.
    fs::remove_file(project.path().join("src/billing/invoice.py")).unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    let embedder = HashEmbedder::default();

    check_drift(&store, "demo", project.path(), None, &config).unwrap();

    let billing_ctx =
        get_full_context(&store, &embedder, "flow.billing", "demo", project.path(), &config)
            .unwrap();
    let report = billing_ctx.drift.expect("stored report");
    assert!(report.has_drift);
    assert!(report.drifts.iter().all(|d| d.flow_id == "flow.billing"));

    let auth_ctx =
        get_full_context(&store, &embedder, "flow.auth", "demo", project.path(), &config).unwrap();
    let report = auth_ctx.drift.expect("stored report");
    assert!(!report.has_drift, "auth flow has no drift entries");
}

#[test]
fn unknown_flow_yields_empty_slice_not_error() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    seed_project(project.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    let embedder = HashEmbedder::default();

    let ctx = get_full_context(
        &store,
        &embedder,
        "flow.payments",
        "demo",
        project.path(),
        &config,
    )
    .unwrap();
    assert!(ctx.skill.is_none());
    assert!(ctx.graph.entities.is_empty());
}

#[test]
fn markdown_rendering_includes_sections() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    seed_project(project.path());
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    let embedder = HashEmbedder::default();

    store_memory(
        &store,
        &embedder,
        "pattern",
        "session invalidation",
        "always clear the refresh token",
        "demo",
        6.0,
        &config,
    )
    .unwrap();

    let ctx =
        get_full_context(&store, &embedder, "flow.auth", "demo", project.path(), &config).unwrap();
    let rendered = format_context_for_agent(&ctx);
    assert!(rendered.contains("# Context for flow: flow.auth"));
    assert!(rendered.contains("## Documented Contract"));
    assert!(rendered.contains("## Structural Contract"));
    assert!(rendered.contains("`src/auth/login.ts`"));
}
