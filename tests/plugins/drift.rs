use cephalon::core::config::{CephalonConfig, FileMatchPolicy};
use cephalon::core::store::{Store, StoreKind};
use cephalon::plugins::drift::{
    check_drift, format_drift_report, latest_report, DRIFT_MISSING_CODE, DRIFT_MISSING_DOC,
    DRIFT_SIGNATURE_CHANGE, DRIFT_STALE_REFERENCE,
};
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

fn write_skill(dir: &Path, body: &str) {
    write_file(dir, ".cephalon/SKILL.md", body);
}

#[test]
fn exact_enumeration_has_no_drift() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    write_file(
        project.path(),
        "src/auth/login.ts",
        "export function login(u) {\n  return u;\n}\n",
    );
    write_file(
        project.path(),
        "src/auth/session.ts",
        "export function session(id) {\n  return id;\n}\n",
    );
    write_skill(
        project.path(),
        "## Flow: auth\nAuth flow.\n- `src/auth/login.ts`\n- `src/auth/session.ts`\n",
    );

    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(!report.has_drift, "unexpected drifts: {:?}", report.drifts);
    assert!(report.drifts.is_empty());
}

#[test]
fn basename_alias_tolerates_moved_directories() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    // Documented as auth/login.ts, actually at src/auth/login.ts.
    write_file(
        project.path(),
        "src/auth/login.ts",
        "export function login(u) {\n  return u;\n}\n",
    );
    write_skill(project.path(), "## Flow: auth\n- `auth/login.ts`\n");

    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(
        !report
            .drifts
            .iter()
            .any(|d| d.drift_type == DRIFT_MISSING_DOC || d.drift_type == DRIFT_STALE_REFERENCE),
        "alias match must suppress missing_doc/stale_reference: {:?}",
        report.drifts
    );
}

#[test]
fn exact_policy_reports_the_moved_file() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let mut config = CephalonConfig::default();
    config.file_match = FileMatchPolicy::Exact;

    write_file(
        project.path(),
        "src/auth/login.ts",
        "export function login(u) {\n  return u;\n}\n",
    );
    write_skill(project.path(), "## Flow: auth\n- `auth/login.ts`\n");

    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(report
        .drifts
        .iter()
        .any(|d| d.drift_type == DRIFT_STALE_REFERENCE));
}

#[test]
fn undocumented_reachable_file_is_missing_doc() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    write_file(
        project.path(),
        "src/auth/login.ts",
        "export function login(u) {\n  return u;\n}\n",
    );
    write_file(
        project.path(),
        "src/auth/session.ts",
        "export function session(id) {\n  return id;\n}\n",
    );
    // The flow declares both files as structural entries but documents
    // only one of them.
    write_skill(
        project.path(),
        "## Flow: auth\n- `src/auth/login.ts`\n- entry: `file.src/auth/login.ts`\n- entry: `file.src/auth/session.ts`\n",
    );

    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(report.drifts.iter().any(|d| d.drift_type == DRIFT_MISSING_DOC
        && d.code_item.as_deref() == Some("src/auth/session.ts")));
    assert!(!report
        .drifts
        .iter()
        .any(|d| d.code_item.as_deref() == Some("src/auth/login.ts")));
}

#[test]
fn documented_flow_with_no_code_is_missing_code() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    write_file(
        project.path(),
        "src/other.ts",
        "export function other() {\n  return 1;\n}\n",
    );
    write_skill(project.path(), "## Flow: ghost\n- `src/ghost/engine.ts`\n");

    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(report.has_drift);
    let types: Vec<&str> = report.drifts.iter().map(|d| d.drift_type.as_str()).collect();
    assert!(types.contains(&DRIFT_MISSING_CODE));
    assert!(types.contains(&DRIFT_STALE_REFERENCE));
    // Within a flow, missing_code outranks stale_reference.
    assert_eq!(report.drifts[0].drift_type, DRIFT_MISSING_CODE);
}

#[test]
fn signature_change_is_detected_against_snapshot() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    write_file(
        project.path(),
        "src/auth/login.ts",
        "export function login(user) {\n  return user;\n}\n",
    );
    write_skill(project.path(), "## Flow: auth\n- `src/auth/login.ts`\n");

    // First check records the baseline.
    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(!report.has_drift);

    // Same structure, different signature.
    write_file(
        project.path(),
        "src/auth/login.ts",
        "export function login(user, otp) {\n  return user;\n}\n",
    );
    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(report
        .drifts
        .iter()
        .any(|d| d.drift_type == DRIFT_SIGNATURE_CHANGE
            && d.code_item.as_deref() == Some("function.src/auth/login.ts:login")));

    // A third check against the new baseline is clean again.
    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(!report
        .drifts
        .iter()
        .any(|d| d.drift_type == DRIFT_SIGNATURE_CHANGE));
}

#[test]
fn flow_filter_and_declaration_order() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    write_skill(
        project.path(),
        "## Flow: alpha\n- `src/alpha.ts`\n\n## Flow: beta\n- `src/beta.ts`\n",
    );
    // Neither file exists; both flows drift.
    fs::create_dir_all(project.path().join("src")).unwrap();
    fs::write(project.path().join("src/unrelated.py"), "def x():\n    pass\n").unwrap();

    let full = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    let flows: Vec<&str> = full.drifts.iter().map(|d| d.flow_id.as_str()).collect();
    let first_beta = flows.iter().position(|f| *f == "flow.beta").unwrap();
    let last_alpha = flows.iter().rposition(|f| *f == "flow.alpha").unwrap();
    assert!(last_alpha < first_beta, "flows must keep declaration order");

    let only_beta = check_drift(&store, "demo", project.path(), Some("flow.beta"), &config).unwrap();
    assert!(only_beta.drifts.iter().all(|d| d.flow_id == "flow.beta"));
    assert!(only_beta.has_drift);
}

#[test]
fn reports_are_persisted_and_superseded_not_mutated() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    write_skill(project.path(), "## Flow: ghost\n- `src/ghost.ts`\n");
    fs::create_dir_all(project.path().join("src")).unwrap();
    fs::write(project.path().join("src/real.py"), "def real():\n    pass\n").unwrap();

    let first = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(first.has_drift);

    // Fix the project; the next check supersedes the old report.
    fs::write(project.path().join("src/ghost.ts"), "export function ghost() {\n  return 1;\n}\n")
        .unwrap();
    write_skill(project.path(), "## Flow: ghost\n- `src/ghost.ts`\n");
    let second = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(!second.has_drift);
    assert_ne!(first.id, second.id);

    let latest = latest_report(&store, "demo").unwrap().expect("latest report");
    assert_eq!(latest.id, second.id);
    assert!(!latest.has_drift);
}

#[test]
fn no_skill_doc_is_success_not_error() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();
    fs::create_dir_all(project.path().join("src")).unwrap();
    fs::write(project.path().join("src/a.py"), "def a():\n    pass\n").unwrap();

    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    assert!(!report.has_drift);
    assert!(report.drifts.is_empty());
}

#[test]
fn report_formats_as_markdown() {
    let tmp = tempdir().unwrap();
    let project = tempdir().unwrap();
    let store = store_at(tmp.path());
    let config = CephalonConfig::default();

    write_skill(project.path(), "## Flow: ghost\n- `src/ghost.ts`\n");
    fs::create_dir_all(project.path().join("src")).unwrap();
    fs::write(project.path().join("src/real.py"), "def real():\n    pass\n").unwrap();

    let report = check_drift(&store, "demo", project.path(), None, &config).unwrap();
    let rendered = format_drift_report(&report);
    assert!(rendered.contains("# Skill-Code Drift Report"));
    assert!(rendered.contains("missing_code"));
}
