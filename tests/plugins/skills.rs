use cephalon::plugins::skills::{find_skill_doc, load_skill_model, parse_skill_doc};
use std::fs;
use tempfile::tempdir;

const DOC: &str = "# Project Skills\n\nGeneral notes.\n\n## Flow: auth\nLogin and session handling.\n\nFiles:\n- `src/auth/login.ts`\n- `src/auth/session.ts`\n- entry: `function.src/auth/login.ts:login`\n- Tokens are validated on every request\n\n## Flow: billing\nInvoice generation.\n- `src/billing/invoice.py`\n\n## Conventions\nNot a flow section.\n";

#[test]
fn parses_flows_with_files_entries_and_behaviors() {
    let model = parse_skill_doc(DOC);
    assert_eq!(model.flows.len(), 2);

    let auth = model.flow("flow.auth").expect("auth flow");
    assert_eq!(auth.name, "auth");
    assert_eq!(auth.order, 0);
    assert_eq!(auth.description, "Login and session handling.");
    assert_eq!(
        auth.files,
        vec!["src/auth/login.ts".to_string(), "src/auth/session.ts".to_string()]
    );
    assert_eq!(auth.entry_points, vec!["function.src/auth/login.ts:login"]);
    assert_eq!(auth.behaviors, vec!["Tokens are validated on every request"]);

    let billing = model.flow("flow.billing").expect("billing flow");
    assert_eq!(billing.order, 1);
    assert_eq!(billing.files, vec!["src/billing/invoice.py"]);
}

#[test]
fn non_flow_sections_are_not_flows() {
    let model = parse_skill_doc(DOC);
    assert!(model.flows.iter().all(|f| f.name != "Conventions"));
}

#[test]
fn absent_flow_is_absent_not_error() {
    let model = parse_skill_doc(DOC);
    assert!(model.flow("flow.payments").is_none());
}

#[test]
fn reparse_is_idempotent_per_document_version() {
    let a = parse_skill_doc(DOC);
    let b = parse_skill_doc(DOC);
    assert_eq!(
        serde_json::to_value(&a).unwrap(),
        serde_json::to_value(&b).unwrap()
    );
}

#[test]
fn doc_discovery_prefers_cephalon_dir() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".cephalon")).unwrap();
    fs::create_dir_all(root.join(".claude/skills/demo")).unwrap();
    fs::write(root.join(".cephalon/SKILL.md"), "## Flow: a\n- `x/a.rs`\n").unwrap();
    fs::write(root.join(".claude/skills/demo/SKILL.md"), "## Flow: b\n- `x/b.rs`\n").unwrap();

    let found = find_skill_doc(root).expect("doc found");
    assert_eq!(found, root.join(".cephalon/SKILL.md"));

    let model = load_skill_model(root).unwrap().expect("model");
    assert_eq!(model.flows.len(), 1);
    assert_eq!(model.flows[0].id, "flow.a");
    assert_eq!(model.source_path.as_deref(), Some(found.as_path()));
}

#[test]
fn claude_skills_dir_is_a_fallback() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".claude/skills/demo")).unwrap();
    fs::write(root.join(".claude/skills/demo/SKILL.md"), "## Flow: b\n- `x/b.rs`\n").unwrap();

    let model = load_skill_model(root).unwrap().expect("model");
    assert_eq!(model.flows[0].id, "flow.b");
}

#[test]
fn missing_doc_yields_none() {
    let tmp = tempdir().unwrap();
    assert!(load_skill_model(tmp.path()).unwrap().is_none());
}
