//! Skill-vs-code drift detection.
//!
//! Diffs the Skill Document Model (what the docs claim) against the Code
//! Graph (what the tree contains), per documented flow. Detection is
//! read-only analysis: it refreshes the graph and writes its own report
//! rows, but never touches the skill doc or the code.
//!
//! Drift classes, ordered by severity:
//! 1. missing_code      - flow documented, zero resolvable structural entities
//! 2. missing_doc       - structural file reachable from the flow, not documented
//! 3. signature_change  - entity signature changed since the last recorded snapshot
//! 4. stale_reference   - documented file absent from the project

use crate::core::broker::DbBroker;
use crate::core::config::{CephalonConfig, FileMatchPolicy};
use crate::core::db;
use crate::core::error::CephalonError;
use crate::core::store::Store;
use crate::core::time::{new_event_id, now_epoch_z};
use crate::plugins::graph::{self, Graph, SyncMode, KIND_FILE};
use crate::plugins::skills::{self, SkillFlow};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;

pub const DRIFT_MISSING_CODE: &str = "missing_code";
pub const DRIFT_MISSING_DOC: &str = "missing_doc";
pub const DRIFT_SIGNATURE_CHANGE: &str = "signature_change";
pub const DRIFT_STALE_REFERENCE: &str = "stale_reference";

fn severity_rank(drift_type: &str) -> u8 {
    match drift_type {
        DRIFT_MISSING_CODE => 0,
        DRIFT_MISSING_DOC => 1,
        DRIFT_SIGNATURE_CHANGE => 2,
        DRIFT_STALE_REFERENCE => 3,
        _ => 4,
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Drift {
    pub id: String,
    pub flow_id: String,
    pub drift_type: String,
    pub description: String,
    pub doc_item: Option<String>,
    pub code_item: Option<String>,
    pub detected_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DriftReport {
    pub id: String,
    pub project: String,
    pub flow_scope: Option<String>,
    pub has_drift: bool,
    pub drifts: Vec<Drift>,
    pub summary: String,
    pub checked_at: String,
}

/// Check documented flows against the structural graph.
///
/// Passing `flow_id` restricts the check to one flow; otherwise every
/// documented flow is checked in declaration order. "No drift found" is a
/// successful empty report, never an error.
pub fn check_drift(
    store: &Store,
    project: &str,
    project_path: &Path,
    flow_id: Option<&str>,
    config: &CephalonConfig,
) -> Result<DriftReport, CephalonError> {
    graph::build_graph(store, project, project_path, SyncMode::Incremental, config)?;

    let checked_at = now_epoch_z();
    let report_id = new_event_id();

    let Some(skill_model) = skills::load_skill_model(project_path)? else {
        let report = DriftReport {
            id: report_id,
            project: project.to_string(),
            flow_scope: flow_id.map(|s| s.to_string()),
            has_drift: false,
            drifts: Vec::new(),
            summary: format!("Cannot detect drift: no skill doc found in {}", project_path.display()),
            checked_at,
        };
        persist_report(store, &report)?;
        return Ok(report);
    };

    let code_graph = graph::load_graph(store, project)?.unwrap_or_default();

    let mut drifts: Vec<Drift> = Vec::new();
    for flow in &skill_model.flows {
        if let Some(wanted) = flow_id {
            if flow.id != wanted && flow.name != wanted {
                continue;
            }
        }
        let mut flow_drifts = check_flow(store, project, flow, &code_graph, config, &checked_at)?;
        flow_drifts.sort_by_key(|d| severity_rank(&d.drift_type));
        drifts.extend(flow_drifts);
    }

    let summary = summarize(&drifts);
    let report = DriftReport {
        id: report_id,
        project: project.to_string(),
        flow_scope: flow_id.map(|s| s.to_string()),
        has_drift: !drifts.is_empty(),
        drifts,
        summary,
        checked_at,
    };
    persist_report(store, &report)?;
    Ok(report)
}

fn summarize(drifts: &[Drift]) -> String {
    if drifts.is_empty() {
        return "No drift detected. Skill and code are in sync.".to_string();
    }
    let mut by_type: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for d in drifts {
        *by_type.entry(d.drift_type.as_str()).or_insert(0) += 1;
    }
    let parts: Vec<String> = by_type.iter().map(|(t, n)| format!("{} {}", n, t)).collect();
    format!("Found {} drift(s): {}", drifts.len(), parts.join(", "))
}

/// True when `documented` covers `path` under the active match policy.
fn path_documented(documented: &[String], path: &str, policy: FileMatchPolicy) -> bool {
    if documented.iter().any(|d| d == path) {
        return true;
    }
    if policy == FileMatchPolicy::Exact {
        return false;
    }
    let basename = basename_of(path);
    documented.iter().any(|d| basename_of(d) == basename)
}

fn basename_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// True when the documented path resolves to a project file under the
/// active match policy.
fn path_resolves(code_graph: &Graph, path: &str, policy: FileMatchPolicy) -> bool {
    if code_graph.file_by_path(path).is_some() {
        return true;
    }
    policy == FileMatchPolicy::BasenameAlias && !code_graph.files_by_basename(path).is_empty()
}

/// Entity ids a flow's traversal starts from: declared entry points when
/// they resolve, else the documented files themselves.
pub fn resolve_entry_ids(
    flow: &SkillFlow,
    code_graph: &Graph,
    policy: FileMatchPolicy,
) -> Vec<String> {
    let mut entries: Vec<String> = flow
        .entry_points
        .iter()
        .filter(|id| code_graph.entities.contains_key(id.as_str()))
        .cloned()
        .collect();
    if entries.is_empty() {
        // No declared entries: fall back to the documented files themselves.
        for doc_path in &flow.files {
            if let Some(file) = code_graph.file_by_path(doc_path) {
                entries.push(file.id.clone());
            } else if policy == FileMatchPolicy::BasenameAlias {
                for file in code_graph.files_by_basename(doc_path) {
                    entries.push(file.id.clone());
                }
            }
        }
        entries.sort();
        entries.dedup();
    }
    entries
}

fn check_flow(
    store: &Store,
    project: &str,
    flow: &SkillFlow,
    code_graph: &Graph,
    config: &CephalonConfig,
    checked_at: &str,
) -> Result<Vec<Drift>, CephalonError> {
    let policy = config.file_match;
    let mut drifts = Vec::new();

    let entry_ids = resolve_entry_ids(flow, code_graph, policy);
    let reached = code_graph.reachable_from(&entry_ids);

    if reached.is_empty() && (!flow.files.is_empty() || !flow.entry_points.is_empty()) {
        drifts.push(Drift {
            id: new_event_id(),
            flow_id: flow.id.clone(),
            drift_type: DRIFT_MISSING_CODE.to_string(),
            description: format!(
                "Flow '{}' is documented but resolves to zero structural entities",
                flow.id
            ),
            doc_item: Some(flow.id.clone()),
            code_item: None,
            detected_at: checked_at.to_string(),
        });
    }

    // Structural file set S reachable from the flow's entries.
    let structural_files: BTreeSet<String> = reached
        .iter()
        .filter(|e| e.kind == KIND_FILE)
        .map(|e| e.qualified_path.clone())
        .collect();

    // Documented set D vs the project: files the doc names that no longer exist.
    for doc_path in &flow.files {
        if !path_resolves(code_graph, doc_path, policy) {
            drifts.push(Drift {
                id: new_event_id(),
                flow_id: flow.id.clone(),
                drift_type: DRIFT_STALE_REFERENCE.to_string(),
                description: format!(
                    "Documented file '{}' not found in the project",
                    doc_path
                ),
                doc_item: Some(doc_path.clone()),
                code_item: None,
                detected_at: checked_at.to_string(),
            });
        }
    }

    // S vs D: structural files the doc never mentions.
    for code_path in &structural_files {
        if !path_documented(&flow.files, code_path, policy) {
            drifts.push(Drift {
                id: new_event_id(),
                flow_id: flow.id.clone(),
                drift_type: DRIFT_MISSING_DOC.to_string(),
                description: format!(
                    "File '{}' is reachable from flow '{}' but not documented",
                    code_path, flow.id
                ),
                doc_item: None,
                code_item: Some(code_path.clone()),
                detected_at: checked_at.to_string(),
            });
        }
    }

    // Signature drift against the last recorded snapshot for this flow.
    let current: Vec<(String, String)> = reached
        .iter()
        .filter_map(|e| {
            e.attributes
                .get("signature")
                .filter(|s| !s.is_empty())
                .map(|sig| (e.id.clone(), signature_hash(sig)))
        })
        .collect();
    let changed = diff_and_record_snapshot(store, project, &flow.id, &current, checked_at)?;
    for entity_id in changed {
        drifts.push(Drift {
            id: new_event_id(),
            flow_id: flow.id.clone(),
            drift_type: DRIFT_SIGNATURE_CHANGE.to_string(),
            description: format!(
                "Signature of '{}' changed since the last check of flow '{}'",
                entity_id, flow.id
            ),
            doc_item: None,
            code_item: Some(entity_id),
            detected_at: checked_at.to_string(),
        });
    }

    Ok(drifts)
}

fn signature_hash(signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compare current signatures against the stored per-flow snapshot, then
/// replace the snapshot. Returns ids whose signature hash changed. First
/// check of a flow records a baseline and reports nothing.
fn diff_and_record_snapshot(
    store: &Store,
    project: &str,
    flow_id: &str,
    current: &[(String, String)],
    checked_at: &str,
) -> Result<Vec<String>, CephalonError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::graph_db_path(&store.root),
        "cephalon",
        None,
        "drift.snapshot",
        |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut changed = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT signature_hash FROM flow_snapshots
                     WHERE project = ?1 AND flow_id = ?2 AND entity_id = ?3",
                )?;
                for (entity_id, hash) in current {
                    let prior: Option<String> = stmt
                        .query_row(params![project, flow_id, entity_id], |row| row.get(0))
                        .optional()?;
                    if let Some(prior) = prior {
                        if &prior != hash {
                            changed.push(entity_id.clone());
                        }
                    }
                }
            }
            tx.execute(
                "DELETE FROM flow_snapshots WHERE project = ?1 AND flow_id = ?2",
                params![project, flow_id],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO flow_snapshots(project, flow_id, entity_id, signature_hash, recorded_at)
                     VALUES(?1, ?2, ?3, ?4, ?5)",
                )?;
                for (entity_id, hash) in current {
                    insert.execute(params![project, flow_id, entity_id, hash, checked_at])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        },
    )
}

fn persist_report(store: &Store, report: &DriftReport) -> Result<(), CephalonError> {
    db::initialize_graph_db(&store.root)?;
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::graph_db_path(&store.root),
        "cephalon",
        None,
        "drift.report",
        |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO drift_reports(id, project, flow_scope, has_drift, summary, checked_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    report.id,
                    report.project,
                    report.flow_scope,
                    report.has_drift as i64,
                    report.summary,
                    report.checked_at,
                ],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO drifts(id, report_id, flow_id, drift_type, description, doc_item, code_item, detected_at)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for d in &report.drifts {
                    insert.execute(params![
                        d.id,
                        report.id,
                        d.flow_id,
                        d.drift_type,
                        d.description,
                        d.doc_item,
                        d.code_item,
                        d.detected_at,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        },
    )
}

/// Most recent stored report for the project. Reports are immutable
/// history; the latest one supersedes the rest.
pub fn latest_report(store: &Store, project: &str) -> Result<Option<DriftReport>, CephalonError> {
    let db_path = db::graph_db_path(&store.root);
    if !db_path.exists() {
        return Ok(None);
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, "cephalon", None, "drift.latest", |conn| {
        let table_present: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'drift_reports'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if table_present.is_none() {
            return Ok(None);
        }
        let header: Option<(String, Option<String>, bool, String, String)> = conn
            .query_row(
                "SELECT id, flow_scope, has_drift, summary, checked_at FROM drift_reports
                 WHERE project = ?1 ORDER BY rowid DESC LIMIT 1",
                params![project],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get::<_, i64>(2)? != 0,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, flow_scope, has_drift, summary, checked_at)) = header else {
            return Ok(None);
        };

        let mut drifts = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, flow_id, drift_type, description, doc_item, code_item, detected_at
                 FROM drifts WHERE report_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok(Drift {
                    id: row.get(0)?,
                    flow_id: row.get(1)?,
                    drift_type: row.get(2)?,
                    description: row.get(3)?,
                    doc_item: row.get(4)?,
                    code_item: row.get(5)?,
                    detected_at: row.get(6)?,
                })
            })?;
            for r in rows {
                drifts.push(r?);
            }
        }

        Ok(Some(DriftReport {
            id,
            project: project.to_string(),
            flow_scope,
            has_drift,
            drifts,
            summary,
            checked_at,
        }))
    })
}

/// Markdown rendering of a drift report.
pub fn format_drift_report(report: &DriftReport) -> String {
    let mut lines = vec![
        "# Skill-Code Drift Report".to_string(),
        String::new(),
        format!("**Project**: {}", report.project),
        format!("**Checked at**: {}", report.checked_at),
        format!(
            "**Status**: {}",
            if report.has_drift { "drift detected" } else { "in sync" }
        ),
        String::new(),
    ];

    if !report.has_drift {
        lines.push(report.summary.clone());
        return lines.join("\n");
    }

    lines.push(report.summary.clone());
    lines.push(String::new());
    for d in &report.drifts {
        lines.push(format!("## [{}] {}", d.drift_type, d.flow_id));
        lines.push(format!("- {}", d.description));
        if let Some(doc) = &d.doc_item {
            lines.push(format!("- doc: `{}`", doc));
        }
        if let Some(code) = &d.code_item {
            lines.push(format!("- code: `{}`", code));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "drift",
        "version": "0.1.0",
        "description": "Skill-vs-code drift detection with immutable reports",
        "commands": [
            { "name": "check", "parameters": ["project", "path", "flow"] },
            { "name": "latest", "parameters": ["project"] }
        ],
        "storage": ["graph.db"]
    })
}
