//! Context facade.
//!
//! Composes the three knowledge layers into one query-scoped snapshot for
//! an agent turn: the Code-Graph slice reachable from a flow, the skill
//! section documenting it, and the most relevant memories. The facade is
//! read-only; the only write it may trigger is a synchronous graph
//! rebuild when the graph is absent or stale. It never runs a drift
//! check — it surfaces the last stored report instead.

use crate::core::config::CephalonConfig;
use crate::core::error::CephalonError;
use crate::core::store::Store;
use crate::core::time::now_epoch_z;
use crate::plugins::drift::{self, DriftReport};
use crate::plugins::graph::{self, Entity, Relation, SyncMode, KIND_FLOW, REL_DOCUMENTS};
use crate::plugins::memory::{self, Embedder, Memory};
use crate::plugins::skills::{self, SkillFlow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GraphSlice {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Context {
    pub project: String,
    pub flow_id: String,
    pub skill: Option<SkillFlow>,
    pub graph: GraphSlice,
    pub memories: Vec<Memory>,
    pub drift: Option<DriftReport>,
    pub composed_at: String,
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn graph_is_stale(store: &Store, project: &str, config: &CephalonConfig) -> bool {
    match graph::last_sync(store, project) {
        Ok(Some(synced)) => now_secs().saturating_sub(synced) > config.graph_staleness_secs,
        _ => true,
    }
}

/// Compose the full three-layer context for one flow.
///
/// Callers may block on a synchronous rebuild when the graph is missing
/// or older than the configured staleness window.
pub fn get_full_context(
    store: &Store,
    embedder: &dyn Embedder,
    flow_id: &str,
    project: &str,
    project_path: &Path,
    config: &CephalonConfig,
) -> Result<Context, CephalonError> {
    if graph_is_stale(store, project, config) {
        graph::build_graph(store, project, project_path, SyncMode::Incremental, config)?;
    }
    let code_graph = graph::load_graph(store, project)?.unwrap_or_default();

    let skill_model = skills::load_skill_model(project_path)?.unwrap_or_default();
    let skill = skill_model
        .flows
        .iter()
        .find(|f| f.id == flow_id || f.name == flow_id)
        .cloned();

    let slice = match &skill {
        Some(flow) => {
            let entries = drift::resolve_entry_ids(flow, &code_graph, config.file_match);
            let reached = code_graph.reachable_from(&entries);
            let ids: HashSet<String> = reached.iter().map(|e| e.id.clone()).collect();
            let mut entities: Vec<Entity> = reached.into_iter().cloned().collect();
            entities.sort_by(|a, b| a.id.cmp(&b.id));
            let mut relations = code_graph.relations_within(&ids);

            // Overlay the documented layer: the flow node itself, with
            // `documents` edges to the files it binds to the section.
            let mut attributes = BTreeMap::new();
            if !flow.description.is_empty() {
                attributes.insert("description".to_string(), flow.description.clone());
            }
            let flow_entity = Entity {
                id: flow.id.clone(),
                kind: KIND_FLOW.to_string(),
                name: flow.name.clone(),
                qualified_path: flow.id.clone(),
                attributes,
            };
            for entity in &entities {
                if entity.kind == graph::KIND_FILE {
                    relations.push(Relation {
                        source_id: flow_entity.id.clone(),
                        target_id: entity.id.clone(),
                        kind: REL_DOCUMENTS.to_string(),
                    });
                }
            }
            entities.insert(0, flow_entity);

            GraphSlice { relations, entities }
        }
        None => GraphSlice::default(),
    };

    let query = match &skill {
        Some(flow) if !flow.description.is_empty() => {
            format!("{} {}", flow.name, flow.description)
        }
        Some(flow) => flow.name.clone(),
        None => flow_id.to_string(),
    };
    let memories = memory::search_memory_semantic(
        store,
        embedder,
        &query,
        Some(project),
        config.context_memory_limit,
        None,
        config,
    )?;

    let drift = drift::latest_report(store, project)?.map(|mut report| {
        report
            .drifts
            .retain(|d| d.flow_id == flow_id || d.flow_id == format!("flow.{}", flow_id));
        report.has_drift = !report.drifts.is_empty();
        report
    });

    Ok(Context {
        project: project.to_string(),
        flow_id: skill
            .as_ref()
            .map(|f| f.id.clone())
            .unwrap_or_else(|| flow_id.to_string()),
        skill,
        graph: slice,
        memories,
        drift,
        composed_at: now_epoch_z(),
    })
}

/// Render a context snapshot as agent-readable Markdown.
pub fn format_context_for_agent(context: &Context) -> String {
    let mut lines = Vec::new();
    lines.push(format!("# Context for flow: {}", context.flow_id));
    lines.push(String::new());

    if let Some(flow) = &context.skill {
        lines.push("## Documented Contract".to_string());
        if !flow.description.is_empty() {
            lines.push(flow.description.clone());
        }
        for path in &flow.files {
            lines.push(format!("- `{}`", path));
        }
        for behavior in &flow.behaviors {
            lines.push(format!("- {}", behavior));
        }
        lines.push(String::new());
    }

    if !context.graph.entities.is_empty() {
        lines.push("## Structural Contract".to_string());
        for entity in context.graph.entities.iter().take(20) {
            lines.push(format!("- [{}] {}", entity.kind, entity.qualified_path));
        }
        if context.graph.entities.len() > 20 {
            lines.push(format!(
                "- ... and {} more",
                context.graph.entities.len() - 20
            ));
        }
        lines.push(String::new());
    }

    if !context.memories.is_empty() {
        lines.push("## Related Memory".to_string());
        for memory in &context.memories {
            let mut content: String = memory.content.chars().take(100).collect();
            if memory.content.chars().count() > 100 {
                content.push_str("...");
            }
            lines.push(format!("- **{}**: {}", memory.title, content));
        }
        lines.push(String::new());
    }

    if let Some(report) = &context.drift {
        if report.has_drift {
            lines.push("## Drift Warning".to_string());
            for d in report.drifts.iter().take(5) {
                lines.push(format!("- [{}] {}", d.drift_type, d.description));
            }
            lines.push(String::new());
        }
    }

    if lines.len() <= 2 {
        return format!("No context available for flow: {}", context.flow_id);
    }
    lines.join("\n")
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "context",
        "version": "0.1.0",
        "description": "Query-scoped three-layer context composition",
        "commands": [
            { "name": "show", "parameters": ["flow", "project", "path"] }
        ],
        "storage": []
    })
}
