//! Skill Document Model.
//!
//! Parses a project's skill documentation into the flow vocabulary the
//! drift detector and context facade consume: documented flows, the files
//! they reference, declared entry entities, and behavior descriptions.
//! Read-only toward the project tree; re-parsing a document version is
//! idempotent.

use crate::core::error::CephalonError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SkillFlow {
    /// Canonical id, e.g. `flow.auth`.
    pub id: String,
    pub name: String,
    /// Declaration order within the document, 0-based.
    pub order: usize,
    pub description: String,
    /// Referenced file paths (relative to the project root).
    pub files: Vec<String>,
    /// Declared entry entity ids, e.g. `function.src/auth/login.ts:login`.
    pub entry_points: Vec<String>,
    pub behaviors: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SkillModel {
    pub flows: Vec<SkillFlow>,
    pub source_path: Option<PathBuf>,
}

impl SkillModel {
    pub fn flow(&self, flow_id: &str) -> Option<&SkillFlow> {
        self.flows.iter().find(|f| f.id == flow_id)
    }
}

/// Locations probed for the skill document, in order.
fn skill_doc_candidates(project_path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![
        project_path.join(".cephalon").join("SKILL.md"),
        project_path.join("SKILL.md"),
    ];
    let skills_root = project_path.join(".claude").join("skills");
    if let Ok(entries) = std::fs::read_dir(&skills_root) {
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            candidates.push(dir.join("SKILL.md"));
        }
    }
    candidates
}

pub fn find_skill_doc(project_path: &Path) -> Option<PathBuf> {
    skill_doc_candidates(project_path).into_iter().find(|p| p.is_file())
}

/// Parse the given skill document text into a model.
///
/// Flows are `## Flow: <name>` sections. Within a section:
/// - bullet lines with a backticked path (`- \`src/x.ts\``) are file refs
/// - `- entry: \`<entity id>\`` lines declare structural entry points
/// - other bullet lines are behavior descriptions
/// - leading prose becomes the flow description
pub fn parse_skill_doc(text: &str) -> SkillModel {
    let heading_re = Regex::new(r"(?mi)^##\s+flow\s*:\s*(\S+)\s*$").unwrap();
    let entry_re = Regex::new(r"(?i)^[-*]\s*entry\s*:\s*`?([^`]+?)`?\s*$").unwrap();
    let backtick_re = Regex::new(r"`([^`]+)`").unwrap();

    let mut flows = Vec::new();

    let headings: Vec<(usize, usize, String)> = heading_re
        .captures_iter(text)
        .map(|cap| {
            let m = cap.get(0).unwrap();
            (m.start(), m.end(), cap[1].to_string())
        })
        .collect();

    for (order, (_, body_start, name)) in headings.iter().enumerate() {
        let body_end = headings
            .get(order + 1)
            .map(|(s, _, _)| *s)
            .unwrap_or(text.len());
        // Any `## ` heading terminates the flow section, not just flow ones.
        let body = &text[*body_start..body_end];
        let body = match body.find("\n## ") {
            Some(pos) => &body[..pos],
            None => body,
        };

        let name = name.trim_start_matches("flow.").to_string();
        let mut description_lines: Vec<String> = Vec::new();
        let mut files: Vec<String> = Vec::new();
        let mut entry_points: Vec<String> = Vec::new();
        let mut behaviors: Vec<String> = Vec::new();
        let mut seen_bullet = false;

        for line in body.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(cap) = entry_re.captures(trimmed) {
                entry_points.push(cap[1].trim().to_string());
                seen_bullet = true;
                continue;
            }
            if trimmed.starts_with('-') || trimmed.starts_with('*') {
                seen_bullet = true;
                let mut matched_path = false;
                for cap in backtick_re.captures_iter(trimmed) {
                    let token = cap[1].trim();
                    if looks_like_path(token) {
                        files.push(token.to_string());
                        matched_path = true;
                    }
                }
                if !matched_path {
                    let behavior = trimmed.trim_start_matches(['-', '*']).trim();
                    if !behavior.is_empty() && !behavior.to_lowercase().ends_with(':') {
                        behaviors.push(behavior.to_string());
                    }
                }
                continue;
            }
            if !seen_bullet && !trimmed.to_lowercase().ends_with(':') {
                description_lines.push(trimmed.to_string());
            }
        }

        files.dedup();

        flows.push(SkillFlow {
            id: format!("flow.{}", name),
            name,
            order,
            description: description_lines.join(" "),
            files,
            entry_points,
            behaviors,
        });
    }

    SkillModel {
        flows,
        source_path: None,
    }
}

fn looks_like_path(token: &str) -> bool {
    if token.contains(char::is_whitespace) {
        return false;
    }
    let has_sep = token.contains('/');
    let has_ext = Path::new(token)
        .extension()
        .map(|e| !e.is_empty())
        .unwrap_or(false);
    (has_sep && has_ext) || (!has_sep && has_ext && !token.contains('('))
}

/// Load and parse the project's skill document, if one exists.
///
/// A project with no skill doc yields `Ok(None)` — documentation absence
/// is a drift question, not an error here.
pub fn load_skill_model(project_path: &Path) -> Result<Option<SkillModel>, CephalonError> {
    let Some(doc_path) = find_skill_doc(project_path) else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(&doc_path).map_err(CephalonError::IoError)?;
    let mut model = parse_skill_doc(&text);
    model.source_path = Some(doc_path);
    Ok(Some(model))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "skills",
        "version": "0.1.0",
        "description": "Documented-flow model parsed from the project skill doc",
        "commands": [
            { "name": "parse", "parameters": ["path"] }
        ],
        "storage": []
    })
}
