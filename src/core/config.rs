//! Repo-scoped configuration loaded from `.cephalon/config.toml`.
//!
//! Every knob has a default so a missing file is not an error; a present
//! but malformed file is surfaced as `ConfigError`.

use crate::core::error::CephalonError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Policy for matching documented file paths against structural files.
///
/// `BasenameAlias` tolerates directory refactors by falling back to
/// basename equality when the exact path does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMatchPolicy {
    Exact,
    BasenameAlias,
}

impl Default for FileMatchPolicy {
    fn default() -> Self {
        FileMatchPolicy::BasenameAlias
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CephalonConfig {
    /// Seconds after which the facade considers the code graph stale.
    pub graph_staleness_secs: u64,
    /// Bounded verify/reject loop: rejections past this count fail the subtask.
    pub max_subtask_retries: u32,
    /// Time budget for a full graph build before `Timeout`.
    pub build_timeout_ms: u64,
    /// Time budget for a single embedding computation before `Timeout`.
    pub embed_timeout_ms: u64,
    /// Candidate over-fetch multiplier for semantic search (K = limit * overfetch).
    pub search_overfetch: usize,
    /// Memories composed into a flow context by the facade.
    pub context_memory_limit: usize,
    /// Documented-vs-structural file matching policy for drift detection.
    pub file_match: FileMatchPolicy,
    /// Directories excluded from graph builds in addition to the built-ins.
    pub ignore_dirs: Vec<String>,
}

impl Default for CephalonConfig {
    fn default() -> Self {
        Self {
            graph_staleness_secs: 3600,
            max_subtask_retries: 3,
            build_timeout_ms: 30_000,
            embed_timeout_ms: 5_000,
            search_overfetch: 4,
            context_memory_limit: 5,
            file_match: FileMatchPolicy::default(),
            ignore_dirs: Vec::new(),
        }
    }
}

impl CephalonConfig {
    /// Load config from `<repo>/.cephalon/config.toml`, defaulting when absent.
    pub fn load(repo_root: &Path) -> Result<Self, CephalonError> {
        let path = repo_root.join(".cephalon").join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(CephalonError::IoError)?;
        toml::from_str(&content).map_err(|e| {
            CephalonError::ConfigError(format!("{}: {}", path.display(), e))
        })
    }
}
