//! Experiential memory store with semantic recall.
//!
//! Records are immutable: storage computes an embedding from
//! `title + content` at write time and never edits in place, preserving
//! provenance for retrieval ranking. Search embeds the query, ranks
//! project-scoped candidates by cosine similarity, and optionally hands
//! the top-K to a reranking collaborator.

use crate::core::broker::DbBroker;
use crate::core::config::CephalonConfig;
use crate::core::db;
use crate::core::error::CephalonError;
use crate::core::store::Store;
use crate::core::time::now_epoch_z;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Instant;
use ulid::Ulid;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Memory {
    pub id: String,
    pub category: String,
    pub title: String,
    pub content: String,
    pub project: String,
    pub importance: f64,
    pub created_at: String,
    /// Cosine similarity to the query; populated by search.
    #[serde(default)]
    pub score: f32,
}

/// Embedding collaborator. Implementations must be deterministic for a
/// given model version; stored embeddings are never recomputed unless
/// explicitly re-indexing.
pub trait Embedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CephalonError>;
    fn dimensions(&self) -> usize;
}

/// Deterministic fallback embedder: sha256-seeded, L2-normalized.
///
/// Not a semantic model; it gives the pipeline a dependency-free default
/// with exact-duplicate recall and stable ordering.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 64 }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CephalonError> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();

        let mut v: Vec<f32> = (0..self.dims)
            .map(|i| {
                let byte = hash[i % hash.len()];
                // Rotate the hash per lap so dims > 32 stay distinct.
                let lap = (i / hash.len()) as u8;
                (f32::from(byte.wrapping_add(lap.wrapping_mul(97))) / 127.5) - 1.0
            })
            .collect();
        l2_normalize(&mut v);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in [-1, 1]; 0.0 for empty/mismatched/zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Reranking collaborator: reorders a similarity-ranked candidate set and
/// may drop entries; the result is at most `limit` long.
pub trait Reranker {
    fn rerank(
        &self,
        query: &str,
        candidates: Vec<Memory>,
        limit: usize,
    ) -> Result<Vec<Memory>, CephalonError>;
}

/// Default no-op reranker: keep the similarity order, truncate to limit.
pub struct SimilarityReranker;

impl Reranker for SimilarityReranker {
    fn rerank(
        &self,
        _query: &str,
        mut candidates: Vec<Memory>,
        limit: usize,
    ) -> Result<Vec<Memory>, CephalonError> {
        candidates.truncate(limit);
        Ok(candidates)
    }
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(v.len() * 4);
    for x in v {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn embed_with_budget(
    embedder: &dyn Embedder,
    text: &str,
    budget_ms: u64,
) -> Result<Vec<f32>, CephalonError> {
    let started = Instant::now();
    let embedding = embedder.embed(text)?;
    if started.elapsed().as_millis() as u64 > budget_ms {
        return Err(CephalonError::Timeout(format!(
            "embedding exceeded {}ms budget",
            budget_ms
        )));
    }
    Ok(embedding)
}

/// Persist a new memory record. Content is immutable once written;
/// corrections are new records.
pub fn store_memory(
    store: &Store,
    embedder: &dyn Embedder,
    category: &str,
    title: &str,
    content: &str,
    project: &str,
    importance: f64,
    config: &CephalonConfig,
) -> Result<String, CephalonError> {
    if !(0.0..=10.0).contains(&importance) {
        return Err(CephalonError::ValidationError(format!(
            "importance must be in [0,10], got {}",
            importance
        )));
    }

    db::initialize_memory_db(&store.root)?;
    let embedding = embed_with_budget(
        embedder,
        &format!("{} {}", title, content),
        config.embed_timeout_ms,
    )?;

    let id = Ulid::new().to_string();
    let created_at = now_epoch_z();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::memory_db_path(&store.root),
        "cephalon",
        None,
        "memory.store",
        |conn| {
            conn.execute(
                "INSERT INTO memories(id, category, title, content, project, importance, embedding, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    category,
                    title,
                    content,
                    project,
                    importance,
                    encode_embedding(&embedding),
                    created_at,
                ],
            )?;
            Ok(())
        },
    )?;
    Ok(id)
}

pub fn get_memory(store: &Store, id: &str) -> Result<Memory, CephalonError> {
    if !db::memory_db_path(&store.root).exists() {
        return Err(CephalonError::NotFound(format!("memory '{}' not found", id)));
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::memory_db_path(&store.root),
        "cephalon",
        None,
        "memory.get",
        |conn| {
            conn.query_row(
                "SELECT id, category, title, content, project, importance, created_at
                 FROM memories WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Memory {
                        id: row.get(0)?,
                        category: row.get(1)?,
                        title: row.get(2)?,
                        content: row.get(3)?,
                        project: row.get(4)?,
                        importance: row.get(5)?,
                        created_at: row.get(6)?,
                        score: 0.0,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    CephalonError::NotFound(format!("memory '{}' not found", id))
                }
                other => CephalonError::RusqliteError(other),
            })
        },
    )
}

fn created_at_secs(created_at: &str) -> u64 {
    created_at.trim_end_matches('Z').parse().unwrap_or(0)
}

/// Semantic search over the memory store, best match first.
///
/// Candidates are restricted to `project_scope` when given; a scope leak
/// is an internal bug (`ScopeViolation`), never a feature. Ties in
/// similarity break by importance descending, then recency descending.
/// The result never exceeds `limit`.
pub fn search_memory_semantic(
    store: &Store,
    embedder: &dyn Embedder,
    query: &str,
    project_scope: Option<&str>,
    limit: usize,
    reranker: Option<&dyn Reranker>,
    config: &CephalonConfig,
) -> Result<Vec<Memory>, CephalonError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let db_path = db::memory_db_path(&store.root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }

    let query_embedding = embed_with_budget(embedder, query, config.embed_timeout_ms)?;

    let broker = DbBroker::new(&store.root);
    let mut scored: Vec<Memory> = broker.with_conn(
        &db_path,
        "cephalon",
        None,
        "memory.search",
        |conn| {
            let sql = "SELECT id, category, title, content, project, importance, embedding, created_at
                       FROM memories WHERE (?1 IS NULL OR project = ?1)";
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![project_scope], |row| {
                let embedding: Vec<u8> = row.get(6)?;
                Ok((
                    Memory {
                        id: row.get(0)?,
                        category: row.get(1)?,
                        title: row.get(2)?,
                        content: row.get(3)?,
                        project: row.get(4)?,
                        importance: row.get(5)?,
                        created_at: row.get(7)?,
                        score: 0.0,
                    },
                    embedding,
                ))
            })?;
            let mut scored = Vec::new();
            for r in rows {
                let (mut memory, blob) = r?;
                memory.score = cosine_similarity(&decode_embedding(&blob), &query_embedding);
                scored.push(memory);
            }
            Ok(scored)
        },
    )?;

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.importance
                    .partial_cmp(&a.importance)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(created_at_secs(&b.created_at).cmp(&created_at_secs(&a.created_at)))
            // Ulid ids carry millisecond timestamps; descending id keeps
            // recency-descending order within the same epoch second.
            .then(b.id.cmp(&a.id))
    });

    let k = limit.saturating_mul(config.search_overfetch.max(1));
    scored.truncate(k.max(limit));

    let mut results = match reranker {
        Some(r) => {
            let mut reranked = r.rerank(query, scored, limit)?;
            reranked.truncate(limit);
            reranked
        }
        None => {
            scored.truncate(limit);
            scored
        }
    };

    if let Some(scope) = project_scope {
        if results.iter().any(|m| m.project != scope) {
            // Out-of-scope results indicate an internal bug, not user error.
            return Err(CephalonError::ScopeViolation(format!(
                "search returned records outside project '{}'",
                scope
            )));
        }
    }

    results.truncate(limit);
    Ok(results)
}

pub fn list_memories(
    store: &Store,
    project_scope: Option<&str>,
    category: Option<&str>,
) -> Result<Vec<Memory>, CephalonError> {
    let db_path = db::memory_db_path(&store.root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, "cephalon", None, "memory.list", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, category, title, content, project, importance, created_at
             FROM memories
             WHERE (?1 IS NULL OR project = ?1) AND (?2 IS NULL OR category = ?2)
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![project_scope, category], |row| {
            Ok(Memory {
                id: row.get(0)?,
                category: row.get(1)?,
                title: row.get(2)?,
                content: row.get(3)?,
                project: row.get(4)?,
                importance: row.get(5)?,
                created_at: row.get(6)?,
                score: 0.0,
            })
        })?;
        let mut results = Vec::new();
        for r in rows {
            results.push(r?);
        }
        Ok(results)
    })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "memory",
        "version": "0.1.0",
        "description": "Immutable experiential memory with semantic recall",
        "commands": [
            { "name": "store", "parameters": ["category", "title", "content", "project", "importance"] },
            { "name": "search", "parameters": ["query", "project", "limit", "rerank"] }
        ],
        "storage": ["memory.db"]
    })
}
