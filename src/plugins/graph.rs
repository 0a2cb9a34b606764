//! Code Graph Builder.
//!
//! Scans a project's source tree and produces a structural graph of
//! entities (files, modules, functions) and relations (calls, imports,
//! belongs_to). Extraction is regex-based and deterministic; per-language
//! extractors plug in through the `FileExtractor` trait. Each sync writes
//! a fresh generation and flips the generation pointer in the same
//! transaction, so readers never observe a half-built graph.

use crate::core::broker::DbBroker;
use crate::core::config::CephalonConfig;
use crate::core::db;
use crate::core::error::CephalonError;
use crate::core::store::Store;
use rayon::prelude::*;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const KIND_FILE: &str = "file";
pub const KIND_MODULE: &str = "module";
pub const KIND_FUNCTION: &str = "function";
pub const KIND_FLOW: &str = "flow";

pub const REL_CALLS: &str = "calls";
pub const REL_IMPORTS: &str = "imports";
pub const REL_BELONGS_TO: &str = "belongs_to";
pub const REL_DOCUMENTS: &str = "documents";

/// Directories never walked during a build, mirroring the common
/// ecosystem junk dirs plus our own state dir.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    "target",
    ".next",
    "coverage",
    ".cephalon",
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub kind: String,
    pub name: String,
    pub qualified_path: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Relation {
    pub source_id: String,
    pub target_id: String,
    pub kind: String,
}

#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub errors: Vec<String>,
}

/// Per-file-type structural extractor. Implementations must be
/// deterministic: same content, same output.
pub trait FileExtractor: Sync {
    fn kind(&self) -> &'static str;
    fn extensions(&self) -> &'static [&'static str];
    fn extract(&self, rel_path: &str, content: &str) -> ExtractionResult;
}

pub fn make_entity_id(kind: &str, rel_path: &str, name: Option<&str>) -> String {
    match name {
        Some(n) => format!("{}.{}:{}", kind, rel_path, n),
        None => format!("{}.{}", kind, rel_path),
    }
}

fn file_entity(rel_path: &str, language: &str) -> Entity {
    let name = Path::new(rel_path)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| rel_path.to_string());
    let mut attributes = BTreeMap::new();
    attributes.insert("language".to_string(), language.to_string());
    Entity {
        id: make_entity_id(KIND_FILE, rel_path, None),
        kind: KIND_FILE.to_string(),
        name,
        qualified_path: rel_path.to_string(),
        attributes,
    }
}

fn member_entity(
    kind: &str,
    rel_path: &str,
    name: &str,
    language: &str,
    line_start: usize,
    line_end: usize,
    signature: &str,
    visibility: &str,
) -> Entity {
    let mut attributes = BTreeMap::new();
    attributes.insert("language".to_string(), language.to_string());
    attributes.insert("line_start".to_string(), line_start.to_string());
    attributes.insert("line_end".to_string(), line_end.to_string());
    attributes.insert("signature".to_string(), signature.to_string());
    attributes.insert("visibility".to_string(), visibility.to_string());
    Entity {
        id: make_entity_id(kind, rel_path, Some(name)),
        kind: kind.to_string(),
        name: name.to_string(),
        qualified_path: format!("{}:{}", rel_path, name),
        attributes,
    }
}

fn module_target_entity(module_path: &str) -> Entity {
    Entity {
        id: format!("{}.{}", KIND_MODULE, module_path),
        kind: KIND_MODULE.to_string(),
        name: module_path
            .rsplit(['/', '.', ':'])
            .next()
            .unwrap_or(module_path)
            .to_string(),
        qualified_path: module_path.to_string(),
        attributes: BTreeMap::new(),
    }
}

fn line_of(content: &str, byte_offset: usize) -> usize {
    content[..byte_offset].matches('\n').count() + 1
}

/// Brace-counting block end for C-family sources. 1-indexed, inclusive.
fn find_brace_block_end(lines: &[&str], start_line: usize) -> usize {
    let mut brace_count: i64 = 0;
    let mut started = false;
    for (i, line) in lines.iter().enumerate().skip(start_line) {
        for ch in line.chars() {
            match ch {
                '{' => {
                    brace_count += 1;
                    started = true;
                }
                '}' => {
                    brace_count -= 1;
                    if started && brace_count == 0 {
                        return i + 1;
                    }
                }
                _ => {}
            }
        }
    }
    lines.len()
}

/// Indentation-based block end for Python sources. 1-indexed, exclusive of
/// the first dedented line.
fn find_indent_block_end(lines: &[&str], start_line: usize) -> usize {
    if start_line >= lines.len() {
        return start_line + 1;
    }
    let start_indent = lines[start_line].len() - lines[start_line].trim_start().len();
    for (i, line) in lines.iter().enumerate().skip(start_line + 1) {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        if indent <= start_indent {
            return i;
        }
    }
    lines.len()
}

/// Add naive same-file call edges: a function body mentioning another
/// function's name followed by `(` counts as a call. Mutual calls are
/// expected and fine; the graph is not required to be acyclic.
fn add_call_edges(
    result: &mut ExtractionResult,
    content: &str,
    functions: &[(String, usize, usize)],
    rel_path: &str,
) {
    if functions.len() < 2 {
        return;
    }
    let lines: Vec<&str> = content.lines().collect();
    let name_res: Vec<(String, Regex)> = functions
        .iter()
        .map(|(name, _, _)| {
            (
                name.clone(),
                Regex::new(&format!(r"\b{}\s*\(", regex::escape(name))).unwrap(),
            )
        })
        .collect();

    for (caller, start, end) in functions {
        let lo = caller_body_start(*start);
        let hi = (*end).min(lines.len());
        if lo >= hi {
            continue;
        }
        let body = lines[lo..hi].join("\n");
        for (callee, re) in &name_res {
            if callee == caller {
                continue;
            }
            if re.is_match(&body) {
                result.relations.push(Relation {
                    source_id: make_entity_id(KIND_FUNCTION, rel_path, Some(caller)),
                    target_id: make_entity_id(KIND_FUNCTION, rel_path, Some(callee)),
                    kind: REL_CALLS.to_string(),
                });
            }
        }
    }
}

fn caller_body_start(decl_line: usize) -> usize {
    // Skip the declaration line itself so `fn foo` does not "call" foo.
    decl_line
}

// --- TypeScript / JavaScript -------------------------------------------------

pub struct TsExtractor {
    import_re: Regex,
    function_re: Regex,
    arrow_re: Regex,
    class_re: Regex,
    interface_re: Regex,
}

impl Default for TsExtractor {
    fn default() -> Self {
        Self {
            import_re: Regex::new(
                r#"(?m)^import\s+(?:(?:\{[^}]+\}|\*\s+as\s+\w+|\w+)\s+from\s+)?['"]([^'"]+)['"]"#,
            )
            .unwrap(),
            function_re: Regex::new(r"(?m)^(export\s+)?(?:async\s+)?function\s+(\w+)").unwrap(),
            arrow_re: Regex::new(
                r"(?m)^(export\s+)?const\s+(\w+)\s*=\s*(?:async\s+)?\([^)]*\)\s*(?::\s*[^=]+)?=>",
            )
            .unwrap(),
            class_re: Regex::new(r"(?m)^(?:export\s+)?(?:abstract\s+)?class\s+(\w+)").unwrap(),
            interface_re: Regex::new(r"(?m)^(?:export\s+)?interface\s+(\w+)").unwrap(),
        }
    }
}

impl FileExtractor for TsExtractor {
    fn kind(&self) -> &'static str {
        "typescript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "js", "jsx"]
    }

    fn extract(&self, rel_path: &str, content: &str) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        let file = file_entity(rel_path, self.kind());
        let file_id = file.id.clone();
        result.entities.push(file);

        let lines: Vec<&str> = content.lines().collect();

        for cap in self.import_re.captures_iter(content) {
            let module_path = cap[1].to_string();
            let target = module_target_entity(&module_path);
            result.relations.push(Relation {
                source_id: file_id.clone(),
                target_id: target.id.clone(),
                kind: REL_IMPORTS.to_string(),
            });
            result.entities.push(target);
        }

        let mut functions: Vec<(String, usize, usize)> = Vec::new();
        for cap in self
            .function_re
            .captures_iter(content)
            .chain(self.arrow_re.captures_iter(content))
        {
            let exported = cap.get(1).is_some();
            let name = cap[2].to_string();
            let m = cap.get(0).unwrap();
            let line_start = line_of(content, m.start());
            let line_end = find_brace_block_end(&lines, line_start - 1);
            let signature = lines
                .get(line_start - 1)
                .map(|l| l.trim().to_string())
                .unwrap_or_default();
            let visibility = if exported { "public" } else { "private" };
            result.entities.push(member_entity(
                KIND_FUNCTION,
                rel_path,
                &name,
                self.kind(),
                line_start,
                line_end,
                &signature,
                visibility,
            ));
            result.relations.push(Relation {
                source_id: make_entity_id(KIND_FUNCTION, rel_path, Some(&name)),
                target_id: file_id.clone(),
                kind: REL_BELONGS_TO.to_string(),
            });
            functions.push((name, line_start, line_end));
        }

        for cap in self
            .class_re
            .captures_iter(content)
            .chain(self.interface_re.captures_iter(content))
        {
            let name = cap[1].to_string();
            let m = cap.get(0).unwrap();
            let line_start = line_of(content, m.start());
            let line_end = find_brace_block_end(&lines, line_start - 1);
            let signature = lines
                .get(line_start - 1)
                .map(|l| l.trim().to_string())
                .unwrap_or_default();
            result.entities.push(member_entity(
                KIND_MODULE,
                rel_path,
                &name,
                self.kind(),
                line_start,
                line_end,
                &signature,
                "public",
            ));
            result.relations.push(Relation {
                source_id: make_entity_id(KIND_MODULE, rel_path, Some(&name)),
                target_id: file_id.clone(),
                kind: REL_BELONGS_TO.to_string(),
            });
        }

        add_call_edges(&mut result, content, &functions, rel_path);
        result
    }
}

// --- Python ------------------------------------------------------------------

pub struct PyExtractor {
    import_re: Regex,
    function_re: Regex,
    class_re: Regex,
}

impl Default for PyExtractor {
    fn default() -> Self {
        Self {
            import_re: Regex::new(r"(?m)^(?:from\s+(\S+)\s+)?import\s+(.+)$").unwrap(),
            function_re: Regex::new(r"(?m)^(?:async\s+)?def\s+(\w+)\s*\(").unwrap(),
            class_re: Regex::new(r"(?m)^class\s+(\w+)(?:\s*\(([^)]*)\))?:").unwrap(),
        }
    }
}

impl FileExtractor for PyExtractor {
    fn kind(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn extract(&self, rel_path: &str, content: &str) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        let file = file_entity(rel_path, self.kind());
        let file_id = file.id.clone();
        result.entities.push(file);

        let lines: Vec<&str> = content.lines().collect();

        for cap in self.import_re.captures_iter(content) {
            let module_path = match cap.get(1) {
                Some(from_module) => from_module.as_str().to_string(),
                None => cap[2]
                    .split(',')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string(),
            };
            if module_path.is_empty() {
                continue;
            }
            let target = module_target_entity(&module_path);
            result.relations.push(Relation {
                source_id: file_id.clone(),
                target_id: target.id.clone(),
                kind: REL_IMPORTS.to_string(),
            });
            result.entities.push(target);
        }

        let mut functions: Vec<(String, usize, usize)> = Vec::new();
        for cap in self.function_re.captures_iter(content) {
            let name = cap[1].to_string();
            let m = cap.get(0).unwrap();
            let line_start = line_of(content, m.start());
            let line_end = find_indent_block_end(&lines, line_start - 1);
            let signature = lines
                .get(line_start - 1)
                .map(|l| l.trim().to_string())
                .unwrap_or_default();
            let visibility = if name.starts_with('_') { "private" } else { "public" };
            result.entities.push(member_entity(
                KIND_FUNCTION,
                rel_path,
                &name,
                self.kind(),
                line_start,
                line_end,
                &signature,
                visibility,
            ));
            result.relations.push(Relation {
                source_id: make_entity_id(KIND_FUNCTION, rel_path, Some(&name)),
                target_id: file_id.clone(),
                kind: REL_BELONGS_TO.to_string(),
            });
            functions.push((name, line_start, line_end));
        }

        for cap in self.class_re.captures_iter(content) {
            let name = cap[1].to_string();
            let m = cap.get(0).unwrap();
            let line_start = line_of(content, m.start());
            let line_end = find_indent_block_end(&lines, line_start - 1);
            let signature = lines
                .get(line_start - 1)
                .map(|l| l.trim().to_string())
                .unwrap_or_default();
            result.entities.push(member_entity(
                KIND_MODULE,
                rel_path,
                &name,
                self.kind(),
                line_start,
                line_end,
                &signature,
                "public",
            ));
            result.relations.push(Relation {
                source_id: make_entity_id(KIND_MODULE, rel_path, Some(&name)),
                target_id: file_id.clone(),
                kind: REL_BELONGS_TO.to_string(),
            });
        }

        add_call_edges(&mut result, content, &functions, rel_path);
        result
    }
}

// --- Rust --------------------------------------------------------------------

pub struct RustExtractor {
    use_re: Regex,
    function_re: Regex,
    container_re: Regex,
}

impl Default for RustExtractor {
    fn default() -> Self {
        Self {
            use_re: Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([A-Za-z0-9_]+(?:::[A-Za-z0-9_*]+)*)").unwrap(),
            function_re: Regex::new(
                r"(?m)^\s*(pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+(\w+)",
            )
            .unwrap(),
            container_re: Regex::new(
                r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait|mod)\s+(\w+)",
            )
            .unwrap(),
        }
    }
}

impl FileExtractor for RustExtractor {
    fn kind(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn extract(&self, rel_path: &str, content: &str) -> ExtractionResult {
        let mut result = ExtractionResult::default();
        let file = file_entity(rel_path, self.kind());
        let file_id = file.id.clone();
        result.entities.push(file);

        let lines: Vec<&str> = content.lines().collect();

        let mut seen_imports: BTreeSet<String> = BTreeSet::new();
        for cap in self.use_re.captures_iter(content) {
            let module_path = cap[1].to_string();
            if !seen_imports.insert(module_path.clone()) {
                continue;
            }
            let target = module_target_entity(&module_path);
            result.relations.push(Relation {
                source_id: file_id.clone(),
                target_id: target.id.clone(),
                kind: REL_IMPORTS.to_string(),
            });
            result.entities.push(target);
        }

        let mut functions: Vec<(String, usize, usize)> = Vec::new();
        let mut seen_fns: BTreeSet<String> = BTreeSet::new();
        for cap in self.function_re.captures_iter(content) {
            let name = cap[2].to_string();
            if !seen_fns.insert(name.clone()) {
                continue;
            }
            let visibility = if cap.get(1).is_some() { "public" } else { "private" };
            let m = cap.get(0).unwrap();
            let line_start = line_of(content, m.start());
            let line_end = find_brace_block_end(&lines, line_start - 1);
            let signature = lines
                .get(line_start - 1)
                .map(|l| l.trim().to_string())
                .unwrap_or_default();
            result.entities.push(member_entity(
                KIND_FUNCTION,
                rel_path,
                &name,
                self.kind(),
                line_start,
                line_end,
                &signature,
                visibility,
            ));
            result.relations.push(Relation {
                source_id: make_entity_id(KIND_FUNCTION, rel_path, Some(&name)),
                target_id: file_id.clone(),
                kind: REL_BELONGS_TO.to_string(),
            });
            functions.push((name, line_start, line_end));
        }

        let mut seen_containers: BTreeSet<String> = BTreeSet::new();
        for cap in self.container_re.captures_iter(content) {
            let name = cap[1].to_string();
            if !seen_containers.insert(name.clone()) {
                continue;
            }
            let m = cap.get(0).unwrap();
            let line_start = line_of(content, m.start());
            let line_end = find_brace_block_end(&lines, line_start - 1);
            let signature = lines
                .get(line_start - 1)
                .map(|l| l.trim().to_string())
                .unwrap_or_default();
            result.entities.push(member_entity(
                KIND_MODULE,
                rel_path,
                &name,
                self.kind(),
                line_start,
                line_end,
                &signature,
                "public",
            ));
            result.relations.push(Relation {
                source_id: make_entity_id(KIND_MODULE, rel_path, Some(&name)),
                target_id: file_id.clone(),
                kind: REL_BELONGS_TO.to_string(),
            });
        }

        add_call_edges(&mut result, content, &functions, rel_path);
        result
    }
}

pub fn default_extractors() -> Vec<Box<dyn FileExtractor>> {
    vec![
        Box::new(TsExtractor::default()),
        Box::new(PyExtractor::default()),
        Box::new(RustExtractor::default()),
    ]
}

// --- Sync --------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncMode {
    Full,
    Incremental,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncResult {
    pub project: String,
    pub generation: i64,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub entities_added: usize,
    pub relations_added: usize,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn collect_source_files(
    root: &Path,
    dir: &Path,
    ignored: &HashSet<String>,
    known_exts: &HashSet<String>,
    out: &mut Vec<(String, PathBuf)>,
) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
                if ignored.contains(name) {
                    continue;
                }
                collect_source_files(root, &path, ignored, known_exts, out);
            } else if path.is_file() {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_lowercase();
                if !known_exts.contains(&ext) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel_str = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push((rel_str, path));
                }
            }
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn current_generation(conn: &Connection, project: &str) -> Result<Option<i64>, CephalonError> {
    let key = format!("generation:{}", project);
    let value: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value.and_then(|v| v.parse::<i64>().ok()))
}

/// Last successful sync for the project, as unix-epoch seconds.
/// `Ok(None)` when the store was never initialized or never synced.
pub fn last_sync(store: &Store, project: &str) -> Result<Option<u64>, CephalonError> {
    let db_path = db::graph_db_path(&store.root);
    if !db_path.exists() {
        return Ok(None);
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, "cephalon", None, "graph.last_sync", |conn| {
        let meta_present: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if meta_present.is_none() {
            return Ok(None);
        }
        let key = format!("last_sync:{}", project);
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.and_then(|v| v.parse::<u64>().ok()))
    })
}

/// Build (or rebuild) the code graph for a project.
///
/// Incremental mode carries over rows for files whose content hash is
/// unchanged since the previous generation; everything else is
/// re-extracted. The generation pointer flips inside the write
/// transaction, and a deadline overrun discards the new generation
/// entirely.
pub fn build_graph(
    store: &Store,
    project: &str,
    project_path: &Path,
    mode: SyncMode,
    config: &CephalonConfig,
) -> Result<SyncResult, CephalonError> {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(config.build_timeout_ms);

    if !project_path.is_dir() {
        return Err(CephalonError::BuildError(format!(
            "Project path not readable: {}",
            project_path.display()
        )));
    }

    db::initialize_graph_db(&store.root)?;

    let extractors = default_extractors();
    build_graph_with(store, project, project_path, mode, config, &extractors, deadline, started)
}

#[allow(clippy::too_many_arguments)]
pub fn build_graph_with(
    store: &Store,
    project: &str,
    project_path: &Path,
    mode: SyncMode,
    config: &CephalonConfig,
    extractors: &[Box<dyn FileExtractor>],
    deadline: Instant,
    started: Instant,
) -> Result<SyncResult, CephalonError> {
    let mut ignored: HashSet<String> = IGNORED_DIRS.iter().map(|s| s.to_string()).collect();
    ignored.extend(config.ignore_dirs.iter().cloned());

    let mut by_ext: FxHashMap<String, &dyn FileExtractor> = FxHashMap::default();
    for ex in extractors {
        for ext in ex.extensions() {
            by_ext.insert((*ext).to_string(), ex.as_ref());
        }
    }
    let known_exts: HashSet<String> = by_ext.keys().cloned().collect();

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    collect_source_files(project_path, project_path, &ignored, &known_exts, &mut files);
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let broker = DbBroker::new(&store.root);
    let db_path = db::graph_db_path(&store.root);

    let prior_hashes: FxHashMap<String, String> = broker.with_conn(
        &db_path,
        "cephalon",
        None,
        "graph.read_hashes",
        |conn| {
            let mut map = FxHashMap::default();
            if let Some(generation) = current_generation(conn, project)? {
                let mut stmt = conn.prepare(
                    "SELECT rel_path, hash FROM file_hashes WHERE project = ?1 AND generation = ?2",
                )?;
                let rows = stmt.query_map(params![project, generation], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for r in rows {
                    let (p, h) = r?;
                    map.insert(p, h);
                }
            }
            Ok(map)
        },
    )?;

    let mut errors: Vec<String> = Vec::new();
    let mut carried: Vec<(String, String)> = Vec::new(); // (rel_path, hash)
    let mut changed: Vec<(String, String, String)> = Vec::new(); // (rel_path, hash, content)

    for (rel_path, abs_path) in &files {
        if Instant::now() >= deadline {
            return Err(CephalonError::Timeout(format!(
                "graph build for '{}' exceeded {}ms",
                project, config.build_timeout_ms
            )));
        }
        let bytes = match std::fs::read(abs_path) {
            Ok(b) => b,
            Err(e) => {
                errors.push(format!("{}: {}", rel_path, e));
                continue;
            }
        };
        let hash = sha256_hex(&bytes);
        let unchanged = mode == SyncMode::Incremental
            && prior_hashes.get(rel_path).map(|h| h == &hash).unwrap_or(false);
        if unchanged {
            carried.push((rel_path.clone(), hash));
        } else {
            changed.push((rel_path.clone(), hash, String::from_utf8_lossy(&bytes).to_string()));
        }
    }

    let timed_out = AtomicBool::new(false);
    let extracted: Vec<(String, String, ExtractionResult)> = changed
        .par_iter()
        .filter_map(|(rel_path, hash, content)| {
            if timed_out.load(Ordering::Relaxed) || Instant::now() >= deadline {
                timed_out.store(true, Ordering::Relaxed);
                return None;
            }
            let ext = Path::new(rel_path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            let extractor = by_ext.get(&ext)?;
            Some((rel_path.clone(), hash.clone(), extractor.extract(rel_path, content)))
        })
        .collect();

    if timed_out.load(Ordering::Relaxed) {
        // A timed-out build is discarded entirely, never reused.
        return Err(CephalonError::Timeout(format!(
            "graph build for '{}' exceeded {}ms",
            project, config.build_timeout_ms
        )));
    }

    for (rel_path, _, result) in &extracted {
        for e in &result.errors {
            errors.push(format!("{}: {}", rel_path, e));
        }
    }

    let files_processed = extracted.len();
    let files_skipped = carried.len();

    let (generation, entities_added, relations_added) = broker.with_conn(
        &db_path,
        "cephalon",
        None,
        "graph.sync",
        |conn| {
            let tx = conn.unchecked_transaction()?;
            let old_generation = current_generation(&tx, project)?;
            let generation = old_generation.unwrap_or(0) + 1;

            let mut entities_added = 0usize;
            let mut relations_added = 0usize;

            {
                let mut insert_entity = tx.prepare(
                    "INSERT OR IGNORE INTO entities(project, generation, id, kind, name, qualified_path, attributes, src_file)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                let mut insert_relation = tx.prepare(
                    "INSERT OR IGNORE INTO relations(project, generation, source_id, target_id, kind, src_file)
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                let mut insert_hash = tx.prepare(
                    "INSERT OR REPLACE INTO file_hashes(project, generation, rel_path, hash)
                     VALUES(?1, ?2, ?3, ?4)",
                )?;

                for (rel_path, hash, result) in &extracted {
                    for entity in &result.entities {
                        let attributes = serde_json::to_string(&entity.attributes).unwrap();
                        entities_added += insert_entity.execute(params![
                            project,
                            generation,
                            entity.id,
                            entity.kind,
                            entity.name,
                            entity.qualified_path,
                            attributes,
                            rel_path,
                        ])?;
                    }
                    for relation in &result.relations {
                        relations_added += insert_relation.execute(params![
                            project,
                            generation,
                            relation.source_id,
                            relation.target_id,
                            relation.kind,
                            rel_path,
                        ])?;
                    }
                    insert_hash.execute(params![project, generation, rel_path, hash])?;
                }
            }

            if let Some(old_generation) = old_generation {
                for (rel_path, hash) in &carried {
                    tx.execute(
                        "INSERT OR IGNORE INTO entities(project, generation, id, kind, name, qualified_path, attributes, src_file)
                         SELECT project, ?1, id, kind, name, qualified_path, attributes, src_file
                         FROM entities WHERE project = ?2 AND generation = ?3 AND src_file = ?4",
                        params![generation, project, old_generation, rel_path],
                    )?;
                    tx.execute(
                        "INSERT OR IGNORE INTO relations(project, generation, source_id, target_id, kind, src_file)
                         SELECT project, ?1, source_id, target_id, kind, src_file
                         FROM relations WHERE project = ?2 AND generation = ?3 AND src_file = ?4",
                        params![generation, project, old_generation, rel_path],
                    )?;
                    tx.execute(
                        "INSERT OR REPLACE INTO file_hashes(project, generation, rel_path, hash)
                         VALUES(?1, ?2, ?3, ?4)",
                        params![project, generation, rel_path, hash],
                    )?;
                }
            }

            // Flip the generation pointer; readers switch atomically at commit.
            tx.execute(
                "INSERT OR REPLACE INTO meta(key, value) VALUES(?1, ?2)",
                params![format!("generation:{}", project), generation.to_string()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO meta(key, value) VALUES(?1, ?2)",
                params![format!("last_sync:{}", project), now_secs().to_string()],
            )?;

            // Old generations are rebuildable garbage once the pointer moved.
            tx.execute(
                "DELETE FROM entities WHERE project = ?1 AND generation < ?2",
                params![project, generation],
            )?;
            tx.execute(
                "DELETE FROM relations WHERE project = ?1 AND generation < ?2",
                params![project, generation],
            )?;
            tx.execute(
                "DELETE FROM file_hashes WHERE project = ?1 AND generation < ?2",
                params![project, generation],
            )?;

            tx.commit()?;
            Ok((generation, entities_added, relations_added))
        },
    )?;

    Ok(SyncResult {
        project: project.to_string(),
        generation,
        files_processed,
        files_skipped,
        entities_added,
        relations_added,
        duration_ms: started.elapsed().as_millis() as u64,
        errors,
    })
}

// --- In-memory graph ---------------------------------------------------------

/// Adjacency-indexed graph view of the current generation.
///
/// Relation lookups are indexed by source and by target so traversal from
/// any flow's entry points is O(reachable set) regardless of cycles.
#[derive(Debug, Default)]
pub struct Graph {
    pub entities: FxHashMap<String, Entity>,
    out_edges: FxHashMap<String, Vec<(String, String)>>,
    in_edges: FxHashMap<String, Vec<(String, String)>>,
    pub relation_count: usize,
}

impl Graph {
    pub fn from_parts(entities: Vec<Entity>, relations: Vec<Relation>) -> Self {
        let mut graph = Graph {
            relation_count: relations.len(),
            ..Default::default()
        };
        for entity in entities {
            graph.entities.insert(entity.id.clone(), entity);
        }
        for relation in relations {
            graph
                .out_edges
                .entry(relation.source_id.clone())
                .or_default()
                .push((relation.kind.clone(), relation.target_id.clone()));
            graph
                .in_edges
                .entry(relation.target_id)
                .or_default()
                .push((relation.kind, relation.source_id));
        }
        graph
    }

    pub fn outgoing(&self, id: &str) -> &[(String, String)] {
        self.out_edges.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn incoming(&self, id: &str) -> &[(String, String)] {
        self.in_edges.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Entities reachable from the given roots.
    ///
    /// Follows outgoing edges of every kind, plus incoming `belongs_to`
    /// edges so that reaching a container pulls in its members. A visited
    /// set keeps traversal linear under mutual-call cycles.
    pub fn reachable_from(&self, roots: &[String]) -> Vec<&Entity> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for root in roots {
            if self.entities.contains_key(root) && visited.insert(root.clone()) {
                queue.push_back(root.clone());
            }
        }
        let mut reached: Vec<&Entity> = Vec::new();
        while let Some(id) = queue.pop_front() {
            if let Some(entity) = self.entities.get(&id) {
                reached.push(entity);
            }
            for (_, target) in self.outgoing(&id) {
                if self.entities.contains_key(target) && visited.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
            }
            for (kind, source) in self.incoming(&id) {
                if kind == REL_BELONGS_TO
                    && self.entities.contains_key(source)
                    && visited.insert(source.clone())
                {
                    queue.push_back(source.clone());
                }
            }
        }
        reached
    }

    /// All relations among the given entity ids.
    pub fn relations_within(&self, ids: &HashSet<String>) -> Vec<Relation> {
        let mut relations = Vec::new();
        for id in ids {
            for (kind, target) in self.outgoing(id) {
                if ids.contains(target) {
                    relations.push(Relation {
                        source_id: id.clone(),
                        target_id: target.clone(),
                        kind: kind.clone(),
                    });
                }
            }
        }
        relations.sort_by(|a, b| {
            (&a.source_id, &a.target_id, &a.kind).cmp(&(&b.source_id, &b.target_id, &b.kind))
        });
        relations
    }

    /// Qualified paths of every file entity.
    pub fn file_paths(&self) -> BTreeSet<String> {
        self.entities
            .values()
            .filter(|e| e.kind == KIND_FILE)
            .map(|e| e.qualified_path.clone())
            .collect()
    }

    /// Look up a file entity by exact qualified path.
    pub fn file_by_path(&self, path: &str) -> Option<&Entity> {
        self.entities.get(&make_entity_id(KIND_FILE, path, None))
    }

    /// Look up file entities whose basename matches the given path's
    /// basename (alias matching for moved files).
    pub fn files_by_basename(&self, path: &str) -> Vec<&Entity> {
        let basename = Path::new(path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string());
        let mut matches: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| e.kind == KIND_FILE && e.name == basename)
            .collect();
        matches.sort_by(|a, b| a.qualified_path.cmp(&b.qualified_path));
        matches
    }
}

/// Load the current generation of a project's graph, if one exists.
pub fn load_graph(store: &Store, project: &str) -> Result<Option<Graph>, CephalonError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::graph_db_path(&store.root);
    if !db_path.exists() {
        return Ok(None);
    }
    broker.with_conn(&db_path, "cephalon", None, "graph.load", |conn| {
        let meta_present: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if meta_present.is_none() {
            return Ok(None);
        }
        let Some(generation) = current_generation(conn, project)? else {
            return Ok(None);
        };

        let mut entities = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, kind, name, qualified_path, attributes FROM entities
                 WHERE project = ?1 AND generation = ?2",
            )?;
            let rows = stmt.query_map(params![project, generation], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            for r in rows {
                let (id, kind, name, qualified_path, attributes) = r?;
                let attributes: BTreeMap<String, String> =
                    serde_json::from_str(&attributes).unwrap_or_default();
                entities.push(Entity {
                    id,
                    kind,
                    name,
                    qualified_path,
                    attributes,
                });
            }
        }

        let mut relations = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT source_id, target_id, kind FROM relations
                 WHERE project = ?1 AND generation = ?2",
            )?;
            let rows = stmt.query_map(params![project, generation], |row| {
                Ok(Relation {
                    source_id: row.get(0)?,
                    target_id: row.get(1)?,
                    kind: row.get(2)?,
                })
            })?;
            for r in rows {
                relations.push(r?);
            }
        }

        Ok(Some(Graph::from_parts(entities, relations)))
    })
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GraphStats {
    pub project: String,
    pub entity_count: usize,
    pub relation_count: usize,
    pub file_count: usize,
    pub last_sync: Option<u64>,
}

pub fn graph_stats(store: &Store, project: &str) -> Result<GraphStats, CephalonError> {
    let graph = load_graph(store, project)?;
    let last = last_sync(store, project)?;
    let (entity_count, relation_count, file_count) = match &graph {
        Some(g) => (
            g.entities.len(),
            g.relation_count,
            g.entities.values().filter(|e| e.kind == KIND_FILE).count(),
        ),
        None => (0, 0, 0),
    };
    Ok(GraphStats {
        project: project.to_string(),
        entity_count,
        relation_count,
        file_count,
        last_sync: last,
    })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "graph",
        "version": "0.1.0",
        "description": "Structural code graph with generation-swapped rebuilds",
        "commands": [
            { "name": "sync", "parameters": ["project", "path", "full"] },
            { "name": "stats", "parameters": ["project"] }
        ],
        "storage": ["graph.db"]
    })
}
