//! Centralized database schema definitions for Cephalon's consolidated bins.
//!
//! Cephalon uses 3 SQLite databases ("bins") to manage state:
//! 1. graph.db: code-graph generations, skill flow snapshots, drift reports.
//! 2. memory.db: experiential memory records with vector embeddings.
//! 3. task.db: task/subtask lifecycle with checkpoints and events.

// --- 1. Graph Bin ---
pub const GRAPH_DB_NAME: &str = "graph.db";

pub const GRAPH_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const GRAPH_DB_SCHEMA_ENTITIES: &str = "
    CREATE TABLE IF NOT EXISTS entities (
        row_id INTEGER PRIMARY KEY,
        project TEXT NOT NULL,
        generation INTEGER NOT NULL,
        id TEXT NOT NULL,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        qualified_path TEXT NOT NULL,
        attributes TEXT NOT NULL DEFAULT '{}',
        src_file TEXT NOT NULL DEFAULT ''
    )
";

pub const GRAPH_DB_SCHEMA_RELATIONS: &str = "
    CREATE TABLE IF NOT EXISTS relations (
        row_id INTEGER PRIMARY KEY,
        project TEXT NOT NULL,
        generation INTEGER NOT NULL,
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        src_file TEXT NOT NULL DEFAULT ''
    )
";

pub const GRAPH_DB_SCHEMA_FILE_HASHES: &str = "
    CREATE TABLE IF NOT EXISTS file_hashes (
        project TEXT NOT NULL,
        generation INTEGER NOT NULL,
        rel_path TEXT NOT NULL,
        hash TEXT NOT NULL,
        PRIMARY KEY(project, generation, rel_path)
    )
";

pub const GRAPH_DB_SCHEMA_FLOW_SNAPSHOTS: &str = "
    CREATE TABLE IF NOT EXISTS flow_snapshots (
        project TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        signature_hash TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY(project, flow_id, entity_id)
    )
";

pub const GRAPH_DB_SCHEMA_DRIFT_REPORTS: &str = "
    CREATE TABLE IF NOT EXISTS drift_reports (
        id TEXT PRIMARY KEY,
        project TEXT NOT NULL,
        flow_scope TEXT,
        has_drift INTEGER NOT NULL,
        summary TEXT NOT NULL DEFAULT '',
        checked_at TEXT NOT NULL
    )
";

pub const GRAPH_DB_SCHEMA_DRIFTS: &str = "
    CREATE TABLE IF NOT EXISTS drifts (
        id TEXT PRIMARY KEY,
        report_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        drift_type TEXT NOT NULL,
        description TEXT NOT NULL,
        doc_item TEXT,
        code_item TEXT,
        detected_at TEXT NOT NULL,
        FOREIGN KEY(report_id) REFERENCES drift_reports(id)
    )
";

pub const GRAPH_DB_INDEX_ENTITIES_GEN: &str =
    "CREATE INDEX IF NOT EXISTS idx_entities_gen ON entities(project, generation)";
pub const GRAPH_DB_INDEX_ENTITIES_UNIQUE: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_unique ON entities(project, generation, id)";
pub const GRAPH_DB_INDEX_ENTITIES_SRC: &str =
    "CREATE INDEX IF NOT EXISTS idx_entities_src ON entities(project, generation, src_file)";
pub const GRAPH_DB_INDEX_ENTITIES_QPATH: &str =
    "CREATE INDEX IF NOT EXISTS idx_entities_qpath ON entities(project, generation, qualified_path)";
pub const GRAPH_DB_INDEX_RELATIONS_GEN: &str =
    "CREATE INDEX IF NOT EXISTS idx_relations_gen ON relations(project, generation)";
pub const GRAPH_DB_INDEX_RELATIONS_UNIQUE: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_relations_unique ON relations(project, generation, source_id, target_id, kind)";
pub const GRAPH_DB_INDEX_RELATIONS_SRC: &str =
    "CREATE INDEX IF NOT EXISTS idx_relations_src ON relations(project, generation, src_file)";
pub const GRAPH_DB_INDEX_RELATIONS_SOURCE: &str =
    "CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(project, generation, source_id)";
pub const GRAPH_DB_INDEX_RELATIONS_TARGET: &str =
    "CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(project, generation, target_id)";
pub const GRAPH_DB_INDEX_DRIFTS_REPORT: &str =
    "CREATE INDEX IF NOT EXISTS idx_drifts_report ON drifts(report_id)";
pub const GRAPH_DB_INDEX_REPORTS_PROJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_drift_reports_project ON drift_reports(project, checked_at)";

// --- 2. Memory Bin ---
pub const MEMORY_DB_NAME: &str = "memory.db";

pub const MEMORY_DB_SCHEMA_MEMORIES: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        category TEXT NOT NULL DEFAULT '',
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        project TEXT NOT NULL DEFAULT '',
        importance REAL NOT NULL DEFAULT 5.0,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL
    )
";

pub const MEMORY_DB_INDEX_PROJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(project)";
pub const MEMORY_DB_INDEX_CATEGORY: &str =
    "CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category)";
pub const MEMORY_DB_INDEX_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at)";

// --- 3. Task Bin ---
pub const TASK_DB_NAME: &str = "task.db";

pub const TASK_DB_SCHEMA_TASKS: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        project TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL,
        priority REAL NOT NULL DEFAULT 5.0,
        status TEXT NOT NULL DEFAULT 'created',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const TASK_DB_SCHEMA_SUBTASKS: &str = "
    CREATE TABLE IF NOT EXISTS subtasks (
        id TEXT PRIMARY KEY,
        parent_task_id TEXT NOT NULL,
        description TEXT NOT NULL,
        assigned_agent TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        ord INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        rejection_note TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(parent_task_id) REFERENCES tasks(id)
    )
";

pub const TASK_DB_SCHEMA_CHECKPOINTS: &str = "
    CREATE TABLE IF NOT EXISTS checkpoints (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        agent TEXT NOT NULL,
        state TEXT NOT NULL,
        summary TEXT NOT NULL DEFAULT '',
        saved_at TEXT NOT NULL
    )
";

pub const TASK_DB_SCHEMA_TASK_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS task_events (
        event_id TEXT PRIMARY KEY,
        ts TEXT NOT NULL,
        event_type TEXT NOT NULL,
        task_id TEXT,
        subtask_id TEXT,
        payload TEXT NOT NULL,
        actor TEXT NOT NULL
    )
";

pub const TASK_DB_INDEX_SUBTASKS_PARENT: &str =
    "CREATE INDEX IF NOT EXISTS idx_subtasks_parent ON subtasks(parent_task_id, ord)";
pub const TASK_DB_INDEX_SUBTASKS_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_subtasks_status ON subtasks(status)";
pub const TASK_DB_INDEX_TASKS_PROJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project)";
pub const TASK_DB_INDEX_CHECKPOINTS_PAIR: &str =
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_pair ON checkpoints(task_id, agent, seq)";
pub const TASK_DB_INDEX_EVENTS_TASK: &str =
    "CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events(task_id)";
