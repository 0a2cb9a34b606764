use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::CephalonError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::CephalonError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::CephalonError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::CephalonError::RusqliteError)?;
    Ok(conn)
}

pub fn graph_db_path(root: &Path) -> PathBuf {
    root.join(schemas::GRAPH_DB_NAME)
}

pub fn memory_db_path(root: &Path) -> PathBuf {
    root.join(schemas::MEMORY_DB_NAME)
}

pub fn task_db_path(root: &Path) -> PathBuf {
    root.join(schemas::TASK_DB_NAME)
}

pub fn initialize_graph_db(root: &Path) -> Result<(), error::CephalonError> {
    fs::create_dir_all(root).map_err(error::CephalonError::IoError)?;
    let broker = DbBroker::new(root);
    broker.with_conn(&graph_db_path(root), "cephalon", None, "graph.init", |conn| {
        conn.execute(schemas::GRAPH_DB_SCHEMA_META, [])?;
        conn.execute(schemas::GRAPH_DB_SCHEMA_ENTITIES, [])?;
        conn.execute(schemas::GRAPH_DB_SCHEMA_RELATIONS, [])?;
        conn.execute(schemas::GRAPH_DB_SCHEMA_FILE_HASHES, [])?;
        conn.execute(schemas::GRAPH_DB_SCHEMA_FLOW_SNAPSHOTS, [])?;
        conn.execute(schemas::GRAPH_DB_SCHEMA_DRIFT_REPORTS, [])?;
        conn.execute(schemas::GRAPH_DB_SCHEMA_DRIFTS, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_ENTITIES_GEN, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_ENTITIES_UNIQUE, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_ENTITIES_SRC, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_ENTITIES_QPATH, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_RELATIONS_GEN, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_RELATIONS_UNIQUE, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_RELATIONS_SRC, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_RELATIONS_SOURCE, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_RELATIONS_TARGET, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_DRIFTS_REPORT, [])?;
        conn.execute(schemas::GRAPH_DB_INDEX_REPORTS_PROJECT, [])?;
        Ok(())
    })
}

pub fn initialize_memory_db(root: &Path) -> Result<(), error::CephalonError> {
    fs::create_dir_all(root).map_err(error::CephalonError::IoError)?;
    let broker = DbBroker::new(root);
    broker.with_conn(&memory_db_path(root), "cephalon", None, "memory.init", |conn| {
        conn.execute(schemas::MEMORY_DB_SCHEMA_MEMORIES, [])?;
        conn.execute(schemas::MEMORY_DB_INDEX_PROJECT, [])?;
        conn.execute(schemas::MEMORY_DB_INDEX_CATEGORY, [])?;
        conn.execute(schemas::MEMORY_DB_INDEX_CREATED, [])?;
        Ok(())
    })
}

pub fn initialize_task_db(root: &Path) -> Result<(), error::CephalonError> {
    fs::create_dir_all(root).map_err(error::CephalonError::IoError)?;
    let broker = DbBroker::new(root);
    broker.with_conn(&task_db_path(root), "cephalon", None, "task.init", |conn| {
        conn.execute(schemas::TASK_DB_SCHEMA_TASKS, [])?;
        conn.execute(schemas::TASK_DB_SCHEMA_SUBTASKS, [])?;
        conn.execute(schemas::TASK_DB_SCHEMA_CHECKPOINTS, [])?;
        conn.execute(schemas::TASK_DB_SCHEMA_TASK_EVENTS, [])?;
        conn.execute(schemas::TASK_DB_INDEX_SUBTASKS_PARENT, [])?;
        conn.execute(schemas::TASK_DB_INDEX_SUBTASKS_STATUS, [])?;
        conn.execute(schemas::TASK_DB_INDEX_TASKS_PROJECT, [])?;
        conn.execute(schemas::TASK_DB_INDEX_CHECKPOINTS_PAIR, [])?;
        conn.execute(schemas::TASK_DB_INDEX_EVENTS_TASK, [])?;
        Ok(())
    })
}

/// Initialize every bin under the store root. Existing databases are
/// preserved (schemas are CREATE IF NOT EXISTS).
pub fn initialize_all(root: &Path) -> Result<(), error::CephalonError> {
    initialize_graph_db(root)?;
    initialize_memory_db(root)?;
    initialize_task_db(root)?;
    Ok(())
}
