//! Task lifecycle management.
//!
//! Owns the task/subtask state machines, agent assignment, checkpoint
//! persistence, and derived progress. All mutations route through the DB
//! broker, which serializes them; the subtask claim is additionally a
//! compare-and-set on the current status so concurrent dispatch cannot
//! double-assign.
//!
//! Task:    created -> planned -> in_progress -> {completed | blocked | failed}
//! Subtask: pending -> assigned -> in_progress -> {verified | rejected -> in_progress | failed}

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::CephalonError;
use crate::core::store::Store;
use crate::core::time::now_epoch_z;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Planned,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Planned => "planned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CephalonError> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "planned" => Ok(TaskStatus::Planned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(CephalonError::ValidationError(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Blocked | TaskStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskStatus {
    Pending,
    Assigned,
    InProgress,
    Verified,
    Rejected,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Assigned => "assigned",
            SubtaskStatus::InProgress => "in_progress",
            SubtaskStatus::Verified => "verified",
            SubtaskStatus::Rejected => "rejected",
            SubtaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CephalonError> {
        match s {
            "pending" => Ok(SubtaskStatus::Pending),
            "assigned" => Ok(SubtaskStatus::Assigned),
            "in_progress" => Ok(SubtaskStatus::InProgress),
            "verified" => Ok(SubtaskStatus::Verified),
            "rejected" => Ok(SubtaskStatus::Rejected),
            "failed" => Ok(SubtaskStatus::Failed),
            other => Err(CephalonError::ValidationError(format!(
                "unknown subtask status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskStatus::Verified | SubtaskStatus::Failed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Task {
    pub id: String,
    pub project: String,
    pub description: String,
    pub priority: f64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Subtask {
    pub id: String,
    pub parent_task_id: String,
    pub description: String,
    pub assigned_agent: String,
    pub status: String,
    pub ord: i64,
    pub retry_count: i64,
    pub rejection_note: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TaskProgress {
    pub completed_count: usize,
    pub total_count: usize,
    pub percent: f64,
    pub is_complete: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    pub agent: String,
    pub state: JsonValue,
    pub summary: String,
    pub saved_at: String,
    pub seq: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TaskEvent {
    pub event_id: String,
    pub ts: String,
    pub event_type: String,
    pub task_id: Option<String>,
    pub subtask_id: Option<String>,
    pub payload: JsonValue,
    pub actor: String,
}

fn insert_event(conn: &Connection, ev: &TaskEvent) -> Result<(), CephalonError> {
    conn.execute(
        "INSERT INTO task_events(event_id, ts, event_type, task_id, subtask_id, payload, actor)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            ev.event_id,
            ev.ts,
            ev.event_type,
            ev.task_id,
            ev.subtask_id,
            serde_json::to_string(&ev.payload).unwrap(),
            ev.actor,
        ],
    )?;
    Ok(())
}

fn event(
    event_type: &str,
    task_id: Option<&str>,
    subtask_id: Option<&str>,
    payload: JsonValue,
    actor: &str,
    ts: &str,
) -> TaskEvent {
    TaskEvent {
        event_id: Ulid::new().to_string(),
        ts: ts.to_string(),
        event_type: event_type.to_string(),
        task_id: task_id.map(|s| s.to_string()),
        subtask_id: subtask_id.map(|s| s.to_string()),
        payload,
        actor: actor.to_string(),
    }
}

fn task_row(conn: &Connection, id: &str) -> Result<Option<Task>, CephalonError> {
    conn.query_row(
        "SELECT id, project, description, priority, status, created_at, updated_at
         FROM tasks WHERE id = ?1",
        params![id],
        |row| {
            Ok(Task {
                id: row.get(0)?,
                project: row.get(1)?,
                description: row.get(2)?,
                priority: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        },
    )
    .optional()
    .map_err(CephalonError::RusqliteError)
}

fn subtask_row(conn: &Connection, id: &str) -> Result<Option<Subtask>, CephalonError> {
    conn.query_row(
        "SELECT id, parent_task_id, description, assigned_agent, status, ord, retry_count, rejection_note, created_at, updated_at
         FROM subtasks WHERE id = ?1",
        params![id],
        |row| {
            Ok(Subtask {
                id: row.get(0)?,
                parent_task_id: row.get(1)?,
                description: row.get(2)?,
                assigned_agent: row.get(3)?,
                status: row.get(4)?,
                ord: row.get(5)?,
                retry_count: row.get(6)?,
                rejection_note: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        },
    )
    .optional()
    .map_err(CephalonError::RusqliteError)
}

pub fn create_task(
    store: &Store,
    project: &str,
    description: &str,
    priority: f64,
) -> Result<Task, CephalonError> {
    if !(0.0..=10.0).contains(&priority) {
        return Err(CephalonError::ValidationError(format!(
            "priority must be in [0,10], got {}",
            priority
        )));
    }
    db::initialize_task_db(&store.root)?;
    let ts = now_epoch_z();
    let id = Ulid::new().to_string();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "task.create",
        |conn| {
            conn.execute(
                "INSERT INTO tasks(id, project, description, priority, status, created_at, updated_at)
                 VALUES(?1, ?2, ?3, ?4, 'created', ?5, ?5)",
                params![id, project, description, priority, ts],
            )?;
            insert_event(
                conn,
                &event(
                    "task.create",
                    Some(&id),
                    None,
                    serde_json::json!({ "description": description, "priority": priority }),
                    "cephalon",
                    &ts,
                ),
            )?;
            Ok(())
        },
    )?;
    get_task(store, &id)
}

pub fn create_subtask(
    store: &Store,
    parent_task_id: &str,
    description: &str,
) -> Result<Subtask, CephalonError> {
    let ts = now_epoch_z();
    let id = Ulid::new().to_string();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "subtask.create",
        |conn| {
            let task = task_row(conn, parent_task_id)?.ok_or_else(|| {
                CephalonError::NotFound(format!("task '{}' not found", parent_task_id))
            })?;
            let status = TaskStatus::parse(&task.status)?;
            if status.is_terminal() {
                return Err(CephalonError::InvalidTransition(format!(
                    "cannot add subtask to {} task '{}'",
                    task.status, parent_task_id
                )));
            }
            let next_ord: i64 = conn.query_row(
                "SELECT COALESCE(MAX(ord), -1) + 1 FROM subtasks WHERE parent_task_id = ?1",
                params![parent_task_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO subtasks(id, parent_task_id, description, status, ord, created_at, updated_at)
                 VALUES(?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
                params![id, parent_task_id, description, next_ord, ts],
            )?;
            insert_event(
                conn,
                &event(
                    "subtask.create",
                    Some(parent_task_id),
                    Some(&id),
                    serde_json::json!({ "description": description, "ord": next_ord }),
                    "cephalon",
                    &ts,
                ),
            )?;
            Ok(())
        },
    )?;
    get_subtask(store, &id)
}

pub fn get_task(store: &Store, id: &str) -> Result<Task, CephalonError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "task.get",
        |conn| {
            task_row(conn, id)?
                .ok_or_else(|| CephalonError::NotFound(format!("task '{}' not found", id)))
        },
    )
}

pub fn get_subtask(store: &Store, id: &str) -> Result<Subtask, CephalonError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "subtask.get",
        |conn| {
            subtask_row(conn, id)?
                .ok_or_else(|| CephalonError::NotFound(format!("subtask '{}' not found", id)))
        },
    )
}

pub fn list_tasks(store: &Store, project: Option<&str>) -> Result<Vec<Task>, CephalonError> {
    let db_path = db::task_db_path(&store.root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, "cephalon", None, "task.list", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, project, description, priority, status, created_at, updated_at
             FROM tasks WHERE (?1 IS NULL OR project = ?1) ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![project], |row| {
            Ok(Task {
                id: row.get(0)?,
                project: row.get(1)?,
                description: row.get(2)?,
                priority: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;
        let mut tasks = Vec::new();
        for r in rows {
            tasks.push(r?);
        }
        Ok(tasks)
    })
}

pub fn list_subtasks(store: &Store, parent_task_id: &str) -> Result<Vec<Subtask>, CephalonError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "subtask.list",
        |conn| list_subtasks_in(conn, parent_task_id),
    )
}

fn list_subtasks_in(conn: &Connection, parent_task_id: &str) -> Result<Vec<Subtask>, CephalonError> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_task_id, description, assigned_agent, status, ord, retry_count, rejection_note, created_at, updated_at
         FROM subtasks WHERE parent_task_id = ?1 ORDER BY ord",
    )?;
    let rows = stmt.query_map(params![parent_task_id], |row| {
        Ok(Subtask {
            id: row.get(0)?,
            parent_task_id: row.get(1)?,
            description: row.get(2)?,
            assigned_agent: row.get(3)?,
            status: row.get(4)?,
            ord: row.get(5)?,
            retry_count: row.get(6)?,
            rejection_note: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    })?;
    let mut subtasks = Vec::new();
    for r in rows {
        subtasks.push(r?);
    }
    Ok(subtasks)
}

fn transition_task(
    store: &Store,
    id: &str,
    from: &[TaskStatus],
    to: TaskStatus,
    event_type: &str,
) -> Result<Task, CephalonError> {
    let ts = now_epoch_z();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        event_type,
        |conn| {
            let task = task_row(conn, id)?
                .ok_or_else(|| CephalonError::NotFound(format!("task '{}' not found", id)))?;
            let current = TaskStatus::parse(&task.status)?;
            if !from.contains(&current) {
                return Err(CephalonError::InvalidTransition(format!(
                    "task '{}': {} -> {}",
                    id,
                    current.as_str(),
                    to.as_str()
                )));
            }
            conn.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.as_str(), ts, id],
            )?;
            insert_event(
                conn,
                &event(
                    event_type,
                    Some(id),
                    None,
                    serde_json::json!({ "from": current.as_str(), "to": to.as_str() }),
                    "cephalon",
                    &ts,
                ),
            )?;
            Ok(())
        },
    )?;
    get_task(store, id)
}

pub fn plan_task(store: &Store, id: &str) -> Result<Task, CephalonError> {
    transition_task(store, id, &[TaskStatus::Created], TaskStatus::Planned, "task.plan")
}

pub fn start_task(store: &Store, id: &str) -> Result<Task, CephalonError> {
    transition_task(
        store,
        id,
        &[TaskStatus::Planned],
        TaskStatus::InProgress,
        "task.start",
    )
}

/// Claim a subtask for an agent.
///
/// The claim is a compare-and-set against `status = 'pending'`; under
/// concurrent dispatch exactly one agent wins and the loser gets
/// `InvalidTransition`.
pub fn assign_subtask(store: &Store, id: &str, agent: &str) -> Result<Subtask, CephalonError> {
    if agent.is_empty() {
        return Err(CephalonError::ValidationError(
            "assign requires a non-empty agent id".to_string(),
        ));
    }
    let ts = now_epoch_z();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        agent,
        None,
        "subtask.assign",
        |conn| {
            let changed = conn.execute(
                "UPDATE subtasks SET status = 'assigned', assigned_agent = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![agent, ts, id],
            )?;
            if changed == 0 {
                let existing = subtask_row(conn, id)?;
                return match existing {
                    None => Err(CephalonError::NotFound(format!(
                        "subtask '{}' not found",
                        id
                    ))),
                    Some(s) => Err(CephalonError::InvalidTransition(format!(
                        "subtask '{}': {} -> assigned",
                        id, s.status
                    ))),
                };
            }
            insert_event(
                conn,
                &event(
                    "subtask.assign",
                    None,
                    Some(id),
                    serde_json::json!({ "agent": agent }),
                    agent,
                    &ts,
                ),
            )?;
            Ok(())
        },
    )?;
    get_subtask(store, id)
}

/// Begin (or resume after rejection) execution of a subtask. Starting the
/// first subtask pulls a planned parent task into `in_progress`.
pub fn start_subtask(store: &Store, id: &str) -> Result<Subtask, CephalonError> {
    let ts = now_epoch_z();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "subtask.start",
        |conn| {
            let subtask = subtask_row(conn, id)?
                .ok_or_else(|| CephalonError::NotFound(format!("subtask '{}' not found", id)))?;
            let current = SubtaskStatus::parse(&subtask.status)?;
            if !matches!(current, SubtaskStatus::Assigned | SubtaskStatus::Rejected) {
                return Err(CephalonError::InvalidTransition(format!(
                    "subtask '{}': {} -> in_progress",
                    id, subtask.status
                )));
            }
            conn.execute(
                "UPDATE subtasks SET status = 'in_progress', updated_at = ?1 WHERE id = ?2",
                params![ts, id],
            )?;
            conn.execute(
                "UPDATE tasks SET status = 'in_progress', updated_at = ?1
                 WHERE id = ?2 AND status = 'planned'",
                params![ts, subtask.parent_task_id],
            )?;
            insert_event(
                conn,
                &event(
                    "subtask.start",
                    Some(&subtask.parent_task_id),
                    Some(id),
                    serde_json::json!({ "retry": current == SubtaskStatus::Rejected }),
                    &subtask.assigned_agent,
                    &ts,
                ),
            )?;
            Ok(())
        },
    )?;
    get_subtask(store, id)
}

/// Critic verdict: success.
pub fn verify_subtask(store: &Store, id: &str) -> Result<Subtask, CephalonError> {
    let ts = now_epoch_z();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "subtask.verify",
        |conn| {
            let subtask = subtask_row(conn, id)?
                .ok_or_else(|| CephalonError::NotFound(format!("subtask '{}' not found", id)))?;
            if SubtaskStatus::parse(&subtask.status)? != SubtaskStatus::InProgress {
                return Err(CephalonError::InvalidTransition(format!(
                    "subtask '{}': {} -> verified",
                    id, subtask.status
                )));
            }
            conn.execute(
                "UPDATE subtasks SET status = 'verified', updated_at = ?1 WHERE id = ?2",
                params![ts, id],
            )?;
            insert_event(
                conn,
                &event(
                    "subtask.verify",
                    Some(&subtask.parent_task_id),
                    Some(id),
                    serde_json::json!({}),
                    "cephalon",
                    &ts,
                ),
            )?;
            Ok(())
        },
    )?;
    get_subtask(store, id)
}

/// Critic verdict: rejection, annotated.
///
/// The subtask loops back toward the same executing agent for a bounded
/// number of retries; exhausting `max_retries` fails it terminally and
/// moves the parent task to `blocked`.
pub fn reject_subtask(
    store: &Store,
    id: &str,
    note: &str,
    max_retries: u32,
) -> Result<Subtask, CephalonError> {
    let ts = now_epoch_z();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "subtask.reject",
        |conn| {
            let subtask = subtask_row(conn, id)?
                .ok_or_else(|| CephalonError::NotFound(format!("subtask '{}' not found", id)))?;
            if SubtaskStatus::parse(&subtask.status)? != SubtaskStatus::InProgress {
                return Err(CephalonError::InvalidTransition(format!(
                    "subtask '{}': {} -> rejected",
                    id, subtask.status
                )));
            }
            let retries = subtask.retry_count + 1;
            let exhausted = retries > max_retries as i64;
            let new_status = if exhausted { "failed" } else { "rejected" };
            conn.execute(
                "UPDATE subtasks SET status = ?1, retry_count = ?2, rejection_note = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![new_status, retries, note, ts, id],
            )?;
            if exhausted {
                // Terminal failure propagates the parent toward blocked.
                conn.execute(
                    "UPDATE tasks SET status = 'blocked', updated_at = ?1
                     WHERE id = ?2 AND status NOT IN ('completed', 'failed')",
                    params![ts, subtask.parent_task_id],
                )?;
            }
            insert_event(
                conn,
                &event(
                    "subtask.reject",
                    Some(&subtask.parent_task_id),
                    Some(id),
                    serde_json::json!({ "note": note, "retry_count": retries, "exhausted": exhausted }),
                    "cephalon",
                    &ts,
                ),
            )?;
            Ok(())
        },
    )?;
    get_subtask(store, id)
}

fn progress_of(subtasks: &[Subtask]) -> TaskProgress {
    let total_count = subtasks.len();
    let completed_count = subtasks.iter().filter(|s| s.status == "verified").count();
    let percent = if total_count == 0 {
        0.0
    } else {
        completed_count as f64 * 100.0 / total_count as f64
    };
    TaskProgress {
        completed_count,
        total_count,
        percent,
        is_complete: total_count > 0 && completed_count == total_count,
    }
}

/// Aggregate progress, derived from current subtask states on every call.
/// Never stored.
pub fn get_task_progress(store: &Store, task_id: &str) -> Result<TaskProgress, CephalonError> {
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "task.progress",
        |conn| {
            if task_row(conn, task_id)?.is_none() {
                return Err(CephalonError::NotFound(format!(
                    "task '{}' not found",
                    task_id
                )));
            }
            let subtasks = list_subtasks_in(conn, task_id)?;
            Ok(progress_of(&subtasks))
        },
    )
}

/// Complete a task.
///
/// Legal only when every subtask is `verified`; the subtask scan and the
/// task write happen under one brokered connection so a concurrent
/// subtask update cannot produce a false `completed`. Calling it again on
/// a completed task is a no-op returning the completed row.
pub fn finish_task(store: &Store, task_id: &str) -> Result<Task, CephalonError> {
    let ts = now_epoch_z();
    let broker = DbBroker::new(&store.root);
    broker.with_conn(
        &db::task_db_path(&store.root),
        "cephalon",
        None,
        "task.finish",
        |conn| {
            let tx = conn.unchecked_transaction()?;
            let task = task_row(&tx, task_id)?
                .ok_or_else(|| CephalonError::NotFound(format!("task '{}' not found", task_id)))?;
            let current = TaskStatus::parse(&task.status)?;
            if current == TaskStatus::Completed {
                tx.commit()?;
                return Ok(());
            }
            if matches!(current, TaskStatus::Blocked | TaskStatus::Failed) {
                return Err(CephalonError::InvalidTransition(format!(
                    "task '{}': {} -> completed",
                    task_id,
                    current.as_str()
                )));
            }
            let subtasks = list_subtasks_in(&tx, task_id)?;
            if let Some(open) = subtasks.iter().find(|s| s.status != "verified") {
                return Err(CephalonError::InvalidTransition(format!(
                    "task '{}': subtask '{}' is {}, not verified",
                    task_id, open.id, open.status
                )));
            }
            tx.execute(
                "UPDATE tasks SET status = 'completed', updated_at = ?1 WHERE id = ?2",
                params![ts, task_id],
            )?;
            insert_event(
                &tx,
                &event(
                    "task.finish",
                    Some(task_id),
                    None,
                    serde_json::json!({ "subtasks": subtasks.len() }),
                    "cephalon",
                    &ts,
                ),
            )?;
            tx.commit()?;
            Ok(())
        },
    )?;
    get_task(store, task_id)
}

// --- Checkpoints -------------------------------------------------------------

/// Persist a resumable state snapshot for `(task_id, agent)`.
///
/// Checkpoints are append-only: the newest row is the resume point and
/// older rows stay retrievable as history.
pub fn save_checkpoint(
    store: &Store,
    task_id: &str,
    agent: &str,
    state: &JsonValue,
    summary: &str,
) -> Result<Checkpoint, CephalonError> {
    let ts = now_epoch_z();
    let id = Ulid::new().to_string();
    let broker = DbBroker::new(&store.root);
    let seq = broker.with_conn(
        &db::task_db_path(&store.root),
        agent,
        None,
        "checkpoint.save",
        |conn| {
            if task_row(conn, task_id)?.is_none() {
                return Err(CephalonError::NotFound(format!(
                    "task '{}' not found",
                    task_id
                )));
            }
            conn.execute(
                "INSERT INTO checkpoints(id, task_id, agent, state, summary, saved_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    task_id,
                    agent,
                    serde_json::to_string(state).unwrap(),
                    summary,
                    ts
                ],
            )?;
            Ok(conn.last_insert_rowid())
        },
    )?;
    Ok(Checkpoint {
        id,
        task_id: task_id.to_string(),
        agent: agent.to_string(),
        state: state.clone(),
        summary: summary.to_string(),
        saved_at: ts,
        seq,
    })
}

fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Checkpoint, String)> {
    let state_raw: String = row.get(3)?;
    Ok((
        Checkpoint {
            id: row.get(0)?,
            task_id: row.get(1)?,
            agent: row.get(2)?,
            state: JsonValue::Null,
            summary: row.get(4)?,
            saved_at: row.get(5)?,
            seq: row.get(6)?,
        },
        state_raw,
    ))
}

/// Latest checkpoint for `(task_id, agent)`, or `Ok(None)` when the pair
/// has never checkpointed — first runs are not an error.
pub fn load_checkpoint(
    store: &Store,
    task_id: &str,
    agent: &str,
) -> Result<Option<Checkpoint>, CephalonError> {
    let db_path = db::task_db_path(&store.root);
    if !db_path.exists() {
        return Ok(None);
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, agent, None, "checkpoint.load", |conn| {
        let row = conn
            .query_row(
                "SELECT id, task_id, agent, state, summary, saved_at, seq FROM checkpoints
                 WHERE task_id = ?1 AND agent = ?2 ORDER BY seq DESC LIMIT 1",
                params![task_id, agent],
                checkpoint_from_row,
            )
            .optional()?;
        Ok(row.map(|(mut cp, state_raw)| {
            cp.state = serde_json::from_str(&state_raw).unwrap_or(JsonValue::Null);
            cp
        }))
    })
}

/// Full checkpoint history for `(task_id, agent)`, newest first.
pub fn list_checkpoints(
    store: &Store,
    task_id: &str,
    agent: &str,
) -> Result<Vec<Checkpoint>, CephalonError> {
    let db_path = db::task_db_path(&store.root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, agent, None, "checkpoint.list", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, task_id, agent, state, summary, saved_at, seq FROM checkpoints
             WHERE task_id = ?1 AND agent = ?2 ORDER BY seq DESC",
        )?;
        let rows = stmt.query_map(params![task_id, agent], checkpoint_from_row)?;
        let mut checkpoints = Vec::new();
        for r in rows {
            let (mut cp, state_raw) = r?;
            cp.state = serde_json::from_str(&state_raw).unwrap_or(JsonValue::Null);
            checkpoints.push(cp);
        }
        Ok(checkpoints)
    })
}

pub fn task_db_path(root: &Path) -> std::path::PathBuf {
    db::task_db_path(root)
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "tasks",
        "version": "0.1.0",
        "description": "Task/subtask lifecycle with CAS assignment and checkpoints",
        "commands": [
            { "name": "add", "parameters": ["project", "description", "priority"] },
            { "name": "subtask", "parameters": ["task", "description"] },
            { "name": "assign", "parameters": ["id", "agent"] },
            { "name": "start", "parameters": ["id"] },
            { "name": "verify", "parameters": ["id"] },
            { "name": "reject", "parameters": ["id", "note"] },
            { "name": "finish", "parameters": ["id"] },
            { "name": "progress", "parameters": ["id"] },
            { "name": "checkpoint", "parameters": ["task", "agent", "state", "summary"] }
        ],
        "storage": ["task.db"]
    })
}
