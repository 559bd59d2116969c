//! Persistence for `TaskInstance` and `WorkUnit` records.
//!
//! Mirrors the CRUD shape used elsewhere in this crate: typed query methods
//! returning `StoreResult<T>`, with `NotFound` mapped from
//! `rusqlite::Error::QueryReturnedNoRows` where a single row is expected.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Status codes
// ═══════════════════════════════════════════════════════════════════════

/// Stable status codes for `TaskInstance` and `WorkUnit` records.
///
/// The integer values are part of the external contract (persisted records
/// and the `task_statuses` wire format) and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TaskStatus {
    Stopped = 0,
    Running = 1,
    Paused = 2,
    Complete = 3,
    Cancelled = 4,
    Failed = -1,
    Unknown = -2,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Cancelled | TaskStatus::Failed | TaskStatus::Complete)
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<i32> for TaskStatus {
    fn from(value: i32) -> Self {
        match value {
            0 => TaskStatus::Stopped,
            1 => TaskStatus::Running,
            2 => TaskStatus::Paused,
            3 => TaskStatus::Complete,
            4 => TaskStatus::Cancelled,
            -1 => TaskStatus::Failed,
            _ => TaskStatus::Unknown,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// One scheduled execution of a root task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: i64,
    pub task_key: String,
    pub priority: i32,
    /// Opaque JSON-encoded argument blob.
    pub args: String,
    pub status: TaskStatus,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub main_worker_id: Option<String>,
    pub local_workunit_id: Option<i64>,
}

/// One subtask execution assigned by a main worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: i64,
    pub task_instance_id: i64,
    pub subtask_key: Option<String>,
    pub workunit_key: Option<String>,
    pub args: String,
    pub worker_id: Option<String>,
    pub status: TaskStatus,
    pub on_main_worker: bool,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

struct TaskInstanceRow {
    id: i64,
    task_key: String,
    priority: i32,
    args: String,
    status: i32,
    queued_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    main_worker_id: Option<String>,
    local_workunit_id: Option<i64>,
}

impl TaskInstanceRow {
    fn into_task_instance(self) -> TaskInstance {
        TaskInstance {
            id: self.id,
            task_key: self.task_key,
            priority: self.priority,
            args: self.args,
            status: self.status.into(),
            queued_at: self.queued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            main_worker_id: self.main_worker_id,
            local_workunit_id: self.local_workunit_id,
        }
    }
}

struct WorkUnitRow {
    id: i64,
    task_instance_id: i64,
    subtask_key: Option<String>,
    workunit_key: Option<String>,
    args: String,
    worker_id: Option<String>,
    status: i32,
    on_main_worker: bool,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl WorkUnitRow {
    fn into_work_unit(self) -> WorkUnit {
        WorkUnit {
            id: self.id,
            task_instance_id: self.task_instance_id,
            subtask_key: self.subtask_key,
            workunit_key: self.workunit_key,
            args: self.args,
            worker_id: self.worker_id,
            status: self.status.into(),
            on_main_worker: self.on_main_worker,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

const TASK_INSTANCE_COLUMNS: &str = "id, task_key, priority, args, status, queued_at, started_at, completed_at, main_worker_id, local_workunit_id";
const WORK_UNIT_COLUMNS: &str = "id, task_instance_id, subtask_key, workunit_key, args, worker_id, status, on_main_worker, started_at, completed_at";

fn read_task_instance_row(row: &rusqlite::Row) -> rusqlite::Result<TaskInstanceRow> {
    Ok(TaskInstanceRow {
        id: row.get(0)?,
        task_key: row.get(1)?,
        priority: row.get(2)?,
        args: row.get(3)?,
        status: row.get(4)?,
        queued_at: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        main_worker_id: row.get(8)?,
        local_workunit_id: row.get(9)?,
    })
}

fn read_work_unit_row(row: &rusqlite::Row) -> rusqlite::Result<WorkUnitRow> {
    Ok(WorkUnitRow {
        id: row.get(0)?,
        task_instance_id: row.get(1)?,
        subtask_key: row.get(2)?,
        workunit_key: row.get(3)?,
        args: row.get(4)?,
        worker_id: row.get(5)?,
        status: row.get(6)?,
        on_main_worker: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  TaskStore
// ═══════════════════════════════════════════════════════════════════════

/// CRUD operations on `TaskInstance` and `WorkUnit` records.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new task instance in STOPPED status and return it.
    #[instrument(skip(self, args))]
    pub async fn create_task_instance(
        &self,
        task_key: &str,
        priority: i32,
        args: &str,
    ) -> StoreResult<TaskInstance> {
        let task_key = task_key.to_string();
        let args = args.to_string();
        let now = Utc::now().timestamp();

        let id = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO task_instances (task_key, priority, args, status, queued_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![task_key, priority, args, TaskStatus::Stopped.as_i32(), now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(task_id = id, "task instance queued");
        self.get_task_instance(id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "task_instance",
                id: id.to_string(),
            })
    }

    #[instrument(skip(self))]
    pub async fn get_task_instance(&self, id: i64) -> StoreResult<Option<TaskInstance>> {
        self.db
            .execute(move |conn| {
                let sql = format!("SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE id = ?1");
                let result = conn.query_row(&sql, rusqlite::params![id], read_task_instance_row);
                match result {
                    Ok(row) => Ok(Some(row.into_task_instance())),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// List instances currently RUNNING or STOPPED, used to rehydrate the
    /// priority queue on startup.
    #[instrument(skip(self))]
    pub async fn list_active(&self) -> StoreResult<Vec<TaskInstance>> {
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE status IN (?1, ?2) ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![TaskStatus::Running.as_i32(), TaskStatus::Stopped.as_i32()],
                        read_task_instance_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().map(|r| r.into_task_instance()).collect())
            })
            .await
    }

    /// Paginated history for a given task key, most recent first.
    #[instrument(skip(self))]
    pub async fn history(&self, task_key: &str, page: i64, page_size: i64) -> StoreResult<Vec<TaskInstance>> {
        let task_key = task_key.to_string();
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE task_key = ?1 \
                     ORDER BY id DESC LIMIT ?2 OFFSET ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let offset = page.max(0) * page_size;
                let rows = stmt
                    .query_map(rusqlite::params![task_key, page_size, offset], read_task_instance_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().map(|r| r.into_task_instance()).collect())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_status(&self, id: i64, status: TaskStatus) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                if status.is_terminal() {
                    conn.execute(
                        "UPDATE task_instances SET status = ?1, completed_at = ?2 WHERE id = ?3",
                        rusqlite::params![status.as_i32(), now, id],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE task_instances SET status = ?1 WHERE id = ?2",
                        rusqlite::params![status.as_i32(), id],
                    )?;
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_main_worker(&self, id: i64, worker_id: &str) -> StoreResult<()> {
        let worker_id = worker_id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE task_instances SET main_worker_id = ?1, started_at = COALESCE(started_at, ?2), status = ?3 \
                     WHERE id = ?4",
                    rusqlite::params![worker_id, now, TaskStatus::Running.as_i32(), id],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_local_workunit(&self, id: i64, workunit_id: Option<i64>) -> StoreResult<()> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE task_instances SET local_workunit_id = ?1 WHERE id = ?2",
                    rusqlite::params![workunit_id, id],
                )?;
                Ok(())
            })
            .await
    }

    // ── work units ───────────────────────────────────────────────────

    #[instrument(skip(self, args))]
    pub async fn create_work_unit(
        &self,
        task_instance_id: i64,
        subtask_key: Option<&str>,
        workunit_key: Option<&str>,
        args: &str,
    ) -> StoreResult<WorkUnit> {
        let subtask_key = subtask_key.map(str::to_string);
        let workunit_key = workunit_key.map(str::to_string);
        let args = args.to_string();

        let id = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO work_units (task_instance_id, subtask_key, workunit_key, args, status, on_main_worker) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                    rusqlite::params![
                        task_instance_id,
                        subtask_key,
                        workunit_key,
                        args,
                        TaskStatus::Stopped.as_i32()
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        self.get_work_unit(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "work_unit",
            id: id.to_string(),
        })
    }

    #[instrument(skip(self))]
    pub async fn get_work_unit(&self, id: i64) -> StoreResult<Option<WorkUnit>> {
        self.db
            .execute(move |conn| {
                let sql = format!("SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE id = ?1");
                let result = conn.query_row(&sql, rusqlite::params![id], read_work_unit_row);
                match result {
                    Ok(row) => Ok(Some(row.into_work_unit())),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn assign_work_unit(&self, id: i64, worker_id: &str, on_main_worker: bool) -> StoreResult<()> {
        let worker_id = worker_id.to_string();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE work_units SET worker_id = ?1, on_main_worker = ?2, status = ?3, started_at = ?4 \
                     WHERE id = ?5",
                    rusqlite::params![worker_id, on_main_worker, TaskStatus::Running.as_i32(), now, id],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_work_unit_status(&self, id: i64, status: TaskStatus) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                if status.is_terminal() {
                    conn.execute(
                        "UPDATE work_units SET status = ?1, completed_at = ?2 WHERE id = ?3",
                        rusqlite::params![status.as_i32(), now, id],
                    )?;
                } else {
                    conn.execute(
                        "UPDATE work_units SET status = ?1 WHERE id = ?2",
                        rusqlite::params![status.as_i32(), id],
                    )?;
                }
                Ok(())
            })
            .await
    }

    /// All work units belonging to a task instance, ordered by id. Backs
    /// `task_history_detail` and `task_log`.
    #[instrument(skip(self))]
    pub async fn list_work_units(&self, task_instance_id: i64) -> StoreResult<Vec<WorkUnit>> {
        self.db
            .execute(move |conn| {
                let sql = format!(
                    "SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE task_instance_id = ?1 ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![task_instance_id], read_work_unit_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().map(|r| r.into_work_unit()).collect())
            })
            .await
    }

    /// Distinct task keys ever queued, newest-queued first. Stands in for
    /// `task_manager.py`'s `list_tasks` package catalog: package discovery
    /// on disk is out of scope, so this reports keys the scheduler has
    /// actually seen rather than what's installed.
    #[instrument(skip(self))]
    pub async fn list_task_keys(&self) -> StoreResult<Vec<String>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_key FROM task_instances GROUP BY task_key ORDER BY MAX(id) DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  NodeStore — node CRUD (grounded on `node_manager.py`)
// ═══════════════════════════════════════════════════════════════════════

/// A known Node, as enumerable through the Controller Interface's node CRUD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub port: i64,
    pub enrolled: bool,
    pub created_at: i64,
}

/// CRUD operations on known Nodes.
#[derive(Clone)]
pub struct NodeStore {
    db: Database,
}

impl NodeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn register(&self, id: &str, host: &str, port: i64) -> StoreResult<Node> {
        let id = id.to_string();
        let host = host.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO nodes (id, host, port, enrolled, created_at) VALUES (?1, ?2, ?3, 1, ?4) \
                     ON CONFLICT(id) DO UPDATE SET host = excluded.host, port = excluded.port, enrolled = 1",
                    rusqlite::params![id, host, port, now],
                )?;
                Ok(())
            })
            .await?;

        debug!(node_id = %id, "node registered");
        Ok(Node {
            id,
            host,
            port,
            enrolled: true,
            created_at: now,
        })
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> StoreResult<Vec<Node>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, host, port, enrolled, created_at FROM nodes ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Node {
                            id: row.get(0)?,
                            host: row.get(1)?,
                            port: row.get(2)?,
                            enrolled: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute("DELETE FROM nodes WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
