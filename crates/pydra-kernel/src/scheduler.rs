//! Scheduler Core.
//!
//! Matches pending [`WorkerRequest`]s to idle, main, or held workers and
//! drives the RPC calls (`run_task`, `stop_task`, `release_worker`, ...)
//! that carry work onto them. Task metadata is authoritative in the
//! [`pydra_store::TaskStore`]; this module holds the *live* per-task state
//! (FIFO request queue, running/waiting worker sets) that only matters while
//! a `TaskInstance` is active.
//!
//! # Locking
//!
//! `advance_lock` is the `queue_lock` from the concurrency model: it
//! serializes scheduling passes so at most one pass runs at a time. Each
//! pass locks at most one task's state plus the [`WorkerRegistry`]'s
//! internal pool lock (`worker_lock`), in that order, and releases both
//! before issuing any RPC call — `run_task` and friends never run with a
//! lock held.
//!
//! # Scheduling algorithm
//!
//! One pass: scan tasks in the priority queue's score order for the first
//! one with a non-empty FIFO request queue, select a worker for its head
//! request by the precedence in [`select_worker`], dispatch exactly one
//! `run_task`, and return. Callers re-invoke [`Scheduler::advance`] after
//! any state-changing event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;

use pydra_store::{TaskStatus as StoreTaskStatus, TaskStore};

use crate::error::{KernelError, Result};
use crate::ipc::{Event, IpcBus};
use crate::priority_queue::{compute_score, PriorityQueue};
use crate::registry::WorkerRegistry;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Unique id of a `TaskInstance`, assigned by the Task Store.
pub type TaskId = i64;

/// Lifecycle status of a `TaskInstance` or `WorkUnit`.
pub type TaskStatus = StoreTaskStatus;

/// Queued demand for one worker, belonging to exactly one `TaskInstance`.
///
/// The root request (created by `queue_task`) has `subtask_key = None`; it
/// represents the TaskInstance's own root computation.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub subtask_key: Option<String>,
    pub workunit_key: Option<String>,
    pub args: Value,
    /// `Some` for subtask requests — the persisted `WorkUnit` row created
    /// when `request_worker` was called. `None` for the root request.
    pub workunit_id: Option<i64>,
}

impl WorkerRequest {
    fn is_subtask(&self) -> bool {
        self.subtask_key.is_some()
    }
}

/// How `worker_status` replied during the reconnect handshake (§4.5).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "state", rename_all = "UPPERCASE")]
pub enum WorkerStatusReport {
    Idle,
    Working {
        task_instance_id: i64,
        workunit_key: Option<String>,
    },
    Finished {
        results: Value,
    },
}

/// One reported result or failure for a work unit (or the root task, when
/// `workunit_key` is `None`).
#[derive(Debug, Clone)]
pub struct ResultItem {
    pub workunit_key: Option<String>,
    pub payload: Value,
    pub failed: bool,
}

/// Live, in-memory state for one active `TaskInstance`. Authoritative status
/// lives in the Task Store; this struct exists only while the task is in
/// the active set.
struct TaskState {
    task_key: String,
    priority: i32,
    queued_at: i64,
    status: TaskStatus,
    main_worker_id: Option<String>,
    /// Work unit id currently executing on the main worker, if any.
    local_workunit: Option<i64>,
    /// Non-main workers currently running a subtask for this task, and the
    /// work unit id each is bound to.
    active_workunits: HashMap<String, i64>,
    /// Held workers, most-recently-released last (LIFO reuse).
    waiting_workers: Vec<String>,
    worker_requests: VecDeque<WorkerRequest>,
    /// Set by `cancel_task` on a running task; cleared once finalized.
    cancel_requested: bool,
}

/// Selected worker and the precedence rule that matched (§4.2 step 3).
enum Selection {
    /// (a) reused a held worker from `waiting_workers`.
    ReuseWaiting(String),
    /// (b) assigned the task's own main worker a concurrent work unit.
    MainLocal,
    /// (c) pulled an idle worker from the global pool.
    Idle(String),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The Scheduler Core. Cheaply cloneable and `Send + Sync`.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: TaskStore,
    registry: WorkerRegistry,
    queue: PriorityQueue,
    ipc: IpcBus,
    active: DashMap<TaskId, Arc<Mutex<TaskState>>>,
    /// worker_id -> task id, for both main and active-subtask workers; used
    /// to route `send_results`/`worker_stopped`/`remove_worker` in O(1).
    worker_task: DashMap<String, TaskId>,
    /// Serializes scheduling passes — the `queue_lock`.
    advance_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(store: TaskStore, registry: WorkerRegistry, ipc: IpcBus) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                registry,
                queue: PriorityQueue::new(),
                ipc,
                active: DashMap::new(),
                worker_task: DashMap::new(),
                advance_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Rehydrate the priority queue from the Task Store (§4.1): all records
    /// in status RUNNING or STOPPED are re-inserted with freshly computed
    /// scores. No attempt is made to reattach in-flight workers — their
    /// status is recovered through the reconnect handshake.
    pub async fn rehydrate(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        for task in self.inner.store.list_active().await? {
            let state = TaskState {
                task_key: task.task_key.clone(),
                priority: task.priority,
                queued_at: task.queued_at,
                status: task.status,
                main_worker_id: task.main_worker_id.clone(),
                local_workunit: task.local_workunit_id,
                active_workunits: HashMap::new(),
                waiting_workers: Vec::new(),
                worker_requests: VecDeque::new(),
                cancel_requested: false,
            };
            self.inner
                .active
                .insert(task.id, Arc::new(Mutex::new(state)));
            self.inner
                .queue
                .enqueue(task.id, compute_score(task.priority, task.queued_at, now));
            tracing::info!(task_id = task.id, status = ?task.status, "task instance rehydrated");
        }
        Ok(())
    }

    // -- Public operations ----------------------------------------------

    /// `queue_task(key, args, priority=5)`.
    pub async fn queue_task(&self, task_key: &str, args: Value, priority: i32) -> Result<TaskId> {
        if !(1..=10).contains(&priority) {
            return Err(KernelError::Validation {
                task_key: task_key.to_string(),
                errors: vec![format!("priority {priority} out of range 1..10")],
            });
        }

        let args_json = serde_json::to_string(&args).map_err(|e| KernelError::Validation {
            task_key: task_key.to_string(),
            errors: vec![format!("args must be JSON-serializable: {e}")],
        })?;

        let task = self
            .inner
            .store
            .create_task_instance(task_key, priority, &args_json)
            .await?;

        let state = TaskState {
            task_key: task_key.to_string(),
            priority,
            queued_at: task.queued_at,
            status: TaskStatus::Stopped,
            main_worker_id: None,
            local_workunit: None,
            active_workunits: HashMap::new(),
            waiting_workers: Vec::new(),
            worker_requests: VecDeque::from([WorkerRequest {
                subtask_key: None,
                workunit_key: None,
                args,
                workunit_id: None,
            }]),
            cancel_requested: false,
        };
        self.inner.active.insert(task.id, Arc::new(Mutex::new(state)));
        self.inner.queue.enqueue(
            task.id,
            compute_score(priority, task.queued_at, task.queued_at),
        );

        tracing::info!(task_id = task.id, task_key = %task_key, "task queued");
        self.spawn_advance();
        Ok(task.id)
    }

    /// `cancel_task(id)`. Idempotent.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        let Some(task_arc) = self.inner.active.get(&task_id).map(|e| Arc::clone(&e)) else {
            return Ok(()); // silently no-ops if id unknown
        };

        let (workers_to_stop, already_running) = {
            let mut state = task_arc.lock().unwrap();
            if state.cancel_requested || state.status.is_terminal() {
                return Ok(()); // idempotent
            }

            if state.main_worker_id.is_none() {
                // Still queued: remove and mark CANCELLED immediately.
                state.status = TaskStatus::Cancelled;
                self.inner.queue.remove(task_id);
                self.inner.active.remove(&task_id);
                drop(state);
                self.inner.store.set_status(task_id, TaskStatus::Cancelled).await?;
                tracing::info!(task_id, "queued task cancelled");
                return Ok(());
            }

            state.cancel_requested = true;
            self.inner.queue.remove(task_id);

            let mut workers = Vec::new();
            workers.extend(state.main_worker_id.clone());
            workers.extend(state.active_workunits.keys().cloned());
            workers.extend(state.waiting_workers.iter().cloned());
            (workers, true)
        };

        let _ = already_running;
        for worker_id in workers_to_stop {
            if let Ok(handle) = self.inner.registry.handle(&worker_id) {
                if let Err(reason) = handle.stop_task(task_id).await {
                    tracing::warn!(task_id, %worker_id, %reason, "stop_task failed");
                }
            }
        }
        tracing::info!(task_id, "cancellation requested; awaiting worker_stopped");
        Ok(())
    }

    /// `request_worker(requester_id, subtask_key, args, workunit_key)`.
    pub async fn request_worker(
        &self,
        requester_id: &str,
        subtask_key: &str,
        args: Value,
        workunit_key: &str,
    ) -> Result<()> {
        let Some(task_id) = self.inner.registry.main_task_of(requester_id) else {
            return Err(KernelError::TransientSchedulerState {
                reason: format!("request_worker from unknown main worker {requester_id}"),
            });
        };
        let Some(task_arc) = self.inner.active.get(&task_id).map(|e| Arc::clone(&e)) else {
            return Err(KernelError::TaskNotFound { task_id });
        };

        let args_json = serde_json::to_string(&args).unwrap_or_default();
        let work_unit = self
            .inner
            .store
            .create_work_unit(task_id, Some(subtask_key), Some(workunit_key), &args_json)
            .await?;

        {
            let mut state = task_arc.lock().unwrap();
            state.worker_requests.push_back(WorkerRequest {
                subtask_key: Some(subtask_key.to_string()),
                workunit_key: Some(workunit_key.to_string()),
                args,
                workunit_id: Some(work_unit.id),
            });
        }
        self.inner.queue.enqueue(task_id, self.current_score(task_id));
        self.spawn_advance();
        Ok(())
    }

    /// `request_worker_release(requester_id)`.
    pub async fn request_worker_release(&self, requester_id: &str) -> Result<()> {
        let Some(task_id) = self.inner.registry.main_task_of(requester_id) else {
            return Ok(());
        };
        let Some(task_arc) = self.inner.active.get(&task_id).map(|e| Arc::clone(&e)) else {
            return Ok(());
        };

        let released = {
            let mut state = task_arc.lock().unwrap();
            state.waiting_workers.pop()
        };

        if let Some(worker_id) = released {
            if let Ok(handle) = self.inner.registry.handle(&worker_id) {
                let _ = handle.release_worker().await;
            }
            self.inner.registry.push_idle(&worker_id);
            tracing::debug!(task_id, %worker_id, "waiting worker released");
        }
        Ok(())
    }

    /// `send_results(worker_id, results)` — see §4.4 Result Routing.
    pub async fn send_results(&self, worker_id: &str, results: Vec<ResultItem>) -> Result<()> {
        let Some(task_id) = self.inner.worker_task.get(worker_id).map(|e| *e) else {
            return Err(KernelError::TransientSchedulerState {
                reason: format!("send_results from unrecognized worker {worker_id}"),
            });
        };
        let Some(task_arc) = self.inner.active.get(&task_id).map(|e| Arc::clone(&e)) else {
            return Err(KernelError::TaskNotFound { task_id });
        };

        for item in results {
            match item.workunit_key {
                Some(_) => self.route_subtask_result(task_id, &task_arc, worker_id, &item).await?,
                None => self.route_root_result(task_id, &task_arc, worker_id, &item).await?,
            }
        }
        self.spawn_advance();
        Ok(())
    }

    async fn route_subtask_result(
        &self,
        task_id: TaskId,
        task_arc: &Arc<Mutex<TaskState>>,
        worker_id: &str,
        item: &ResultItem,
    ) -> Result<()> {
        let final_status = if item.failed { TaskStatus::Failed } else { TaskStatus::Complete };

        let (workunit_id, on_main, main_worker_id, subtask_key) = {
            let mut state = task_arc.lock().unwrap();
            let on_main = state.main_worker_id.as_deref() == Some(worker_id) && state.local_workunit.is_some();
            let workunit_id = if on_main {
                state.local_workunit.take()
            } else {
                let id = state.active_workunits.remove(worker_id);
                state.running_workers_retain(worker_id);
                if id.is_some() {
                    state.waiting_workers.push(worker_id.to_string());
                }
                id
            };
            (workunit_id, on_main, state.main_worker_id.clone(), None::<String>)
        };
        let _ = subtask_key;

        if !on_main {
            self.inner.registry.clear_active(worker_id);
        }

        if let Some(wu_id) = workunit_id {
            self.inner.store.set_work_unit_status(wu_id, final_status).await?;
        }

        if let Some(main_id) = main_worker_id {
            if let Ok(handle) = self.inner.registry.handle(&main_id) {
                let _ = handle
                    .receive_results(worker_id, &item.payload, None, item.workunit_key.as_deref())
                    .await;
            }
        }

        let _ = task_id;
        Ok(())
    }

    async fn route_root_result(
        &self,
        task_id: TaskId,
        task_arc: &Arc<Mutex<TaskState>>,
        worker_id: &str,
        item: &ResultItem,
    ) -> Result<()> {
        let final_status = if item.failed { TaskStatus::Failed } else { TaskStatus::Complete };
        let (waiting, task_key): (Vec<String>, String) = {
            let mut state = task_arc.lock().unwrap();
            state.status = final_status;
            (std::mem::take(&mut state.waiting_workers), state.task_key.clone())
        };

        self.inner.store.set_status(task_id, final_status).await?;

        for held in &waiting {
            if let Ok(handle) = self.inner.registry.handle(held) {
                let _ = handle.release_worker().await;
            }
            self.inner.registry.push_idle(held);
        }
        self.inner.registry.push_idle(worker_id);
        self.inner.worker_task.remove(worker_id);
        self.inner.queue.remove(task_id);
        self.inner.active.remove(&task_id);

        let _ = self.inner.ipc.publish(Event::TaskStatusChanged {
            task_id,
            task_key,
            status: final_status.as_i32(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// `worker_stopped(worker_id)` — after a `stop_task` ack.
    pub async fn worker_stopped(&self, worker_id: &str) -> Result<()> {
        let Some(task_id) = self.inner.worker_task.get(worker_id).map(|e| *e) else {
            self.inner.registry.push_idle(worker_id);
            return Ok(());
        };

        let is_main = self.inner.registry.main_task_of(worker_id) == Some(task_id);
        if is_main {
            if let Some(task_arc) = self.inner.active.get(&task_id).map(|e| Arc::clone(&e)) {
                let (waiting, running, cancel_requested) = {
                    let state = task_arc.lock().unwrap();
                    (
                        state.waiting_workers.clone(),
                        state.active_workunits.keys().cloned().collect::<Vec<_>>(),
                        state.cancel_requested,
                    )
                };
                if cancel_requested {
                    self.inner.store.set_status(task_id, TaskStatus::Cancelled).await?;
                    for w in waiting.iter().chain(running.iter()) {
                        self.inner.registry.push_idle(w);
                        self.inner.worker_task.remove(w);
                    }
                    self.inner.active.remove(&task_id);
                    self.inner.queue.remove(task_id);
                    tracing::info!(task_id, "task cancellation finalized");
                }
            }
        }

        self.inner.worker_task.remove(worker_id);
        self.inner.registry.push_idle(worker_id);
        Ok(())
    }

    /// `worker_connected(worker)` → performs the reconnect handshake (§4.5).
    pub async fn worker_connected(
        &self,
        worker_id: &str,
        handle: Arc<dyn crate::registry::WorkerRpc>,
    ) -> Result<()> {
        let reply = handle
            .worker_status()
            .await
            .map_err(|reason| KernelError::WorkerFailure {
                worker_id: worker_id.to_string(),
                reason,
            })?;
        let report: WorkerStatusReport = serde_json::from_value(reply).unwrap_or(WorkerStatusReport::Idle);

        match report {
            WorkerStatusReport::Idle => {
                self.inner.registry.connect(worker_id, handle);
            }
            WorkerStatusReport::Working { task_instance_id, .. } => {
                self.inner.registry.reattach_main(worker_id, handle, task_instance_id);
                self.inner.worker_task.insert(worker_id.to_string(), task_instance_id);
                tracing::info!(worker_id, task_instance_id, "worker reattached as main");
            }
            WorkerStatusReport::Finished { results } => {
                self.inner.registry.connect(worker_id, handle);
                tracing::info!(worker_id, ?results, "worker reconnected already finished");
            }
        }
        self.spawn_advance();
        Ok(())
    }

    /// `remove_worker(id)` — disconnect.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let class = self.inner.registry.disconnect(worker_id);
        let task_id = self.inner.worker_task.remove(worker_id).map(|(_, id)| id);

        match (class, task_id) {
            (Some(crate::registry::WorkerClass::Active), Some(task_id)) => {
                if let Some(task_arc) = self.inner.active.get(&task_id).map(|e| Arc::clone(&e)) {
                    let mut state = task_arc.lock().unwrap();
                    if let Some(wu_id) = state.active_workunits.remove(worker_id) {
                        state.running_workers_retain(worker_id);
                        drop(state);
                        if let Ok(Some(wu)) = self.inner.store.get_work_unit(wu_id).await {
                            let args: Value = serde_json::from_str(&wu.args).unwrap_or(Value::Null);
                            let mut state = task_arc.lock().unwrap();
                            state.worker_requests.push_front(WorkerRequest {
                                subtask_key: wu.subtask_key,
                                workunit_key: wu.workunit_key,
                                args,
                                workunit_id: Some(wu.id),
                            });
                        }
                        self.inner.queue.enqueue(task_id, self.current_score(task_id));
                        self.spawn_advance();
                    }
                }
            }
            (Some(crate::registry::WorkerClass::Main), Some(task_id)) => {
                self.inner.store.set_status(task_id, TaskStatus::Failed).await?;
                self.inner.active.remove(&task_id);
                self.inner.queue.remove(task_id);
                tracing::warn!(task_id, %worker_id, "main worker disconnected, task marked FAILED");
            }
            _ => {
                // Possibly a held (waiting) worker — scan active tasks.
                for entry in self.inner.active.iter() {
                    let mut state = entry.value().lock().unwrap();
                    if let Some(pos) = state.waiting_workers.iter().position(|w| w == worker_id) {
                        state.waiting_workers.remove(pos);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // -- Scheduling pass --------------------------------------------------

    fn spawn_advance(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.advance().await;
        });
    }

    /// One scheduling pass, serialized under `advance_lock` (the
    /// `queue_lock`). Dispatches at most one `run_task` RPC.
    pub async fn advance(&self) {
        let _guard = self.inner.advance_lock.lock().await;

        for task_id in self.inner.queue.scan_order() {
            let Some(task_arc) = self.inner.active.get(&task_id).map(|e| Arc::clone(&e)) else {
                self.inner.queue.remove(task_id);
                continue;
            };

            let request = {
                let state = task_arc.lock().unwrap();
                state.worker_requests.front().cloned()
            };
            let Some(request) = request else { continue };

            let selection = self.select_worker(&task_arc, &request);
            let Some(selection) = selection else {
                // (d) no worker available anywhere — leave queued and stop.
                return;
            };

            {
                let mut state = task_arc.lock().unwrap();
                state.worker_requests.pop_front();
            }

            self.dispatch(task_id, task_arc, request, selection).await;
            return; // only one request consumed per pass
        }
    }

    /// Worker-selection precedence (§4.2 step 3), executed under the
    /// registry's pool lock but released before returning.
    fn select_worker(&self, task_arc: &Arc<Mutex<TaskState>>, request: &WorkerRequest) -> Option<Selection> {
        let mut state = task_arc.lock().unwrap();

        if request.is_subtask() {
            if let Some(w) = state.waiting_workers.pop() {
                return Some(Selection::ReuseWaiting(w));
            }
            if state.local_workunit.is_none() && state.main_worker_id.is_some() {
                return Some(Selection::MainLocal);
            }
        }

        if let Some(w) = self.inner.registry.pop_idle() {
            return Some(Selection::Idle(w));
        }

        let _ = &mut state;
        None
    }

    async fn dispatch(
        &self,
        task_id: TaskId,
        task_arc: Arc<Mutex<TaskState>>,
        request: WorkerRequest,
        selection: Selection,
    ) {
        let is_subtask = request.is_subtask();
        let worker_id = match &selection {
            Selection::ReuseWaiting(w) | Selection::Idle(w) => w.clone(),
            Selection::MainLocal => {
                let state = task_arc.lock().unwrap();
                state.main_worker_id.clone().expect("MainLocal implies a main worker")
            }
        };

        {
            let mut state = task_arc.lock().unwrap();
            match &selection {
                Selection::ReuseWaiting(w) => {
                    if let Some(wu_id) = request.workunit_id {
                        state.active_workunits.insert(w.clone(), wu_id);
                    }
                }
                Selection::MainLocal => {
                    state.local_workunit = request.workunit_id;
                }
                Selection::Idle(w) => {
                    if is_subtask {
                        if let Some(wu_id) = request.workunit_id {
                            state.active_workunits.insert(w.clone(), wu_id);
                        }
                    }
                }
            }
        }
        if is_subtask && !matches!(selection, Selection::MainLocal) {
            self.inner.worker_task.insert(worker_id.clone(), task_id);
            if let Some(wu_id) = request.workunit_id {
                self.inner.registry.mark_active(&worker_id, wu_id);
            }
        }

        let Ok(handle) = self.inner.registry.handle(&worker_id) else {
            tracing::warn!(task_id, %worker_id, "selected worker vanished before dispatch");
            return;
        };

        let main_worker_hint = {
            let state = task_arc.lock().unwrap();
            state.main_worker_id.clone().unwrap_or_else(|| worker_id.clone())
        };

        let result = handle
            .run_task(
                &{ task_arc.lock().unwrap().task_key.clone() },
                "1",
                &request.args,
                request.subtask_key.as_deref(),
                request.workunit_key.as_deref(),
                &main_worker_hint,
                task_id,
            )
            .await;

        match result {
            Ok(()) => self.on_dispatch_success(task_id, &task_arc, &worker_id, &request, &selection).await,
            Err(reason) => self.on_dispatch_failure(task_id, &task_arc, &worker_id, request, selection, reason).await,
        }
    }

    async fn on_dispatch_success(
        &self,
        task_id: TaskId,
        task_arc: &Arc<Mutex<TaskState>>,
        worker_id: &str,
        request: &WorkerRequest,
        selection: &Selection,
    ) {
        if !request.is_subtask() {
            {
                let mut state = task_arc.lock().unwrap();
                state.main_worker_id = Some(worker_id.to_string());
                state.status = TaskStatus::Running;
            }
            self.inner.registry.mark_main(worker_id, task_id);
            self.inner.worker_task.insert(worker_id.to_string(), task_id);
            if let Err(err) = self.inner.store.set_main_worker(task_id, worker_id).await {
                tracing::error!(task_id, %err, "failed to persist main worker");
            }
        } else if let Some(wu_id) = request.workunit_id {
            let on_main = matches!(selection, Selection::MainLocal);
            if let Err(err) = self.inner.store.assign_work_unit(wu_id, worker_id, on_main).await {
                tracing::error!(task_id, %err, "failed to persist work unit assignment");
            }
        }
        self.spawn_advance();
    }

    async fn on_dispatch_failure(
        &self,
        task_id: TaskId,
        task_arc: &Arc<Mutex<TaskState>>,
        worker_id: &str,
        request: WorkerRequest,
        selection: Selection,
        reason: String,
    ) {
        tracing::warn!(task_id, %worker_id, %reason, "run_task failed");

        if !request.is_subtask() {
            self.inner.registry.push_idle(worker_id);
            self.inner.active.remove(&task_id);
            self.inner.queue.remove(task_id);
            let _ = self.inner.store.set_status(task_id, TaskStatus::Failed).await;
            return;
        }

        {
            let mut state = task_arc.lock().unwrap();
            match &selection {
                Selection::MainLocal => state.local_workunit = None,
                Selection::ReuseWaiting(_) | Selection::Idle(_) => {
                    state.active_workunits.remove(worker_id);
                }
            }
            state.worker_requests.push_front(request.clone());
        }
        if !matches!(selection, Selection::MainLocal) {
            self.inner.registry.push_idle(worker_id);
            self.inner.worker_task.remove(worker_id);
        }
        if let Some(wu_id) = request.workunit_id {
            let _ = self.inner.store.set_work_unit_status(wu_id, TaskStatus::Failed).await;
        }
        self.spawn_advance();
    }

    fn current_score(&self, task_id: TaskId) -> i64 {
        let task_arc = self.inner.active.get(&task_id);
        match task_arc {
            Some(entry) => {
                let state = entry.lock().unwrap();
                compute_score(state.priority, state.queued_at, Utc::now().timestamp())
            }
            None => 0,
        }
    }
}

impl TaskState {
    fn running_workers_retain(&mut self, _worker_id: &str) {
        // active_workunits already removed by caller; nothing else tracks
        // non-main running membership, so this is a no-op placeholder kept
        // for readability at call sites.
    }
}

impl Clone for WorkerRequest {
    fn clone(&self) -> Self {
        Self {
            subtask_key: self.subtask_key.clone(),
            workunit_key: self.workunit_key.clone(),
            args: self.args.clone(),
            workunit_id: self.workunit_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerRpc;
    use async_trait::async_trait;
    use pydra_store::Database;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubWorker {
        fail_run_task: AtomicBool,
    }

    impl StubWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_run_task: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl WorkerRpc for StubWorker {
        async fn run_task(
            &self,
            _task_key: &str,
            _v: &str,
            _args: &Value,
            _subtask_key: Option<&str>,
            _workunit_key: Option<&str>,
            _main_worker_id: &str,
            _task_instance_id: i64,
        ) -> std::result::Result<(), String> {
            if self.fail_run_task.load(Ordering::SeqCst) {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
        async fn stop_task(&self, _task_instance_id: i64) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn task_status(&self, _task_instance_id: i64) -> std::result::Result<Value, String> {
            Ok(Value::Null)
        }
        async fn worker_status(&self) -> std::result::Result<Value, String> {
            Ok(serde_json::json!({ "state": "IDLE" }))
        }
        async fn receive_results(
            &self,
            _worker_id: &str,
            _results: &Value,
            _subtask_key: Option<&str>,
            _workunit_key: Option<&str>,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn release_worker(&self) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn kill_worker(&self, _hard: bool) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    async fn scheduler() -> Scheduler {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = TaskStore::new(db);
        let registry = WorkerRegistry::new();
        let ipc = IpcBus::new(16);
        Scheduler::new(store, registry, ipc)
    }

    #[tokio::test]
    async fn queue_and_run_root() {
        let sched = scheduler().await;
        sched.inner.registry.connect("w0", StubWorker::new());

        let task_id = sched
            .queue_task("demo.Echo", serde_json::json!({"msg": "hi"}), 5)
            .await
            .unwrap();

        sched.advance().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(sched.inner.registry.main_task_of("w0"), Some(task_id));

        sched
            .send_results("w0", vec![ResultItem { workunit_key: None, payload: serde_json::json!("hi"), failed: false }])
            .await
            .unwrap();

        let stored = sched.inner.store.get_task_instance(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Complete);
        assert_eq!(sched.inner.registry.classify("w0"), Some(crate::registry::WorkerClass::Idle));
    }

    #[tokio::test]
    async fn parallel_subtask_reuses_waiting_worker() {
        let sched = scheduler().await;
        sched.inner.registry.connect("w0", StubWorker::new());
        sched.inner.registry.connect("w1", StubWorker::new());

        let task_id = sched.queue_task("parent.Task", serde_json::json!({}), 5).await.unwrap();
        sched.advance().await; // w0 becomes main
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(sched.inner.registry.main_task_of("w0"), Some(task_id));

        sched.request_worker("w0", "sub.Square", serde_json::json!({}), "k1").await.unwrap();
        sched.advance().await; // dispatched to main (MainLocal) since no waiting workers yet
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        sched.request_worker("w0", "sub.Square", serde_json::json!({}), "k2").await.unwrap();
        sched.advance().await; // dispatched to idle w1
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(sched.inner.worker_task.get("w1").map(|e| *e), Some(task_id));

        sched
            .send_results("w1", vec![ResultItem { workunit_key: Some("k2".into()), payload: serde_json::json!("2"), failed: false }])
            .await
            .unwrap();

        sched.request_worker("w0", "sub.Square", serde_json::json!({}), "k3").await.unwrap();
        sched.advance().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // w1 should have been reused (popped from waiting) rather than pulling another idle worker.
        assert_eq!(sched.inner.worker_task.get("w1").map(|e| *e), Some(task_id));
    }

    #[tokio::test]
    async fn cancel_queued_task_is_immediate() {
        let sched = scheduler().await;
        let task_id = sched.queue_task("demo.Echo", serde_json::json!({}), 5).await.unwrap();
        sched.cancel_task(task_id).await.unwrap();

        let stored = sched.inner.store.get_task_instance(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(!sched.inner.queue.contains(task_id));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let sched = scheduler().await;
        sched.inner.registry.connect("w0", StubWorker::new());
        let task_id = sched.queue_task("demo.Echo", serde_json::json!({}), 5).await.unwrap();
        sched.advance().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        sched.cancel_task(task_id).await.unwrap();
        sched.cancel_task(task_id).await.unwrap();
    }

    #[tokio::test]
    async fn worker_disconnect_requeues_subtask() {
        let sched = scheduler().await;
        sched.inner.registry.connect("w0", StubWorker::new());
        sched.inner.registry.connect("w1", StubWorker::new());

        let task_id = sched.queue_task("parent.Task", serde_json::json!({}), 5).await.unwrap();
        sched.advance().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        sched.request_worker("w0", "sub.Square", serde_json::json!({}), "k1").await.unwrap();
        sched.advance().await; // local to main
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        sched.request_worker("w0", "sub.Square", serde_json::json!({}), "k2").await.unwrap();
        sched.advance().await; // to idle w1
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        sched.remove_worker("w1").await.unwrap();

        let task_arc = sched.inner.active.get(&task_id).unwrap();
        let state = task_arc.lock().unwrap();
        assert!(state.worker_requests.iter().any(|r| r.workunit_key.as_deref() == Some("k2")));
    }
}
