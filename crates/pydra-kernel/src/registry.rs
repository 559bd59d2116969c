//! Worker Registry.
//!
//! Tracks every connected worker's RPC handle and liveness, plus the three
//! pools the Scheduler Core's worker-selection precedence reads and writes:
//! `idle` (a LIFO stack, for warm process reuse), `active` (worker id →
//! work unit id, for non-main subtask workers), and `main` (worker id →
//! task instance id).
//!
//! Per the concurrency model, a single lock (`pools`) guards `idle`,
//! `active`, and `main` together so the Scheduler's worker-selection step
//! observes a consistent view without taking three separate locks. The
//! `handles` map (RPC handle + liveness per worker) is a [`DashMap`] since
//! handle lookup is independent of pool membership.
//!
//! `waiting_workers` is *not* tracked here — per the data model, it belongs
//! to the owning `TaskInstance`, since a held worker is scoped to exactly
//! one task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Remote contract
// ---------------------------------------------------------------------------

/// The sealed set of remote methods the Scheduler Core may invoke on a
/// connected worker's RPC handle.
///
/// Implemented by the transport crate's duplex connection type; the kernel
/// never depends on the transport directly, only on this contract.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    async fn run_task(
        &self,
        task_key: &str,
        package_version: &str,
        args: &Value,
        subtask_key: Option<&str>,
        workunit_key: Option<&str>,
        main_worker_id: &str,
        task_instance_id: i64,
    ) -> std::result::Result<(), String>;

    async fn stop_task(&self, task_instance_id: i64) -> std::result::Result<(), String>;

    async fn task_status(&self, task_instance_id: i64) -> std::result::Result<Value, String>;

    async fn worker_status(&self) -> std::result::Result<Value, String>;

    async fn receive_results(
        &self,
        worker_id: &str,
        results: &Value,
        subtask_key: Option<&str>,
        workunit_key: Option<&str>,
    ) -> std::result::Result<(), String>;

    async fn release_worker(&self) -> std::result::Result<(), String>;

    async fn kill_worker(&self, hard: bool) -> std::result::Result<(), String>;
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Derived classification of a worker. Never stored — always computed from
/// the registry's pools (and, for `Waiting`, from the owning TaskInstance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerClass {
    Idle,
    Active,
    Main,
    Waiting,
}

/// Metadata about a connected worker, independent of pool membership.
#[derive(Clone)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub rpc_handle: Arc<dyn WorkerRpc>,
    pub connected_at: DateTime<Utc>,
    pub liveness: bool,
}

#[derive(Default)]
struct WorkerPools {
    /// LIFO stack of idle worker ids — popped from the back for warm reuse.
    idle: Vec<String>,
    /// worker_id -> work unit id, for non-main subtask workers.
    active: HashMap<String, i64>,
    /// worker_id -> task instance id, for main workers.
    main: HashMap<String, i64>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent worker registry. Cheaply cloneable and `Send + Sync`.
#[derive(Clone)]
pub struct WorkerRegistry {
    handles: Arc<DashMap<String, WorkerEntry>>,
    pools: Arc<Mutex<WorkerPools>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: Arc::new(DashMap::new()),
            pools: Arc::new(Mutex::new(WorkerPools::default())),
        }
    }

    /// Register a newly authenticated worker and place it in the idle pool.
    ///
    /// Per the reconnect handshake (§4.5), callers should instead use
    /// [`Self::reattach`] when `worker_status` reports WORKING/FINISHED.
    pub fn connect(&self, worker_id: impl Into<String>, rpc_handle: Arc<dyn WorkerRpc>) {
        let worker_id = worker_id.into();
        tracing::info!(worker_id = %worker_id, "worker connected");

        self.handles.insert(
            worker_id.clone(),
            WorkerEntry {
                worker_id: worker_id.clone(),
                rpc_handle,
                connected_at: Utc::now(),
                liveness: true,
            },
        );
        let mut pools = self.pools.lock().unwrap();
        pools.idle.push(worker_id);
    }

    /// Register a worker that reconnected already WORKING on a task, without
    /// placing it in the idle pool.
    pub fn reattach_main(&self, worker_id: impl Into<String>, rpc_handle: Arc<dyn WorkerRpc>, task_instance_id: i64) {
        let worker_id = worker_id.into();
        self.handles.insert(
            worker_id.clone(),
            WorkerEntry {
                worker_id: worker_id.clone(),
                rpc_handle,
                connected_at: Utc::now(),
                liveness: true,
            },
        );
        self.pools.lock().unwrap().main.insert(worker_id, task_instance_id);
    }

    /// Remove a disconnected worker from every pool it may be in, returning
    /// its prior classification (so the caller can decide whether to
    /// re-enqueue a `WorkerRequest`).
    pub fn disconnect(&self, worker_id: &str) -> Option<WorkerClass> {
        self.handles.remove(worker_id);
        let mut pools = self.pools.lock().unwrap();

        if let Some(pos) = pools.idle.iter().position(|id| id == worker_id) {
            pools.idle.remove(pos);
            return Some(WorkerClass::Idle);
        }
        if pools.active.remove(worker_id).is_some() {
            return Some(WorkerClass::Active);
        }
        if pools.main.remove(worker_id).is_some() {
            return Some(WorkerClass::Main);
        }
        // Not found in any pool — caller should also check the owning
        // TaskInstance's waiting_workers.
        None
    }

    /// Pop the most recently idled worker (LIFO), if any.
    pub fn pop_idle(&self) -> Option<String> {
        self.pools.lock().unwrap().idle.pop()
    }

    /// Return a worker to the idle pool (e.g. after `worker_stopped` or
    /// `release_worker`).
    pub fn push_idle(&self, worker_id: impl Into<String>) {
        let worker_id = worker_id.into();
        let mut pools = self.pools.lock().unwrap();
        pools.active.remove(&worker_id);
        pools.main.remove(&worker_id);
        pools.idle.push(worker_id);
    }

    /// Record that `worker_id` is now running `workunit_id` as a non-main
    /// subtask worker.
    pub fn mark_active(&self, worker_id: impl Into<String>, workunit_id: i64) {
        let worker_id = worker_id.into();
        let mut pools = self.pools.lock().unwrap();
        if let Some(pos) = pools.idle.iter().position(|id| *id == worker_id) {
            pools.idle.remove(pos);
        }
        pools.active.insert(worker_id, workunit_id);
    }

    /// Record that `worker_id` is now the main worker for `task_instance_id`.
    pub fn mark_main(&self, worker_id: impl Into<String>, task_instance_id: i64) {
        let worker_id = worker_id.into();
        let mut pools = self.pools.lock().unwrap();
        if let Some(pos) = pools.idle.iter().position(|id| *id == worker_id) {
            pools.idle.remove(pos);
        }
        pools.main.insert(worker_id, task_instance_id);
    }

    /// Clear a non-main active assignment (worker moves to waiting or idle).
    pub fn clear_active(&self, worker_id: &str) {
        self.pools.lock().unwrap().active.remove(worker_id);
    }

    /// Whether `worker_id` is currently classified as idle/active/main.
    pub fn classify(&self, worker_id: &str) -> Option<WorkerClass> {
        let pools = self.pools.lock().unwrap();
        if pools.idle.iter().any(|id| id == worker_id) {
            return Some(WorkerClass::Idle);
        }
        if pools.active.contains_key(worker_id) {
            return Some(WorkerClass::Active);
        }
        if pools.main.contains_key(worker_id) {
            return Some(WorkerClass::Main);
        }
        None
    }

    /// Fetch the RPC handle for a connected worker.
    pub fn handle(&self, worker_id: &str) -> Result<Arc<dyn WorkerRpc>> {
        self.handles
            .get(worker_id)
            .map(|e| Arc::clone(&e.rpc_handle))
            .ok_or_else(|| KernelError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })
    }

    /// Number of workers currently connected (any classification).
    pub fn connected_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of idle workers available for immediate dispatch.
    pub fn idle_count(&self) -> usize {
        self.pools.lock().unwrap().idle.len()
    }

    /// Task instance id a main worker is bound to, if any.
    pub fn main_task_of(&self, worker_id: &str) -> Option<i64> {
        self.pools.lock().unwrap().main.get(worker_id).copied()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct StubWorker;

    #[async_trait]
    impl WorkerRpc for StubWorker {
        async fn run_task(
            &self,
            _: &str,
            _: &str,
            _: &Value,
            _: Option<&str>,
            _: Option<&str>,
            _: &str,
            _: i64,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn stop_task(&self, _: i64) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn task_status(&self, _: i64) -> std::result::Result<Value, String> {
            Ok(Value::Null)
        }
        async fn worker_status(&self) -> std::result::Result<Value, String> {
            Ok(Value::Null)
        }
        async fn receive_results(
            &self,
            _: &str,
            _: &Value,
            _: Option<&str>,
            _: Option<&str>,
        ) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn release_worker(&self) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn kill_worker(&self, _: bool) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn stub() -> Arc<dyn WorkerRpc> {
        Arc::new(StubWorker)
    }

    #[test]
    fn connect_places_worker_idle() {
        let registry = WorkerRegistry::new();
        registry.connect("w0", stub());
        assert_eq!(registry.classify("w0"), Some(WorkerClass::Idle));
        assert_eq!(registry.idle_count(), 1);
    }

    #[test]
    fn idle_pop_is_lifo() {
        let registry = WorkerRegistry::new();
        registry.connect("w0", stub());
        registry.connect("w1", stub());
        assert_eq!(registry.pop_idle(), Some("w1".to_string()));
        assert_eq!(registry.pop_idle(), Some("w0".to_string()));
        assert_eq!(registry.pop_idle(), None);
    }

    #[test]
    fn mark_active_removes_from_idle() {
        let registry = WorkerRegistry::new();
        registry.connect("w0", stub());
        registry.mark_active("w0", 42);
        assert_eq!(registry.classify("w0"), Some(WorkerClass::Active));
        assert_eq!(registry.idle_count(), 0);
    }

    #[test]
    fn mark_main_removes_from_idle() {
        let registry = WorkerRegistry::new();
        registry.connect("w0", stub());
        registry.mark_main("w0", 1);
        assert_eq!(registry.classify("w0"), Some(WorkerClass::Main));
        assert_eq!(registry.main_task_of("w0"), Some(1));
    }

    #[test]
    fn push_idle_clears_other_pools() {
        let registry = WorkerRegistry::new();
        registry.connect("w0", stub());
        registry.mark_active("w0", 7);
        registry.push_idle("w0");
        assert_eq!(registry.classify("w0"), Some(WorkerClass::Idle));
    }

    #[test]
    fn disconnect_reports_prior_class_and_removes_handle() {
        let registry = WorkerRegistry::new();
        registry.connect("w0", stub());
        registry.mark_active("w0", 7);

        let prior = registry.disconnect("w0");
        assert_eq!(prior, Some(WorkerClass::Active));
        assert!(registry.handle("w0").is_err());
        assert_eq!(registry.classify("w0"), None);
    }

    #[test]
    fn handle_not_found_error() {
        let registry = WorkerRegistry::new();
        assert!(matches!(
            registry.handle("missing"),
            Err(KernelError::WorkerNotFound { .. })
        ));
    }
}
