//! Status Aggregator.
//!
//! Backs the Controller Interface's `task_statuses` call (spec.md §4.7).
//! Progress is fetched lazily: a fan-out of `task_status` RPCs goes only to
//! workers marked WORKING for a root task, results are cached for 3 seconds,
//! and concurrent callers within that window share a single in-flight fetch
//! rather than each issuing their own RPC.
//!
//! Grounded on `scheduler.py`'s `fetch_task_status` / `task_statuses`: the
//! original throttles by a module-level "next update" timestamp and caches
//! results in a plain dict; here the TTL and de-duplication are both carried
//! by [`pydra_store::CacheLayer`] plus a per-task fetch lock so a second
//! caller blocks on (and then reuses) the first caller's fetch instead of
//! re-issuing the RPC.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use pydra_store::{CacheLayer, TaskInstance, TaskStatus as StoreTaskStatus};

use crate::registry::WorkerRegistry;

/// One entry of the `task_statuses` response: `{s, t, p}` for running tasks,
/// `{s: STOPPED}` for queued ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusEntry {
    pub s: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<Value>,
}

/// Fans out `task_status` RPCs to main workers, with a 3-second TTL cache
/// and de-duplicated in-flight fetches per task id.
pub struct StatusAggregator {
    cache: CacheLayer<Value>,
    fetch_locks: DashMap<i64, Arc<AsyncMutex<()>>>,
}

impl StatusAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: CacheLayer::builder("task_status_progress")
                .max_capacity(1000)
                .ttl_seconds(3)
                .build(),
            fetch_locks: DashMap::new(),
        }
    }

    /// Build the `task_statuses` response for every task in `tasks`.
    ///
    /// Queued (STOPPED) tasks report immediately with no RPC. Running tasks
    /// fetch progress from their main worker, subject to the TTL/dedup rules
    /// above.
    pub async fn task_statuses(
        &self,
        tasks: &[TaskInstance],
        registry: &WorkerRegistry,
    ) -> HashMap<i64, TaskStatusEntry> {
        let mut out = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if task.status == StoreTaskStatus::Stopped {
                out.insert(
                    task.id,
                    TaskStatusEntry {
                        s: StoreTaskStatus::Stopped.as_i32(),
                        t: None,
                        p: None,
                    },
                );
                continue;
            }

            let progress = match &task.main_worker_id {
                Some(worker_id) => Some(self.progress_for(task.id, worker_id, registry).await),
                None => None,
            };

            out.insert(
                task.id,
                TaskStatusEntry {
                    s: task.status.as_i32(),
                    t: task.started_at,
                    p: progress,
                },
            );
        }
        out
    }

    async fn progress_for(&self, task_id: i64, worker_id: &str, registry: &WorkerRegistry) -> Value {
        let cache_key = task_id.to_string();
        if let Some(cached) = self.cache.get(&cache_key).await {
            return cached;
        }

        let lock = self
            .fetch_locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: the lock holder ahead of us may already have populated it.
        if let Some(cached) = self.cache.get(&cache_key).await {
            return cached;
        }

        let value = match registry.handle(worker_id) {
            Ok(handle) => handle.task_status(task_id).await.unwrap_or(Value::Null),
            Err(_) => Value::Null,
        };

        let _ = self.cache.insert(&cache_key, &value).await;
        value
    }
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerRpc;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWorker {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerRpc for CountingWorker {
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(serde_json::json!({"progress": 0.5}))
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

    fn running_task(id: i64, main_worker_id: &str) -> TaskInstance {
        TaskInstance {
            id,
            task_key: "demo.Echo".into(),
            priority: 5,
            args: "{}".into(),
            status: StoreTaskStatus::Running,
            queued_at: Utc::now().timestamp(),
            started_at: Some(Utc::now().timestamp()),
            completed_at: None,
            main_worker_id: Some(main_worker_id.to_string()),
            local_workunit_id: None,
        }
    }

    #[tokio::test]
    async fn stopped_task_reports_without_rpc() {
        let agg = StatusAggregator::new();
        let registry = WorkerRegistry::new();
        let task = TaskInstance {
            id: 1,
            task_key: "demo.Echo".into(),
            priority: 5,
            args: "{}".into(),
            status: StoreTaskStatus::Stopped,
            queued_at: Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            main_worker_id: None,
            local_workunit_id: None,
        };

        let statuses = agg.task_statuses(&[task], &registry).await;
        assert_eq!(statuses[&1].s, StoreTaskStatus::Stopped.as_i32());
        assert!(statuses[&1].p.is_none());
    }

    #[tokio::test]
    async fn concurrent_fetches_dedupe_to_one_rpc() {
        let agg = Arc::new(StatusAggregator::new());
        let registry = WorkerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.connect("w0", Arc::new(CountingWorker { calls: Arc::clone(&calls) }));
        registry.mark_main("w0", 1);

        let task = running_task(1, "w0");

        let a = Arc::clone(&agg);
        let r1 = registry.clone();
        let t1 = task.clone();
        let h1 = tokio::spawn(async move { a.task_statuses(&[t1], &r1).await });

        let a = Arc::clone(&agg);
        let r2 = registry.clone();
        let t2 = task.clone();
        let h2 = tokio::spawn(async move { a.task_statuses(&[t2], &r2).await });

        let (s1, s2) = tokio::join!(h1, h2);
        let s1 = s1.unwrap();
        let s2 = s2.unwrap();

        assert_eq!(s1[&1].p, s2[&1].p);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
