//! Integration tests for `pydra-store`.
//!
//! Exercises the full database lifecycle — migrations, `TaskStore` and
//! `NodeStore` CRUD, and the cache layer — against a real SQLite database on
//! disk (via `tempfile`).

use pydra_store::{Database, NodeStore, TaskStatus, TaskStore};

// ═══════════════════════════════════════════════════════════════════════
//  Database lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn database_open_and_migrate_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");

    let db = Database::open_and_migrate(db_path.clone()).await.unwrap();

    let task_count: i64 = db
        .execute(|conn| {
            let c: i64 = conn.query_row("SELECT count(*) FROM task_instances", [], |row| row.get(0))?;
            Ok(c)
        })
        .await
        .unwrap();
    assert_eq!(task_count, 0);

    let work_unit_count: i64 = db
        .execute(|conn| {
            let c: i64 = conn.query_row("SELECT count(*) FROM work_units", [], |row| row.get(0))?;
            Ok(c)
        })
        .await
        .unwrap();
    assert_eq!(work_unit_count, 0);

    let node_count: i64 = db
        .execute(|conn| {
            let c: i64 = conn.query_row("SELECT count(*) FROM nodes", [], |row| row.get(0))?;
            Ok(c)
        })
        .await
        .unwrap();
    assert_eq!(node_count, 0);

    assert!(db_path.exists());
}

#[tokio::test]
async fn database_open_and_migrate_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test_idempotent.db");

    let db1 = Database::open_and_migrate(db_path.clone()).await.unwrap();
    drop(db1);

    let db2 = Database::open_and_migrate(db_path).await.unwrap();
    let count: i64 = db2
        .execute(|conn| {
            let c: i64 = conn.query_row("SELECT count(*) FROM task_instances", [], |row| row.get(0))?;
            Ok(c)
        })
        .await
        .unwrap();
    assert_eq!(count, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  TaskStore full lifecycle (on-disk database)
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn task_instance_and_work_unit_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("test.db"))
        .await
        .unwrap();
    let store = TaskStore::new(db);

    // ── Queue ───────────────────────────────────────────────────────
    let task = store
        .create_task_instance("demo.Echo", 5, r#"{"msg":"hi"}"#)
        .await
        .unwrap();
    assert_eq!(task.task_key, "demo.Echo");
    assert_eq!(task.priority, 5);
    assert_eq!(task.status, TaskStatus::Stopped);
    assert!(task.started_at.is_none());

    // ── Assign a main worker ────────────────────────────────────────
    store.set_main_worker(task.id, "node1:9001:0").await.unwrap();
    let fetched = store.get_task_instance(task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Running);
    assert_eq!(fetched.main_worker_id.as_deref(), Some("node1:9001:0"));
    assert!(fetched.started_at.is_some());

    // Rehydration should pick this task up as active (RUNNING).
    let active = store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, task.id);

    // ── Attach a subtask work unit ──────────────────────────────────
    let work_unit = store
        .create_work_unit(task.id, Some("demo.Echo.sub"), Some("wu-1"), "{}")
        .await
        .unwrap();
    assert_eq!(work_unit.task_instance_id, task.id);
    assert_eq!(work_unit.status, TaskStatus::Stopped);

    store.assign_work_unit(work_unit.id, "node2:9001:0", false).await.unwrap();
    let assigned = store.get_work_unit(work_unit.id).await.unwrap().unwrap();
    assert_eq!(assigned.status, TaskStatus::Running);
    assert_eq!(assigned.worker_id.as_deref(), Some("node2:9001:0"));
    assert!(!assigned.on_main_worker);

    store.set_work_unit_status(work_unit.id, TaskStatus::Complete).await.unwrap();
    let completed = store.get_work_unit(work_unit.id).await.unwrap().unwrap();
    assert_eq!(completed.status, TaskStatus::Complete);
    assert!(completed.completed_at.is_some());

    store.set_local_workunit(task.id, Some(work_unit.id)).await.unwrap();
    let fetched = store.get_task_instance(task.id).await.unwrap().unwrap();
    assert_eq!(fetched.local_workunit_id, Some(work_unit.id));

    // ── Work units belonging to the task instance ───────────────────
    let units = store.list_work_units(task.id).await.unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].id, work_unit.id);

    // ── Complete the root task and verify it leaves `list_active` ───
    store.set_status(task.id, TaskStatus::Complete).await.unwrap();
    let fetched = store.get_task_instance(task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Complete);
    assert!(fetched.completed_at.is_some());

    let active = store.list_active().await.unwrap();
    assert!(active.is_empty());

    // ── History and distinct task keys ───────────────────────────────
    let history = store.history("demo.Echo", 0, 20).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, task.id);

    let keys = store.list_task_keys().await.unwrap();
    assert_eq!(keys, vec!["demo.Echo".to_string()]);
}

#[tokio::test]
async fn history_is_paginated_most_recent_first() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("test.db"))
        .await
        .unwrap();
    let store = TaskStore::new(db);

    for i in 0..5 {
        store
            .create_task_instance("demo.Echo", 0, &format!(r#"{{"i":{i}}}"#))
            .await
            .unwrap();
    }

    let page0 = store.history("demo.Echo", 0, 2).await.unwrap();
    assert_eq!(page0.len(), 2);
    // Most recent first: the last-created instance has the highest id.
    assert!(page0[0].id > page0[1].id);

    let page1 = store.history("demo.Echo", 1, 2).await.unwrap();
    assert_eq!(page1.len(), 2);
    assert!(page1[0].id < page0[1].id);
}

// ═══════════════════════════════════════════════════════════════════════
//  NodeStore CRUD (on-disk database)
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn node_register_list_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("test.db"))
        .await
        .unwrap();
    let store = NodeStore::new(db);

    let node = store.register("node1", "10.0.0.5", 9091).await.unwrap();
    assert_eq!(node.id, "node1");
    assert!(node.enrolled);

    // Re-registering the same id upserts rather than duplicating.
    let updated = store.register("node1", "10.0.0.6", 9092).await.unwrap();
    assert_eq!(updated.host, "10.0.0.6");
    assert_eq!(updated.port, 9092);

    let nodes = store.list().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].host, "10.0.0.6");

    store.remove("node1").await.unwrap();
    let nodes = store.list().await.unwrap();
    assert!(nodes.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Cache layer
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cache_layer_basic_operations() {
    use pydra_store::CacheLayer;

    let cache: CacheLayer<String> = CacheLayer::builder("test-cache")
        .max_capacity(100)
        .ttl_seconds(60)
        .build();

    cache.insert("key1", &"value1".to_string()).await.unwrap();
    let val = cache.get("key1").await;
    assert_eq!(val.as_deref(), Some("value1"));

    let stats = cache.stats();
    assert_eq!(stats.hits(), 1);
    assert_eq!(stats.misses(), 0);

    let missing = cache.get("nonexistent").await;
    assert!(missing.is_none());

    let stats = cache.stats();
    assert_eq!(stats.misses(), 1);

    cache.invalidate("key1").await;
    let val = cache.get("key1").await;
    assert!(val.is_none());
}
