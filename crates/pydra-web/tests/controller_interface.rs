//! End-to-end exercise of the Controller HTTP interface: queue a task
//! through the unauthenticated-then-authenticated flow, look it up via
//! `list_queue`, and confirm an unregistered method reports `404`.

use std::sync::Arc;

use pydra_auth::SessionManager;
use pydra_kernel::{IpcBus, Scheduler, StatusAggregator, WorkerRegistry};
use pydra_rpc::KeyPair;
use pydra_store::{Database, NodeStore, TaskStore};
use pydra_web::{AppState, WebConfig, WebServer};
use serde_json::json;

async fn spawn_server() -> (String, KeyPair) {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();

    let task_store = TaskStore::new(db.clone());
    let node_store = NodeStore::new(db.clone());
    let registry = WorkerRegistry::new();
    let ipc = IpcBus::new(16);
    let scheduler = Scheduler::new(task_store.clone(), registry.clone(), ipc);
    scheduler.rehydrate().await.unwrap();

    let master_key = KeyPair::generate(512).unwrap();
    let sessions = SessionManager::new(master_key.public());

    let state = AppState {
        scheduler,
        task_store,
        node_store,
        registry,
        status: StatusAggregator::new(),
        sessions,
    };

    let server = WebServer::new(WebConfig::default(), state);
    let router = server.router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), master_key)
}

fn jar_client() -> reqwest::Client {
    reqwest::Client::builder().cookie_store(true).build().unwrap()
}

#[tokio::test]
async fn unauthenticated_call_is_rejected_then_succeeds_after_handshake() {
    let (base, master_key) = spawn_server().await;
    let client = jar_client();

    let resp = client
        .post(format!("{base}/queue_task"))
        .json(&json!({"args": ["demo.Echo", {"msg": "hi"}, 5]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let challenge: String = client
        .post(format!("{base}/authenticate"))
        .json(&json!({"args": []}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let encrypted = pydra_rpc::keys::raw_encrypt(&master_key.public(), challenge.as_bytes());
    let response = {
        use sha2::{Digest, Sha512};
        hex::encode(Sha512::digest(&encrypted))
    };

    let authed: bool = client
        .post(format!("{base}/challenge_response"))
        .json(&json!({"args": [response]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(authed);

    let resp = client
        .post(format!("{base}/queue_task"))
        .json(&json!({"args": ["demo.Echo", {"msg": "hi"}, 5]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let task_id: i64 = resp.json().await.unwrap();
    assert!(task_id > 0);

    let queue: Vec<serde_json::Value> = client
        .post(format!("{base}/list_queue"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn unregistered_method_is_not_found() {
    let (base, _master_key) = spawn_server().await;
    let client = jar_client();

    let resp = client.post(format!("{base}/not_a_real_method")).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}
