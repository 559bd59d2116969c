//! [`pydra_kernel::registry::WorkerRpc`] over a framed [`RpcConnection`].
//!
//! This is the piece the kernel crate only knows as a trait object: once a
//! Node has paired and authenticated (see [`crate::auth`]), its connection
//! is wrapped in a `WireWorker` and handed to
//! `WorkerRegistry::connect`/`reattach_main`, and the Scheduler Core drives
//! it exactly like the in-process stubs its own tests use.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use pydra_kernel::WorkerRpc;

use crate::connection::RpcConnection;

pub struct WireWorker {
    conn: Arc<RpcConnection>,
}

impl WireWorker {
    pub fn new(conn: Arc<RpcConnection>) -> Self {
        Self { conn }
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, String> {
        self.conn.call(method, args).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl WorkerRpc for WireWorker {
    async fn run_task(
        &self,
        task_key: &str,
        package_version: &str,
        args: &Value,
        subtask_key: Option<&str>,
        workunit_key: Option<&str>,
        main_worker_id: &str,
        task_instance_id: i64,
    ) -> std::result::Result<(), String> {
        self.call(
            "run_task",
            vec![
                json!(task_key),
                json!(package_version),
                args.clone(),
                json!(subtask_key),
                json!(workunit_key),
                json!(main_worker_id),
                json!(task_instance_id),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn stop_task(&self, task_instance_id: i64) -> std::result::Result<(), String> {
        self.call("stop_task", vec![json!(task_instance_id)]).await.map(|_| ())
    }

    async fn task_status(&self, task_instance_id: i64) -> std::result::Result<Value, String> {
        self.call("task_status", vec![json!(task_instance_id)]).await
    }

    async fn worker_status(&self) -> std::result::Result<Value, String> {
        self.call("worker_status", vec![]).await
    }

    async fn receive_results(
        &self,
        worker_id: &str,
        results: &Value,
        subtask_key: Option<&str>,
        workunit_key: Option<&str>,
    ) -> std::result::Result<(), String> {
        self.call(
            "receive_results",
            vec![
                json!(worker_id),
                results.clone(),
                json!(subtask_key),
                json!(workunit_key),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn release_worker(&self) -> std::result::Result<(), String> {
        self.call("release_worker", vec![]).await.map(|_| ())
    }

    async fn kill_worker(&self, hard: bool) -> std::result::Result<(), String> {
        self.call("kill_worker", vec![json!(hard)]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pydra_kernel::WorkerRpc as _;

    #[tokio::test]
    async fn run_task_sends_positional_args_and_awaits_ack() {
        let (a, b) = tokio::io::duplex(8192);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let client = RpcConnection::spawn(a_read, a_write);
        let server = RpcConnection::spawn(b_read, b_write);
        let worker = WireWorker::new(client);

        tokio::spawn(async move {
            let call = server.next_inbound().await.expect("inbound call");
            assert_eq!(call.method, "run_task");
            assert_eq!(call.args[0], json!("demo.Echo"));
            call.respond_ok(Value::Null);
        });

        worker
            .run_task("demo.Echo", "1.0", &json!({}), None, None, "main-1", 7)
            .await
            .unwrap();
    }
}
