//! Master-side Node/Worker accept loop.
//!
//! Grounded on `worker_connection_manager.py`'s `get_worker_service`
//! (`internet.TCPServer(PORT, pb.PBServerFactory(p))`): one `TcpListener`
//! accepts Node connections, and each connection runs the pairing +
//! challenge/response handshake from [`crate::auth`] before any sealed
//! method is allowed through to the Scheduler.
//!
//! Unlike the original's `pb.Avatar`-per-connection model, there is no
//! `portal`/`realm` indirection here: each accepted socket gets one
//! [`RpcConnection`] and one [`MasterHandshake`], and the per-connection
//! task below *is* the avatar — it owns the handshake state and, once
//! authenticated, owns the loop that dispatches the Node's inbound calls
//! (`request_worker`, `send_results`, `worker_stopped`, ...) to the
//! [`pydra_kernel::Scheduler`].

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use pydra_kernel::Scheduler;

use crate::auth::MasterHandshake;
use crate::connection::{InboundCall, RpcConnection};
use crate::error::{Result, RpcError};
use crate::keys::{KeyPair, PublicKey};
use crate::worker::WireWorker;

/// Chunk size for key-exchange payloads, matching the default the teacher's
/// transport negotiates when carrying big integers over a framed channel.
pub const KEY_CHUNK_SIZE: usize = 256;

/// Bind `addr` and accept Node connections until the process shuts down.
///
/// Each accepted socket is handled on its own task; a connection that fails
/// pairing, authentication, or framing is dropped without affecting any
/// other connection.
pub async fn serve(addr: &str, master_key: KeyPair, scheduler: Scheduler) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "node listener bound");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "node connection accepted");
        let master_key = master_key.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let (read_half, write_half) = stream.into_split();
            let conn = RpcConnection::spawn(read_half, write_half);
            if let Err(reason) = handle_connection(conn, master_key, scheduler).await {
                tracing::warn!(%peer, %reason, "node connection ended");
            }
        });
    }
}

/// Per-connection handshake + dispatch loop. `worker_id` is established by
/// the Node's first call (any of `exchange_keys`/`get_key`/`auth_challenge`
/// must carry it as their first positional argument) and is then fixed for
/// the life of the connection.
async fn handle_connection(conn: Arc<RpcConnection>, master_key: KeyPair, scheduler: Scheduler) -> Result<()> {
    let mut handshake = MasterHandshake::new(master_key, None);
    let mut worker_id: Option<String> = None;
    let mut authenticated = false;

    while let Some(call) = conn.next_inbound().await {
        let method = call.method.clone();
        match method.as_str() {
            "exchange_keys" => handle_exchange_keys(call, &mut handshake, &mut worker_id),
            "get_key" => handle_get_key(call, &handshake),
            "auth_challenge" => handle_auth_challenge(call, &mut handshake, &mut worker_id),
            "auth_response" => {
                authenticated = handle_auth_response(call, &mut handshake);
                if authenticated {
                    if let Some(id) = &worker_id {
                        let handle: Arc<dyn pydra_kernel::WorkerRpc> = Arc::new(WireWorker::new(Arc::clone(&conn)));
                        if let Err(reason) = scheduler.worker_connected(id, handle).await {
                            tracing::warn!(worker_id = %id, %reason, "worker_connected reconnect handshake failed");
                        }
                    }
                }
            }
            _ if !authenticated => {
                tracing::warn!(%method, "sealed method called before authentication");
            }
            "request_worker" => dispatch_request_worker(call, &scheduler).await,
            "request_worker_release" => dispatch_request_worker_release(call, &scheduler, worker_id.as_deref()).await,
            "send_results" => dispatch_send_results(call, &scheduler, worker_id.as_deref()).await,
            "worker_stopped" => dispatch_worker_stopped(call, &scheduler, worker_id.as_deref()).await,
            other => {
                tracing::warn!(method = %other, "unrecognized inbound method");
            }
        }
    }

    if let Some(id) = worker_id {
        let _ = scheduler.remove_worker(&id).await;
    }
    Ok(())
}

fn handle_exchange_keys(call: InboundCall, handshake: &mut MasterHandshake, worker_id: &mut Option<String>) {
    if let Some(id) = call.args.first().and_then(Value::as_str) {
        *worker_id = Some(id.to_string());
    }
    let chunks: Vec<String> = match call.args.get(1) {
        Some(v) => serde_json::from_value(v.clone()).unwrap_or_default(),
        None => Vec::new(),
    };
    match PublicKey::from_chunks(&chunks) {
        Ok(node_key) => match handshake.exchange_keys(node_key, KEY_CHUNK_SIZE) {
            Ok(reply_chunks) => call.respond_ok(json!(reply_chunks)),
            Err(reason) => call.respond_err(reason.to_string()),
        },
        Err(reason) => call.respond_err(reason.to_string()),
    }
}

fn handle_get_key(call: InboundCall, handshake: &MasterHandshake) {
    match handshake.get_key(KEY_CHUNK_SIZE) {
        Ok(chunks) => call.respond_ok(json!(chunks)),
        Err(reason) => call.respond_err(reason.to_string()),
    }
}

fn handle_auth_challenge(call: InboundCall, handshake: &mut MasterHandshake, worker_id: &mut Option<String>) {
    if let Some(id) = call.args.first().and_then(Value::as_str) {
        *worker_id = Some(id.to_string());
    }
    match handshake.auth_challenge() {
        Some(ciphertext) => call.respond_ok(json!(ciphertext)),
        None => call.respond_err(RpcError::Auth("NOT_PAIRED".into()).to_string()),
    }
}

fn handle_auth_response(call: InboundCall, handshake: &mut MasterHandshake) -> bool {
    let response = call.args.first().and_then(Value::as_str).unwrap_or_default();
    let verified = handshake.auth_response(response);
    if verified {
        call.respond_ok(json!(true));
    } else {
        call.respond_err("CHALLENGE_REJECTED");
    }
    verified
}

async fn dispatch_request_worker(call: InboundCall, scheduler: &Scheduler) {
    let requester_id = call.args.first().and_then(Value::as_str).unwrap_or_default().to_string();
    let subtask_key = call.args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
    let args = call.args.get(2).cloned().unwrap_or(Value::Null);
    let workunit_key = call.args.get(3).and_then(Value::as_str).unwrap_or_default().to_string();

    match scheduler.request_worker(&requester_id, &subtask_key, args, &workunit_key).await {
        Ok(()) => call.respond_ok(Value::Null),
        Err(reason) => call.respond_err(reason.to_string()),
    }
}

async fn dispatch_request_worker_release(call: InboundCall, scheduler: &Scheduler, worker_id: Option<&str>) {
    let Some(requester_id) = worker_id else {
        call.respond_err("unknown caller");
        return;
    };
    match scheduler.request_worker_release(requester_id).await {
        Ok(()) => call.respond_ok(Value::Null),
        Err(reason) => call.respond_err(reason.to_string()),
    }
}

async fn dispatch_send_results(call: InboundCall, scheduler: &Scheduler, worker_id: Option<&str>) {
    let Some(worker_id) = worker_id else {
        call.respond_err("unknown caller");
        return;
    };
    let Some(raw_results) = call.args.first() else {
        call.respond_err("missing results argument");
        return;
    };
    let items: Vec<pydra_kernel::ResultItem> = match raw_results.as_array() {
        Some(arr) => arr
            .iter()
            .filter_map(|item| {
                let triple = item.as_array()?;
                Some(pydra_kernel::ResultItem {
                    workunit_key: triple.first().and_then(Value::as_str).map(str::to_string),
                    payload: triple.get(1).cloned().unwrap_or(Value::Null),
                    failed: triple.get(2).and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect(),
        None => Vec::new(),
    };

    match scheduler.send_results(worker_id, items).await {
        Ok(()) => call.respond_ok(Value::Null),
        Err(reason) => call.respond_err(reason.to_string()),
    }
}

async fn dispatch_worker_stopped(call: InboundCall, scheduler: &Scheduler, worker_id: Option<&str>) {
    let Some(worker_id) = worker_id else {
        call.respond_err("unknown caller");
        return;
    };
    match scheduler.worker_stopped(worker_id).await {
        Ok(()) => call.respond_ok(Value::Null),
        Err(reason) => call.respond_err(reason.to_string()),
    }
}
