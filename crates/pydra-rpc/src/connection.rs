//! A duplex RPC connection: one task reads frames off the wire and
//! dispatches them either to a pending call's response channel or to an
//! inbound-call handler, while `call` sends requests and awaits their
//! matching reply by id.
//!
//! This is the direct analogue of `PerspectiveBroker`'s remote-call
//! dispatch, built on the framed codec in [`crate::codec`] instead of
//! Twisted's banana protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::JsonCodec;
use crate::error::{Result, RpcError};
use crate::message::Message;

/// An inbound `Call` handed to whatever drives this side of the connection
/// (the Master's dispatcher for Node-originated calls like `send_results`,
/// or a Node's dispatcher for Master-originated calls like `run_task`).
pub struct InboundCall {
    pub method: String,
    pub args: Vec<Value>,
    reply_id: u64,
    replies: mpsc::UnboundedSender<Message>,
}

impl InboundCall {
    pub fn respond_ok(self, result: Value) {
        let _ = self.replies.send(Message::ok(self.reply_id, result));
    }

    pub fn respond_err(self, error: impl Into<String>) {
        let _ = self.replies.send(Message::err(self.reply_id, error.into()));
    }
}

/// A live RPC connection over any `AsyncRead + AsyncWrite` transport
/// (normally a `TcpStream` half-pair).
pub struct RpcConnection {
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, oneshot::Sender<Message>>>,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundCall>>,
}

impl RpcConnection {
    /// Spawn the read/write pump tasks and return a handle. Calls arriving
    /// from the peer are delivered through [`RpcConnection::next_inbound`];
    /// calls this side makes are sent through [`RpcConnection::call`].
    pub fn spawn<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Arc<DashMap<u64, oneshot::Sender<Message>>> = Arc::new(DashMap::new());
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundCall>();

        let mut framed_write = FramedWrite::new(writer, JsonCodec::default());
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if framed_write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reply_tx = outbound_tx.clone();
        let pending_for_reader = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut framed_read = FramedRead::new(reader, JsonCodec::default());
            while let Some(frame) = framed_read.next().await {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(reason) => {
                        tracing::warn!(%reason, "rpc connection framing error, closing");
                        break;
                    }
                };
                match msg {
                    Message::Reply { id, .. } => {
                        if let Some((_, tx)) = pending_for_reader.remove(&id) {
                            let _ = tx.send(msg);
                        }
                    }
                    Message::Call { id, method, args } => {
                        let call = InboundCall {
                            method,
                            args,
                            reply_id: id,
                            replies: reply_tx.clone(),
                        };
                        if inbound_tx.send(call).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending,
            outbound: outbound_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// Issue a `Call` and await the matching `Reply`.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        self.outbound
            .send(Message::call(id, method, args))
            .map_err(|_| RpcError::ConnectionClosed)?;

        let reply = rx.await.map_err(|_| RpcError::ConnectionClosed)?;
        match reply {
            Message::Reply {
                result: Some(value),
                ..
            } => Ok(value),
            Message::Reply {
                error: Some(reason),
                ..
            } => Err(RpcError::RemoteError {
                method: method.to_string(),
                reason,
            }),
            Message::Reply { .. } => Ok(Value::Null),
            Message::Call { .. } => Err(RpcError::Codec("expected reply, got call".into())),
        }
    }

    /// Await the next call the peer has made on this connection.
    pub async fn next_inbound(&self) -> Option<InboundCall> {
        self.inbound.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn call_is_answered_by_the_peer_dispatcher() {
        let (a, b) = tokio::io::duplex(8192);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let client = RpcConnection::spawn(a_read, a_write);
        let server = RpcConnection::spawn(b_read, b_write);

        let server_task = tokio::spawn(async move {
            let call = server.next_inbound().await.expect("inbound call");
            assert_eq!(call.method, "worker_status");
            call.respond_ok(json!({"state": "IDLE"}));
        });

        let result = client.call("worker_status", vec![]).await.unwrap();
        assert_eq!(result, json!({"state": "IDLE"}));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn remote_error_surfaces_as_remote_error() {
        let (a, b) = tokio::io::duplex(8192);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let client = RpcConnection::spawn(a_read, a_write);
        let server = RpcConnection::spawn(b_read, b_write);

        tokio::spawn(async move {
            let call = server.next_inbound().await.expect("inbound call");
            call.respond_err("task not found");
        });

        let err = client.call("stop_task", vec![json!(5)]).await.unwrap_err();
        match err {
            RpcError::RemoteError { method, reason } => {
                assert_eq!(method, "stop_task");
                assert_eq!(reason, "task not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
