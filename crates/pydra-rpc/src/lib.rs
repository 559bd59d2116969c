//! Pydra wire transport.
//!
//! Everything needed to carry the Scheduler Core's sealed RPC surface
//! (spec.md §9) across a socket, plus the pairing and challenge/response
//! handshake that gates it:
//!
//! - **[`keys`]** — RSA keypair generation, JSON-array wire serialization,
//!   and textbook (unpadded) encrypt/decrypt, grounded on `rsa_auth.py`.
//! - **[`auth`]** — the Node↔Master pairing and challenge/response state
//!   machines (`MasterHandshake`, `NodeHandshake`).
//! - **[`message`]** / **[`codec`]** — the `Call`/`Reply` wire envelope and
//!   its length-delimited JSON framing.
//! - **[`connection`]** — a duplex [`connection::RpcConnection`] pumping
//!   frames to/from an async transport and correlating calls to replies.
//! - **[`worker`]** — [`worker::WireWorker`], the
//!   [`pydra_kernel::registry::WorkerRpc`] implementation the Scheduler
//!   Core actually drives once a Node is paired and authenticated.
//! - **[`listener`]** — the Master-side `TcpListener` accept loop, grounded
//!   on `worker_connection_manager.py`, that runs [`auth::MasterHandshake`]
//!   per connection and dispatches the Node's sealed calls to
//!   [`pydra_kernel::Scheduler`].
//! - **[`error`]** — transport error types.

pub mod auth;
pub mod codec;
pub mod connection;
pub mod error;
pub mod keys;
pub mod listener;
pub mod message;
pub mod worker;

pub use auth::{MasterHandshake, NodeHandshake};
pub use connection::{InboundCall, RpcConnection};
pub use error::{Result, RpcError};
pub use keys::{KeyPair, PublicKey};
pub use listener::serve;
pub use message::Message;
pub use worker::WireWorker;
