//! Controller HTTP/JSON-RPC interface for Pydra's Master.
//!
//! Grounded on `controller/web/interface.py`'s `InterfaceResource` /
//! `FunctionResource`: every exposed Scheduler/Task Store/Node Store
//! operation is reachable as `POST /<method>`, dispatched through a single
//! generic handler rather than one Axum route per method. A session cookie
//! tracks the Controller's authentication state across calls; methods
//! marked as requiring auth are rejected with `401` until the session has
//! completed the challenge/response handshake in [`pydra_auth::SessionManager`].
//!
//! - **[`state`]** — [`state::AppState`], the shared handles every call
//!   dispatches against.
//! - **[`interface`]** — the generic `POST /<method>` entry point: session
//!   lookup, auth gating, and the `200`/`401`/`404`/`500` response shapes.
//! - **[`handlers`]** — the method table itself, one function per exposed
//!   operation.
//! - **[`server`]** — [`server::WebServer`], which assembles the Axum
//!   router and binds the Controller's listening port.

pub mod handlers;
pub mod interface;
pub mod server;
pub mod state;

pub use server::WebServer;
pub use state::AppState;

/// Controller HTTP interface configuration.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on, matching `CONTROLLER_PORT`.
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8080,
        }
    }
}
