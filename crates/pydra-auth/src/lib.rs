//! Controller session authentication for Pydra's Master.
//!
//! Grounded on `interface_module.py`'s `authenticate`/`challenge_response`
//! and `controller/web/interface.py`'s `FunctionResource`: a Controller
//! authenticates a per-session challenge/response against the Master's own
//! RSA keypair (see [`pydra_rpc::keys`]), distinct from the Node↔Master
//! pairing handshake in [`pydra_rpc::auth`].
//!
//! - **[`session`]** — [`session::SessionManager`], the per-session
//!   challenge/response state machine and TTL sweep.
//! - **[`error`]** — [`error::AuthError`], surfaced by the Controller
//!   Interface as `CHALLENGE_REJECTED` / `NO_CHALLENGE` / `AUTH_FAIL`.

pub mod error;
pub mod session;

pub use error::{AuthError, Result};
pub use session::{SessionManager, DEFAULT_SESSION_TTL_SECS};
