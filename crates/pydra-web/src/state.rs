//! Shared application state for the Controller interface.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across every request
//! handler, mirroring `controller/web/interface.py`'s `Interface` instance
//! that every `FunctionResource` closes over.

use pydra_auth::SessionManager;
use pydra_kernel::{Scheduler, StatusAggregator, WorkerRegistry};
use pydra_store::{NodeStore, TaskStore};

/// Everything a Controller call might need to touch.
pub struct AppState {
    pub scheduler: Scheduler,
    pub task_store: TaskStore,
    pub node_store: NodeStore,
    pub registry: WorkerRegistry,
    pub status: StatusAggregator,
    pub sessions: SessionManager,
}
