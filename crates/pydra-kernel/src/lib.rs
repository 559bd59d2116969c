//! Pydra Master-side kernel.
//!
//! This crate holds the live, in-memory half of the Master-side Task
//! Scheduler described in the Pydra spec — the half that only matters while
//! the process is up, as opposed to the persisted half in
//! [`pydra_store`].
//!
//! - **[`scheduler`]** — the Scheduler Core: matches pending
//!   [`scheduler::WorkerRequest`]s to idle/main/held workers and drives the
//!   `run_task`/`stop_task`/`release_worker` RPC calls that carry work onto
//!   them.
//! - **[`priority_queue`]** — the min-heap of active `TaskInstance`s the
//!   Scheduler Core scans each pass.
//! - **[`registry`]** — the Worker Registry: connected worker RPC handles
//!   and the idle/active/main pools the scheduling algorithm reads.
//! - **[`status`]** — the Status Aggregator backing the Controller
//!   Interface's `task_statuses` call.
//! - **[`ipc`]** — the pub/sub event bus other components subscribe to for
//!   task/worker lifecycle signals.
//! - **[`error`]** — unified kernel error types via [`thiserror`].

pub mod error;
pub mod ipc;
pub mod priority_queue;
pub mod registry;
pub mod scheduler;
pub mod status;

pub use error::{KernelError, Result};
pub use ipc::{Event, IpcBus};
pub use priority_queue::{compute_score, PriorityQueue};
pub use registry::{WorkerClass, WorkerEntry, WorkerRegistry, WorkerRpc};
pub use scheduler::{ResultItem, Scheduler, TaskId, TaskStatus, WorkerRequest, WorkerStatusReport};
pub use status::{StatusAggregator, TaskStatusEntry};
