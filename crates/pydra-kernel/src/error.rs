//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate. Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

/// Unified error type for Pydra's Master-side kernel (scheduler, priority
/// queue, worker registry, status aggregator, signals).
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Validation -----------------------------------------------------
    /// `queue_task` was called with a malformed task form; no state change
    /// occurred.
    #[error("validation failed for task {task_key}: {errors:?}")]
    Validation {
        task_key: String,
        errors: Vec<String>,
    },

    // -- NotFound ---------------------------------------------------------
    /// The referenced task instance does not exist.
    #[error("task instance not found: {task_id}")]
    TaskNotFound { task_id: i64 },

    /// The referenced work unit does not exist.
    #[error("work unit not found: {workunit_id}")]
    WorkUnitNotFound { workunit_id: i64 },

    /// The requested worker is not registered.
    #[error("worker not found: {worker_id}")]
    WorkerNotFound { worker_id: String },

    // -- Scheduler state --------------------------------------------------
    /// The task instance has already terminated and cannot be transitioned
    /// to the requested state.
    #[error("invalid task state transition for {task_id}: {reason}")]
    InvalidTaskState { task_id: i64, reason: String },

    /// The scheduler has been shut down and will not accept new work.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// An RPC call to a worker failed or the worker disconnected mid-execution.
    ///
    /// Root-task failures mark the `TaskInstance` FAILED; subtask failures
    /// re-enqueue the `WorkerRequest`.
    #[error("worker failure on {worker_id}: {reason}")]
    WorkerFailure { worker_id: String, reason: String },

    /// An event that does not warrant aborting the current scheduling pass
    /// (e.g. a request from an unrecognized worker). Logged and dropped.
    #[error("transient scheduler state: {reason}")]
    TransientSchedulerState { reason: String },

    // -- Registry errors ----------------------------------------------------
    /// The worker is registered but not in a usable state for the requested
    /// operation.
    #[error("worker unavailable: {worker_id} (status: {status})")]
    WorkerUnavailable { worker_id: String, status: String },

    // -- IPC errors ---------------------------------------------------------
    /// Publishing a signal to the IPC bus failed (e.g. no active receivers).
    #[error("ipc publish failed: {reason}")]
    IpcPublishFailed { reason: String },

    /// Subscribing to the IPC bus failed.
    #[error("ipc subscribe failed: {reason}")]
    IpcSubscribeFailed { reason: String },

    // -- Persistence ----------------------------------------------------
    /// A Task Store operation failed while backing a kernel operation.
    #[error("store error: {0}")]
    Store(#[from] pydra_store::StoreError),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant. Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
