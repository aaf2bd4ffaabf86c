#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-runtime** – Async glue binding the deterministic orchestrator core
//! to a `World` and a `Queue` (§4.F, §4.G).
//!
//! `wkf-orchestrator` never touches storage or the queue; it is handed an
//! event-log snapshot and returns either a completed result or a
//! `Suspension`. This crate is what actually drives that: [`workflow`]
//! re-invokes the orchestrator per `__wkf_workflow_<name>` message (catching
//! up elapsed waits first), [`suspension`] turns a `Suspension` into durable
//! appends and queue messages, and [`step`] drives
//! `__wkf_step_<name>` messages through a registered step function with the
//! retry/backoff policy in §4.G.
//!
//! Grounded on `toka-runtime`'s background-loop shape
//! (`toka-runtime/src/runtime/mod.rs`) for the handler-driver pattern, and
//! `toka-agent-runtime/src/task.rs`'s retry/backoff for [`backoff`].

pub mod backoff;
pub mod messages;
pub mod step;
pub mod step_registry;
pub mod suspension;
pub mod workflow;

pub use step::StepHandler;
pub use suspension::SuspensionHandler;
pub use workflow::WorkflowHandler;

/// Errors surfaced by the runtime handlers. Wraps the lower-level error
/// types from every crate the handlers call into, plus the handlers' own
/// (de)serialization concerns for the queue message envelopes.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A `World` call failed.
    #[error(transparent)]
    World(#[from] wkf_world_core::WorldError),
    /// A `Queue` call failed.
    #[error(transparent)]
    Queue(#[from] wkf_queue_core::QueueError),
    /// A `wkf-codec` (de)serialization or decryption failure.
    #[error(transparent)]
    Codec(#[from] wkf_codec::CodecError),
    /// The orchestrator itself reported a fatal, non-suspension error.
    #[error(transparent)]
    Workflow(#[from] wkf_types::WorkflowError),
    /// A queue-message envelope failed to (de)serialize; not a `wkf-codec`
    /// concern since these envelopes never carry user values.
    #[error("message envelope serialization failed: {0}")]
    Serde(String),
}
