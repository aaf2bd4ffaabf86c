//! Error types surfaced by the public facade (§4.H, §7).

use wkf_codec::CodecError;
use wkf_queue_core::QueueError;
use wkf_types::{RunId, StructuredError};
use wkf_world_core::WorldError;

/// Errors raised while creating or cancelling a run, or resuming a hook.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// A `World` call failed.
    #[error(transparent)]
    World(#[from] WorldError),
    /// A `Queue` call failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A `wkf-codec` (de)serialization or encryption failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The store echoed back a different `runId` than the client generated;
    /// per §4.H step 5 this is a fatal client/store protocol mismatch.
    #[error("run id mismatch: requested {requested}, store echoed {echoed}")]
    RunIdMismatch {
        /// The client-generated run id `start()` sent.
        requested: String,
        /// The run id the store actually echoed back.
        echoed: String,
    },
    /// `workflowName` could not be derived (§4.H step 1).
    #[error("workflow misconfigured: {0}")]
    Misconfigured(String),
    /// A hook token resume was requested for a token with no live hook.
    #[error("no live hook for token {0}")]
    UnknownHookToken(String),
    /// The run owning a hook could not be found.
    #[error("run {0} not found")]
    UnknownRun(RunId),
}

/// Raised by [`crate::Run::return_value`] when the run reached `run_failed`.
#[derive(Debug, thiserror::Error)]
#[error("run {run_id} failed: {error}")]
pub struct RunFailedError {
    /// The run that failed.
    pub run_id: RunId,
    /// The structured failure recorded on `run_failed`.
    pub error: StructuredError,
}

/// Raised by [`crate::Run::return_value`] when the run has not reached a
/// terminal state yet (only returned by the non-blocking poll variant).
#[derive(Debug, thiserror::Error)]
#[error("run {0} has not completed")]
pub struct RunNotCompletedError(pub RunId);

/// Every way [`crate::Run::return_value`] can fail to produce `Out`.
#[derive(Debug, thiserror::Error)]
pub enum ReturnValueError {
    /// The run reached `run_failed`.
    #[error(transparent)]
    Failed(#[from] RunFailedError),
    /// The run has not completed yet (non-blocking poll only).
    #[error(transparent)]
    NotCompleted(#[from] RunNotCompletedError),
    /// A `World` call failed while polling.
    #[error(transparent)]
    World(#[from] WorldError),
    /// The completed output failed to decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
