#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-world-core** – Core `World` abstraction for the workflow runtime.
//!
//! This crate defines the storage-agnostic [`World`] trait that the
//! orchestrator and runtime crates depend on, the pure entity-mutation rules
//! every backend must enforce (see [`state`]), and the BLAKE3 integrity
//! digest computed over every event's payload. Concrete backends (in-memory,
//! sled, sqlite) live in their own crates and implement [`World`] over this
//! shared contract.

pub mod state;

use async_trait::async_trait;
use wkf_types::{ApiError, CorrelationId, Event, EventData, Hook, Run, RunId, Step, Wait};

pub use state::{apply_event, build_event, ApplyOutcome, RunState};

/// Compute the BLAKE3 integrity digest of a serialized event payload.
///
/// Unlike the teacher lineage's causal hash (which folds in parent event
/// digests to build a hash chain), this digest covers only the payload: the
/// workflow log's ordering guarantee already comes from the backend's
/// monotonic `event_id`, so the digest here exists purely as a cheap
/// corruption check and a payload-dedup key, not a causal proof.
pub fn causal_hash(payload_bytes: &[u8]) -> [u8; 32] {
    blake3::hash(payload_bytes).into()
}

/// Errors surfaced by [`World`] operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// A domain-level conflict (409), gone (410), or similar API-shaped error.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// A backend I/O or (de)serialization failure unrelated to the domain
    /// conflict rules above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a successful [`World::append`] call (§4.A).
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The committed event. Absent only for legacy spec-version runs that
    /// skip persistence for events their version predates (§4.A "legacy
    /// compatibility").
    pub event: Option<Event>,
    /// Updated run view, if this event touched the run.
    pub run: Option<Run>,
    /// Updated step view, if this event touched a step.
    pub step: Option<Step>,
    /// Updated hook view, if this event touched a hook.
    pub hook: Option<Hook>,
    /// Updated wait view, if this event touched a wait.
    pub wait: Option<Wait>,
}

/// The pluggable event log and entity store (§4.A).
///
/// Implementations must guarantee that `append` is atomic: the new event row
/// and the resulting entity mutation are committed together, or neither is.
#[async_trait]
pub trait World: Send + Sync {
    /// Append one event to `run_id`'s log, applying the conflict rules in
    /// §4.A and returning the resulting materialized views.
    async fn append(
        &self,
        run_id: &RunId,
        correlation_id: Option<CorrelationId>,
        data: EventData,
        spec_version: u32,
    ) -> Result<AppendOutcome, WorldError>;

    /// Read the full ordered event log for a run.
    async fn list_events(&self, run_id: &RunId) -> anyhow::Result<Vec<Event>>;

    /// Fetch the materialized run view.
    async fn get_run(&self, run_id: &RunId) -> anyhow::Result<Option<Run>>;

    /// Fetch a step by its correlation id.
    async fn get_step(&self, step_id: &CorrelationId) -> anyhow::Result<Option<Step>>;

    /// Fetch a hook by its correlation id.
    async fn get_hook(&self, hook_id: &CorrelationId) -> anyhow::Result<Option<Hook>>;

    /// Fetch a hook by its externally-addressable token.
    async fn get_hook_by_token(&self, token: &str) -> anyhow::Result<Option<Hook>>;

    /// Fetch a wait by its correlation id.
    async fn get_wait(&self, wait_id: &CorrelationId) -> anyhow::Result<Option<Wait>>;

    /// Resolve the per-run AES-256-GCM key, if the backend manages
    /// encryption centrally (§4.A, §4.I).
    async fn encryption_key_for_run(&self, run_id: &RunId) -> anyhow::Result<Option<[u8; 32]>>;

    /// The deployment identifier this `World` instance serves.
    fn deployment_id(&self) -> &str;
}
