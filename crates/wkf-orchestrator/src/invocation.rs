//! Invocation-queue items and the `Suspension`/`Interrupt` control-flow
//! values standing in for a thrown-exception sentinel (§4.D, §9).

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use wkf_types::{CorrelationId, SerializedData, WorkflowError};

/// One pending await, keyed by its correlation id in [`super::context::OrchestratorContext`].
///
/// Mirrors the three invocation-queue item shapes in §3: these are never
/// persisted themselves, only the events they wait on are.
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationItem {
    /// Awaiting a step's terminal event.
    Step {
        /// Registered step function name.
        step_name: String,
        /// Serialized step arguments, needed to (re-)append `step_created`.
        input: SerializedData,
        /// Whether `step_created` has already been observed for this id.
        has_created_event: bool,
    },
    /// Awaiting payloads on a hook.
    Hook {
        /// Token this hook is addressed by.
        token: String,
        /// Optional metadata captured at creation time.
        metadata: Option<SerializedData>,
        /// Whether `hook_created` (or `hook_conflict`) has been observed.
        has_created_event: bool,
    },
    /// Awaiting a timed wait's completion.
    Wait {
        /// Absolute wall time the wait should resume at.
        resume_at: DateTime<Utc>,
        /// Whether `wait_created` has already been observed.
        has_created_event: bool,
    },
}

/// The invocation queue snapshot captured when a workflow suspends.
///
/// Handed to the suspension handler (§4.F) to durably record whichever
/// `*_created` events are still missing and to schedule the re-invocation.
#[derive(Debug, Clone, Default)]
pub struct Suspension {
    /// Pending invocations, in the order they were first registered.
    pub invocations: IndexMap<CorrelationId, InvocationItem>,
}

/// Marker propagated with `?` from a consumer factory when it cannot
/// resolve from the log snapshot it was given and the workflow must yield
/// control back to the host.
///
/// Rust has no cheap unchecked throw, so suspension is modeled as an
/// explicit effect threaded up the `async fn` call stack via `?` rather
/// than unwound as an exception.
#[derive(Debug, Clone, Copy)]
pub struct Suspend;

/// What a registered workflow function returns in place of its real output
/// when it cannot complete the current invocation.
#[derive(Debug)]
pub enum Interrupt {
    /// The workflow has at least one unresolved await; suspend it.
    Suspend,
    /// The workflow failed in a way the orchestrator must record as
    /// `run_failed` rather than retry (§7 item 4/5).
    Fatal(WorkflowError),
}

impl From<Suspend> for Interrupt {
    fn from(_: Suspend) -> Self {
        Interrupt::Suspend
    }
}

impl From<WorkflowError> for Interrupt {
    fn from(err: WorkflowError) -> Self {
        Interrupt::Fatal(err)
    }
}

/// What one orchestrator invocation produced (§4.D/§9's `WorkflowOutcome`).
#[derive(Debug)]
pub enum WorkflowOutcome {
    /// The workflow function returned; its result should be recorded as
    /// `run_completed`.
    Completed(SerializedData),
    /// The workflow suspended; `Suspension` should be handed to §4.F.
    Suspended(Suspension),
}
