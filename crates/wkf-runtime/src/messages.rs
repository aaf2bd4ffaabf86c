//! Payload shapes carried on the two queue families from §4.B:
//! `__wkf_workflow_<name>` and `__wkf_step_<name>`.
//!
//! These are plain JSON over the wire (not run through `wkf-codec`): they
//! are runtime-internal routing envelopes, never the user's own step
//! arguments or workflow input, so there is nothing here that needs
//! per-run encryption or the binary/legacy split.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of a message on a `__wkf_workflow_<name>` queue: "go invoke (or
/// re-invoke) this run's orchestrator."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowInvocationMessage {
    /// The run to invoke.
    pub run_id: String,
    /// Opaque trace/propagation headers threaded from whatever enqueued
    /// this message (`start()`, a step's continuation, a suspension).
    #[serde(default)]
    pub trace_carrier: HashMap<String, String>,
}

/// Body of a message on a `__wkf_step_<name>` queue: "go run this step
/// attempt."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepInvocationMessage {
    /// Registered step function name, also recoverable from the queue name
    /// but carried here so the handler need not parse it back out.
    pub step_name: String,
    /// Owning run, so the handler can report back and re-enqueue the
    /// workflow invocation once the step settles.
    pub workflow_run_id: String,
    /// Registered workflow name, needed to address the continuation's
    /// `__wkf_workflow_<name>` queue.
    pub workflow_name: String,
    /// The run's creation time, carried for observability; not used for any
    /// replay-sensitive decision (that lives entirely in the event log).
    pub workflow_started_at: DateTime<Utc>,
    /// Correlation id of the step this message drives.
    pub step_id: String,
    /// Opaque trace/propagation headers.
    #[serde(default)]
    pub trace_carrier: HashMap<String, String>,
    /// When this attempt was requested, for latency observability.
    pub requested_at: DateTime<Utc>,
}
