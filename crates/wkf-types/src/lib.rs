#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-types** – Core data model for the durable workflow runtime.
//!
//! This crate defines the entities (`Run`, `Step`, `Hook`, `Wait`), the event
//! log's `Event`/`EventType` discriminated union, correlation identifiers, and
//! the error taxonomy shared by every other crate in the workspace. It has no
//! I/O and no async dependency so that it can sit at the bottom of the
//! dependency graph and be depended on by storage drivers, the orchestrator,
//! and the runtime alike.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Size / length guards
//─────────────────────────────

/// Maximum length of a workflow name.
pub const MAX_WORKFLOW_NAME_LEN: usize = 256;
/// Maximum length of a step name.
pub const MAX_STEP_NAME_LEN: usize = 256;
/// Maximum length of a hook token.
pub const MAX_HOOK_TOKEN_LEN: usize = 512;
/// Maximum length of a structured error message before truncation in logs.
pub const MAX_ERROR_MESSAGE_LEN: usize = 8192;
/// Current binary spec version written by this runtime.
pub const CURRENT_SPEC_VERSION: u32 = 2;
/// Legacy JSON spec version still accepted on read.
pub const LEGACY_SPEC_VERSION: u32 = 1;

//─────────────────────────────
//  Identifiers
//─────────────────────────────

/// Identifier for a workflow run, client-generated as `"wrun_" + ULID`.
///
/// Runs are identified client-side (see [`crate`] docs on `start()`) so the
/// caller can correlate the call with the persisted run before the first
/// event round-trip completes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub String);

impl RunId {
    /// Wrap a raw id string, validating it looks like a run id.
    pub fn new(raw: impl Into<String>) -> anyhow::Result<Self> {
        let raw = raw.into();
        if !raw.starts_with("wrun_") {
            anyhow::bail!("run id must start with 'wrun_', got {raw}");
        }
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A content-addressed correlation identifier shared by an invocation's
/// `*_created` event and every subsequent event for the same intent.
///
/// Correlation ids are derived deterministically from call-site position
/// within a run (never randomly generated) so that replaying the same log
/// produces the same ids and therefore the same idempotency keys on the
/// queue (§4.D, §9 of the governing design notes).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Derive a correlation id from a run id and a zero-based call-site index.
    ///
    /// `kind` distinguishes step/hook/wait correlation ids that happen to
    /// share the same call-site index within one run.
    pub fn derive(run_id: &RunId, kind: &str, call_site_index: u32) -> Self {
        Self(format!("{}:{}:{}", run_id.0, kind, call_site_index))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//─────────────────────────────
//  Run
//─────────────────────────────

/// Lifecycle status of a [`Run`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet picked up by the orchestrator.
    Pending,
    /// At least one orchestrator invocation has started.
    Running,
    /// Terminal: `run_completed` observed.
    Completed,
    /// Terminal: `run_failed` observed.
    Failed,
    /// Terminal: `run_cancelled` observed.
    Cancelled,
}

impl RunStatus {
    /// Whether this status is terminal (no further events may be appended).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single workflow invocation, materialized from its event log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Run {
    /// Client-generated run identifier.
    pub run_id: RunId,
    /// Registered workflow name this run executes.
    pub workflow_name: String,
    /// Deployment this run belongs to.
    pub deployment_id: String,
    /// Monotonic spec version the run was created under.
    pub spec_version: u32,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Serialized workflow arguments.
    pub input: SerializedData,
    /// Serialized workflow return value, present once completed.
    pub output: Option<SerializedData>,
    /// Structured error, present once failed.
    pub error: Option<StructuredError>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status-changing event timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Construct a fresh, pending run, validating name lengths.
    pub fn new(
        run_id: RunId,
        workflow_name: impl Into<String>,
        deployment_id: impl Into<String>,
        spec_version: u32,
        input: SerializedData,
    ) -> anyhow::Result<Self> {
        let workflow_name = workflow_name.into();
        if workflow_name.is_empty() || workflow_name.len() > MAX_WORKFLOW_NAME_LEN {
            anyhow::bail!("workflow name length out of bounds: {}", workflow_name.len());
        }
        let now = Utc::now();
        Ok(Self {
            run_id,
            workflow_name,
            deployment_id: deployment_id.into(),
            spec_version,
            status: RunStatus::Pending,
            input,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

//─────────────────────────────
//  Step
//─────────────────────────────

/// Lifecycle status of a [`Step`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// `step_created` observed, not yet started.
    Pending,
    /// `step_started` observed for the current attempt.
    Running,
    /// Terminal: `step_completed` observed.
    Completed,
    /// Terminal: `step_failed` observed.
    Failed,
}

/// A side-effectful user function invocation, memoized in the event log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Correlation id scoping this step within its run.
    pub step_id: CorrelationId,
    /// Owning run.
    pub run_id: RunId,
    /// Registered step function name.
    pub step_name: String,
    /// Current lifecycle status.
    pub status: StepStatus,
    /// Current attempt number, starting at 1.
    pub attempt: u32,
    /// Serialized step arguments.
    pub input: SerializedData,
    /// Serialized step result, present once completed.
    pub result: Option<SerializedData>,
    /// Structured error, present on failure or while retrying.
    pub error: Option<StructuredError>,
    /// Optional explicit retry delay requested by the step's own logic.
    pub retry_after: Option<Duration>,
}

impl Step {
    /// Construct a fresh, pending step, validating name length.
    pub fn new(
        step_id: CorrelationId,
        run_id: RunId,
        step_name: impl Into<String>,
        input: SerializedData,
    ) -> anyhow::Result<Self> {
        let step_name = step_name.into();
        if step_name.is_empty() || step_name.len() > MAX_STEP_NAME_LEN {
            anyhow::bail!("step name length out of bounds: {}", step_name.len());
        }
        Ok(Self {
            step_id,
            run_id,
            step_name,
            status: StepStatus::Pending,
            attempt: 1,
            input,
            result: None,
            error: None,
            retry_after: None,
        })
    }
}

//─────────────────────────────
//  Hook
//─────────────────────────────

/// A hook's lifecycle, tracked to enforce token uniqueness (§3 invariant 4).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    /// `hook_created` observed, awaiting external delivery.
    Live,
    /// Terminal: `hook_disposed` observed.
    Disposed,
    /// Terminal: creation lost a token race, `hook_conflict` observed.
    Conflicted,
}

/// An externally-resumable suspension point, addressed by a human-meaningful token.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Hook {
    /// Correlation id for this hook's invocation queue entry.
    pub hook_id: CorrelationId,
    /// Owning run.
    pub run_id: RunId,
    /// Caller-supplied or generated token. Unique among live hooks process-wide.
    pub token: String,
    /// Current lifecycle status.
    pub status: HookStatus,
    /// Optional metadata captured at creation time.
    pub metadata: Option<SerializedData>,
}

impl Hook {
    /// Construct a fresh, live hook, validating token length.
    pub fn new(
        hook_id: CorrelationId,
        run_id: RunId,
        token: impl Into<String>,
        metadata: Option<SerializedData>,
    ) -> anyhow::Result<Self> {
        let token = token.into();
        if token.is_empty() || token.len() > MAX_HOOK_TOKEN_LEN {
            anyhow::bail!("hook token length out of bounds: {}", token.len());
        }
        Ok(Self {
            hook_id,
            run_id,
            token,
            status: HookStatus::Live,
            metadata,
        })
    }
}

//─────────────────────────────
//  Wait
//─────────────────────────────

/// A timed suspension point scheduled via delayed queue delivery.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Wait {
    /// Correlation id for this wait's invocation queue entry.
    pub wait_id: CorrelationId,
    /// Owning run.
    pub run_id: RunId,
    /// Absolute wall time at which the wait should complete.
    pub resume_at: DateTime<Utc>,
    /// Whether `wait_completed` has been observed.
    pub completed: bool,
}

//─────────────────────────────
//  Events
//─────────────────────────────

/// Discriminant for every event type the log may contain.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Run created; always the first event for a run.
    RunCreated,
    /// Run reached its terminal success state.
    RunCompleted,
    /// Run reached its terminal failure state.
    RunFailed,
    /// Run was cancelled by an external caller.
    RunCancelled,
    /// Step invocation queue entry persisted.
    StepCreated,
    /// Step execution attempt began.
    StepStarted,
    /// Step reached a terminal success state.
    StepCompleted,
    /// Step reached a terminal failure state.
    StepFailed,
    /// Step failed but will be retried.
    StepRetrying,
    /// Hook invocation queue entry persisted.
    HookCreated,
    /// Hook creation lost a token race.
    HookConflict,
    /// External caller delivered a payload to a hook.
    HookReceived,
    /// Hook stream was closed.
    HookDisposed,
    /// Wait invocation queue entry persisted.
    WaitCreated,
    /// Wait's scheduled time elapsed.
    WaitCompleted,
}

impl EventType {
    /// Whether this event type is a `*_created` event starting a new correlation id.
    pub fn is_created(self) -> bool {
        matches!(
            self,
            Self::RunCreated | Self::StepCreated | Self::HookCreated | Self::WaitCreated
        )
    }

    /// Whether this event type terminates the run as a whole.
    pub fn is_run_terminal(self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunFailed | Self::RunCancelled)
    }

    /// Whether this event type terminates its correlation id (step/hook/wait scoped).
    pub fn is_correlation_terminal(self) -> bool {
        matches!(
            self,
            Self::StepCompleted
                | Self::StepFailed
                | Self::HookDisposed
                | Self::HookConflict
                | Self::WaitCompleted
        ) || self.is_run_terminal()
    }
}

/// Typed payload carried by an [`Event`], discriminated by [`EventType`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    /// Payload for [`EventType::RunCreated`].
    RunCreated {
        /// Registered workflow name.
        workflow_name: String,
        /// Serialized workflow arguments.
        input: SerializedData,
    },
    /// Payload for [`EventType::RunCompleted`].
    RunCompleted {
        /// Serialized workflow return value.
        output: SerializedData,
    },
    /// Payload for [`EventType::RunFailed`].
    RunFailed {
        /// Structured failure information.
        error: StructuredError,
    },
    /// Payload for [`EventType::RunCancelled`].
    RunCancelled {
        /// Optional human-readable reason.
        reason: Option<String>,
    },
    /// Payload for [`EventType::StepCreated`].
    StepCreated {
        /// Registered step function name.
        step_name: String,
        /// Serialized step arguments.
        input: SerializedData,
    },
    /// Payload for [`EventType::StepStarted`].
    StepStarted {
        /// Attempt number starting at 1.
        attempt: u32,
    },
    /// Payload for [`EventType::StepCompleted`].
    StepCompleted {
        /// Serialized step result.
        result: SerializedData,
    },
    /// Payload for [`EventType::StepFailed`].
    StepFailed {
        /// Structured failure information.
        error: StructuredError,
    },
    /// Payload for [`EventType::StepRetrying`].
    StepRetrying {
        /// Structured failure information for the failed attempt.
        error: StructuredError,
        /// Optional explicit delay before the next attempt.
        retry_after: Option<Duration>,
    },
    /// Payload for [`EventType::HookCreated`].
    HookCreated {
        /// Token this hook is addressed by.
        token: String,
        /// Optional metadata captured at creation time.
        metadata: Option<SerializedData>,
    },
    /// Payload for [`EventType::HookConflict`].
    HookConflict {
        /// Token that was already live.
        token: String,
    },
    /// Payload for [`EventType::HookReceived`].
    HookReceived {
        /// Serialized payload delivered by the external caller.
        payload: SerializedData,
    },
    /// Payload for [`EventType::HookDisposed`].
    HookDisposed,
    /// Payload for [`EventType::WaitCreated`].
    WaitCreated {
        /// Absolute wall time at which the wait should complete.
        resume_at: DateTime<Utc>,
    },
    /// Payload for [`EventType::WaitCompleted`].
    WaitCompleted,
}

impl EventData {
    /// The [`EventType`] this payload corresponds to.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunCreated { .. } => EventType::RunCreated,
            Self::RunCompleted { .. } => EventType::RunCompleted,
            Self::RunFailed { .. } => EventType::RunFailed,
            Self::RunCancelled { .. } => EventType::RunCancelled,
            Self::StepCreated { .. } => EventType::StepCreated,
            Self::StepStarted { .. } => EventType::StepStarted,
            Self::StepCompleted { .. } => EventType::StepCompleted,
            Self::StepFailed { .. } => EventType::StepFailed,
            Self::StepRetrying { .. } => EventType::StepRetrying,
            Self::HookCreated { .. } => EventType::HookCreated,
            Self::HookConflict { .. } => EventType::HookConflict,
            Self::HookReceived { .. } => EventType::HookReceived,
            Self::HookDisposed => EventType::HookDisposed,
            Self::WaitCreated { .. } => EventType::WaitCreated,
            Self::WaitCompleted => EventType::WaitCompleted,
        }
    }
}

/// A single, immutable, ordered log entry.
///
/// `digest` is a BLAKE3 hash over the serialized `event_data`, carried per
/// the integrity property described in the governing design notes; it is not
/// part of the distilled contract but is cheap insurance the storage drivers
/// already compute for payload deduplication.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event identifier, strictly increasing in commit order per run.
    pub event_id: u64,
    /// Owning run.
    pub run_id: RunId,
    /// Correlation id this event belongs to, if any (absent only for
    /// run-scoped events).
    pub correlation_id: Option<CorrelationId>,
    /// Typed payload.
    pub event_data: EventData,
    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
    /// Spec version this event was written under.
    pub spec_version: u32,
    /// BLAKE3 digest of the serialized payload.
    pub digest: [u8; 32],
}

impl Event {
    /// The [`EventType`] of this event.
    pub fn event_type(&self) -> EventType {
        self.event_data.event_type()
    }
}

//─────────────────────────────
//  Serialized values
//─────────────────────────────

/// An opaque, codec-produced byte blob plus the spec version it was encoded
/// under, so readers know whether to decode with `rmp-serde` or legacy JSON.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerializedData {
    /// Spec version the bytes were encoded under.
    pub spec_version: u32,
    /// Whether `bytes` is AES-256-GCM ciphertext (nonce prefix + tag suffix).
    pub encrypted: bool,
    /// Encoded bytes.
    pub bytes: Vec<u8>,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// A structured failure recorded on a terminal run/step event.
///
/// Mirrors the `message`/`stack`/`code` triple the governing design notes
/// require be preserved across the event log so replays can reconstruct an
/// equivalent error for the caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuredError {
    /// Human-readable error message, truncated to [`MAX_ERROR_MESSAGE_LEN`].
    pub message: String,
    /// Optional backtrace-like context string.
    pub stack: Option<String>,
    /// Optional machine-readable error code.
    pub code: Option<String>,
}

impl StructuredError {
    /// Build a structured error from a message, truncating if necessary.
    pub fn new(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            message.truncate(MAX_ERROR_MESSAGE_LEN);
        }
        Self {
            message,
            stack: None,
            code: None,
        }
    }

    /// Attach a machine-readable code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StructuredError {}

/// An HTTP-like error surfaced by the `World`/queue layer (§7 item 1).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP-like status code (409 conflict, 410 gone, 429 throttle, 5xx transient).
    pub status: u16,
    /// Optional machine-readable error code.
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Suggested retry delay, present on 429 responses.
    pub retry_after: Option<Duration>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api error {}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Duplicate terminal event for a correlation id that already settled.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: 409,
            code: Some("conflict".to_string()),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Append attempted against a run already in a terminal state.
    pub fn gone(message: impl Into<String>) -> Self {
        Self {
            status: 410,
            code: Some("gone".to_string()),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Throttled: caller should retry after `retry_after`.
    pub fn throttled(retry_after: Duration) -> Self {
        Self {
            status: 429,
            code: Some("throttled".to_string()),
            message: "rate limited".to_string(),
            retry_after: Some(retry_after),
        }
    }

    /// Transient server-side failure, safe to retry with backoff.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            code: Some("server_error".to_string()),
            message: message.into(),
            retry_after: None,
        }
    }

    /// `true` for 409 duplicate-terminal-event responses.
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    /// `true` for 410 run-terminated responses.
    pub fn is_gone(&self) -> bool {
        self.status == 410
    }

    /// `true` for 429 throttle responses.
    pub fn is_throttled(&self) -> bool {
        self.status == 429
    }

    /// `true` for retryable 5xx responses.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Runtime-level errors not carried as an [`ApiError`] (§7 item 4).
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// A World/queue call returned a non-2xx status.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The event log contained an event type not valid for the consumer
    /// reading it, indicating a corrupted or hand-edited log.
    #[error("log corruption: {0}")]
    LogCorruption(String),
    /// A hook creation lost a token race and the workflow has no recovery
    /// path configured (§9 Open Question resolution, see DESIGN.md).
    #[error("hook token conflict: {0}")]
    HookConflict(String),
    /// User code raised a fatal error, bypassing the step retry policy.
    #[error("fatal step error: {0}")]
    Fatal(#[from] StructuredError),
    /// Required workflow metadata (name, registry entry) was missing.
    #[error("workflow misconfigured: {0}")]
    Misconfigured(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_requires_prefix() {
        assert!(RunId::new("wrun_abc").is_ok());
        assert!(RunId::new("abc").is_err());
    }

    #[test]
    fn correlation_id_is_deterministic() {
        let run_id = RunId::new("wrun_abc").unwrap();
        let a = CorrelationId::derive(&run_id, "step", 0);
        let b = CorrelationId::derive(&run_id, "step", 0);
        assert_eq!(a, b);
        let c = CorrelationId::derive(&run_id, "step", 1);
        assert_ne!(a, c);
    }

    #[test]
    fn run_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn event_type_classification() {
        assert!(EventType::RunCreated.is_created());
        assert!(!EventType::StepStarted.is_created());
        assert!(EventType::StepCompleted.is_correlation_terminal());
        assert!(!EventType::StepStarted.is_correlation_terminal());
        assert!(EventType::RunCompleted.is_run_terminal());
    }

    #[test]
    fn structured_error_truncates() {
        let long = "x".repeat(MAX_ERROR_MESSAGE_LEN + 100);
        let err = StructuredError::new(long);
        assert_eq!(err.message.len(), MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn api_error_classification() {
        assert!(ApiError::conflict("dup").is_conflict());
        assert!(ApiError::gone("terminal").is_gone());
        assert!(ApiError::throttled(Duration::from_secs(1)).is_throttled());
        assert!(ApiError::server_error("boom").is_server_error());
    }

    #[test]
    fn event_data_round_trips_event_type() {
        let data = EventData::StepStarted { attempt: 3 };
        assert_eq!(data.event_type(), EventType::StepStarted);
        let json = serde_json::to_string(&data).unwrap();
        let back: EventData = serde_json::from_str(&json).unwrap();
        assert_eq!(data, back);
    }
}
