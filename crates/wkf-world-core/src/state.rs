//! Pure, storage-agnostic entity mutation rules.
//!
//! [`apply_event`] is the single place that decides whether an incoming
//! event is a conflict, a no-op `hook_conflict` rewrite, or a legal mutation
//! of the run/step/hook/wait materialized views. Every storage backend calls
//! this function from within its own transaction so the conflict rules in
//! §4.A of the governing design notes are enforced identically regardless of
//! which backend is in use.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use wkf_types::{
    ApiError, CorrelationId, Event, EventData, EventType, Hook, HookStatus, Run, RunId,
    RunStatus, Step, StepStatus, Wait,
};

/// In-memory materialized view of one run's entities.
///
/// Storage backends load this (or keep it resident, for the in-memory
/// driver) per run, pass it through [`apply_event`], and persist the result.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunState {
    /// The run itself, `None` until `run_created` has been applied.
    pub run: Option<Run>,
    /// Steps keyed by correlation id.
    pub steps: HashMap<CorrelationId, Step>,
    /// Hooks keyed by correlation id.
    pub hooks: HashMap<CorrelationId, Hook>,
    /// Live hook tokens mapped to their owning correlation id, used to
    /// detect token races across hooks (possibly across different runs, but
    /// scoped per-run here; a process-wide index is layered on top by
    /// backends that need cross-run uniqueness).
    pub hook_tokens: HashMap<String, CorrelationId>,
    /// Waits keyed by correlation id.
    pub waits: HashMap<CorrelationId, Wait>,
}

/// Result of successfully applying one event to a [`RunState`].
pub struct ApplyOutcome {
    /// The event type actually recorded (`hook_conflict` may replace a
    /// requested `hook_created`).
    pub event_data: EventData,
    /// Updated run view, if this event touched the run.
    pub run: Option<Run>,
    /// Updated step view, if this event touched a step.
    pub step: Option<Step>,
    /// Updated hook view, if this event touched a hook.
    pub hook: Option<Hook>,
    /// Updated wait view, if this event touched a wait.
    pub wait: Option<Wait>,
}

/// Apply `data` (targeting `correlation_id`, if any) to `state`, returning
/// the outcome or the [`ApiError`] the store should surface to the caller.
///
/// `hook_token_taken` answers, for a `hook_created` event only, whether the
/// requested token is already live on *some* hook in the process (hook
/// tokens are unique process-wide per §3, not merely within one run, so the
/// caller — not this per-run state — owns that index and passes the answer
/// in).
///
/// This function never panics on well-formed input; callers that violate
/// §3's ordering invariants (e.g. a `step_started` with no prior
/// `step_created`) get a conflict-shaped error rather than a panic, since a
/// replayed log from an older spec version may legitimately be missing
/// entries the store chooses not to materialize (§4.A "legacy compatibility").
pub fn apply_event(
    state: &mut RunState,
    run_id: &RunId,
    correlation_id: Option<&CorrelationId>,
    data: EventData,
    hook_token_taken: bool,
) -> Result<ApplyOutcome, ApiError> {
    if let Some(run) = &state.run {
        if run.status.is_terminal() && !matches!(data, EventData::RunCreated { .. }) {
            return Err(ApiError::gone(format!("run {run_id} already terminated")));
        }
    }

    match data {
        EventData::RunCreated { workflow_name, input } => apply_run_created(state, run_id, workflow_name, input),
        EventData::RunCompleted { output } => apply_run_terminal(state, |r| {
            r.status = RunStatus::Completed;
            r.output = Some(output.clone());
            EventData::RunCompleted { output }
        }),
        EventData::RunFailed { error } => apply_run_terminal(state, |r| {
            r.status = RunStatus::Failed;
            r.error = Some(error.clone());
            EventData::RunFailed { error }
        }),
        EventData::RunCancelled { reason } => apply_run_terminal(state, |r| {
            r.status = RunStatus::Cancelled;
            EventData::RunCancelled { reason: reason.clone() }
        }),
        EventData::StepCreated { step_name, input } => {
            apply_step_created(state, run_id, correlation_id, step_name, input)
        }
        EventData::StepStarted { .. } => apply_step_started(state, correlation_id),
        EventData::StepCompleted { result } => apply_step_completed(state, correlation_id, result),
        EventData::StepFailed { error } => apply_step_failed(state, correlation_id, error),
        EventData::StepRetrying { error, retry_after } => {
            apply_step_retrying(state, correlation_id, error, retry_after)
        }
        EventData::HookCreated { token, metadata } => {
            apply_hook_created(state, run_id, correlation_id, token, metadata, hook_token_taken)
        }
        EventData::HookReceived { payload } => apply_hook_received(state, correlation_id, payload),
        EventData::HookDisposed => apply_hook_disposed(state, correlation_id),
        EventData::HookConflict { token } => Err(ApiError::conflict(format!(
            "hook_conflict is store-authored, not client-appendable (token {token})"
        ))),
        EventData::WaitCreated { resume_at } => {
            apply_wait_created(state, run_id, correlation_id, resume_at)
        }
        EventData::WaitCompleted => apply_wait_completed(state, correlation_id),
    }
}

fn apply_run_created(
    state: &mut RunState,
    run_id: &RunId,
    workflow_name: String,
    input: wkf_types::SerializedData,
) -> Result<ApplyOutcome, ApiError> {
    if let Some(existing) = &state.run {
        // Idempotent replay of the initial create.
        return Ok(ApplyOutcome {
            event_data: EventData::RunCreated {
                workflow_name: existing.workflow_name.clone(),
                input: existing.input.clone(),
            },
            run: Some(existing.clone()),
            step: None,
            hook: None,
            wait: None,
        });
    }
    let run = Run::new(
        run_id.clone(),
        workflow_name.clone(),
        String::new(),
        input.spec_version,
        input.clone(),
    )
    .map_err(|e| ApiError::conflict(e.to_string()))?;
    state.run = Some(run.clone());
    Ok(ApplyOutcome {
        event_data: EventData::RunCreated { workflow_name, input },
        run: Some(run),
        step: None,
        hook: None,
        wait: None,
    })
}

fn apply_run_terminal(
    state: &mut RunState,
    mutate: impl FnOnce(&mut Run) -> EventData,
) -> Result<ApplyOutcome, ApiError> {
    let run = state
        .run
        .as_mut()
        .ok_or_else(|| ApiError::conflict("run not created"))?;
    let event_data = mutate(run);
    run.updated_at = Utc::now();
    Ok(ApplyOutcome {
        event_data,
        run: Some(run.clone()),
        step: None,
        hook: None,
        wait: None,
    })
}

fn require_correlation(correlation_id: Option<&CorrelationId>) -> Result<&CorrelationId, ApiError> {
    correlation_id.ok_or_else(|| ApiError::conflict("missing correlation id"))
}

fn apply_step_created(
    state: &mut RunState,
    run_id: &RunId,
    correlation_id: Option<&CorrelationId>,
    step_name: String,
    input: wkf_types::SerializedData,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    if state.steps.contains_key(&id) {
        return Err(ApiError::conflict(format!("step {id} already created")));
    }
    let step = Step::new(id.clone(), run_id.clone(), step_name.clone(), input.clone())
        .map_err(|e| ApiError::conflict(e.to_string()))?;
    state.steps.insert(id, step.clone());
    Ok(ApplyOutcome {
        event_data: EventData::StepCreated { step_name, input },
        run: None,
        step: Some(step),
        hook: None,
        wait: None,
    })
}

fn apply_step_started(
    state: &mut RunState,
    correlation_id: Option<&CorrelationId>,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    let step = state
        .steps
        .get_mut(&id)
        .ok_or_else(|| ApiError::conflict(format!("step {id} not created")))?;
    step.status = StepStatus::Running;
    let attempt = step.attempt;
    Ok(ApplyOutcome {
        event_data: EventData::StepStarted { attempt },
        run: None,
        step: Some(step.clone()),
        hook: None,
        wait: None,
    })
}

fn apply_step_completed(
    state: &mut RunState,
    correlation_id: Option<&CorrelationId>,
    result: wkf_types::SerializedData,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    let step = state
        .steps
        .get_mut(&id)
        .ok_or_else(|| ApiError::conflict(format!("step {id} not created")))?;
    if step.status == StepStatus::Completed || step.status == StepStatus::Failed {
        return Err(ApiError::conflict(format!("step {id} already terminal")));
    }
    step.status = StepStatus::Completed;
    step.result = Some(result.clone());
    step.error = None;
    Ok(ApplyOutcome {
        event_data: EventData::StepCompleted { result },
        run: None,
        step: Some(step.clone()),
        hook: None,
        wait: None,
    })
}

fn apply_step_failed(
    state: &mut RunState,
    correlation_id: Option<&CorrelationId>,
    error: wkf_types::StructuredError,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    let step = state
        .steps
        .get_mut(&id)
        .ok_or_else(|| ApiError::conflict(format!("step {id} not created")))?;
    if step.status == StepStatus::Completed || step.status == StepStatus::Failed {
        return Err(ApiError::conflict(format!("step {id} already terminal")));
    }
    step.status = StepStatus::Failed;
    step.error = Some(error.clone());
    Ok(ApplyOutcome {
        event_data: EventData::StepFailed { error },
        run: None,
        step: Some(step.clone()),
        hook: None,
        wait: None,
    })
}

fn apply_step_retrying(
    state: &mut RunState,
    correlation_id: Option<&CorrelationId>,
    error: wkf_types::StructuredError,
    retry_after: Option<std::time::Duration>,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    let step = state
        .steps
        .get_mut(&id)
        .ok_or_else(|| ApiError::conflict(format!("step {id} not created")))?;
    if step.status == StepStatus::Completed || step.status == StepStatus::Failed {
        return Err(ApiError::conflict(format!("step {id} already terminal")));
    }
    step.status = StepStatus::Pending;
    step.attempt += 1;
    step.error = Some(error.clone());
    step.retry_after = retry_after;
    Ok(ApplyOutcome {
        event_data: EventData::StepRetrying { error, retry_after },
        run: None,
        step: Some(step.clone()),
        hook: None,
        wait: None,
    })
}

fn apply_hook_created(
    state: &mut RunState,
    run_id: &RunId,
    correlation_id: Option<&CorrelationId>,
    token: String,
    metadata: Option<wkf_types::SerializedData>,
    hook_token_taken: bool,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    if state.hooks.contains_key(&id) {
        return Err(ApiError::conflict(format!("hook {id} already created")));
    }
    if hook_token_taken || state.hook_tokens.contains_key(&token) {
        // Not an error: the store records a hook_conflict event instead.
        return Ok(ApplyOutcome {
            event_data: EventData::HookConflict { token },
            run: None,
            step: None,
            hook: None,
            wait: None,
        });
    }
    let hook = Hook::new(id.clone(), run_id.clone(), token.clone(), metadata.clone())
        .map_err(|e| ApiError::conflict(e.to_string()))?;
    state.hooks.insert(id, hook.clone());
    state.hook_tokens.insert(token.clone(), hook.hook_id.clone());
    Ok(ApplyOutcome {
        event_data: EventData::HookCreated { token, metadata },
        run: None,
        step: None,
        hook: Some(hook),
        wait: None,
    })
}

fn apply_hook_received(
    state: &mut RunState,
    correlation_id: Option<&CorrelationId>,
    payload: wkf_types::SerializedData,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    let hook = state
        .hooks
        .get_mut(&id)
        .ok_or_else(|| ApiError::conflict(format!("hook {id} not created")))?;
    if hook.status != HookStatus::Live {
        return Err(ApiError::conflict(format!("hook {id} not live")));
    }
    Ok(ApplyOutcome {
        event_data: EventData::HookReceived { payload },
        run: None,
        step: None,
        hook: Some(hook.clone()),
        wait: None,
    })
}

fn apply_hook_disposed(
    state: &mut RunState,
    correlation_id: Option<&CorrelationId>,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    let hook = state
        .hooks
        .get_mut(&id)
        .ok_or_else(|| ApiError::conflict(format!("hook {id} not created")))?;
    if hook.status != HookStatus::Live {
        return Err(ApiError::conflict(format!("hook {id} already terminal")));
    }
    hook.status = HookStatus::Disposed;
    state.hook_tokens.remove(&hook.token);
    Ok(ApplyOutcome {
        event_data: EventData::HookDisposed,
        run: None,
        step: None,
        hook: Some(hook.clone()),
        wait: None,
    })
}

fn apply_wait_created(
    state: &mut RunState,
    run_id: &RunId,
    correlation_id: Option<&CorrelationId>,
    resume_at: chrono::DateTime<Utc>,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    if state.waits.contains_key(&id) {
        return Err(ApiError::conflict(format!("wait {id} already created")));
    }
    let wait = Wait {
        wait_id: id.clone(),
        run_id: run_id.clone(),
        resume_at,
        completed: false,
    };
    state.waits.insert(id, wait.clone());
    Ok(ApplyOutcome {
        event_data: EventData::WaitCreated { resume_at },
        run: None,
        step: None,
        hook: None,
        wait: Some(wait),
    })
}

fn apply_wait_completed(
    state: &mut RunState,
    correlation_id: Option<&CorrelationId>,
) -> Result<ApplyOutcome, ApiError> {
    let id = require_correlation(correlation_id)?.clone();
    let wait = state
        .waits
        .get_mut(&id)
        .ok_or_else(|| ApiError::conflict(format!("wait {id} not created")))?;
    if wait.completed {
        return Err(ApiError::conflict(format!("wait {id} already completed")));
    }
    wait.completed = true;
    Ok(ApplyOutcome {
        event_data: EventData::WaitCompleted,
        run: None,
        step: None,
        hook: None,
        wait: Some(wait.clone()),
    })
}

/// Construct an [`Event`] record from an applied outcome, computing its
/// integrity digest (§2.2).
pub fn build_event(
    event_id: u64,
    run_id: RunId,
    correlation_id: Option<CorrelationId>,
    event_data: EventData,
    spec_version: u32,
) -> anyhow::Result<Event> {
    let bytes = rmp_serde::to_vec_named(&event_data)?;
    let digest = crate::causal_hash(&bytes);
    Ok(Event {
        event_id,
        run_id,
        correlation_id,
        event_data,
        created_at: Utc::now(),
        spec_version,
        digest,
    })
}
