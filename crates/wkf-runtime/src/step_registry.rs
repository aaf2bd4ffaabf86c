//! Process-wide registry of step functions (§2.2, mirroring
//! `wkf_orchestrator::registry`'s workflow registry one layer down).
//!
//! A step function receives its arguments already stripped of transport
//! encryption (still codec-encoded — it decodes to its own type via
//! `wkf_codec::decode`) and returns a codec-encoded result or a structured
//! error; encryption of the result back up is the step handler's job.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use wkf_types::{SerializedData, StructuredError, WorkflowError};

/// The future a registered step function returns.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<SerializedData, StructuredError>> + Send>>;

/// A registered step function: given decrypted, codec-encoded arguments,
/// performs the side effect and returns a decrypted, codec-encoded result.
pub type StepFn = Arc<dyn Fn(SerializedData) -> StepFuture + Send + Sync>;

/// A registry entry: the function itself plus how many attempts it may
/// take before the step handler gives up and records `step_failed`.
#[derive(Clone)]
pub struct StepEntry {
    /// The registered function.
    pub handler: StepFn,
    /// Maximum attempts, including the first (§4.G "attempt accounting").
    pub max_attempts: u32,
}

/// Default attempt budget for a step registered without an explicit one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

static REGISTRY: Lazy<RwLock<HashMap<String, StepEntry>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Register `handler` under `step_name` with [`DEFAULT_MAX_ATTEMPTS`].
pub fn register(step_name: impl Into<String>, handler: StepFn) -> Result<(), WorkflowError> {
    register_with_max_attempts(step_name, handler, DEFAULT_MAX_ATTEMPTS)
}

/// Register `handler` under `step_name` with an explicit attempt budget.
pub fn register_with_max_attempts(
    step_name: impl Into<String>,
    handler: StepFn,
    max_attempts: u32,
) -> Result<(), WorkflowError> {
    REGISTRY
        .write()
        .map_err(|_| WorkflowError::Misconfigured("step registry lock poisoned".to_string()))?
        .insert(step_name.into(), StepEntry { handler, max_attempts: max_attempts.max(1) });
    Ok(())
}

/// Look up the entry registered under `step_name`. Absence is surfaced to
/// the caller rather than treated as fatal here: the step handler records
/// it as a non-retryable `step_failed` (§4.G), since a missing registration
/// is a deployment mismatch, not something retrying would fix.
pub fn lookup(step_name: &str) -> Option<StepEntry> {
    REGISTRY.read().ok()?.get(step_name).cloned()
}
