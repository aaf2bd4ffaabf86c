#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-facade** – `start()`/`Run<T>` and the rest of the user-facing
//! runtime surface (§4.H, §6).
//!
//! Everything below this crate — `wkf-orchestrator`'s deterministic replay
//! core, `wkf-runtime`'s suspension/step handlers, the `World`/`Queue`
//! drivers — is plumbing a caller should never need to touch directly.
//! This crate is the one public entry point: [`start`] creates a run and
//! returns a [`Run`] handle; [`hooks::resume_hook`] and [`hooks::cancel_run`]
//! act on a run from outside it; [`sleep`] and the re-exported
//! `HookHandle`/`register` are what user workflow code calls from inside.
//!
//! Grounded on `toka-orchestration`'s top-level `OrchestrationEngine`
//! surface: one entry point that hides a multi-crate pipeline behind a
//! handle with a completion accessor (here, [`Run::return_value`]).

pub mod error;
pub mod hooks;
pub mod run;
pub mod start;
pub mod stream;

pub use error::{FacadeError, ReturnValueError, RunFailedError, RunNotCompletedError};
pub use hooks::{cancel_run, resume_hook};
pub use run::Run;
pub use start::{start, StartOptions, WorkflowMeta};
pub use stream::StreamSink;

// Re-exported so a workflow author never has to depend on `wkf-orchestrator`
// directly for the handful of symbols user code actually calls.
pub use wkf_orchestrator::{await_step, register, sleep_until, HookHandle, WorkflowFn};
pub use wkf_runtime::step_registry::{register as register_step, register_with_max_attempts as register_step_with_max_attempts};

use chrono::Duration;
use wkf_orchestrator::{Interrupt, OrchestratorContext};

/// `sleep(duration)` (§6): suspend the calling workflow for `duration`,
/// relative to the replay-deterministic clock rather than wall time.
///
/// A thin wrapper over [`sleep_until`], which takes an absolute deadline —
/// kept separate in `wkf-orchestrator` since the suspension handler only
/// ever needs the absolute `resumeAt` it persists on `wait_created`.
pub async fn sleep(ctx: &mut OrchestratorContext, duration: Duration) -> Result<(), Interrupt> {
    let resume_at = ctx.now() + duration;
    sleep_until(ctx, resume_at).await
}
