#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wkf-orchestrator** – Deterministic orchestrator core for the workflow
//! runtime (§4.C, §4.D, §4.E, §9).
//!
//! Grounded on `toka-kernel`'s split between a pure, deterministic state
//! machine and a process-wide handler registry (`toka-kernel/src/lib.rs`,
//! `toka-kernel/src/registry.rs`): [`registry`] mirrors
//! `register_handler`/`dispatch` exactly, generalized from synchronous
//! opcode handlers to workflow futures, while [`context`], [`consumer`], and
//! [`factories`] play the role `toka-kernel`'s `WorldState`/handler methods
//! play — a state machine driven purely by its input (here, one run's event
//! log snapshot) with no hidden I/O.
//!
//! This crate never touches storage or the queue directly: it is handed a
//! log snapshot and a clock, and it returns either a completed result or a
//! [`Suspension`] for the runtime crate (§4.F, §4.G) to act on. Replaying
//! the same log through [`invoke`] twice is required to produce the same
//! [`WorkflowOutcome`] — that determinism is the entire point of keeping
//! this crate free of ambient state.

pub mod consumer;
pub mod context;
pub mod factories;
pub mod invocation;
pub mod registry;

pub use consumer::{ConsumerOutcome, EventsConsumer};
pub use context::{OrchestratorContext, ReplayClock};
pub use factories::{await_step, sleep_until, HookHandle};
pub use invocation::{Interrupt, InvocationItem, Suspend, Suspension, WorkflowOutcome};
pub use registry::{lookup, register, WorkflowFn, WorkflowFuture};

use wkf_types::{SerializedData, WorkflowError};

/// Drive one orchestrator invocation: run `workflow` against `ctx` to
/// completion or suspension.
///
/// This is the trampoline named in §9: since Rust has no cheap unchecked
/// throw, `workflow` signals "must suspend" by returning
/// `Err(Interrupt::Suspend)` through ordinary `?`-propagation from whichever
/// consumer factory it was awaiting, rather than throwing. This function is
/// the single place that turns that propagated value into a concrete
/// [`Suspension`], snapshotting the context's invocation queue at the
/// moment it catches it.
pub async fn invoke(
    workflow: WorkflowFn,
    mut ctx: OrchestratorContext,
    input: SerializedData,
) -> Result<WorkflowOutcome, WorkflowError> {
    match workflow(&mut ctx, input).await {
        Ok(output) => Ok(WorkflowOutcome::Completed(output)),
        Err(Interrupt::Suspend) => Ok(WorkflowOutcome::Suspended(Suspension {
            invocations: ctx.invocations_snapshot(),
        })),
        Err(Interrupt::Fatal(err)) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use wkf_types::{RunId, CURRENT_SPEC_VERSION};

    fn input() -> SerializedData {
        SerializedData { spec_version: CURRENT_SPEC_VERSION, encrypted: false, bytes: vec![] }
    }

    #[tokio::test]
    async fn workflow_with_one_unresolved_step_suspends() {
        let handler: WorkflowFn = Arc::new(|ctx, input| {
            Box::pin(async move {
                let result = await_step(ctx, "do_thing", input).await?;
                Ok(result)
            })
        });
        let ctx = OrchestratorContext::new(RunId::new("wrun_invoke_test").unwrap(), CURRENT_SPEC_VERSION, Vec::new(), Utc::now(), None);
        let outcome = invoke(handler, ctx, input()).await.unwrap();
        match outcome {
            WorkflowOutcome::Suspended(suspension) => assert_eq!(suspension.invocations.len(), 1),
            WorkflowOutcome::Completed(_) => panic!("expected suspension"),
        }
    }

    #[tokio::test]
    async fn workflow_with_no_awaits_completes() {
        let handler: WorkflowFn = Arc::new(|_ctx, input| Box::pin(async move { Ok(input) }));
        let ctx = OrchestratorContext::new(RunId::new("wrun_invoke_test").unwrap(), CURRENT_SPEC_VERSION, Vec::new(), Utc::now(), None);
        let outcome = invoke(handler, ctx, input()).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Completed(_)));
    }
}
