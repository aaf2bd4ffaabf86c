//! The per-run, per-invocation orchestrator context (§4.D): a deterministic
//! clone of the ambient environment plus the mutable state the consumer
//! factories thread their awaits through.
//!
//! Everything replay-sensitive lives here rather than behind an ambient
//! singleton (the one intentional exception being [`crate::registry`], which
//! is a registry of code, not of replay-sensitive state — see §9).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use ulid::Ulid;
use wkf_types::{CorrelationId, Event, RunId};

use crate::consumer::EventsConsumer;
use crate::invocation::InvocationItem;

/// A clock frozen to one instant for the duration of an orchestrator
/// invocation, advancing only across suspensions (§4.D).
#[derive(Clone, Copy, Debug)]
pub struct ReplayClock {
    fixed_now: DateTime<Utc>,
}

impl ReplayClock {
    /// Freeze the clock at `fixed_now`, used for this invocation only.
    pub fn new(fixed_now: DateTime<Utc>) -> Self {
        Self { fixed_now }
    }

    /// The replay-stable "current" time.
    pub fn now(&self) -> DateTime<Utc> {
        self.fixed_now
    }
}

/// A hook's live delivery state, shared between the subscribed callback and
/// the await method that reads it back (§4.E.2).
pub(crate) enum HookSignal {
    Live,
    Disposed,
    Conflicted,
}

/// Per-run, per-invocation deterministic context (§4.D).
///
/// Reseeded identically on every replay of the same run: the RNG seed is a
/// pure function of `(run_id, spec_version)`, never of wall-clock time or
/// any other ambient source, so two replays of the same log produce
/// bit-identical ids and therefore identical correlation ids.
pub struct OrchestratorContext {
    /// The run this invocation belongs to.
    pub run_id: RunId,
    spec_version: u32,
    rng: StdRng,
    clock: ReplayClock,
    call_site_counter: u32,
    encryption_key: Option<[u8; 32]>,
    pub(crate) events: EventsConsumer,
    pub(crate) invocations: IndexMap<CorrelationId, InvocationItem>,
    pub(crate) hook_buffers: HashMap<CorrelationId, Arc<Mutex<std::collections::VecDeque<wkf_types::SerializedData>>>>,
    pub(crate) hook_signal: HashMap<CorrelationId, Arc<Mutex<HookSignal>>>,
}

impl OrchestratorContext {
    /// Build a context for one invocation of `run_id`, bound to `events`
    /// (the log snapshot read at the start of this invocation, §4.A) and
    /// frozen at `now`.
    pub fn new(
        run_id: RunId,
        spec_version: u32,
        events: Vec<Event>,
        now: DateTime<Utc>,
        encryption_key: Option<[u8; 32]>,
    ) -> Self {
        let seed = deterministic_seed(&run_id, spec_version);
        Self {
            run_id,
            spec_version,
            rng: StdRng::seed_from_u64(seed),
            clock: ReplayClock::new(now),
            call_site_counter: 0,
            encryption_key,
            events: EventsConsumer::new(events),
            invocations: IndexMap::new(),
            hook_buffers: HashMap::new(),
            hook_signal: HashMap::new(),
        }
    }

    /// The replay-stable current time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The spec version this invocation is running under.
    pub fn spec_version(&self) -> u32 {
        self.spec_version
    }

    /// The per-run encryption key, if the backing `World` manages one.
    pub fn encryption_key(&self) -> Option<&[u8; 32]> {
        self.encryption_key.as_ref()
    }

    /// Derive the next deterministic correlation id for an await of kind
    /// `kind` (`"step"`, `"hook"`, or `"wait"`), advancing the call-site
    /// counter. Content-addressed, not random, per §9: the same call-site
    /// position on replay always yields the same id.
    pub fn next_correlation_id(&mut self, kind: &str) -> CorrelationId {
        let index = self.call_site_counter;
        self.call_site_counter += 1;
        CorrelationId::derive(&self.run_id, kind, index)
    }

    /// Generate a ULID from the seeded RNG and frozen clock, so replays of
    /// the same run produce bit-identical ids.
    pub fn next_ulid(&mut self) -> Ulid {
        Ulid::from_datetime_with_source(self.now().into(), &mut self.rng)
    }

    /// A mutable handle to the seeded RNG, for user code that needs
    /// replay-deterministic randomness beyond id generation.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Snapshot the current invocation queue, e.g. when constructing a
    /// [`crate::invocation::Suspension`].
    pub fn invocations_snapshot(&self) -> IndexMap<CorrelationId, InvocationItem> {
        self.invocations.clone()
    }
}

/// `(run_id, spec_version)` hashed into a 64-bit RNG seed. Not
/// cryptographic: determinism, not unpredictability, is the requirement.
fn deterministic_seed(run_id: &RunId, spec_version: u32) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    run_id.as_str().hash(&mut hasher);
    spec_version.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn run_id() -> RunId {
        RunId::new("wrun_context_test").unwrap()
    }

    #[test]
    fn same_run_and_spec_version_seed_identically() {
        let now = Utc::now();
        let mut a = OrchestratorContext::new(run_id(), 2, Vec::new(), now, None);
        let mut b = OrchestratorContext::new(run_id(), 2, Vec::new(), now, None);
        assert_eq!(a.next_ulid(), b.next_ulid());
        assert_eq!(a.rng().next_u32(), b.rng().next_u32());
    }

    #[test]
    fn correlation_ids_advance_deterministically() {
        let mut ctx = OrchestratorContext::new(run_id(), 2, Vec::new(), Utc::now(), None);
        let first = ctx.next_correlation_id("step");
        let second = ctx.next_correlation_id("step");
        assert_ne!(first, second);

        let mut replay = OrchestratorContext::new(run_id(), 2, Vec::new(), Utc::now(), None);
        assert_eq!(first, replay.next_correlation_id("step"));
        assert_eq!(second, replay.next_correlation_id("step"));
    }

    #[test]
    fn clock_is_frozen_for_the_invocation() {
        let now = Utc::now();
        let ctx = OrchestratorContext::new(run_id(), 2, Vec::new(), now, None);
        assert_eq!(ctx.now(), now);
        assert_eq!(ctx.now(), now);
    }
}
