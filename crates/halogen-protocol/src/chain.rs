//! Correlation identifiers.
//!
//! A [`Chain`] names one causal sequence of events. The context half identifies
//! the origin (0 for the process itself, one fresh value per remote connection)
//! and the flow half sequences unrelated chains inside that origin.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Context owned by the running process.
pub const PROCESS_CONTEXT: u64 = 0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Chain {
    pub context: u64,
    pub flow: u64,
}

impl Chain {
    pub fn new(context: u64, flow: u64) -> Self {
        Self { context, flow }
    }

    pub fn is_process(&self) -> bool {
        self.context == PROCESS_CONTEXT
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.context, self.flow)
    }
}

/// Whether released contexts may be handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPolicy {
    /// Contexts only ever increase and are never reissued.
    #[default]
    Monotonic,
    /// Released contexts are reissued, lowest first, with their flow reset.
    Recycle,
}

impl ContextPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextPolicy::Monotonic => "monotonic",
            ContextPolicy::Recycle => "recycle",
        }
    }
}

/// Source of chains, shared by every component that starts new causal sequences.
pub trait ChainSource: Send + Sync {
    /// Allocate a fresh context and return its first chain (flow 0).
    fn new_context(&self) -> Chain;

    /// Issue the next flow of `context`.
    fn next_in(&self, context: u64) -> Chain;

    /// The most recently issued chain of `context`, if any.
    fn current(&self, context: u64) -> Option<Chain>;

    /// Seed the flow counter of `chain.context` so later flows follow `chain`.
    fn adopt(&self, chain: Chain);

    /// Forget `context`. Recycling allocators may issue it again.
    fn release(&self, context: u64);

    /// Chain for an event caused by `cause`, or a new process chain when there is none.
    fn next(&self, cause: Option<&Event>) -> Chain {
        match cause {
            Some(event) => event.chain,
            None => self.next_in(PROCESS_CONTEXT),
        }
    }
}

#[derive(Debug)]
struct AllocatorState {
    next_context: u64,
    /// Next flow to issue per context.
    flows: HashMap<u64, u64>,
    released: BTreeSet<u64>,
}

/// Default [`ChainSource`], a pair of counters behind one lock.
#[derive(Debug)]
pub struct ChainAllocator {
    policy: ContextPolicy,
    state: Mutex<AllocatorState>,
}

impl Default for ChainAllocator {
    fn default() -> Self {
        Self::new(ContextPolicy::default())
    }
}

impl ChainAllocator {
    pub fn new(policy: ContextPolicy) -> Self {
        let mut flows = HashMap::new();
        flows.insert(PROCESS_CONTEXT, 0);
        Self {
            policy,
            state: Mutex::new(AllocatorState {
                next_context: PROCESS_CONTEXT + 1,
                flows,
                released: BTreeSet::new(),
            }),
        }
    }

    pub fn policy(&self) -> ContextPolicy {
        self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChainSource for ChainAllocator {
    fn new_context(&self) -> Chain {
        let mut state = self.lock();
        let reused = match self.policy {
            ContextPolicy::Recycle => state.released.pop_first(),
            ContextPolicy::Monotonic => None,
        };
        let context = match reused {
            Some(context) => context,
            None => {
                let context = state.next_context;
                state.next_context += 1;
                context
            }
        };
        state.flows.insert(context, 1);
        Chain::new(context, 0)
    }

    fn next_in(&self, context: u64) -> Chain {
        let mut state = self.lock();
        let flow = state.flows.entry(context).or_insert(0);
        let chain = Chain::new(context, *flow);
        *flow += 1;
        chain
    }

    fn current(&self, context: u64) -> Option<Chain> {
        let state = self.lock();
        match state.flows.get(&context) {
            Some(&next) if next > 0 => Some(Chain::new(context, next - 1)),
            _ => None,
        }
    }

    fn adopt(&self, chain: Chain) {
        let mut state = self.lock();
        let flow = state.flows.entry(chain.context).or_insert(0);
        *flow = (*flow).max(chain.flow + 1);
        if state.next_context <= chain.context {
            state.next_context = chain.context + 1;
        }
    }

    fn release(&self, context: u64) {
        if context == PROCESS_CONTEXT {
            return;
        }
        let mut state = self.lock();
        let known = state.flows.remove(&context).is_some();
        if known && self.policy == ContextPolicy::Recycle {
            state.released.insert(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use crate::event::{Event, EventBody};

    #[test]
    fn test_chain_display() {
        assert_eq!(Chain::new(3, 7).to_string(), "(3:7)");
    }

    #[test]
    fn test_process_chains_increment_flow() {
        let chains = ChainAllocator::default();
        assert_eq!(chains.next(None), Chain::new(0, 0));
        assert_eq!(chains.next(None), Chain::new(0, 1));
        assert_eq!(chains.current(PROCESS_CONTEXT), Some(Chain::new(0, 1)));
    }

    #[test]
    fn test_next_reuses_event_chain() {
        let chains = ChainAllocator::default();
        let event = Event::new(
            "test",
            Chain::new(9, 4),
            EventBody::Error {
                message: "boom".to_string(),
            },
        );
        assert_eq!(chains.next(Some(&event)), Chain::new(9, 4));
        // no allocation happened
        assert_eq!(chains.next(None), Chain::new(0, 0));
    }

    #[test]
    fn test_new_context_unique_under_concurrency() {
        let chains = ChainAllocator::default();
        let issued: Vec<Chain> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| (0..50).map(|_| chains.new_context()).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let contexts: HashSet<u64> = issued.iter().map(|c| c.context).collect();
        assert_eq!(contexts.len(), 400);
        assert!(!contexts.contains(&PROCESS_CONTEXT));
        assert!(issued.iter().all(|c| c.flow == 0));
    }

    #[test]
    fn test_new_context_strictly_increasing() {
        let chains = ChainAllocator::default();
        let first = chains.new_context();
        let second = chains.new_context();
        assert!(second.context > first.context);
    }

    #[test]
    fn test_flows_are_per_context() {
        let chains = ChainAllocator::default();
        let c1 = chains.new_context();
        let c2 = chains.new_context();
        assert_ne!(c1.context, c2.context);
        assert_eq!(c1.flow, 0);
        assert_eq!(c2.flow, 0);

        assert_eq!(chains.next_in(c1.context), Chain::new(c1.context, 1));
        assert_eq!(chains.next_in(c1.context), Chain::new(c1.context, 2));
        assert_eq!(chains.current(c2.context), Some(c2));
    }

    #[test]
    fn test_monotonic_never_reuses() {
        let chains = ChainAllocator::new(ContextPolicy::Monotonic);
        let first = chains.new_context();
        chains.release(first.context);
        let second = chains.new_context();
        assert_ne!(first.context, second.context);
    }

    #[test]
    fn test_release_forgets_flows_under_both_policies() {
        for policy in [ContextPolicy::Monotonic, ContextPolicy::Recycle] {
            let chains = ChainAllocator::new(policy);
            let client = chains.new_context();
            chains.next_in(client.context);
            chains.release(client.context);
            assert_eq!(chains.current(client.context), None);
        }

        let chains = ChainAllocator::default();
        chains.next(None);
        chains.release(PROCESS_CONTEXT);
        assert_eq!(chains.current(PROCESS_CONTEXT), Some(Chain::new(0, 0)));
    }

    #[test]
    fn test_recycle_reissues_lowest_released() {
        let chains = ChainAllocator::new(ContextPolicy::Recycle);
        let a = chains.new_context();
        let b = chains.new_context();
        chains.next_in(b.context);
        chains.release(b.context);
        chains.release(a.context);

        assert_eq!(chains.new_context(), Chain::new(a.context, 0));
        let again = chains.new_context();
        assert_eq!(again, Chain::new(b.context, 0));
        assert_eq!(chains.next_in(b.context), Chain::new(b.context, 1));
    }

    #[test]
    fn test_adopt_seeds_flow() {
        let chains = ChainAllocator::default();
        chains.adopt(Chain::new(5, 0));
        assert_eq!(chains.next_in(5), Chain::new(5, 1));
        assert!(chains.new_context().context > 5);
    }
}
