//! Replay of already explored tactic edges.
//!
//! The same (state, tactic) pair always yields the same successor, so the
//! explored edges of a [`ProofSearch`] double as a memo table. A hit is
//! answered locally with no round trip to lean-gym and no graph mutation.

use crate::protocol::GymReply;
use crate::search::ProofSearch;
use crate::types::StateId;

/// Hit/miss counters since the last reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Looks up explored edges and counts how often that saved a round trip.
#[derive(Debug, Default)]
pub struct TacticCache {
    stats: CacheStats,
}

impl TacticCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthesize the reply lean-gym gave the first time `tactic` was run
    /// from `state_id`, if it succeeded.
    pub fn lookup(
        &mut self,
        search: &ProofSearch,
        state_id: &StateId,
        tactic: &str,
    ) -> Option<GymReply> {
        match search.next_state(state_id, tactic) {
            Some(next) => {
                self.stats.hits += 1;
                tracing::trace!(
                    search_id = %search.search_id(),
                    state_id = %state_id,
                    tactic,
                    "Tactic cache hit"
                );
                Some(GymReply::cached(
                    search.search_id().clone(),
                    next.state_id.clone(),
                    next.text.clone(),
                ))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
    }
}
