//! Ordering and bookkeeping for the randomized waitlist pass.
//!
//! The snapshot is put into canonical order (`requested_at`, then `id`) and
//! then permuted with a uniform shuffle, so processing order carries no bias
//! toward early submitters while a fixed seed still replays the same pass.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::types::{AllocationRequest, CapacityEntry, Problem, ProblemId};

/// RNG for one resolution pass. Seeded runs are reproducible.
pub fn pass_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Canonicalize then shuffle the waitlist snapshot.
pub fn plan_order<R: Rng + ?Sized>(
    mut snapshot: Vec<AllocationRequest>,
    rng: &mut R,
) -> Vec<AllocationRequest> {
    snapshot.sort_by(|a, b| {
        a.requested_at
            .cmp(&b.requested_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    snapshot.shuffle(rng);
    snapshot
}

/// Which problems are still worth trying during a pass.
#[derive(Debug, Default)]
pub struct PassState {
    seatable: HashSet<ProblemId>,
}

impl PassState {
    /// Start with every active problem that had room when the pass began.
    pub fn new(active: &[Problem], capacity: &[CapacityEntry]) -> Self {
        let seatable = active
            .iter()
            .filter(|p| p.is_active)
            .filter(|p| {
                capacity
                    .iter()
                    .find(|c| c.problem_id == p.id)
                    .map(|c| c.remaining() > 0)
                    .unwrap_or(false)
            })
            .map(|p| p.id.clone())
            .collect();
        Self { seatable }
    }

    /// The request's preferences, in rank order, that may still have room.
    pub fn candidates<'a>(
        &'a self,
        request: &'a AllocationRequest,
    ) -> impl Iterator<Item = &'a ProblemId> + 'a {
        request
            .preferences
            .iter()
            .filter(move |p| self.seatable.contains(*p))
    }

    pub fn mark_full(&mut self, problem_id: &str) {
        self.seatable.remove(problem_id);
    }

    pub fn is_exhausted(&self) -> bool {
        self.seatable.is_empty()
    }
}
