//! # Engine
//!
//! [`AllocationEngine`] is the service surface collaborators call:
//!
//! | Operation                   | Gated | Store primitive(s)                        |
//! |-----------------------------|-------|-------------------------------------------|
//! | [`submit_preferences`]      | yes   | `submit`                                  |
//! | [`retract`]                 | yes   | `retract`                                 |
//! | [`resolve_waitlist`]        | no    | `waitlisted`, `seat_waitlisted`           |
//! | [`get_allocation`]          | no    | `find_by_team`                            |
//! | [`capacity_snapshot`]       | no    | `capacity_snapshot`                       |
//!
//! The engine owns policy (gating, validation, ordering, retries); the store
//! owns atomicity. No lock is held across any `.await` here.
//!
//! [`submit_preferences`]: AllocationEngine::submit_preferences
//! [`retract`]: AllocationEngine::retract
//! [`resolve_waitlist`]: AllocationEngine::resolve_waitlist
//! [`get_allocation`]: AllocationEngine::get_allocation
//! [`capacity_snapshot`]: AllocationEngine::capacity_snapshot

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AllocationError, Result};
use crate::resolver::{pass_rng, plan_order, PassState};
use crate::store::{AllocationStore, PhaseGate, ProblemCatalog};
use crate::types::{
    AllocationRequest, BatchResult, CapacityEntry, LedgerDrift, ProblemId, SeatOutcome,
    Submission,
};
use crate::validation::validate_preferences;

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Extra attempts after a `Contention` failure before giving up.
    pub max_contention_retries: u32,
    /// Fixed seed for waitlist passes; `None` draws from OS entropy.
    pub resolver_seed: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_contention_retries: 5,
            resolver_seed: None,
        }
    }
}

/// Aggregate counts for the admin dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStats {
    pub total: usize,
    pub allocated: usize,
    pub waitlisted: usize,
}

enum Placement {
    Seated(ProblemId),
    Unplaced,
    Stale,
}

pub struct AllocationEngine {
    store: Arc<dyn AllocationStore>,
    gate: Arc<dyn PhaseGate>,
    catalog: Arc<dyn ProblemCatalog>,
    options: EngineOptions,
}

impl AllocationEngine {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        gate: Arc<dyn PhaseGate>,
        catalog: Arc<dyn ProblemCatalog>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            gate,
            catalog,
            options,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Team operations (gated)
    // ─────────────────────────────────────────────────────────

    /// Record a team's ranked preferences and try to seat it on its first
    /// choice right away.
    ///
    /// A full first choice is not an error: the returned request is simply
    /// `waitlist`, keeping every preference for the next batch pass.
    pub async fn submit_preferences(
        &self,
        team_id: &str,
        preferences: Vec<ProblemId>,
    ) -> Result<AllocationRequest> {
        self.require_open().await?;
        if team_id.trim().is_empty() {
            return Err(AllocationError::Validation(
                "team id is required".to_string(),
            ));
        }

        let active = self.catalog.list_active_problems().await?;
        validate_preferences(&preferences, &active)?;

        let submission = Submission {
            team_id: team_id.to_string(),
            preferences,
            requested_at: now(),
        };
        let request = self
            .with_retry("submit", || self.store.submit(&submission))
            .await?;

        match &request.resolved_problem_id {
            Some(problem_id) => info!("Team {team_id} allocated {problem_id} (fcfs)"),
            None => info!(
                "Team {team_id} waitlisted; first choice {} is full",
                submission.first_choice()
            ),
        }
        Ok(request)
    }

    /// Withdraw a team's request, freeing its slot if it held one.
    pub async fn retract(&self, team_id: &str) -> Result<()> {
        self.require_open().await?;
        let removed = self
            .with_retry("retract", || self.store.retract(team_id))
            .await?;
        match removed.resolved_problem_id {
            Some(problem_id) => info!("Team {team_id} retracted; released {problem_id}"),
            None => info!("Team {team_id} left the waitlist"),
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Administrator operations (not gated)
    // ─────────────────────────────────────────────────────────

    /// Seat as much of the waitlist as remaining capacity allows.
    ///
    /// Safe to re-run: only records still in `waitlist` are touched, and an
    /// interrupted pass keeps whatever it already seated.
    pub async fn resolve_waitlist(&self) -> Result<BatchResult> {
        let snapshot = self
            .with_retry("waitlisted", || self.store.waitlisted())
            .await?;
        if snapshot.is_empty() {
            info!("Waitlist resolution: nothing to do");
            return Ok(BatchResult::default());
        }

        let active = self.catalog.list_active_problems().await?;
        let capacity = self
            .with_retry("capacity_snapshot", || self.store.capacity_snapshot())
            .await?;
        let mut pass = PassState::new(&active, &capacity);
        let order = plan_order(snapshot, &mut pass_rng(self.options.resolver_seed));

        let mut result = BatchResult::default();
        for (done, request) in order.iter().enumerate() {
            if pass.is_exhausted() {
                let remaining = order.len() - done;
                debug!("No seatable problems left; {remaining} requests stay waitlisted");
                result.still_waitlisted += remaining;
                break;
            }
            match self.place(request, &mut pass).await? {
                Placement::Seated(problem_id) => {
                    debug!("Team {} allocated {problem_id} (random)", request.team_id);
                    result.resolved += 1;
                }
                Placement::Unplaced => result.still_waitlisted += 1,
                Placement::Stale => {
                    debug!("Skipping stale waitlist entry for team {}", request.team_id)
                }
            }
        }

        info!(
            "Waitlist resolution: {} resolved, {} still waitlisted",
            result.resolved, result.still_waitlisted
        );
        Ok(result)
    }

    /// Walk one request's preferences top to bottom until a seat sticks.
    async fn place(&self, request: &AllocationRequest, pass: &mut PassState) -> Result<Placement> {
        let candidates: Vec<ProblemId> = pass.candidates(request).cloned().collect();
        for problem_id in candidates {
            let resolved_at = now();
            let outcome = self
                .with_retry("seat_waitlisted", || {
                    self.store.seat_waitlisted(request, &problem_id, resolved_at)
                })
                .await?;
            match outcome {
                SeatOutcome::Seated(_) => return Ok(Placement::Seated(problem_id)),
                SeatOutcome::Full => pass.mark_full(&problem_id),
                SeatOutcome::Stale => return Ok(Placement::Stale),
            }
        }
        Ok(Placement::Unplaced)
    }

    pub async fn reconcile_ledger(&self) -> Result<Vec<LedgerDrift>> {
        let drifts = self
            .with_retry("reconcile", || self.store.reconcile())
            .await?;
        for drift in &drifts {
            warn!(
                "Ledger drift on {}: ledger said {}, records say {}",
                drift.problem_id, drift.ledger_count, drift.record_count
            );
        }
        Ok(drifts)
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub async fn get_allocation(&self, team_id: &str) -> Result<Option<AllocationRequest>> {
        self.with_retry("find_by_team", || self.store.find_by_team(team_id))
            .await
    }

    pub async fn capacity_snapshot(&self) -> Result<Vec<CapacityEntry>> {
        self.with_retry("capacity_snapshot", || self.store.capacity_snapshot())
            .await
    }

    pub async fn list_requests(&self) -> Result<Vec<AllocationRequest>> {
        self.with_retry("list_requests", || self.store.list_requests())
            .await
    }

    pub async fn stats(&self) -> Result<AllocationStats> {
        let requests = self.list_requests().await?;
        let allocated = requests.iter().filter(|r| r.is_allocated()).count();
        Ok(AllocationStats {
            total: requests.len(),
            allocated,
            waitlisted: requests.len() - allocated,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────

    async fn require_open(&self) -> Result<()> {
        if self.gate.is_submission_open().await? {
            Ok(())
        } else {
            Err(AllocationError::PhaseClosed)
        }
    }

    /// Run a store call, retrying `Contention` with capped exponential back-off.
    /// Each delay carries up to 50% random jitter so contending callers spread out.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.options.max_contention_retries.saturating_add(1);
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut attempt = 1;

        loop {
            match call().await {
                Err(err) if err.is_retryable() => {
                    if attempt >= max_attempts {
                        warn!("{op}: contention persisted after {attempt} attempts");
                        return Err(AllocationError::Transient { attempts: attempt });
                    }
                    let delay = backoff + rand::thread_rng().gen_range(0..=backoff / 2);
                    debug!("{op}: contention on attempt {attempt}, retrying in {delay}ms");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}
