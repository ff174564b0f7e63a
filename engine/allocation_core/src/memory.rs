//! In-process store for single-node deployments and tests.
//!
//! Records and ledger slots live in two [`DashMap`]s. Every mutating path
//! takes the team's record entry first and the problem's ledger slot second,
//! and releases both before returning. That fixed order keeps the store
//! deadlock-free while teams and problems proceed in parallel.
//!
//! State does not survive a restart; durable deployments use the SQLite
//! store in the backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{AllocationError, Result};
use crate::store::{AllocationStore, PhaseGate, ProblemCatalog};
use crate::types::{
    AllocationMethod, AllocationRequest, CapacityEntry, LedgerDrift, Problem, ProblemId,
    RequestStatus, SeatOutcome, Submission, TeamId,
};

#[derive(Debug, Clone)]
struct LedgerSlot {
    capacity: u32,
    is_active: bool,
    allocated: u32,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: DashMap<ProblemId, LedgerSlot>,
    records: DashMap<TeamId, AllocationRequest>,
    next_id: AtomicI64,
    submission_open: AtomicBool,
}

impl MemoryStore {
    pub fn new(problems: impl IntoIterator<Item = Problem>) -> Self {
        let store = Self::default();
        for problem in problems {
            store.upsert_problem(problem);
        }
        store
    }

    /// Add a problem or update its capacity/active flag, keeping its count.
    pub fn upsert_problem(&self, problem: Problem) {
        self.ledger
            .entry(problem.id)
            .and_modify(|slot| {
                slot.capacity = problem.capacity;
                slot.is_active = problem.is_active;
            })
            .or_insert(LedgerSlot {
                capacity: problem.capacity,
                is_active: problem.is_active,
                allocated: 0,
            });
    }

    pub fn set_submission_open(&self, open: bool) {
        self.submission_open.store(open, Ordering::SeqCst);
    }

    /// Conditional increment: succeeds only while `allocated < capacity`.
    fn try_increment(&self, problem_id: &str) -> bool {
        match self.ledger.get_mut(problem_id) {
            Some(mut slot) if slot.is_active && slot.allocated < slot.capacity => {
                slot.allocated += 1;
                true
            }
            _ => false,
        }
    }

    fn decrement(&self, problem_id: &str) {
        if let Some(mut slot) = self.ledger.get_mut(problem_id) {
            slot.allocated = slot.allocated.saturating_sub(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_ledger_count(&self, problem_id: &str, allocated: u32) {
        if let Some(mut slot) = self.ledger.get_mut(problem_id) {
            slot.allocated = allocated;
        }
    }
}

#[async_trait]
impl AllocationStore for MemoryStore {
    async fn submit(&self, submission: &Submission) -> Result<AllocationRequest> {
        let entry = self.records.entry(submission.team_id.clone());
        let id = match &entry {
            Entry::Occupied(existing) if existing.get().is_allocated() => {
                return Err(AllocationError::AlreadyAllocated {
                    team_id: submission.team_id.clone(),
                });
            }
            Entry::Occupied(existing) => existing.get().id,
            Entry::Vacant(_) => self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let first_choice = submission.first_choice();
        let request = if self.try_increment(first_choice) {
            AllocationRequest {
                id,
                team_id: submission.team_id.clone(),
                preferences: submission.preferences.clone(),
                status: RequestStatus::Allocated,
                resolved_problem_id: Some(first_choice.to_string()),
                method: Some(AllocationMethod::Fcfs),
                requested_at: submission.requested_at,
                resolved_at: Some(submission.requested_at),
            }
        } else {
            AllocationRequest {
                id,
                team_id: submission.team_id.clone(),
                preferences: submission.preferences.clone(),
                status: RequestStatus::Waitlist,
                resolved_problem_id: None,
                method: None,
                requested_at: submission.requested_at,
                resolved_at: None,
            }
        };

        entry.insert(request.clone());
        Ok(request)
    }

    async fn seat_waitlisted(
        &self,
        snapshot: &AllocationRequest,
        problem_id: &str,
        resolved_at: i64,
    ) -> Result<SeatOutcome> {
        let Some(mut record) = self.records.get_mut(&snapshot.team_id) else {
            return Ok(SeatOutcome::Stale);
        };
        if record.id != snapshot.id
            || !record.is_waitlisted()
            || record.preferences != snapshot.preferences
        {
            return Ok(SeatOutcome::Stale);
        }
        if !self.try_increment(problem_id) {
            return Ok(SeatOutcome::Full);
        }

        record.status = RequestStatus::Allocated;
        record.resolved_problem_id = Some(problem_id.to_string());
        record.method = Some(AllocationMethod::Random);
        record.resolved_at = Some(resolved_at);
        Ok(SeatOutcome::Seated(record.clone()))
    }

    async fn retract(&self, team_id: &str) -> Result<AllocationRequest> {
        match self.records.entry(team_id.to_string()) {
            Entry::Occupied(existing) => {
                if let Some(problem_id) = &existing.get().resolved_problem_id {
                    self.decrement(problem_id);
                }
                Ok(existing.remove())
            }
            Entry::Vacant(_) => Err(AllocationError::NotFound {
                team_id: team_id.to_string(),
            }),
        }
    }

    async fn find_by_team(&self, team_id: &str) -> Result<Option<AllocationRequest>> {
        Ok(self.records.get(team_id).map(|r| r.clone()))
    }

    async fn list_requests(&self) -> Result<Vec<AllocationRequest>> {
        let mut all: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| {
            b.requested_at
                .cmp(&a.requested_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(all)
    }

    async fn waitlisted(&self) -> Result<Vec<AllocationRequest>> {
        let mut waiting: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.is_waitlisted())
            .map(|r| r.clone())
            .collect();
        waiting.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(waiting)
    }

    async fn capacity_snapshot(&self) -> Result<Vec<CapacityEntry>> {
        let mut entries: Vec<_> = self
            .ledger
            .iter()
            .map(|slot| CapacityEntry {
                problem_id: slot.key().clone(),
                capacity: slot.capacity,
                allocated_count: slot.allocated,
            })
            .collect();
        entries.sort_by(|a, b| a.problem_id.cmp(&b.problem_id));
        Ok(entries)
    }

    /// Meant for quiescent moments (startup, admin repair); concurrent
    /// writers during the scan can produce spurious drift reports.
    async fn reconcile(&self) -> Result<Vec<LedgerDrift>> {
        let mut counts: HashMap<ProblemId, u32> = HashMap::new();
        for record in self.records.iter() {
            if let Some(problem_id) = &record.resolved_problem_id {
                *counts.entry(problem_id.clone()).or_default() += 1;
            }
        }

        let mut drifts = Vec::new();
        for mut slot in self.ledger.iter_mut() {
            let record_count = counts.get(slot.key()).copied().unwrap_or(0);
            if slot.allocated != record_count {
                drifts.push(LedgerDrift {
                    problem_id: slot.key().clone(),
                    ledger_count: slot.allocated,
                    record_count,
                });
                slot.allocated = record_count;
            }
        }
        drifts.sort_by(|a, b| a.problem_id.cmp(&b.problem_id));
        Ok(drifts)
    }
}

#[async_trait]
impl PhaseGate for MemoryStore {
    async fn is_submission_open(&self) -> Result<bool> {
        Ok(self.submission_open.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ProblemCatalog for MemoryStore {
    async fn list_active_problems(&self) -> Result<Vec<Problem>> {
        let mut problems: Vec<_> = self
            .ledger
            .iter()
            .filter(|slot| slot.is_active)
            .map(|slot| Problem {
                id: slot.key().clone(),
                capacity: slot.capacity,
                is_active: true,
            })
            .collect();
        problems.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(problems)
    }
}
