//! # Types
//!
//! Shared data structures used across the allocation engine and its stores.
//!
//! ## Design decisions
//!
//! ### One record per team
//!
//! An [`AllocationRequest`] is keyed by `team_id`. Re-submitting before
//! resolution rewrites the same record (same `id`) instead of appending a new
//! one, so retries and edits are idempotent.
//!
//! ### Status as a Finite-State Machine
//!
//! [`RequestStatus`] only moves forward:
//!
//! ```text
//! (none) ──► Waitlist ──► Allocated
//!    └──────────────────►┘
//! ```
//!
//! There is no `Allocated ──► Waitlist` edge. The only way out of `Allocated`
//! is retraction, which deletes the record.

use serde::{Deserialize, Serialize};

/// Identifier of a competing team.
pub type TeamId = String;

/// Identifier of a problem statement.
pub type ProblemId = String;

/// Maximum number of ranked preferences a team may submit.
pub const MAX_PREFERENCES: usize = 3;

/// The slice of a problem statement the engine cares about.
///
/// Everything else (code, title, description) belongs to the catalog owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub id: ProblemId,
    /// Maximum number of teams that may hold this problem at once.
    pub capacity: u32,
    /// Inactive problems accept no new allocations but keep existing ones.
    pub is_active: bool,
}

/// Where a team's request currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Holds exactly one problem.
    Allocated,
    /// Waiting for a batch resolution pass.
    Waitlist,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::Waitlist => "waitlist",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "allocated" => Some(Self::Allocated),
            "waitlist" => Some(Self::Waitlist),
            _ => None,
        }
    }
}

/// Which path seated a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    /// Seated on its first choice at submission time.
    Fcfs,
    /// Seated by an administrator-triggered waitlist pass.
    Random,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fcfs => "fcfs",
            Self::Random => "random",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fcfs" => Some(Self::Fcfs),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

/// A team's ranked preferences and their resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Store-assigned identifier, stable across resubmissions.
    pub id: i64,
    pub team_id: TeamId,
    /// One to three distinct problem ids, highest preference first.
    pub preferences: Vec<ProblemId>,
    pub status: RequestStatus,
    /// Set iff `status == Allocated`.
    pub resolved_problem_id: Option<ProblemId>,
    /// `None` while pending.
    pub method: Option<AllocationMethod>,
    /// Unix seconds of the latest submission.
    pub requested_at: i64,
    /// Unix seconds of seating.
    pub resolved_at: Option<i64>,
}

impl AllocationRequest {
    pub fn is_allocated(&self) -> bool {
        self.status == RequestStatus::Allocated
    }

    pub fn is_waitlisted(&self) -> bool {
        self.status == RequestStatus::Waitlist
    }
}

/// Input to [`crate::AllocationStore::submit`], already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub team_id: TeamId,
    pub preferences: Vec<ProblemId>,
    pub requested_at: i64,
}

impl Submission {
    /// The only preference FCFS seating considers.
    pub fn first_choice(&self) -> &str {
        &self.preferences[0]
    }
}

/// Outcome of a single waitlist seating attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatOutcome {
    /// The record is now allocated on the requested problem.
    Seated(AllocationRequest),
    /// The problem had no remaining capacity.
    Full,
    /// The snapshot no longer matches the stored record (retracted,
    /// already allocated, or resubmitted with other preferences).
    Stale,
}

/// Counts reported by a waitlist resolution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub resolved: usize,
    pub still_waitlisted: usize,
}

/// One row of the capacity snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityEntry {
    pub problem_id: ProblemId,
    pub capacity: u32,
    pub allocated_count: u32,
}

impl CapacityEntry {
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.allocated_count)
    }
}

/// A ledger entry that disagreed with the allocation records and was rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDrift {
    pub problem_id: ProblemId,
    pub ledger_count: u32,
    pub record_count: u32,
}
