//! # Store
//!
//! The seams between the engine and the outside world.
//!
//! | Trait               | Direction | Backs                                   |
//! |---------------------|-----------|-----------------------------------------|
//! | [`AllocationStore`] | read/write| Capacity Ledger + Allocation Records    |
//! | [`PhaseGate`]       | read      | `project_request_open` setting          |
//! | [`ProblemCatalog`]  | read      | Active problem statements               |
//!
//! Every `AllocationStore` method is one indivisible step: a capacity change
//! and the matching record write either both land or neither does. Ledger
//! increments, decrements and the seating checks for a given problem share a
//! single serialization point, so the allocated count never exceeds capacity.
//!
//! A store reports lock contention as [`AllocationError::Contention`]; the
//! engine retries those.
//!
//! [`AllocationError::Contention`]: crate::AllocationError::Contention

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    AllocationRequest, CapacityEntry, LedgerDrift, Problem, SeatOutcome, Submission,
};

#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// FCFS step: fail with `AlreadyAllocated` if the team holds a problem,
    /// otherwise try to seat on the first choice and upsert the record as
    /// `allocated/fcfs` or `waitlist`.
    async fn submit(&self, submission: &Submission) -> Result<AllocationRequest>;

    /// Try to seat a waitlisted snapshot record on `problem_id` with
    /// method `random`.
    async fn seat_waitlisted(
        &self,
        snapshot: &AllocationRequest,
        problem_id: &str,
        resolved_at: i64,
    ) -> Result<SeatOutcome>;

    /// Delete the team's record, releasing its slot if it held one.
    /// Returns the deleted record, or `NotFound`.
    async fn retract(&self, team_id: &str) -> Result<AllocationRequest>;

    async fn find_by_team(&self, team_id: &str) -> Result<Option<AllocationRequest>>;

    /// All records, newest `requested_at` first.
    async fn list_requests(&self) -> Result<Vec<AllocationRequest>>;

    /// Waitlisted records, oldest `requested_at` first (ties by id).
    async fn waitlisted(&self) -> Result<Vec<AllocationRequest>>;

    async fn capacity_snapshot(&self) -> Result<Vec<CapacityEntry>>;

    /// Rebuild ledger counts from allocated records; returns the entries
    /// that had drifted.
    async fn reconcile(&self) -> Result<Vec<LedgerDrift>>;
}

#[async_trait]
pub trait PhaseGate: Send + Sync {
    async fn is_submission_open(&self) -> Result<bool>;
}

#[async_trait]
pub trait ProblemCatalog: Send + Sync {
    async fn list_active_problems(&self) -> Result<Vec<Problem>>;
}

