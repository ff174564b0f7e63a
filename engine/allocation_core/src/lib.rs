//! # Allocation Core
//!
//! Capacity-safe allocation of capacity-bounded problem statements to teams.
//! Each team submits one to three ranked preferences and ends up holding at
//! most one problem.
//!
//! | Phase          | Entry Point(s)                                        |
//! |----------------|-------------------------------------------------------|
//! | Submission     | [`AllocationEngine::submit_preferences`] (FCFS, rank 1 only) |
//! | Withdrawal     | [`AllocationEngine::retract`]                         |
//! | Batch fill     | [`AllocationEngine::resolve_waitlist`] (randomized)   |
//! | Queries        | `get_allocation`, `capacity_snapshot`, `list_requests`, `stats` |
//! | Repair         | [`AllocationEngine::reconcile_ledger`]                |
//!
//! ## Architecture
//!
//! Policy lives in [`engine`]; atomic ledger/record primitives live behind
//! [`AllocationStore`]. [`MemoryStore`] is the in-process implementation;
//! the backend service provides a durable SQLite one.
//!
//! ## Invariants
//!
//! - allocated count per problem never exceeds its capacity;
//! - at most one request per team;
//! - `waitlist → allocated` is the only status transition;
//! - the ledger count for a problem equals the number of records allocated to it.

pub mod engine;
pub mod error;
pub mod memory;
pub mod resolver;
pub mod store;
pub mod types;
pub mod validation;

#[cfg(test)]
mod test_engine;

pub use engine::{AllocationEngine, AllocationStats, EngineOptions};
pub use error::{AllocationError, Result};
pub use memory::MemoryStore;
pub use store::{AllocationStore, PhaseGate, ProblemCatalog};
pub use types::{
    AllocationMethod, AllocationRequest, BatchResult, CapacityEntry, LedgerDrift, Problem,
    ProblemId, RequestStatus, SeatOutcome, Submission, TeamId, MAX_PREFERENCES,
};
