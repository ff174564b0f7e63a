//! Error taxonomy of the allocation engine.
//!
//! "Problem full" is not here: it is the `waitlist` outcome of a successful
//! submission.

use thiserror::Error;

use crate::types::TeamId;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum AllocationError {
    /// Malformed preference list. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Team {team_id} already holds an allocation; retract it first")]
    AlreadyAllocated { team_id: TeamId },

    #[error("Problem requests are closed")]
    PhaseClosed,

    #[error("No allocation request found for team {team_id}")]
    NotFound { team_id: TeamId },

    /// A conflicting concurrent write hit the capacity primitive.
    /// Retried inside the engine and never returned to callers directly.
    #[error("Concurrent write contention")]
    Contention,

    #[error("Allocation temporarily unavailable after {attempts} attempts; retry later")]
    Transient { attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[source] BoxError),
}

impl AllocationError {
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(err))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention)
    }
}

pub type Result<T> = std::result::Result<T, AllocationError>;
