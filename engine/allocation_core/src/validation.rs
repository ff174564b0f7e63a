//! Preference-list validation, run before any store mutation.

use std::collections::HashSet;

use crate::error::{AllocationError, Result};
use crate::types::{Problem, ProblemId, MAX_PREFERENCES};

/// Check a ranked preference list against the active catalog.
///
/// Accepts 1..=[`MAX_PREFERENCES`] distinct ids, each naming an active problem.
/// Blank entries are rejected rather than skipped.
pub fn validate_preferences(preferences: &[ProblemId], active: &[Problem]) -> Result<()> {
    if preferences.is_empty() {
        return Err(AllocationError::Validation(
            "at least one preference is required".to_string(),
        ));
    }
    if preferences.len() > MAX_PREFERENCES {
        return Err(AllocationError::Validation(format!(
            "at most {MAX_PREFERENCES} preferences are allowed, got {}",
            preferences.len()
        )));
    }

    let mut seen = HashSet::with_capacity(preferences.len());
    for (rank, problem_id) in preferences.iter().enumerate() {
        if problem_id.trim().is_empty() {
            return Err(AllocationError::Validation(format!(
                "preference {} is empty",
                rank + 1
            )));
        }
        if !seen.insert(problem_id.as_str()) {
            return Err(AllocationError::Validation(format!(
                "problem {problem_id} appears more than once"
            )));
        }
        let known = active
            .iter()
            .any(|p| p.id == *problem_id && p.is_active);
        if !known {
            return Err(AllocationError::Validation(format!(
                "problem {problem_id} is unknown or inactive"
            )));
        }
    }
    Ok(())
}
