use std::sync::Arc;

use crate::invariants::{
    assert_all_invariants, assert_resolution_immutable, assert_valid_status_transition,
};
use crate::{
    AllocationEngine, AllocationError, AllocationMethod, AllocationStore, EngineOptions,
    MemoryStore, Problem, ProblemId, RequestStatus, SeatOutcome,
};

fn problem(id: &str, capacity: u32) -> Problem {
    Problem {
        id: id.to_string(),
        capacity,
        is_active: true,
    }
}

fn setup_with_seed(
    problems: &[(&str, u32)],
    seed: Option<u64>,
) -> (Arc<MemoryStore>, AllocationEngine) {
    let store = Arc::new(MemoryStore::new(
        problems.iter().map(|(id, cap)| problem(id, *cap)),
    ));
    store.set_submission_open(true);
    let engine = AllocationEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
        EngineOptions {
            max_contention_retries: 3,
            resolver_seed: seed,
        },
    );
    (store, engine)
}

fn setup(problems: &[(&str, u32)]) -> (Arc<MemoryStore>, AllocationEngine) {
    setup_with_seed(problems, Some(42))
}

fn prefs(ids: &[&str]) -> Vec<ProblemId> {
    ids.iter().map(|s| s.to_string()).collect()
}

async fn allocated_count(engine: &AllocationEngine, problem_id: &str) -> u32 {
    engine
        .capacity_snapshot()
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.problem_id == problem_id)
        .map(|e| e.allocated_count)
        .unwrap()
}

async fn check_invariants(engine: &AllocationEngine) {
    let snapshot = engine.capacity_snapshot().await.unwrap();
    let records = engine.list_requests().await.unwrap();
    assert_all_invariants(&snapshot, &records);
}

// ─────────────────────────────────────────────────────────
// FCFS submission
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fcfs_seats_first_choice() {
    let (_, engine) = setup(&[("x", 2), ("y", 1)]);

    let request = engine
        .submit_preferences("team-1", prefs(&["x", "y"]))
        .await
        .unwrap();

    assert_eq!(request.status, RequestStatus::Allocated);
    assert_eq!(request.resolved_problem_id.as_deref(), Some("x"));
    assert_eq!(request.method, Some(AllocationMethod::Fcfs));
    assert!(request.resolved_at.is_some());
    assert_eq!(allocated_count(&engine, "x").await, 1);
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_full_first_choice_waitlists_without_trying_lower_ranks() {
    let (_, engine) = setup(&[("x", 1), ("y", 3)]);
    engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();

    let request = engine
        .submit_preferences("team-2", prefs(&["x", "y"]))
        .await
        .unwrap();

    assert_eq!(request.status, RequestStatus::Waitlist);
    assert_eq!(request.method, None);
    assert_eq!(request.resolved_problem_id, None);
    assert_eq!(request.preferences, prefs(&["x", "y"]));
    assert_eq!(allocated_count(&engine, "y").await, 0);
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_resubmission_is_idempotent() {
    let (_, engine) = setup(&[("x", 1)]);
    engine.submit_preferences("holder", prefs(&["x"])).await.unwrap();

    let first = engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();
    let second = engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();

    assert_eq!(first.id, second.id);
    let records = engine.list_requests().await.unwrap();
    assert_eq!(records.iter().filter(|r| r.team_id == "team-1").count(), 1);
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_resubmission_replaces_waitlisted_preferences() {
    let (_, engine) = setup(&[("x", 1), ("y", 1)]);
    engine.submit_preferences("holder", prefs(&["x"])).await.unwrap();
    let waiting = engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();
    assert_eq!(waiting.status, RequestStatus::Waitlist);

    let seated = engine
        .submit_preferences("team-1", prefs(&["y", "x"]))
        .await
        .unwrap();

    assert_eq!(seated.id, waiting.id);
    assert_eq!(seated.status, RequestStatus::Allocated);
    assert_eq!(seated.resolved_problem_id.as_deref(), Some("y"));
    assert_valid_status_transition(Some(waiting.status), seated.status);
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_allocated_team_cannot_resubmit() {
    let (_, engine) = setup(&[("x", 2), ("y", 2)]);
    let before = engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();

    let err = engine
        .submit_preferences("team-1", prefs(&["y"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::AlreadyAllocated { .. }));
    let after = engine.get_allocation("team-1").await.unwrap().unwrap();
    assert_resolution_immutable(&before, &after);
    assert_eq!(allocated_count(&engine, "y").await, 0);
}

#[tokio::test]
async fn test_validation_errors_leave_no_trace() {
    let (_, engine) = setup(&[("x", 2), ("y", 2)]);

    let cases = [
        prefs(&[]),
        prefs(&["x", "x"]),
        prefs(&["x", "y", "x", "y"]),
        prefs(&["unknown"]),
    ];
    for case in cases {
        let err = engine.submit_preferences("team-1", case).await.unwrap_err();
        assert!(matches!(err, AllocationError::Validation(_)));
    }

    let err = engine.submit_preferences("  ", prefs(&["x"])).await.unwrap_err();
    assert!(matches!(err, AllocationError::Validation(_)));

    assert!(engine.list_requests().await.unwrap().is_empty());
    assert_eq!(allocated_count(&engine, "x").await, 0);
}

#[tokio::test]
async fn test_inactive_problem_rejected() {
    let (store, engine) = setup(&[("x", 2)]);
    store.upsert_problem(Problem {
        id: "x".to_string(),
        capacity: 2,
        is_active: false,
    });

    let err = engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap_err();
    assert!(matches!(err, AllocationError::Validation(_)));
}

// ─────────────────────────────────────────────────────────
// Phase gate
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_closed_gate_blocks_submit_and_retract() {
    let (store, engine) = setup(&[("x", 2)]);
    engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();
    store.set_submission_open(false);

    let err = engine.submit_preferences("team-2", prefs(&["x"])).await.unwrap_err();
    assert!(matches!(err, AllocationError::PhaseClosed));

    let err = engine.retract("team-1").await.unwrap_err();
    assert!(matches!(err, AllocationError::PhaseClosed));

    assert!(engine.get_allocation("team-1").await.unwrap().is_some());
    assert!(engine.get_allocation("team-2").await.unwrap().is_none());
    assert_eq!(allocated_count(&engine, "x").await, 1);
}

#[tokio::test]
async fn test_closed_gate_checked_before_validation() {
    let (store, engine) = setup(&[("x", 2)]);
    store.set_submission_open(false);

    let err = engine.submit_preferences("team-1", prefs(&[])).await.unwrap_err();
    assert!(matches!(err, AllocationError::PhaseClosed));
}

// ─────────────────────────────────────────────────────────
// Retraction
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retraction_frees_exactly_one_slot() {
    let (_, engine) = setup(&[("x", 1)]);
    engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();
    assert_eq!(allocated_count(&engine, "x").await, 1);

    engine.retract("team-1").await.unwrap();
    assert_eq!(allocated_count(&engine, "x").await, 0);
    assert!(engine.get_allocation("team-1").await.unwrap().is_none());

    let next = engine.submit_preferences("team-2", prefs(&["x"])).await.unwrap();
    assert_eq!(next.status, RequestStatus::Allocated);
    let after = engine.submit_preferences("team-3", prefs(&["x"])).await.unwrap();
    assert_eq!(after.status, RequestStatus::Waitlist);
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_retracting_waitlisted_team_keeps_ledger() {
    let (_, engine) = setup(&[("x", 1)]);
    engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();
    engine.submit_preferences("team-2", prefs(&["x"])).await.unwrap();

    engine.retract("team-2").await.unwrap();

    assert_eq!(allocated_count(&engine, "x").await, 1);
    assert_eq!(engine.list_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_retract_unknown_team_is_not_found() {
    let (_, engine) = setup(&[("x", 1)]);
    let err = engine.retract("ghost").await.unwrap_err();
    assert!(matches!(err, AllocationError::NotFound { .. }));
}

#[tokio::test]
async fn test_retracted_team_may_submit_again() {
    let (_, engine) = setup(&[("x", 1), ("y", 1)]);
    engine.submit_preferences("team-1", prefs(&["x"])).await.unwrap();
    engine.retract("team-1").await.unwrap();

    let again = engine.submit_preferences("team-1", prefs(&["y"])).await.unwrap();
    assert_eq!(again.resolved_problem_id.as_deref(), Some("y"));
    check_invariants(&engine).await;
}

// ─────────────────────────────────────────────────────────
// Waitlist resolution
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_resolver_seats_on_lower_preference() {
    let (_, engine) = setup(&[("y", 1), ("w", 2)]);
    engine.submit_preferences("holder", prefs(&["y"])).await.unwrap();
    let waiting = engine
        .submit_preferences("team-z", prefs(&["y", "w"]))
        .await
        .unwrap();
    assert_eq!(waiting.status, RequestStatus::Waitlist);

    let result = engine.resolve_waitlist().await.unwrap();

    assert_eq!(result.resolved, 1);
    assert_eq!(result.still_waitlisted, 0);
    let z = engine.get_allocation("team-z").await.unwrap().unwrap();
    assert_eq!(z.status, RequestStatus::Allocated);
    assert_eq!(z.resolved_problem_id.as_deref(), Some("w"));
    assert_eq!(z.method, Some(AllocationMethod::Random));
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_resolver_leaves_exhausted_team_waitlisted() {
    let (_, engine) = setup(&[("y", 1), ("w", 1)]);
    engine.submit_preferences("a", prefs(&["y"])).await.unwrap();
    engine.submit_preferences("b", prefs(&["w"])).await.unwrap();
    engine.submit_preferences("z", prefs(&["y", "w"])).await.unwrap();

    let result = engine.resolve_waitlist().await.unwrap();

    assert_eq!(result.resolved, 0);
    assert_eq!(result.still_waitlisted, 1);
    let z = engine.get_allocation("z").await.unwrap().unwrap();
    assert_eq!(z.status, RequestStatus::Waitlist);
}

#[tokio::test]
async fn test_resolver_counts_remaining_once_nothing_is_seatable() {
    let (_, engine) = setup(&[("x", 1)]);
    engine.submit_preferences("a", prefs(&["x"])).await.unwrap();
    for team in ["b", "c", "d"] {
        engine.submit_preferences(team, prefs(&["x"])).await.unwrap();
    }

    let result = engine.resolve_waitlist().await.unwrap();

    assert_eq!(result.resolved, 0);
    assert_eq!(result.still_waitlisted, 3);
    assert_eq!(allocated_count(&engine, "x").await, 1);
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_resolver_stops_trying_after_last_seat_fills() {
    let (_, engine) = setup(&[("x", 1), ("w", 1)]);
    engine.submit_preferences("a", prefs(&["x"])).await.unwrap();
    for team in ["b", "c", "d", "e"] {
        engine.submit_preferences(team, prefs(&["x", "w"])).await.unwrap();
    }

    let result = engine.resolve_waitlist().await.unwrap();

    assert_eq!(result.resolved, 1);
    assert_eq!(result.still_waitlisted, 3);
    assert_eq!(allocated_count(&engine, "w").await, 1);
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_resolver_never_touches_allocated_or_lowers_counts() {
    let (_, engine) = setup(&[("x", 2), ("y", 1), ("w", 3)]);
    for team in ["a", "b"] {
        engine.submit_preferences(team, prefs(&["x"])).await.unwrap();
    }
    engine.submit_preferences("c", prefs(&["y"])).await.unwrap();
    for team in ["d", "e", "f", "g"] {
        engine
            .submit_preferences(team, prefs(&["x", "y", "w"]))
            .await
            .unwrap();
    }
    let before_records = engine.list_requests().await.unwrap();
    let before_counts = engine.capacity_snapshot().await.unwrap();

    let result = engine.resolve_waitlist().await.unwrap();

    assert_eq!(result.resolved, 3);
    assert_eq!(result.still_waitlisted, 1);
    let after_counts = engine.capacity_snapshot().await.unwrap();
    for (before, after) in before_counts.iter().zip(&after_counts) {
        assert!(after.allocated_count >= before.allocated_count);
    }
    for before in before_records.iter().filter(|r| r.is_allocated()) {
        let after = engine.get_allocation(&before.team_id).await.unwrap().unwrap();
        assert_eq!(&after, before);
    }
    for before in &before_records {
        let after = engine.get_allocation(&before.team_id).await.unwrap().unwrap();
        assert_valid_status_transition(Some(before.status), after.status);
        assert_resolution_immutable(before, &after);
    }
    check_invariants(&engine).await;
}

#[tokio::test]
async fn test_resolver_is_not_gated() {
    let (store, engine) = setup(&[("y", 1), ("w", 1)]);
    engine.submit_preferences("a", prefs(&["y"])).await.unwrap();
    engine.submit_preferences("z", prefs(&["y", "w"])).await.unwrap();
    store.set_submission_open(false);

    let result = engine.resolve_waitlist().await.unwrap();
    assert_eq!(result.resolved, 1);
}

#[tokio::test]
async fn test_resolver_rerun_is_noop() {
    let (_, engine) = setup(&[("y", 1), ("w", 1)]);
    engine.submit_preferences("a", prefs(&["y"])).await.unwrap();
    engine.submit_preferences("z", prefs(&["y", "w"])).await.unwrap();
    engine.submit_preferences("q", prefs(&["y"])).await.unwrap();

    let first = engine.resolve_waitlist().await.unwrap();
    let second = engine.resolve_waitlist().await.unwrap();

    assert_eq!(first.resolved, 1);
    assert_eq!(first.still_waitlisted, 1);
    assert_eq!(second.resolved, 0);
    assert_eq!(second.still_waitlisted, 1);
}

#[tokio::test]
async fn test_resolver_empty_waitlist() {
    let (_, engine) = setup(&[("x", 1)]);
    let result = engine.resolve_waitlist().await.unwrap();
    assert_eq!(result.resolved, 0);
    assert_eq!(result.still_waitlisted, 0);
}

#[tokio::test]
async fn test_resolver_skips_inactive_problems() {
    let (store, engine) = setup(&[("y", 1), ("w", 2)]);
    engine.submit_preferences("a", prefs(&["y"])).await.unwrap();
    engine.submit_preferences("z", prefs(&["y", "w"])).await.unwrap();
    store.upsert_problem(Problem {
        id: "w".to_string(),
        capacity: 2,
        is_active: false,
    });

    let result = engine.resolve_waitlist().await.unwrap();

    assert_eq!(result.still_waitlisted, 1);
    assert_eq!(allocated_count(&engine, "w").await, 0);
}

async fn seeded_winners(seed: u64) -> Vec<String> {
    let (_, engine) = setup_with_seed(&[("y", 1), ("w", 2)], Some(seed));
    engine.submit_preferences("holder", prefs(&["y"])).await.unwrap();
    for team in ["t1", "t2", "t3", "t4", "t5", "t6"] {
        engine.submit_preferences(team, prefs(&["y", "w"])).await.unwrap();
    }
    engine.resolve_waitlist().await.unwrap();

    let mut winners: Vec<_> = engine
        .list_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method == Some(AllocationMethod::Random))
        .map(|r| r.team_id)
        .collect();
    winners.sort();
    winners
}

#[tokio::test]
async fn test_seeded_resolution_is_reproducible() {
    let first = seeded_winners(1234).await;
    let second = seeded_winners(1234).await;
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
}

// ─────────────────────────────────────────────────────────
// Store-level edge cases
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_seat_waitlisted_rejects_stale_snapshots() {
    let (store, engine) = setup(&[("y", 1), ("w", 2)]);
    engine.submit_preferences("a", prefs(&["y"])).await.unwrap();
    engine.submit_preferences("z", prefs(&["y", "w"])).await.unwrap();
    engine.submit_preferences("q", prefs(&["y", "w"])).await.unwrap();
    let snapshot = store.waitlisted().await.unwrap();
    assert_eq!(snapshot.len(), 2);

    engine.retract("z").await.unwrap();
    engine.submit_preferences("q", prefs(&["y"])).await.unwrap();

    for request in &snapshot {
        let outcome = store.seat_waitlisted(request, "w", 0).await.unwrap();
        assert_eq!(outcome, SeatOutcome::Stale);
    }
    assert_eq!(allocated_count(&engine, "w").await, 0);
}

#[tokio::test]
async fn test_reconcile_repairs_drift() {
    let (store, engine) = setup(&[("x", 3), ("y", 3)]);
    engine.submit_preferences("a", prefs(&["x"])).await.unwrap();
    engine.submit_preferences("b", prefs(&["x"])).await.unwrap();
    store.force_ledger_count("x", 0);
    store.force_ledger_count("y", 2);

    let drifts = engine.reconcile_ledger().await.unwrap();

    assert_eq!(drifts.len(), 2);
    assert_eq!(drifts[0].problem_id, "x");
    assert_eq!(drifts[0].ledger_count, 0);
    assert_eq!(drifts[0].record_count, 2);
    assert_eq!(drifts[1].problem_id, "y");
    assert_eq!(drifts[1].record_count, 0);
    check_invariants(&engine).await;
    assert!(engine.reconcile_ledger().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stats_counts_by_status() {
    let (_, engine) = setup(&[("x", 1)]);
    engine.submit_preferences("a", prefs(&["x"])).await.unwrap();
    engine.submit_preferences("b", prefs(&["x"])).await.unwrap();
    engine.submit_preferences("c", prefs(&["x"])).await.unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.waitlisted, 2);
}
