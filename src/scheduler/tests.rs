use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

const H: Ms = 3_600_000;
const M: Ms = 60_000;
/// 2024-01-01T00:00:00Z
const DAY: Ms = 1_704_067_200_000;

fn at(hour: Ms, minute: Ms) -> Ms {
    DAY + hour * H + minute * M
}

fn w(start: Ms, end: Ms) -> Window {
    Window::new(start, end)
}

/// Some window starting `hours` from now, one hour long.
fn ahead(hours: Ms) -> Window {
    let start = now_ms() + hours * H;
    w(start, start + H)
}

fn admin() -> Actor {
    Actor::new("ops-1", Role::Admin)
}

fn agent() -> Actor {
    Actor::new("agent-7", Role::GateAgent)
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
    failing: AtomicBool,
}

impl RecordingSink {
    fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssignmentSink for RecordingSink {
    async fn persist(&self, event: &Event) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("disk full"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn recorded(options: SchedulerOptions) -> (Scheduler, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let scheduler = Scheduler::new(
        Policy::default(),
        options,
        sink.clone(),
        Arc::new(NotifyHub::new()),
    );
    (scheduler, sink)
}

async fn register(s: &Scheduler, class: ResourceClass) -> Ulid {
    s.register_resource(&admin(), Ulid::new(), class, None, None)
        .await
        .unwrap()
}

fn assert_disjoint(intervals: &[Interval]) {
    for (i, a) in intervals.iter().enumerate() {
        for b in &intervals[i + 1..] {
            assert!(!a.window.overlaps(&b.window), "{:?} overlaps {:?}", a.window, b.window);
        }
    }
}

// ── Core scenarios ───────────────────────────────────────

#[tokio::test]
async fn conflict_names_holder_then_clears_after_cancel() {
    let s = Scheduler::in_memory();
    let r1 = register(&s, ResourceClass::Gate).await;
    let f1 = Ulid::new();
    let f2 = Ulid::new();

    let a1 = s
        .create(&admin(), f1, ResourceClass::Gate, r1, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    let err = s
        .create(&admin(), f2, ResourceClass::Gate, r1, w(at(10, 30), at(10, 45)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SchedulerError::ResourceConflict {
            assignment_id: a1,
            flight_id: Some(f1),
            window: w(at(10, 0), at(11, 0)),
        }
    );
    assert_eq!(err.kind(), ErrorKind::ResourceConflict);

    s.create(&admin(), f2, ResourceClass::Gate, r1, w(at(11, 0), at(11, 30)))
        .await
        .unwrap();

    assert!(s.cancel(&admin(), a1).await.unwrap());
    s.create(&admin(), f2, ResourceClass::Gate, r1, w(at(10, 30), at(10, 45)))
        .await
        .unwrap();
}

#[tokio::test]
async fn back_to_back_on_both_sides() {
    let s = Scheduler::in_memory();
    let r = register(&s, ResourceClass::Runway).await;
    s.create(&admin(), Ulid::new(), ResourceClass::Runway, r, w(at(10, 0), at(10, 5)))
        .await
        .unwrap();
    s.create(&admin(), Ulid::new(), ResourceClass::Runway, r, w(at(9, 55), at(10, 0)))
        .await
        .unwrap();
    s.create(&admin(), Ulid::new(), ResourceClass::Runway, r, w(at(10, 5), at(10, 10)))
        .await
        .unwrap();
    assert_eq!(s.assignments_for_resource(&admin(), r).await.unwrap().len(), 3);
}

#[tokio::test]
async fn cancel_twice_is_ok() {
    let s = Scheduler::in_memory();
    let r = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, r, w(at(8, 0), at(9, 0)))
        .await
        .unwrap();

    assert!(s.cancel(&admin(), id).await.unwrap());
    assert!(!s.cancel(&admin(), id).await.unwrap());
    assert_eq!(s.assignment(&admin(), id).unwrap().status, AssignmentStatus::Cancelled);
    assert!(s.store().intervals(r).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_assignment_cannot_be_rescheduled() {
    let s = Scheduler::in_memory();
    let r = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, r, w(at(8, 0), at(9, 0)))
        .await
        .unwrap();
    s.cancel(&admin(), id).await.unwrap();
    assert_eq!(
        s.reschedule(&admin(), id, w(at(9, 0), at(10, 0))).await,
        Err(SchedulerError::NotFound(id))
    );
}

#[tokio::test]
async fn reschedule_by_a_few_minutes_never_hits_itself() {
    let s = Scheduler::in_memory();
    let r = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, r, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    s.reschedule(&agent(), id, w(at(10, 5), at(11, 5))).await.unwrap();
    s.reschedule(&agent(), id, w(at(9, 55), at(10, 30))).await.unwrap();

    let a = s.assignment(&agent(), id).unwrap();
    assert_eq!(a.window, w(at(9, 55), at(10, 30)));
    assert_eq!(s.store().intervals(r).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reschedule_conflict_keeps_old_window() {
    let s = Scheduler::in_memory();
    let r = register(&s, ResourceClass::Gate).await;
    let a = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, r, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    let b = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, r, w(at(12, 0), at(13, 0)))
        .await
        .unwrap();

    let err = s.reschedule(&admin(), b, w(at(10, 30), at(12, 30))).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceConflict { assignment_id, .. } if assignment_id == a));
    assert_eq!(s.assignment(&admin(), b).unwrap().window, w(at(12, 0), at(13, 0)));
}

#[tokio::test]
async fn gate_agent_cannot_delete_runway_even_when_idle() {
    let s = Scheduler::in_memory();
    let runway = register(&s, ResourceClass::Runway).await;

    let err = s
        .delete_resource(&agent(), ResourceClass::Runway, runway)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    s.create(&admin(), Ulid::new(), ResourceClass::Runway, runway, ahead(24))
        .await
        .unwrap();
    let err = s
        .delete_resource(&agent(), ResourceClass::Runway, runway)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    // Unknown id: still a policy answer, not a lookup one.
    let err = s
        .delete_resource(&agent(), ResourceClass::Runway, Ulid::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn delete_gate_with_only_past_assignments() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let past = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    s.delete_resource(&agent(), ResourceClass::Gate, gate).await.unwrap();
    assert_eq!(
        s.assignment(&admin(), past),
        Err(SchedulerError::NotFound(past))
    );
    assert!(s.list_resources(&admin(), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_gate_with_future_assignment_in_use() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    s.create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    s.create(&admin(), Ulid::new(), ResourceClass::Gate, gate, ahead(48))
        .await
        .unwrap();

    assert_eq!(
        s.delete_resource(&agent(), ResourceClass::Gate, gate).await,
        Err(SchedulerError::ResourceInUse {
            resource_id: gate,
            active: 1
        })
    );
    assert_eq!(s.list_resources(&admin(), None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_wrong_class_is_invalid_request() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let err = s
        .delete_resource(&admin(), ResourceClass::Runway, gate)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

// ── Validation and policy ordering ───────────────────────

#[tokio::test]
async fn forbidden_comes_before_window_check() {
    let s = Scheduler::in_memory();
    let security = Actor::new("sec-2", Role::Security);
    let err = s
        .create(&security, Ulid::new(), ResourceClass::Gate, Ulid::new(), Window { start: 5, end: 1 })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn invalid_window_before_resource_lookup() {
    let s = Scheduler::in_memory();
    for bad in [Window { start: at(10, 0), end: at(10, 0) }, Window { start: at(11, 0), end: at(10, 0) }] {
        let err = s
            .create(&admin(), Ulid::new(), ResourceClass::Gate, Ulid::new(), bad)
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::InvalidWindow(bad));
    }
}

#[tokio::test]
async fn unknown_resource_and_assignment_not_found() {
    let s = Scheduler::in_memory();
    let rid = Ulid::new();
    assert_eq!(
        s.create(&admin(), Ulid::new(), ResourceClass::Gate, rid, w(at(1, 0), at(2, 0))).await,
        Err(SchedulerError::NotFound(rid))
    );
    let aid = Ulid::new();
    assert_eq!(s.cancel(&admin(), aid).await, Err(SchedulerError::NotFound(aid)));
    assert_eq!(
        s.reschedule(&admin(), aid, w(at(1, 0), at(2, 0))).await,
        Err(SchedulerError::NotFound(aid))
    );
}

#[tokio::test]
async fn non_schedulable_class_rejected() {
    let s = Scheduler::in_memory();
    let err = s
        .register_resource(&admin(), Ulid::new(), ResourceClass::Vehicle, None, None)
        .await
        .unwrap_err();
    assert_eq!(err, SchedulerError::NotSchedulable(ResourceClass::Vehicle));

    let err = s
        .create(&admin(), Ulid::new(), ResourceClass::Flight, Ulid::new(), w(at(1, 0), at(2, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn class_must_match_resource() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let err = s
        .create(&admin(), Ulid::new(), ResourceClass::Runway, gate, w(at(1, 0), at(2, 0)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SchedulerError::ClassMismatch {
            resource_id: gate,
            expected: ResourceClass::Runway,
            actual: ResourceClass::Gate,
        }
    );
}

#[tokio::test]
async fn gate_agent_books_gates_but_only_views_runways() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let runway = register(&s, ResourceClass::Runway).await;

    s.create(&agent(), Ulid::new(), ResourceClass::Gate, gate, w(at(1, 0), at(2, 0)))
        .await
        .unwrap();
    let err = s
        .create(&agent(), Ulid::new(), ResourceClass::Runway, runway, w(at(1, 0), at(2, 0)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SchedulerError::Forbidden {
            role: Role::GateAgent,
            class: ResourceClass::Runway,
            action: Action::Create,
        }
    );
    assert!(s.conflicts(&agent(), runway, w(at(0, 0), at(23, 0))).await.unwrap().is_empty());
}

#[tokio::test]
async fn airline_staff_lists_gates_only() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    register(&s, ResourceClass::Runway).await;
    let staff = Actor::new("crew-desk", Role::AirlineStaff);

    let visible = s.list_resources(&staff, None).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, gate);
    assert_eq!(
        s.list_resources(&staff, Some(ResourceClass::Runway)).await.unwrap_err().kind(),
        ErrorKind::Forbidden
    );
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn conflicts_query_names_flights_in_order() {
    let s = Scheduler::in_memory();
    let r = register(&s, ResourceClass::Gate).await;
    let f1 = Ulid::new();
    let f2 = Ulid::new();
    let a2 = s
        .create(&admin(), f2, ResourceClass::Gate, r, w(at(12, 0), at(13, 0)))
        .await
        .unwrap();
    let a1 = s
        .create(&admin(), f1, ResourceClass::Gate, r, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    let hits = s.conflicts(&admin(), r, w(at(10, 30), at(12, 30))).await.unwrap();
    assert_eq!(
        hits,
        vec![
            ConflictInfo { assignment_id: a1, flight_id: Some(f1), window: w(at(10, 0), at(11, 0)) },
            ConflictInfo { assignment_id: a2, flight_id: Some(f2), window: w(at(12, 0), at(13, 0)) },
        ]
    );
    assert!(s.conflicts(&admin(), r, w(at(11, 0), at(12, 0))).await.unwrap().is_empty());
    assert_eq!(
        s.conflicts(&admin(), r, Window { start: at(9, 0), end: at(9, 0) }).await.unwrap_err().kind(),
        ErrorKind::InvalidWindow
    );
}

#[tokio::test]
async fn conflicts_query_with_extreme_bounds_is_limited() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let widest = Window { start: i64::MIN, end: i64::MAX };
    let err = s.conflicts(&admin(), gate, widest).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);

    let too_early = Window { start: i64::MIN, end: at(1, 0) };
    assert_eq!(
        s.conflicts(&admin(), gate, too_early).await.unwrap_err().kind(),
        ErrorKind::LimitExceeded
    );
}

#[tokio::test]
async fn flight_view_spans_gate_and_runway() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let runway = register(&s, ResourceClass::Runway).await;
    let flight = Ulid::new();

    s.create(&admin(), flight, ResourceClass::Runway, runway, w(at(14, 0), at(14, 5)))
        .await
        .unwrap();
    s.create(&admin(), flight, ResourceClass::Gate, gate, w(at(12, 0), at(13, 30)))
        .await
        .unwrap();
    s.create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(15, 0), at(16, 0)))
        .await
        .unwrap();

    let mine = s.assignments_for_flight(&admin(), flight).unwrap();
    let classes: Vec<_> = mine.iter().map(|a| a.class).collect();
    assert_eq!(classes, vec![ResourceClass::Gate, ResourceClass::Runway]);

    let staff = Actor::new("crew-desk", Role::AirlineStaff);
    let visible = s.assignments_for_flight(&staff, flight).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].class, ResourceClass::Gate);
}

// ── Reassign ─────────────────────────────────────────────

#[tokio::test]
async fn reassign_moves_between_gates() {
    let s = Scheduler::in_memory();
    let g1 = register(&s, ResourceClass::Gate).await;
    let g2 = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, g1, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    s.reassign(&agent(), id, g2, None).await.unwrap();

    let a = s.assignment(&admin(), id).unwrap();
    assert_eq!(a.resource_id, g2);
    assert_eq!(a.window, w(at(10, 0), at(11, 0)));
    assert!(s.store().intervals(g1).await.unwrap().is_empty());
    assert_eq!(s.store().intervals(g2).await.unwrap().len(), 1);

    // g1 is free again
    s.create(&admin(), Ulid::new(), ResourceClass::Gate, g1, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn reassign_conflict_leaves_source_booked() {
    let s = Scheduler::in_memory();
    let g1 = register(&s, ResourceClass::Gate).await;
    let g2 = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, g1, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    let blocker = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, g2, w(at(10, 30), at(12, 0)))
        .await
        .unwrap();

    let err = s.reassign(&admin(), id, g2, None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceConflict { assignment_id, .. } if assignment_id == blocker));
    assert_eq!(s.assignment(&admin(), id).unwrap().resource_id, g1);

    s.reassign(&admin(), id, g2, Some(w(at(12, 0), at(13, 0)))).await.unwrap();
    assert_eq!(s.assignment(&admin(), id).unwrap().window, w(at(12, 0), at(13, 0)));
}

#[tokio::test]
async fn reassign_to_runway_is_class_mismatch() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let runway = register(&s, ResourceClass::Runway).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    let err = s.reassign(&admin(), id, runway, None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ClassMismatch { .. }));
    assert_eq!(s.store().intervals(gate).await.unwrap().len(), 1);
    assert!(s.store().intervals(runway).await.unwrap().is_empty());
}

#[tokio::test]
async fn reassign_same_resource_acts_as_reschedule() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    s.reassign(&admin(), id, gate, Some(w(at(10, 30), at(11, 30)))).await.unwrap();
    assert_eq!(s.assignment(&admin(), id).unwrap().window, w(at(10, 30), at(11, 30)));
}

// ── Persistence and rollback ─────────────────────────────

#[tokio::test]
async fn failed_write_rolls_back_create() {
    let (s, sink) = recorded(SchedulerOptions::default());
    let gate = register(&s, ResourceClass::Gate).await;

    sink.fail(true);
    let err = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert!(err.is_retryable());
    assert!(s.store().intervals(gate).await.unwrap().is_empty());
    assert!(s.assignments_for_resource(&admin(), gate).await.unwrap().is_empty());

    sink.fail(false);
    s.create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_write_restores_cancel_and_reschedule() {
    let (s, sink) = recorded(SchedulerOptions::default());
    let gate = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    sink.fail(true);
    assert_eq!(s.cancel(&admin(), id).await.unwrap_err().kind(), ErrorKind::Persistence);
    assert_eq!(
        s.reschedule(&admin(), id, w(at(12, 0), at(13, 0))).await.unwrap_err().kind(),
        ErrorKind::Persistence
    );

    let intervals = s.store().intervals(gate).await.unwrap();
    assert_eq!(intervals, vec![Interval { id, window: w(at(10, 0), at(11, 0)) }]);
    assert_eq!(s.assignment(&admin(), id).unwrap().status, AssignmentStatus::Committed);
}

#[tokio::test]
async fn failed_write_restores_reassign() {
    let (s, sink) = recorded(SchedulerOptions::default());
    let g1 = register(&s, ResourceClass::Gate).await;
    let g2 = register(&s, ResourceClass::Gate).await;
    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, g1, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();

    sink.fail(true);
    assert!(s.reassign(&admin(), id, g2, None).await.is_err());
    assert_eq!(s.store().intervals(g1).await.unwrap().len(), 1);
    assert!(s.store().intervals(g2).await.unwrap().is_empty());
    assert_eq!(s.store().resource_for_interval(&id), Some(g1));
}

#[tokio::test]
async fn failed_write_undoes_registration() {
    let (s, sink) = recorded(SchedulerOptions::default());
    sink.fail(true);
    let id = Ulid::new();
    assert!(s
        .register_resource(&admin(), id, ResourceClass::Gate, None, None)
        .await
        .is_err());
    assert!(!s.store().contains_resource(&id));
}

#[tokio::test]
async fn replay_rebuilds_same_state() {
    let (s, sink) = recorded(SchedulerOptions::default());
    let g1 = register(&s, ResourceClass::Gate).await;
    let g2 = register(&s, ResourceClass::Gate).await;
    let gone = register(&s, ResourceClass::Runway).await;
    let a = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, g1, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    let b = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, g1, w(at(12, 0), at(13, 0)))
        .await
        .unwrap();
    s.reassign(&admin(), b, g2, None).await.unwrap();
    s.reschedule(&admin(), a, w(at(9, 0), at(10, 0))).await.unwrap();
    let c = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, g2, w(at(14, 0), at(15, 0)))
        .await
        .unwrap();
    s.cancel(&admin(), c).await.unwrap();
    s.delete_resource(&admin(), ResourceClass::Runway, gone).await.unwrap();

    let restored = Scheduler::in_memory();
    let events = sink.events();
    assert_eq!(restored.replay(events.clone()).await, events.len());

    assert_eq!(restored.assignment(&admin(), a).unwrap().window, w(at(9, 0), at(10, 0)));
    assert_eq!(restored.assignment(&admin(), b).unwrap().resource_id, g2);
    assert_eq!(restored.assignment(&admin(), c).unwrap().status, AssignmentStatus::Cancelled);
    assert!(!restored.store().contains_resource(&gone));
    assert_eq!(
        restored.store().list_resources().await,
        s.store().list_resources().await
    );
}

#[tokio::test]
async fn snapshot_keeps_only_live_state() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let kept = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    let dropped = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(11, 0), at(12, 0)))
        .await
        .unwrap();
    s.cancel(&admin(), dropped).await.unwrap();

    let snapshot = {
        let _pause = s.pause_mutations().await;
        s.snapshot_events().await
    };
    assert_eq!(snapshot.len(), 3);
    assert!(matches!(snapshot[0], Event::ResourceRegistered { id, .. } if id == gate));
    assert!(snapshot[1..]
        .iter()
        .any(|e| matches!(e, Event::AssignmentCommitted { id, .. } if *id == kept)));
    assert!(snapshot[1..]
        .iter()
        .any(|e| matches!(e, Event::AssignmentCancelled { id, .. } if *id == dropped)));

    let restored = Scheduler::in_memory();
    assert_eq!(restored.replay(snapshot).await, 3);
    assert_eq!(restored.store().intervals(gate).await.unwrap().len(), 1);
    assert_eq!(restored.assignment(&admin(), dropped).unwrap().status, AssignmentStatus::Cancelled);
}

#[tokio::test]
async fn cancel_retried_after_restart_is_still_a_no_op() {
    let (s, sink) = recorded(SchedulerOptions { one_active_per_flight: true });
    let gate = register(&s, ResourceClass::Gate).await;
    let flight = Ulid::new();
    let id = s.create(&admin(), flight, ResourceClass::Gate, gate, ahead(3)).await.unwrap();
    assert_eq!(s.cancel(&admin(), id).await, Ok(true));

    let (restored, _) = recorded(SchedulerOptions { one_active_per_flight: true });
    let events = sink.events();
    assert_eq!(restored.replay(events.clone()).await, events.len());
    assert_eq!(restored.cancel(&admin(), id).await, Ok(false));
    assert!(restored.store().intervals(gate).await.unwrap().is_empty());

    // The flight is free to book again after the replayed cancel.
    restored
        .create(&admin(), flight, ResourceClass::Gate, gate, ahead(3))
        .await
        .unwrap();
}

// ── Housekeeping and notifications ───────────────────────

#[tokio::test]
async fn prune_history_drops_old_records() {
    let (s, sink) = recorded(SchedulerOptions::default());
    let gate = register(&s, ResourceClass::Gate).await;
    let old = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(1, 0), at(2, 0)))
        .await
        .unwrap();
    let tombstone = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(3, 0), at(4, 0)))
        .await
        .unwrap();
    s.cancel(&admin(), tombstone).await.unwrap();
    let recent = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(20, 0), at(21, 0)))
        .await
        .unwrap();

    assert_eq!(s.prune_history(at(12, 0)).await, 2);
    assert!(s.assignment(&admin(), old).is_err());
    assert!(s.assignment(&admin(), tombstone).is_err());
    assert!(s.assignment(&admin(), recent).is_ok());
    assert_eq!(s.store().intervals(gate).await.unwrap().len(), 1);
    let released: Vec<Ulid> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::AssignmentReleased { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(released.len(), 2);
    assert!(released.contains(&old) && released.contains(&tombstone));

    assert_eq!(s.prune_history(at(12, 0)).await, 0);

    let restored = Scheduler::in_memory();
    restored.replay(sink.events()).await;
    assert!(restored.assignment(&admin(), tombstone).is_err());
    assert!(restored.assignment(&admin(), recent).is_ok());
}

#[tokio::test]
async fn subscribers_see_committed_events() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let mut rx = s.subscribe(&agent(), gate).await.unwrap();

    let id = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    match rx.recv().await.unwrap() {
        Event::AssignmentCommitted { id: got, resource_id, .. } => {
            assert_eq!(got, id);
            assert_eq!(resource_id, gate);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Rejected work publishes nothing.
    let _ = s
        .create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await;
    s.cancel(&admin(), id).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), Event::AssignmentCancelled { id: got, .. } if got == id));
}

// ── One active assignment per flight ─────────────────────

#[tokio::test]
async fn one_active_per_flight_when_enabled() {
    let (s, _) = recorded(SchedulerOptions { one_active_per_flight: true });
    let g1 = register(&s, ResourceClass::Gate).await;
    let g2 = register(&s, ResourceClass::Gate).await;
    let runway = register(&s, ResourceClass::Runway).await;
    let flight = Ulid::new();

    let first = s.create(&admin(), flight, ResourceClass::Gate, g1, ahead(2)).await.unwrap();
    let err = s
        .create(&admin(), flight, ResourceClass::Gate, g2, ahead(5))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SchedulerError::FlightAlreadyAssigned {
            flight_id: flight,
            class: ResourceClass::Gate,
            assignment_id: first,
        }
    );
    // Different class is a separate slot.
    s.create(&admin(), flight, ResourceClass::Runway, runway, ahead(3)).await.unwrap();

    s.cancel(&admin(), first).await.unwrap();
    s.create(&admin(), flight, ResourceClass::Gate, g2, ahead(5)).await.unwrap();
}

#[tokio::test]
async fn past_assignment_frees_flight_slot() {
    let (s, _) = recorded(SchedulerOptions { one_active_per_flight: true });
    let gate = register(&s, ResourceClass::Gate).await;
    let flight = Ulid::new();
    s.create(&admin(), flight, ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
        .await
        .unwrap();
    s.create(&admin(), flight, ResourceClass::Gate, gate, ahead(1)).await.unwrap();
}

#[tokio::test]
async fn multiple_assignments_per_flight_by_default() {
    let s = Scheduler::in_memory();
    let gate = register(&s, ResourceClass::Gate).await;
    let flight = Ulid::new();
    s.create(&admin(), flight, ResourceClass::Gate, gate, ahead(1)).await.unwrap();
    s.create(&admin(), flight, ResourceClass::Gate, gate, ahead(3)).await.unwrap();
    assert_eq!(s.assignments_for_flight(&admin(), flight).unwrap().len(), 2);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_for_one_window_admit_one() {
    let s = Arc::new(Scheduler::in_memory());
    let gate = register(&s, ResourceClass::Gate).await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let s = s.clone();
        handles.push(tokio::spawn(async move {
            s.create(&admin(), Ulid::new(), ResourceClass::Gate, gate, w(at(10, 0), at(11, 0)))
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::ResourceConflict),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_create_and_reschedule_never_overlap() {
    let s = Arc::new(Scheduler::in_memory());
    let gates = [
        register(&s, ResourceClass::Gate).await,
        register(&s, ResourceClass::Gate).await,
        register(&s, ResourceClass::Gate).await,
    ];

    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let s = s.clone();
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(0xA9_0000 + worker);
            let mut mine: Vec<Ulid> = Vec::new();
            for _ in 0..200 {
                let start = at(0, 0) + rng.gen_range(0..96) * 15 * M;
                let window = w(start, start + rng.gen_range(1..8) * 15 * M);
                let roll = rng.gen_range(0..10);
                if roll < 5 || mine.is_empty() {
                    let gate = gates[rng.gen_range(0..gates.len())];
                    if let Ok(id) = s.create(&admin(), Ulid::new(), ResourceClass::Gate, gate, window).await {
                        mine.push(id);
                    }
                } else if roll < 8 {
                    let id = mine[rng.gen_range(0..mine.len())];
                    let _ = s.reschedule(&admin(), id, window).await;
                } else if roll < 9 {
                    let id = mine[rng.gen_range(0..mine.len())];
                    let gate = gates[rng.gen_range(0..gates.len())];
                    let _ = s.reassign(&admin(), id, gate, Some(window)).await;
                } else {
                    let id = mine.swap_remove(rng.gen_range(0..mine.len()));
                    s.cancel(&admin(), id).await.unwrap();
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for gate in gates {
        let intervals = s.store().intervals(gate).await.unwrap();
        assert_disjoint(&intervals);
        let records = s.assignments_for_resource(&admin(), gate).await.unwrap();
        assert_eq!(records.len(), intervals.len());
        for r in records {
            assert!(intervals.contains(&Interval { id: r.id, window: r.window }));
        }
    }
}
