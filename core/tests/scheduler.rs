use chrono::{DateTime, Duration, TimeZone, Utc};
use cleanmatch_core::{
    access::{Actor, Role},
    clock::ManualClock,
    engine::{MatchEngine, NewJob, OPERATIONS_RECIPIENT},
    event::MatchEvent,
    locks::LockRequest,
    model::{AssignmentMode, AvailabilitySlot, JobStatus, LockTarget, Provider, ProviderKind, ReleaseReason, TeamMember},
    notify::RecordingNotifier,
    scheduler::{ExpiredLockSweep, Sweep, SweepReport, SweepScheduler, Trigger},
    team::NewTeam,
};
use std::sync::{atomic::AtomicBool, Arc};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

fn provider(id: &str) -> Provider {
    Provider {
        id: id.into(),
        display_name: id.into(),
        kind: ProviderKind::Individual,
        active: true,
        eco_friendly: false,
        hourly_rate: 30.0,
        rating_average: 4.0,
        rating_count: 3,
        services: vec!["standard".into()],
        service_zones: vec![],
        areas: vec![],
        slots: vec![AvailabilitySlot {
            weekday: 1,
            start_minute: 8 * 60,
            end_minute: 18 * 60,
            timezone: "UTC".into(),
            active: true,
        }],
        time_off: vec![],
    }
}

fn setup(providers: &[&str]) -> (MatchEngine, Arc<ManualClock>, Arc<RecordingNotifier>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (engine, clock) = MatchEngine::build_test(at(1, 12)).expect("engine");
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = engine.with_notifier(Box::new(notifier.clone()));
    for id in providers {
        engine.store().insert_provider(&provider(id)).unwrap();
    }
    (engine, clock, notifier)
}

fn job(engine: &MatchEngine, required: u32, mode: AssignmentMode) -> String {
    engine
        .create_job(NewJob {
            client_id: "client-1".into(),
            service: "standard".into(),
            eco_preference: false,
            city: None,
            postal_code: None,
            start_at: at(2, 9),
            end_at: at(2, 11),
            required_members: required,
            surface_m2: None,
            assignment_mode: mode,
        })
        .expect("job")
        .id
}

fn scheduler(engine: &MatchEngine) -> SweepScheduler {
    SweepScheduler::standard(&engine.config().scheduler, Trigger::Manual)
}

fn report<'a>(reports: &'a [SweepReport], sweep: &str) -> &'a SweepReport {
    reports.iter().find(|r| r.sweep == sweep).expect("sweep report")
}

fn ops() -> Actor {
    Actor::new("op-1", Role::Operator)
}

#[test]
fn sweeps_run_in_fixed_order() {
    let (engine, _clock, _) = setup(&[]);
    let names: Vec<String> = scheduler(&engine).run_once(&engine).into_iter().map(|r| r.sweep).collect();
    assert_eq!(names, ["retry", "promotion", "expiry"]);
}

#[test]
fn stale_unmatched_job_is_matched_on_retry() {
    let (engine, clock, notifier) = setup(&["p1"]);
    let job_id = job(&engine, 1, AssignmentMode::Auto);
    let runner = scheduler(&engine);

    // Freshly touched jobs wait out the stale threshold.
    assert_eq!(report(&runner.run_once(&engine), "retry").examined, 0);

    clock.advance(Duration::minutes(6));
    let reports = runner.run_once(&engine);
    let retry = report(&reports, "retry");
    assert_eq!((retry.examined, retry.succeeded, retry.failed), (1, 1, 0));

    let stored = engine.store().get_job(&job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Assigned);
    assert_eq!(stored.matching_retry_count, 0);
    assert_eq!(engine.store().assignments_for_job(&job_id).unwrap()[0].provider_id, "p1");
    assert_eq!(notifier.count("job_matched"), 1);
}

#[test]
fn retry_count_is_capped_and_escalation_happens_once() {
    let (engine, clock, notifier) = setup(&[]);
    let job_id = job(&engine, 1, AssignmentMode::Auto);
    let runner = scheduler(&engine);
    let max = engine.config().scheduler.max_retries;

    let mut escalated_at = None;
    for cycle in 1..=6u32 {
        let now = clock.advance(Duration::minutes(6));
        runner.run_once(&engine);
        let stored = engine.store().get_job(&job_id).unwrap().unwrap();
        assert_eq!(stored.matching_retry_count, cycle.min(max), "cycle {cycle}");
        assert!(stored.fallback_requested_at.is_some());
        if cycle == max {
            assert_eq!(stored.fallback_escalated_at, Some(now));
            escalated_at = stored.fallback_escalated_at;
        }
        if cycle > max {
            assert_eq!(stored.fallback_escalated_at, escalated_at, "escalation must not be re-stamped");
        }
    }

    assert_eq!(engine.store().count_events("match_retry_failed").unwrap(), max as i64);
    assert_eq!(engine.store().count_events("fallback_requested").unwrap(), 1);
    assert_eq!(engine.store().count_events("job_escalated").unwrap(), 1);

    let (event, recipients) = notifier
        .sent()
        .into_iter()
        .find(|(e, _)| e.type_name() == "job_escalated")
        .expect("escalation notified");
    assert_eq!(recipients, [OPERATIONS_RECIPIENT]);
    assert!(matches!(event, MatchEvent::JobEscalated { retry_count, .. } if retry_count == max));
}

#[test]
fn manual_cancelled_and_past_jobs_are_not_retried() {
    let (engine, clock, _) = setup(&[]);
    job(&engine, 1, AssignmentMode::Manual);
    let cancelled = job(&engine, 1, AssignmentMode::Auto);
    engine.cancel_job(&ops(), &cancelled).unwrap();
    let runner = scheduler(&engine);

    clock.advance(Duration::minutes(6));
    assert_eq!(report(&runner.run_once(&engine), "retry").examined, 0);

    let late = job(&engine, 1, AssignmentMode::Auto);
    clock.set(at(2, 10));
    assert_eq!(report(&runner.run_once(&engine), "retry").examined, 0);
    let stored = engine.store().get_job(&late).unwrap().unwrap();
    assert_eq!(stored.matching_retry_count, 0);
}

#[test]
fn locked_member_defers_the_team_until_released() {
    let (engine, clock, notifier) = setup(&["m1", "m2"]);
    let crew = engine
        .create_team(
            &Actor::system(),
            NewTeam {
                name: "Crew".into(),
                timezone: "UTC".into(),
                daily_capacity_cap: None,
                services: vec![],
                members: vec![
                    TeamMember { provider_id: "m1".into(), is_lead: true, order_index: 0 },
                    TeamMember { provider_id: "m2".into(), is_lead: false, order_index: 1 },
                ],
            },
        )
        .unwrap();
    // Another job holds m2, so neither the team nor two individuals are free.
    let blocker = job(&engine, 1, AssignmentMode::Manual);
    engine.create_locks(&ops(), &blocker, &LockRequest::providers(&["m2"]).with_ttl(120)).unwrap();
    let job_id = job(&engine, 2, AssignmentMode::Auto);
    let runner = scheduler(&engine);

    clock.advance(Duration::minutes(6));
    let reports = runner.run_once(&engine);
    let retry = report(&reports, "retry");
    assert_eq!((retry.examined, retry.succeeded, retry.failed), (1, 0, 0));

    let stored = engine.store().get_job(&job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::PendingProvider);
    assert_eq!(stored.matching_retry_count, 1);
    assert!(stored.fallback_team_candidate.is_none());
    assert!(notifier.sent().iter().any(|(e, _)| matches!(
        e,
        MatchEvent::FallbackRequested { team_candidate: None, .. }
    )));

    engine.release_locks(&ops(), &blocker, None).unwrap();
    clock.advance(Duration::minutes(6));
    assert_eq!(report(&runner.run_once(&engine), "retry").succeeded, 1);
    let assignments = engine.store().assignments_for_job(&job_id).unwrap();
    assert_eq!(assignments.len(), 2);
    assert!(assignments.iter().all(|a| a.team_id.as_deref() == Some(crew.id.as_str())));
}

#[test]
fn expired_locks_are_released_and_units_returned() {
    let (engine, clock, _) = setup(&["m1", "m2"]);
    let crew = engine
        .create_team(
            &Actor::system(),
            NewTeam {
                name: "Crew".into(),
                timezone: "UTC".into(),
                daily_capacity_cap: None,
                services: vec![],
                members: vec![
                    TeamMember { provider_id: "m1".into(), is_lead: true, order_index: 0 },
                    TeamMember { provider_id: "m2".into(), is_lead: false, order_index: 1 },
                ],
            },
        )
        .unwrap();
    let job_id = job(&engine, 2, AssignmentMode::Manual);
    let locks = engine.create_locks(&ops(), &job_id, &LockRequest::team(&crew.id, None)).unwrap();
    let LockTarget::Team { slot_id, .. } = locks[0].target.clone() else { panic!("team lock expected") };

    let runner = scheduler(&engine);
    clock.advance(Duration::minutes(10));
    assert_eq!(report(&runner.run_once(&engine), "expiry").succeeded, 0, "not expired yet");

    clock.advance(Duration::minutes(10));
    let reports = runner.run_once(&engine);
    assert_eq!(report(&reports, "expiry").succeeded, 1);

    let lock = engine.store().get_lock(&locks[0].id).unwrap().unwrap();
    assert_eq!(lock.release_reason, Some(ReleaseReason::Expired));
    assert_eq!(engine.store().get_slot(&slot_id).unwrap().unwrap().booked, 0);

    // Idempotent.
    assert_eq!(report(&runner.run_once(&engine), "expiry").examined, 0);
}

#[test]
fn expiry_sweep_is_batched() {
    let (engine, clock, _) = setup(&["a", "b", "c"]);
    for id in ["a", "b", "c"] {
        let job_id = job(&engine, 1, AssignmentMode::Manual);
        engine.create_locks(&ops(), &job_id, &LockRequest::providers(&[id])).unwrap();
    }
    let now = clock.advance(Duration::minutes(30));

    let sweep = ExpiredLockSweep::new(2);
    let first = sweep.run(&engine, now).unwrap();
    assert_eq!((first.examined, first.succeeded), (2, 2));
    let second = sweep.run(&engine, now).unwrap();
    assert_eq!((second.examined, second.succeeded), (1, 1));
}

#[test]
fn locks_of_cancelled_jobs_are_left_to_the_caller() {
    let (engine, clock, _) = setup(&["a"]);
    let job_id = job(&engine, 1, AssignmentMode::Manual);
    engine.create_locks(&ops(), &job_id, &LockRequest::providers(&["a"])).unwrap();
    engine.cancel_job(&ops(), &job_id).unwrap();

    clock.advance(Duration::minutes(30));
    assert_eq!(report(&scheduler(&engine).run_once(&engine), "expiry").examined, 0);
    assert_eq!(engine.list_locks(&job_id, false).unwrap().len(), 1);
}

#[test]
fn confirmed_locks_are_promoted_by_the_sweep() {
    let (engine, _clock, _) = setup(&["a"]);
    let job_id = job(&engine, 1, AssignmentMode::Manual);
    engine.create_locks(&ops(), &job_id, &LockRequest::providers(&["a"])).unwrap();
    engine.confirm_locks(&ops(), &job_id, None).unwrap();

    let reports = scheduler(&engine).run_once(&engine);
    let promotion = report(&reports, "promotion");
    assert_eq!((promotion.examined, promotion.succeeded), (1, 1));
    let stored = engine.store().get_job(&job_id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Assigned);
    assert_eq!(engine.store().assignments_for_job(&job_id).unwrap()[0].provider_id, "a");
}

#[test]
fn run_until_honours_trigger_and_shutdown() {
    let (engine, _clock, _) = setup(&[]);
    let stop = AtomicBool::new(true);
    assert_eq!(scheduler(&engine).run_until(&engine, &stop), 1);

    let interval = SweepScheduler::standard(
        &engine.config().scheduler,
        Trigger::Interval(std::time::Duration::from_millis(10)),
    );
    assert_eq!(interval.run_until(&engine, &stop), 0);
}
