//! Two engines on separate connections to one database file racing for
//! the same capacity. The store's immediate transactions must let exactly
//! one of them through.

use chrono::{DateTime, TimeZone, Utc};
use cleanmatch_core::{
    access::{Actor, Role},
    clock::ManualClock,
    config::MatchConfig,
    engine::{MatchEngine, NewJob},
    error::MatchResult,
    locks::LockRequest,
    model::{AssignmentMode, AvailabilitySlot, LockRecord, Provider, ProviderKind, TeamMember},
    scheduler::{Sweep, UnmatchedRetrySweep},
    store::MatchStore,
    team::NewTeam,
};
use std::sync::{Arc, Barrier};
use std::thread;

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
        rating_count: 1,
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

fn engine_on(store: MatchStore) -> MatchEngine {
    let clock = Arc::new(ManualClock::new(at(1, 12)));
    MatchEngine::new(store, MatchConfig::default_test(), clock).expect("engine")
}

fn job(engine: &MatchEngine) -> String {
    job_in_mode(engine, AssignmentMode::Manual)
}

fn job_in_mode(engine: &MatchEngine, mode: AssignmentMode) -> String {
    engine
        .create_job(NewJob {
            client_id: "client-1".into(),
            service: "standard".into(),
            eco_preference: false,
            city: None,
            postal_code: None,
            start_at: at(2, 9),
            end_at: at(2, 11),
            required_members: 1,
            surface_m2: None,
            assignment_mode: mode,
        })
        .expect("job")
        .id
}

/// Runs `request` for each job on its own engine, all released at once.
fn race(
    engines: Vec<MatchEngine>,
    jobs: Vec<String>,
    request: LockRequest,
) -> Vec<MatchResult<Vec<LockRecord>>> {
    let barrier = Arc::new(Barrier::new(engines.len()));
    let handles: Vec<_> = engines
        .into_iter()
        .zip(jobs)
        .map(|(engine, job_id)| {
            let barrier = barrier.clone();
            let request = request.clone();
            thread::spawn(move || {
                let actor = Actor::new("op-1", Role::Operator);
                barrier.wait();
                engine.create_locks(&actor, &job_id, &request)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().expect("thread panicked")).collect()
}

#[test]
fn last_team_unit_goes_to_exactly_one_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("match.db");
    let store = MatchStore::open(path.to_str().unwrap()).unwrap();
    store.migrate().unwrap();
    let main = engine_on(store);

    for id in ["m1", "m2"] {
        main.store().insert_provider(&provider(id)).unwrap();
    }
    let crew = main
        .create_team(
            &Actor::system(),
            NewTeam {
                name: "Crew".into(),
                timezone: "UTC".into(),
                daily_capacity_cap: Some(1),
                services: vec![],
                members: vec![
                    TeamMember { provider_id: "m1".into(), is_lead: true, order_index: 0 },
                    TeamMember { provider_id: "m2".into(), is_lead: false, order_index: 1 },
                ],
            },
        )
        .unwrap();
    let jobs = vec![job(&main), job(&main)];

    let engines = vec![
        engine_on(main.store().reopen().unwrap()),
        engine_on(main.store().reopen().unwrap()),
    ];
    let results = race(engines, jobs, LockRequest::team(crew.id.as_str(), Some(1)));

    let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let lost: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(won.len(), 1);
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].code(), "CAPACITY_EXCEEDED");

    let slot = main
        .ensure_slot(&crew.id, at(2, 9), at(2, 11))
        .unwrap();
    assert_eq!(slot.capacity, 1);
    assert_eq!(slot.booked, 1);
    assert_eq!(main.store().active_units_on_slot(&slot.id).unwrap(), 1);
}

#[test]
fn a_provider_is_locked_for_one_job_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("match.db");
    let store = MatchStore::open(path.to_str().unwrap()).unwrap();
    store.migrate().unwrap();
    let main = engine_on(store);

    main.store().insert_provider(&provider("solo")).unwrap();
    let jobs = vec![job(&main), job(&main)];

    let engines = vec![
        engine_on(main.store().reopen().unwrap()),
        engine_on(main.store().reopen().unwrap()),
    ];
    let results = race(engines, jobs, LockRequest::providers(&["solo"]));

    let codes: Vec<&str> = results
        .iter()
        .filter_map(|r| r.as_ref().err().map(|e| e.code()))
        .collect();
    assert_eq!(codes, ["PROVIDER_ALREADY_LOCKED"]);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
}

#[test]
fn overlapping_retry_sweeps_escalate_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("match.db");
    let store = MatchStore::open(path.to_str().unwrap()).unwrap();
    store.migrate().unwrap();
    let main = engine_on(store);

    // Two misses already recorded; the next one reaches the cap.
    let job_id = job_in_mode(&main, AssignmentMode::Auto);
    let mut stored = main.store().get_job(&job_id).unwrap().unwrap();
    stored.matching_retry_count = 2;
    stored.fallback_requested_at = Some(at(1, 10));
    main.store().save_matching_state(&stored, at(1, 11)).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine_on(main.store().reopen().unwrap());
            let sweep = UnmatchedRetrySweep::new(main.config().scheduler.clone());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                sweep.run(&engine, at(1, 12))
            })
        })
        .collect();
    for h in handles {
        let report = h.join().expect("thread panicked").expect("sweep");
        assert_eq!(report.failed, 0);
    }

    let stored = main.store().get_job(&job_id).unwrap().unwrap();
    assert_eq!(stored.matching_retry_count, 3);
    assert_eq!(stored.fallback_escalated_at, Some(at(1, 12)));
    assert_eq!(main.store().count_events("match_retry_failed").unwrap(), 1);
    assert_eq!(main.store().count_events("job_escalated").unwrap(), 1);
}
