use chrono::{DateTime, TimeZone, Utc};
use cleanmatch_core::{
    access::{Actor, Role},
    candidates::MatchCriteria,
    engine::{MatchEngine, NewJob},
    error::{ConflictKind, MatchError},
    locks::LockRequest,
    model::{
        Assignment, AssignmentMode, AssignmentStatus, AvailabilitySlot, Provider, ProviderKind,
        TeamMember, TimeOffPeriod,
    },
    team::{NewTeam, Selection},
    types::TimeWindow,
};

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
        rating_count: 5,
        services: vec!["standard".into()],
        service_zones: vec![],
        areas: vec![],
        slots: (1..=5)
            .map(|weekday| AvailabilitySlot {
                weekday,
                start_minute: 8 * 60,
                end_minute: 18 * 60,
                timezone: "UTC".into(),
                active: true,
            })
            .collect(),
        time_off: vec![],
    }
}

fn engine_with(ids: &[&str]) -> MatchEngine {
    let (engine, _clock) = MatchEngine::build_test(at(1, 12)).expect("engine");
    for id in ids {
        engine.store().insert_provider(&provider(id)).unwrap();
    }
    engine
}

fn member(id: &str, lead: bool, order_index: i32) -> TeamMember {
    TeamMember { provider_id: id.into(), is_lead: lead, order_index }
}

fn team(engine: &MatchEngine, name: &str, members: Vec<TeamMember>) -> String {
    engine
        .create_team(
            &Actor::system(),
            NewTeam {
                name: name.into(),
                timezone: "UTC".into(),
                daily_capacity_cap: None,
                services: vec![],
                members,
            },
        )
        .expect("create team")
        .id
}

fn job(engine: &MatchEngine, start: DateTime<Utc>, end: DateTime<Utc>, required: u32) -> String {
    engine
        .create_job(NewJob {
            client_id: "client-1".into(),
            service: "standard".into(),
            eco_preference: false,
            city: None,
            postal_code: None,
            start_at: start,
            end_at: end,
            required_members: required,
            surface_m2: None,
            assignment_mode: AssignmentMode::Manual,
        })
        .expect("create job")
        .id
}

/// Give `provider_id` a future blocking assignment on Tuesday.
fn add_forward_load(engine: &MatchEngine, provider_id: &str) {
    let job_id = job(engine, at(3, 9), at(3, 11), 1);
    engine
        .store()
        .insert_assignment(&Assignment {
            id: format!("asg-{provider_id}"),
            job_id,
            provider_id: provider_id.into(),
            team_id: None,
            start_at: at(3, 9),
            end_at: at(3, 11),
            status: AssignmentStatus::Scheduled,
            created_at: at(1, 12),
        })
        .unwrap();
}

fn monday_criteria(required: u32) -> MatchCriteria {
    let mut c = MatchCriteria::new("standard", TimeWindow::new(at(2, 9), at(2, 11)).unwrap());
    c.required_members = required;
    c
}

#[test]
fn team_with_lowest_total_load_wins() {
    let engine = engine_with(&["p1", "p2", "p3", "p4"]);
    add_forward_load(&engine, "p1");
    let busy = team(&engine, "Busy", vec![member("p1", true, 0), member("p2", false, 1)]);
    let idle = team(&engine, "Idle", vec![member("p3", true, 0), member("p4", false, 1)]);

    let found = engine.match_team(&monday_criteria(2), 2).unwrap().expect("a team");
    assert_eq!(found.team_id, idle);
    assert_ne!(found.team_id, busy);
    assert_eq!(found.member_ids, ["p3", "p4"]);
}

#[test]
fn equal_load_goes_to_first_created_team() {
    let engine = engine_with(&["p1", "p2", "p3", "p4"]);
    let first = team(&engine, "First", vec![member("p1", false, 0), member("p2", false, 1)]);
    team(&engine, "Second", vec![member("p3", false, 0), member("p4", false, 1)]);

    let found = engine.match_team(&monday_criteria(2), 2).unwrap().expect("a team");
    assert_eq!(found.team_id, first);
}

#[test]
fn members_are_taken_lead_first() {
    let engine = engine_with(&["p1", "p2", "p3"]);
    team(&engine, "Crew", vec![member("p1", false, 0), member("p2", false, 1), member("p3", true, 5)]);
    let found = engine.match_team(&monday_criteria(2), 2).unwrap().expect("a team");
    assert_eq!(found.member_ids, ["p3", "p1"]);
}

#[test]
fn no_team_with_enough_eligible_members() {
    let engine = engine_with(&["p1", "p2"]);
    let mut away = provider("p3");
    away.time_off.push(TimeOffPeriod { start: at(2, 0), end: at(3, 0) });
    engine.store().insert_provider(&away).unwrap();
    team(&engine, "Short", vec![member("p1", true, 0), member("p3", false, 1)]);

    assert!(engine.match_team(&monday_criteria(2), 2).unwrap().is_none());
}

#[test]
fn auto_assign_falls_back_to_ranked_individuals() {
    let engine = engine_with(&["p1", "p2", "p3"]);
    let job_id = job(&engine, at(2, 9), at(2, 11), 2);

    let selection = engine.auto_assign(&job_id).unwrap().expect("matched");
    match &selection {
        Selection::Individuals { provider_ids } => assert_eq!(provider_ids, &["p1", "p2"]),
        other => panic!("expected individuals, got {other:?}"),
    }
    let assignments = engine.store().assignments_for_job(&job_id).unwrap();
    assert_eq!(assignments.len(), 2);
    assert!(assignments.iter().all(|a| a.team_id.is_none()));
}

#[test]
fn auto_assign_skips_providers_locked_by_another_job() {
    let engine = engine_with(&[]);
    let mut star = provider("p1");
    star.rating_average = 5.0;
    let mut steady = provider("p2");
    steady.rating_average = 3.0;
    engine.store().insert_provider(&star).unwrap();
    engine.store().insert_provider(&steady).unwrap();

    let other = job(&engine, at(2, 10), at(2, 12), 1);
    engine
        .create_locks(&Actor::new("op-1", Role::Operator), &other, &LockRequest::providers(&["p1"]))
        .unwrap();
    let job_id = job(&engine, at(2, 9), at(2, 11), 1);

    let selection = engine.auto_assign(&job_id).unwrap().expect("matched");
    assert_eq!(selection.provider_ids(), ["p2"]);
    assert_eq!(engine.store().assignments_for_job(&job_id).unwrap()[0].provider_id, "p2");

    // The job's own locks do not hide a provider from it.
    let other_job = engine.store().get_job(&other).unwrap().unwrap();
    let ranked = engine.match_providers(&MatchCriteria::for_job(&other_job), 5).unwrap();
    assert!(ranked.contains(&"p1".to_string()));
}

#[test]
fn auto_assign_prefers_a_team() {
    let engine = engine_with(&["p1", "p2", "p3"]);
    let crew = team(&engine, "Crew", vec![member("p2", true, 0), member("p3", false, 1)]);
    let job_id = job(&engine, at(2, 9), at(2, 11), 2);

    let selection = engine.auto_assign(&job_id).unwrap().expect("matched");
    assert_eq!(selection.team_id(), Some(crew.as_str()));
    assert_eq!(selection.provider_ids(), ["p2", "p3"]);
    let stored = engine.store().get_job(&job_id).unwrap().unwrap();
    assert_eq!(stored.status.as_str(), "assigned");
}

#[test]
fn ensure_team_eligible_reports_shortfall() {
    let engine = engine_with(&["p1", "p2"]);
    let mut away = provider("p3");
    away.time_off.push(TimeOffPeriod { start: at(2, 0), end: at(3, 0) });
    engine.store().insert_provider(&away).unwrap();
    let crew = team(&engine, "Crew", vec![member("p3", true, 0), member("p2", false, 1), member("p1", false, 2)]);

    let ok = engine.ensure_team_eligible(&crew, &monday_criteria(2), 2).unwrap();
    assert_eq!(ok, ["p2", "p1"]);

    let err = engine.ensure_team_eligible(&crew, &monday_criteria(3), 3).unwrap_err();
    assert!(
        matches!(err, MatchError::Conflict(ConflictKind::InsufficientMembers { required: 3, eligible: 2 })),
        "unexpected error: {err}"
    );

    let err = engine.ensure_team_eligible("team-missing", &monday_criteria(1), 1).unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    let err = engine.ensure_team_eligible(&crew, &monday_criteria(1), 21).unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[test]
fn ensure_providers_eligible_error_taxonomy() {
    let engine = engine_with(&["p1", "p2"]);
    let busy_job = job(&engine, at(2, 9), at(2, 11), 1);
    engine
        .store()
        .insert_assignment(&Assignment {
            id: "asg-busy".into(),
            job_id: busy_job,
            provider_id: "p2".into(),
            team_id: None,
            start_at: at(2, 9),
            end_at: at(2, 11),
            status: AssignmentStatus::Confirmed,
            created_at: at(1, 12),
        })
        .unwrap();
    let c = monday_criteria(1);

    assert!(engine.ensure_providers_eligible(&["p1".into()], &c).is_ok());
    assert_eq!(engine.ensure_providers_eligible(&[], &c).unwrap_err().code(), "VALIDATION");
    assert_eq!(engine.ensure_providers_eligible(&["ghost".into()], &c).unwrap_err().code(), "NOT_FOUND");
    assert_eq!(
        engine.ensure_providers_eligible(&["p1".into(), "p1".into()], &c).unwrap_err().code(),
        "DUPLICATE_MEMBER"
    );
    assert_eq!(
        engine.ensure_providers_eligible(&["p1".into(), "p2".into()], &c).unwrap_err().code(),
        "PROVIDER_NOT_ELIGIBLE"
    );
}

#[test]
fn team_management_validation() {
    let engine = engine_with(&["p1", "p2"]);
    let payload = |members: Vec<TeamMember>, tz: &str| NewTeam {
        name: "Crew".into(),
        timezone: tz.into(),
        daily_capacity_cap: None,
        services: vec![],
        members,
    };

    let client = Actor::new("c-1", Role::Client);
    let err = engine.create_team(&client, payload(vec![member("p1", true, 0)], "UTC")).unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");

    let system = Actor::system();
    let err = engine
        .create_team(&system, payload(vec![member("p1", true, 0), member("p1", false, 1)], "UTC"))
        .unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_MEMBER");
    let err = engine.create_team(&system, payload(vec![member("p1", true, 0)], "Mars/Olympus")).unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
    let err = engine.create_team(&system, payload(vec![member("nobody", true, 0)], "UTC")).unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
    let err = engine.create_team(&system, payload(vec![], "UTC")).unwrap_err();
    assert_eq!(err.code(), "VALIDATION");

    let created = engine.create_team(&system, payload(vec![member("p1", true, 0)], "Europe/Berlin")).unwrap();
    let operator = Actor::new("op-1", Role::Operator);
    let updated = engine
        .replace_team_members(&operator, &created.id, vec![member("p2", true, 0), member("p1", false, 1)])
        .unwrap();
    let stored = engine.store().get_team(&created.id).unwrap().unwrap();
    assert_eq!(stored.members, updated.members);
    assert_eq!(stored.members.len(), 2);
}
