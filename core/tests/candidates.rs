use chrono::{DateTime, TimeZone, Utc};
use cleanmatch_core::{
    availability::AvailabilityTier,
    candidates::{CandidateFilter, MatchCriteria},
    config::MatchConfig,
    model::{
        Assignment, AssignmentMode, AssignmentStatus, AvailabilitySlot, Job, JobStatus, Provider,
        ProviderKind, TimeOffPeriod,
    },
    store::MatchStore,
    types::TimeWindow,
};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

fn now() -> DateTime<Utc> {
    at(1, 12)
}

fn provider(id: &str) -> Provider {
    Provider {
        id: id.into(),
        display_name: format!("Provider {id}"),
        kind: ProviderKind::Individual,
        active: true,
        eco_friendly: false,
        hourly_rate: 30.0,
        rating_average: 4.0,
        rating_count: 12,
        services: vec!["standard".into()],
        service_zones: vec!["Berlin".into()],
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

fn store_with(providers: &[Provider]) -> MatchStore {
    let store = MatchStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    for p in providers {
        store.insert_provider(p).expect("insert provider");
    }
    store
}

fn criteria() -> MatchCriteria {
    MatchCriteria::new("standard", TimeWindow::new(at(2, 9), at(2, 11)).unwrap())
}

fn ids(store: &MatchStore, criteria: &MatchCriteria) -> Vec<String> {
    let config = MatchConfig::default_test();
    CandidateFilter::new(store, &config)
        .candidates(criteria, now())
        .unwrap()
        .into_iter()
        .map(|c| c.provider.id)
        .collect()
}

#[test]
fn service_active_and_eco_flags_filter_the_pool() {
    let mut other_service = provider("p-other");
    other_service.services = vec!["deep_clean".into()];
    let mut inactive = provider("p-inactive");
    inactive.active = false;
    let mut eco = provider("p-eco");
    eco.eco_friendly = true;
    let store = store_with(&[provider("p-plain"), other_service, inactive, eco]);

    assert_eq!(ids(&store, &criteria()), ["p-eco", "p-plain"]);

    let mut eco_only = criteria();
    eco_only.eco_required = true;
    assert_eq!(ids(&store, &eco_only), ["p-eco"]);
}

#[test]
fn explicit_id_restriction() {
    let store = store_with(&[provider("a"), provider("b"), provider("c")]);
    let scoped = criteria().restricted_to(&["c".to_string(), "a".to_string()]);
    assert_eq!(ids(&store, &scoped), ["a", "c"]);
}

#[test]
fn time_off_excludes_candidate() {
    let mut away = provider("away");
    away.time_off.push(TimeOffPeriod { start: at(2, 0), end: at(3, 0) });
    let store = store_with(&[away, provider("here")]);
    assert_eq!(ids(&store, &criteria()), ["here"]);
}

#[test]
fn conflicting_assignment_excludes_candidate_except_for_own_job() {
    let store = store_with(&[provider("busy"), provider("free")]);
    let job = Job {
        id: "job-1".into(),
        client_id: "client-1".into(),
        service: "standard".into(),
        eco_preference: false,
        city: None,
        postal_code: None,
        start_at: at(2, 10),
        end_at: at(2, 12),
        required_members: 1,
        surface_m2: None,
        status: JobStatus::Assigned,
        assignment_mode: AssignmentMode::Auto,
        matching_retry_count: 0,
        fallback_team_candidate: None,
        fallback_requested_at: None,
        fallback_escalated_at: None,
        created_at: now(),
        updated_at: now(),
    };
    store.insert_job(&job).unwrap();
    store
        .insert_assignment(&Assignment {
            id: "asg-1".into(),
            job_id: job.id.clone(),
            provider_id: "busy".into(),
            team_id: None,
            start_at: job.start_at,
            end_at: job.end_at,
            status: AssignmentStatus::Scheduled,
            created_at: now(),
        })
        .unwrap();

    assert_eq!(ids(&store, &criteria()), ["free"]);

    let mut editing = criteria();
    editing.exclude_job_id = Some("job-1".into());
    assert_eq!(ids(&store, &editing), ["busy", "free"]);
}

#[test]
fn geography_sets_synthetic_distance() {
    let mut far = provider("far");
    far.service_zones = vec!["Hamburg".into()];
    let mut nearby = provider("nearby");
    nearby.service_zones = vec![];
    nearby.areas = vec!["Greater Berlin".into()];
    let store = store_with(&[provider("local"), far, nearby]);

    let mut c = criteria();
    c.city = Some("berlin".into());
    let config = MatchConfig::default_test();
    let found = CandidateFilter::new(&store, &config).candidates(&c, now()).unwrap();
    let distance = |id: &str| found.iter().find(|x| x.provider.id == id).unwrap().distance_km;
    assert_eq!(distance("local"), 0.0);
    assert_eq!(distance("nearby"), 10.0);
    assert_eq!(distance("far"), 20.0);
}

#[test]
fn unavailable_candidates_only_kept_on_request() {
    let mut weekend = provider("weekend");
    weekend.slots = vec![AvailabilitySlot {
        weekday: 6,
        start_minute: 8 * 60,
        end_minute: 18 * 60,
        timezone: "UTC".into(),
        active: true,
    }];
    let store = store_with(&[weekend, provider("weekday")]);
    assert_eq!(ids(&store, &criteria()), ["weekday"]);

    let mut eligibility = criteria();
    eligibility.include_unavailable = true;
    let config = MatchConfig::default_test();
    let all = CandidateFilter::new(&store, &config).candidates(&eligibility, now()).unwrap();
    assert_eq!(all.len(), 2);
    let weekend = all.iter().find(|c| c.provider.id == "weekend").unwrap();
    assert_eq!(weekend.tier, AvailabilityTier::Unavailable);
}

#[test]
fn empty_pool_is_not_an_error() {
    let store = store_with(&[]);
    assert!(ids(&store, &criteria()).is_empty());
}
