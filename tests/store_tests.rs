//! Conformance suite run against both storage backends.

use std::sync::Arc;

use rstest::rstest;
use tempfile::TempDir;

use pricing_experiments::model::{
    Assignment, Churn, ConfidenceLevel, Conversion, Experiment, ExperimentMetadata,
    ExperimentStatus, TargetPlan, TransitionAction, Variant,
};
use pricing_experiments::store::{AssignOutcome, ExperimentStore, MemoryStore, SqliteStore};
use pricing_experiments::ExperimentError;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

/// The temp dir must outlive the store.
fn open(backend: Backend) -> (Arc<dyn ExperimentStore>, Option<TempDir>) {
    match backend {
        Backend::Memory => (Arc::new(MemoryStore::new()), None),
        Backend::Sqlite => {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStore::open(dir.path().join("experiments.db")).unwrap();
            (Arc::new(store), Some(dir))
        }
    }
}

fn experiment(id: &str, org: &str, created_at_ms: u64) -> Experiment {
    let variant = |suffix: &str, price: u64, control: bool| Variant {
        id: format!("{id}_{suffix}"),
        experiment_id: id.into(),
        name: suffix.into(),
        price_cents: price,
        original_price_cents: 4900,
        is_control: control,
        visitors: 0,
        conversions: 0,
        churned: 0,
        total_revenue_cents: 0,
    };
    Experiment {
        id: id.into(),
        org_id: org.into(),
        name: format!("experiment {id}"),
        hypothesis: "higher price holds conversion".into(),
        target_plan: TargetPlan {
            id: "plan_pro".into(),
            name: "Pro".into(),
            price_cents: Some(4900),
        },
        status: ExperimentStatus::Draft,
        planned_duration_days: 14,
        traffic_allocation: 50.0,
        minimum_sample_size: 100,
        confidence_level: ConfidenceLevel::NinetyFive,
        created_at_ms,
        started_at_ms: None,
        ended_at_ms: None,
        metadata: ExperimentMetadata {
            ai_generated: true,
            expected_lift: Some(12.5),
            priority: Some("high".into()),
            risks: vec!["churn".into()],
        },
        variants: vec![variant("control", 4900, true), variant("premium", 5900, false)],
    }
}

fn conversion(customer: &str, revenue: u64, at: u64) -> Conversion {
    Conversion {
        customer_id: customer.into(),
        subscription_id: format!("sub_{customer}"),
        revenue_cents: revenue,
        converted_at_ms: at,
    }
}

/// Insert experiment `id` and move it to RUNNING.
fn start(store: &dyn ExperimentStore, id: &str) {
    store.insert_experiment(&experiment(id, "org", 1)).unwrap();
    store.transition(id, TransitionAction::Start, 2).unwrap();
}

fn variant_counts(
    store: &dyn ExperimentStore,
    id: &str,
    variant_id: &str,
) -> (u64, u64, u64, u64) {
    let e = store.get_experiment(id).unwrap().unwrap();
    let v = e.variant(variant_id).unwrap();
    (v.visitors, v.conversions, v.churned, v.total_revenue_cents)
}

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_insert_and_get_round_trips(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    let e = experiment("e1", "org_a", 1_000);
    store.insert_experiment(&e).unwrap();
    assert_eq!(store.get_experiment("e1").unwrap(), Some(e));
    assert_eq!(store.get_experiment("nope").unwrap(), None);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_list_is_scoped_and_newest_first(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    store.insert_experiment(&experiment("old", "org_a", 1_000)).unwrap();
    store.insert_experiment(&experiment("other", "org_b", 1_500)).unwrap();
    store.insert_experiment(&experiment("new", "org_a", 2_000)).unwrap();

    let ids: Vec<String> =
        store.list_experiments("org_a").unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["new", "old"]);
    assert!(store.list_experiments("org_c").unwrap().is_empty());
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_transition_sets_timestamps(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    store.insert_experiment(&experiment("e1", "org", 1)).unwrap();

    let started = store.transition("e1", TransitionAction::Start, 10).unwrap();
    assert_eq!(started.status, ExperimentStatus::Running);
    assert_eq!(started.started_at_ms, Some(10));

    store.transition("e1", TransitionAction::Pause, 20).unwrap();
    store.transition("e1", TransitionAction::Resume, 30).unwrap();
    let ended = store.transition("e1", TransitionAction::End, 40).unwrap();
    assert_eq!(ended.status, ExperimentStatus::Completed);
    assert_eq!(ended.started_at_ms, Some(10));
    assert_eq!(ended.ended_at_ms, Some(40));
    assert_eq!(store.get_experiment("e1").unwrap().unwrap(), ended);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_rejected_transition_leaves_status(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    store.insert_experiment(&experiment("e1", "org", 1)).unwrap();

    let err = store.transition("e1", TransitionAction::End, 5).unwrap_err();
    assert!(matches!(err, ExperimentError::InvalidTransition { .. }), "{err}");
    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!(e.status, ExperimentStatus::Draft);
    assert_eq!(e.ended_at_ms, None);

    assert!(matches!(
        store.transition("missing", TransitionAction::Start, 5),
        Err(ExperimentError::NotFound { .. })
    ));
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_delete_only_drafts(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    store.insert_experiment(&experiment("draft", "org", 1)).unwrap();
    store.insert_experiment(&experiment("live", "org", 2)).unwrap();
    store.transition("live", TransitionAction::Start, 3).unwrap();

    assert!(matches!(
        store.delete_experiment("live"),
        Err(ExperimentError::NotDeletable { status: ExperimentStatus::Running })
    ));
    assert!(store.get_experiment("live").unwrap().is_some());

    store.delete_experiment("draft").unwrap();
    assert!(store.get_experiment("draft").unwrap().is_none());
    assert!(matches!(store.delete_experiment("draft"), Err(ExperimentError::NotFound { .. })));
}

// ---------------------------------------------------------------------------
// Assignments and outcomes
// ---------------------------------------------------------------------------

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_insert_assignment_is_insert_or_get(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    start(&*store, "e1");

    let first = store
        .insert_assignment(Assignment::new("e1", "v1", "e1_control", 100))
        .unwrap();
    assert!(first.was_inserted());

    // a racing writer picked the other variant; the stored one wins
    let second = store
        .insert_assignment(Assignment::new("e1", "v1", "e1_premium", 200))
        .unwrap();
    assert!(!second.was_inserted());
    assert_eq!(second.assignment(), first.assignment());

    assert_eq!(variant_counts(&*store, "e1", "e1_control").0, 1);
    assert_eq!(variant_counts(&*store, "e1", "e1_premium").0, 0);
    assert_eq!(store.find_assignment("e1", "v1").unwrap().as_ref(), first.assignment());
    assert_eq!(store.find_assignment("e1", "v2").unwrap(), None);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_conversion_counts_once(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    start(&*store, "e1");
    store.insert_assignment(Assignment::new("e1", "v1", "e1_premium", 1)).unwrap();

    let converted = store
        .mark_converted("e1", "v1", &conversion("cus_1", 5900, 50))
        .unwrap()
        .unwrap();
    assert!(converted.converted);
    assert_eq!(converted.customer_id.as_deref(), Some("cus_1"));
    assert_eq!(converted.conversion_revenue_cents, Some(5900));

    assert!(store.mark_converted("e1", "v1", &conversion("cus_1", 5900, 60)).unwrap().is_none());
    assert!(store.mark_converted("e1", "ghost", &conversion("cus_2", 5900, 60)).unwrap().is_none());
    assert_eq!(variant_counts(&*store, "e1", "e1_premium"), (1, 1, 0, 5900));
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_churn_targets_latest_conversion(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    start(&*store, "e1");
    store.insert_assignment(Assignment::new("e1", "laptop", "e1_control", 1)).unwrap();
    store.insert_assignment(Assignment::new("e1", "phone", "e1_premium", 2)).unwrap();
    store.mark_converted("e1", "laptop", &conversion("cus_1", 4900, 10)).unwrap();
    store.mark_converted("e1", "phone", &conversion("cus_1", 5900, 20)).unwrap();

    let churn = Churn { lifetime_revenue_cents: 11800, churned_at_ms: 30 };
    let first = store.mark_churned("e1", "cus_1", churn).unwrap().unwrap();
    assert_eq!(first.visitor_id, "phone");
    assert_eq!(first.lifetime_revenue_cents, Some(11800));

    let second = store.mark_churned("e1", "cus_1", churn).unwrap().unwrap();
    assert_eq!(second.visitor_id, "laptop");
    assert!(store.mark_churned("e1", "cus_1", churn).unwrap().is_none());
    assert!(store.mark_churned("e1", "cus_unknown", churn).unwrap().is_none());

    assert_eq!(variant_counts(&*store, "e1", "e1_control").2, 1);
    assert_eq!(variant_counts(&*store, "e1", "e1_premium").2, 1);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_concurrent_insert_assignment_single_row(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    start(&*store, "e1");

    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let variant = if i % 2 == 0 { "e1_control" } else { "e1_premium" };
                s.spawn(move || {
                    store.insert_assignment(Assignment::new("e1", "v1", variant, i)).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.iter().filter(|o| o.was_inserted()).count(), 1);
    let variant_id = &outcomes[0].assignment().unwrap().variant_id;
    assert!(outcomes.iter().all(|o| &o.assignment().unwrap().variant_id == variant_id));
    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!(e.total_visitors(), 1);
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_concurrent_duplicate_outcomes_count_once(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    start(&*store, "e1");
    store.insert_assignment(Assignment::new("e1", "v1", "e1_premium", 1)).unwrap();

    let converted = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                s.spawn(move || {
                    store.mark_converted("e1", "v1", &conversion("cus_1", 5900, 10 + i)).unwrap()
                })
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().unwrap()).count()
    });
    assert_eq!(converted, 1);

    let churned = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let churn = Churn { lifetime_revenue_cents: 5900, churned_at_ms: 100 + i };
                s.spawn(move || store.mark_churned("e1", "cus_1", churn).unwrap())
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().unwrap()).count()
    });
    assert_eq!(churned, 1);

    assert_eq!(variant_counts(&*store, "e1", "e1_premium"), (1, 1, 1, 5900));
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_writes_follow_status(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    store.insert_experiment(&experiment("e1", "org", 1)).unwrap();

    let draft = store.insert_assignment(Assignment::new("e1", "v1", "e1_control", 1)).unwrap();
    assert_eq!(draft, AssignOutcome::NotRunning(ExperimentStatus::Draft));

    store.transition("e1", TransitionAction::Start, 2).unwrap();
    store.insert_assignment(Assignment::new("e1", "v1", "e1_control", 3)).unwrap();
    store.insert_assignment(Assignment::new("e1", "v2", "e1_control", 4)).unwrap();
    store.transition("e1", TransitionAction::Pause, 5).unwrap();

    // paused: no new buckets, outcomes still land
    let paused = store.insert_assignment(Assignment::new("e1", "v3", "e1_control", 6)).unwrap();
    assert_eq!(paused, AssignOutcome::NotRunning(ExperimentStatus::Paused));
    assert!(store.mark_converted("e1", "v1", &conversion("cus_1", 4900, 7)).unwrap().is_some());

    store.transition("e1", TransitionAction::Resume, 8).unwrap();
    store.transition("e1", TransitionAction::End, 9).unwrap();
    let churn = Churn { lifetime_revenue_cents: 4900, churned_at_ms: 10 };
    assert!(store.mark_converted("e1", "v2", &conversion("cus_2", 4900, 10)).unwrap().is_none());
    assert!(store.mark_churned("e1", "cus_1", churn).unwrap().is_none());
    assert_eq!(variant_counts(&*store, "e1", "e1_control"), (2, 1, 0, 4900));

    assert!(matches!(
        store.insert_assignment(Assignment::new("missing", "v1", "x", 1)),
        Err(ExperimentError::NotFound { .. })
    ));
    assert!(matches!(
        store.mark_converted("missing", "v1", &conversion("cus_1", 1, 1)),
        Err(ExperimentError::NotFound { .. })
    ));
    assert!(matches!(
        store.mark_churned("missing", "cus_1", churn),
        Err(ExperimentError::NotFound { .. })
    ));
}

#[rstest]
#[case(Backend::Memory)]
#[case(Backend::Sqlite)]
fn test_revenue_total_saturates(#[case] backend: Backend) {
    let (store, _dir) = open(backend);
    start(&*store, "e1");
    let huge = i64::MAX as u64;
    for (i, visitor) in ["v1", "v2"].into_iter().enumerate() {
        store.insert_assignment(Assignment::new("e1", visitor, "e1_premium", 1)).unwrap();
        let customer = format!("cus_{i}");
        store.mark_converted("e1", visitor, &conversion(&customer, huge, 2)).unwrap().unwrap();
    }

    let (visitors, conversions, _, revenue) = variant_counts(&*store, "e1", "e1_premium");
    assert_eq!((visitors, conversions), (2, 2));
    assert!(revenue >= huge);
}

#[test]
fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("experiments.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        start(&store, "e1");
        store.insert_assignment(Assignment::new("e1", "v1", "e1_control", 3)).unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    let e = store.get_experiment("e1").unwrap().unwrap();
    assert_eq!(e.status, ExperimentStatus::Running);
    assert_eq!(e.total_visitors(), 1);
    assert!(store.find_assignment("e1", "v1").unwrap().is_some());
}

#[test]
fn test_memory_store_counts_rows() {
    let store = MemoryStore::new();
    start(&store, "e1");
    store.insert_assignment(Assignment::new("e1", "v1", "e1_control", 1)).unwrap();
    store.insert_assignment(Assignment::new("e1", "v1", "e1_control", 2)).unwrap();
    assert_eq!(store.assignment_count().unwrap(), 1);
}
