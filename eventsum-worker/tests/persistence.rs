mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{aggregator, event, fast_retries, persister, rules, ConflictingStore, FailingStore};
use eventsum_common::model::{
    EventInstancePeriod, Record, RowKind, BASE_COLLECTION, DETAIL_COLLECTION,
    INSTANCE_COLLECTION, PERIOD_COLLECTION,
};
use eventsum_common::rules::RuleError;
use eventsum_common::store::{Datastore, MemoryStore, Query};
use eventsum_worker::error::PersistError;
use serde_json::json;

async fn stored_periods(store: &MemoryStore) -> Vec<EventInstancePeriod> {
    store
        .query(Query::filter(PERIOD_COLLECTION).sort_by("start_time"))
        .await
        .unwrap()
        .decode()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_converge_without_lost_updates() {
    const WRITERS: i64 = 24;

    let rules = rules();
    let memory = Arc::new(MemoryStore::with_eventsum_schema());
    let store = Arc::new(ConflictingStore::new(memory.clone(), 16));

    let writers = (0..WRITERS).map(|_| {
        let aggregator = aggregator(rules.clone());
        let persister = persister(store.clone(), rules.clone(), fast_retries(1_000));
        tokio::spawn(async move {
            let batch = aggregator.aggregate(&[event(
                json!({"message": "boom", "level": "error"}),
                "2024-03-09 10:31:00",
            )]);
            persister.persist(batch).await
        })
    });

    let reports = futures::future::join_all(writers).await;
    for report in reports {
        let report = report.unwrap();
        assert!(report.is_success(), "{:?}", report.errors);
    }

    let periods = stored_periods(&memory).await;
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].count, WRITERS);
    assert_eq!(
        periods[0].counter_json.get("error"),
        Some(&json!(WRITERS))
    );
    assert!(store.injected.load(Ordering::SeqCst) > 0);
    assert_eq!(memory.count(BASE_COLLECTION), 1);
    assert_eq!(memory.count(INSTANCE_COLLECTION), 1);
    assert_eq!(memory.count(DETAIL_COLLECTION), 1);
}

#[tokio::test]
async fn exhausted_contention_hands_the_period_to_the_sink() {
    let rules = rules();
    let memory = Arc::new(MemoryStore::with_eventsum_schema());
    let data = json!({"message": "boom", "level": "warning"});

    let seed = persister(memory.clone(), rules.clone(), fast_retries(3));
    let batch = aggregator(rules.clone()).aggregate(&[event(data.clone(), "2024-03-09 10:31:00")]);
    assert!(seed.persist(batch).await.is_success());

    let store = Arc::new(ConflictingStore::new(memory.clone(), usize::MAX));
    let contended = persister(store, rules.clone(), fast_retries(3));
    let batch = aggregator(rules.clone()).aggregate(&[
        event(data.clone(), "2024-03-09 10:32:00"),
        event(data, "2024-03-09 10:33:00"),
    ]);
    let report = contended.persist(batch).await;

    assert_eq!(
        report.errors.get(&(RowKind::Period, 0)),
        Some(&PersistError::ContentionExhausted { attempts: 3 })
    );
    let failed = contended.sink().snapshot();
    assert_eq!(failed.periods.len(), 1);
    assert_eq!(failed.periods[0].count, 2);
    assert!(failed.periods[0].event_instance_id.is_some());

    let periods = stored_periods(&memory).await;
    assert_eq!(periods[0].count, 1);
}

#[tokio::test]
async fn one_failing_base_does_not_abort_the_batch() {
    let rules = rules();
    let memory = Arc::new(MemoryStore::with_eventsum_schema());
    let store = Arc::new(FailingStore::new(memory.clone(), BASE_COLLECTION, 1));
    let persister = persister(store, rules.clone(), fast_retries(3));

    let batch = aggregator(rules.clone()).aggregate(&[
        event(json!({"message": "first"}), "2024-03-09 10:31:00"),
        event(json!({"message": "second"}), "2024-03-09 10:31:00"),
        event(json!({"message": "third"}), "2024-03-09 10:31:00"),
    ]);
    let report = persister.persist(batch).await;

    assert_eq!(report.base_ids.len(), 2);
    assert_eq!(report.failed(RowKind::Base), 1);
    assert!(matches!(
        report.errors.get(&(RowKind::Base, 1)),
        Some(PersistError::Store(_))
    ));
    assert_eq!(memory.count(BASE_COLLECTION), 2);

    // Rows of the failed class cannot be linked and follow it into the sink.
    assert!(matches!(
        report.errors.get(&(RowKind::Instance, 1)),
        Some(PersistError::MissingDependency { dependency: "base", .. })
    ));
    assert_eq!(memory.count(INSTANCE_COLLECTION), 2);
    assert_eq!(memory.count(PERIOD_COLLECTION), 2);

    let failed = persister.sink().snapshot();
    assert_eq!(failed.bases.len(), 1);
    assert_eq!(failed.bases[0].processed_data, json!({"message": "second"}));
    assert_eq!(failed.instances.len(), 1);
    assert_eq!(failed.periods.len(), 1);

    // Replaying the sink against a healthy store completes the batch.
    let healthy = common::persister(memory.clone(), rules, fast_retries(3));
    let replayed = healthy.replay(persister.sink().take()).await;

    assert!(replayed.is_success(), "{:?}", replayed.errors);
    assert_eq!(memory.count(BASE_COLLECTION), 3);
    assert_eq!(memory.count(INSTANCE_COLLECTION), 3);
    assert_eq!(memory.count(PERIOD_COLLECTION), 3);
    assert!(persister.sink().is_empty());
}

#[tokio::test]
async fn later_batches_reuse_rows_and_merge_periods() {
    let rules = rules();
    let memory = Arc::new(MemoryStore::with_eventsum_schema());
    let persister = persister(memory.clone(), rules.clone(), fast_retries(3));
    let aggregator = aggregator(rules);

    for (lineno, minute) in [(10, "31"), (11, "40")] {
        let batch = aggregator.aggregate(&[event(
            json!({"message": "boom", "lineno": lineno, "level": "error"}),
            &format!("2024-03-09 10:{minute}:00"),
        )]);
        let report = persister.persist(batch).await;
        assert!(report.is_success(), "{:?}", report.errors);
    }
    let batch = aggregator.aggregate(&[event(
        json!({"message": "boom", "lineno": 12, "level": "error"}),
        "2024-03-09 10:44:00",
    )]);
    assert!(persister.persist(batch).await.is_success());

    assert_eq!(memory.count(BASE_COLLECTION), 1);
    assert_eq!(memory.count(INSTANCE_COLLECTION), 3);

    let periods = stored_periods(&memory).await;
    assert_eq!(periods.len(), 3);
    assert!(periods.iter().all(|p| p.count == 1 && p.cas_value == 0));
}

#[tokio::test]
async fn same_bucket_across_batches_is_merged_with_cas() {
    let rules = rules();
    let memory = Arc::new(MemoryStore::with_eventsum_schema());
    let persister = persister(memory.clone(), rules.clone(), fast_retries(3));
    let aggregator = aggregator(rules);
    let data = json!({"message": "boom", "level": "error"});

    for minute in ["31", "44"] {
        let batch = aggregator.aggregate(&[
            event(data.clone(), &format!("2024-03-09 10:{minute}:00")),
            event(data.clone(), &format!("2024-03-09 10:{minute}:30")),
        ]);
        assert!(persister.persist(batch).await.is_success());
    }

    let periods = stored_periods(&memory).await;
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].count, 4);
    assert_eq!(periods[0].cas_value, 1);
    assert_eq!(periods[0].counter_json.get("error"), Some(&json!(4)));
    assert_eq!(
        periods[0].updated.to_rfc3339(),
        "2024-03-09T10:44:30+00:00"
    );
}

#[tokio::test]
async fn failing_consolidation_hands_the_period_to_the_sink() {
    let rules = rules();
    let memory = Arc::new(MemoryStore::with_eventsum_schema());
    let persister = persister(memory.clone(), rules.clone(), fast_retries(3));
    let aggregator = aggregator(rules);
    let data = json!({"message": "boom", "level": "error"});

    let batch = aggregator.aggregate(&[event(data.clone(), "2024-03-09 10:31:00")]);
    assert!(persister.persist(batch).await.is_success());

    // Another writer left an accumulator the default consolidation cannot add to.
    let mut corrupted = Record::new();
    corrupted.insert("counter_json".to_owned(), json!({"error": "many"}));
    memory
        .query(Query::update(PERIOD_COLLECTION, corrupted))
        .await
        .unwrap();

    let batch = aggregator.aggregate(&[event(data, "2024-03-09 10:40:00")]);
    let report = persister.persist(batch).await;

    assert!(matches!(
        report.errors.get(&(RowKind::Period, 0)),
        Some(PersistError::Consolidate(RuleError::NonNumericCounter { key, .. })) if key == "error"
    ));
    assert_eq!(report.failed(RowKind::Base), 0);
    assert_eq!(report.failed(RowKind::Instance), 0);

    let failed = persister.sink().snapshot();
    assert_eq!(failed.periods.len(), 1);
    assert_eq!(failed.periods[0].count, 1);
    assert_eq!(failed.periods[0].counter_json.get("error"), Some(&json!(1)));

    let periods = stored_periods(&memory).await;
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0].count, 1);
    assert_eq!(periods[0].cas_value, 0);
}

#[tokio::test]
async fn failing_detail_sends_its_instance_to_the_sink() {
    let rules = rules();
    let memory = Arc::new(MemoryStore::with_eventsum_schema());
    let store = Arc::new(FailingStore::new(memory.clone(), DETAIL_COLLECTION, 1));
    let persister = persister(store, rules.clone(), fast_retries(3));

    let events: Vec<_> = ["web-1", "web-2", "web-3"]
        .iter()
        .enumerate()
        .map(|(n, host)| {
            let mut raw = event(json!({"message": "boom", "n": n}), "2024-03-09 10:31:00");
            raw.extra_args = json!({"host": host});
            raw
        })
        .collect();
    let report = persister
        .persist(aggregator(rules.clone()).aggregate(&events))
        .await;

    assert_eq!(report.base_ids.len(), 3);
    assert_eq!(report.detail_ids.len(), 2);
    assert!(matches!(
        report.errors.get(&(RowKind::Detail, 1)),
        Some(PersistError::Store(_))
    ));
    assert!(matches!(
        report.errors.get(&(RowKind::Instance, 1)),
        Some(PersistError::MissingDependency { dependency: "detail", .. })
    ));
    assert!(matches!(
        report.errors.get(&(RowKind::Period, 1)),
        Some(PersistError::MissingDependency { dependency: "instance", .. })
    ));
    assert_eq!(memory.count(BASE_COLLECTION), 3);
    assert_eq!(memory.count(DETAIL_COLLECTION), 2);
    assert_eq!(memory.count(INSTANCE_COLLECTION), 2);
    assert_eq!(memory.count(PERIOD_COLLECTION), 2);

    let failed = persister.sink().snapshot();
    assert!(failed.bases.is_empty());
    assert_eq!(failed.details.len(), 1);
    assert_eq!(failed.details[0].raw_detail, json!({"host": "web-2"}));
    assert_eq!(failed.instances.len(), 1);
    assert_eq!(failed.instances[0].event_detail_id, None);
    assert_eq!(failed.periods.len(), 1);
}
