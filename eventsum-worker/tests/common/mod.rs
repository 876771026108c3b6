#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsum_common::bucket::Bucketing;
use eventsum_common::failures::FailureSink;
use eventsum_common::model::{EventTime, RawEvent, PERIOD_COLLECTION};
use eventsum_common::retry::RetryPolicy;
use eventsum_common::rules::{builtin, Rules};
use eventsum_common::store::{Datastore, MemoryStore, Query, QueryKind, QueryResult, StoreError};
use eventsum_worker::aggregator::Aggregator;
use eventsum_worker::persister::Persister;
use serde_json::Value;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn rules() -> Arc<Rules> {
    let mut rules = Rules::new();
    builtin::register(&mut rules).unwrap();
    Arc::new(rules)
}

pub fn aggregator(rules: Arc<Rules>) -> Aggregator {
    Aggregator::new(rules, Bucketing::from_minutes(15, TIME_FORMAT).unwrap())
}

pub fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        2,
        Duration::from_millis(1),
        Duration::from_millis(20),
        max_attempts,
    )
}

pub fn persister(
    store: Arc<dyn Datastore>,
    rules: Arc<Rules>,
    retry_policy: RetryPolicy,
) -> Persister {
    let sink = Arc::new(FailureSink::new(rules.clone()));
    Persister::new(store, rules, sink, retry_policy)
}

pub fn event(data: Value, timestamp: &str) -> RawEvent {
    RawEvent {
        service_id: 7,
        environment_id: 1,
        name: "ValueError".to_owned(),
        kind: "python".to_owned(),
        message: "invalid literal for int()".to_owned(),
        data,
        extra_args: serde_json::json!({"host": "web-1"}),
        timestamp: EventTime::Text(timestamp.to_owned()),
        configurable_filters: HashMap::from([(
            "base".to_owned(),
            vec!["exception_python_remove_line_no".to_owned()],
        )]),
        configurable_groupings: vec!["count_by_level".to_owned()],
    }
}

/// Reports a version conflict for the first `conflicts` conditional Period writes,
/// as if another writer had updated the row in between.
pub struct ConflictingStore {
    pub inner: Arc<MemoryStore>,
    conflicts: AtomicUsize,
    pub injected: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(inner: Arc<MemoryStore>, conflicts: usize) -> Self {
        Self {
            inner,
            conflicts: AtomicUsize::new(conflicts),
            injected: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Datastore for ConflictingStore {
    async fn query(&self, query: Query) -> Result<QueryResult, StoreError> {
        if query.kind == QueryKind::Update && query.collection == PERIOD_COLLECTION {
            let inject = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if inject {
                self.injected.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                return Ok(QueryResult::default());
            }
        }
        self.inner.query(query).await
    }
}

/// Fails the `nth` (zero-based) insert into `collection` with a transport error.
pub struct FailingStore {
    pub inner: Arc<MemoryStore>,
    collection: &'static str,
    nth: usize,
    inserts: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>, collection: &'static str, nth: usize) -> Self {
        Self {
            inner,
            collection,
            nth,
            inserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Datastore for FailingStore {
    async fn query(&self, query: Query) -> Result<QueryResult, StoreError> {
        if query.kind == QueryKind::Insert && query.collection == self.collection {
            let n = self.inserts.fetch_add(1, Ordering::SeqCst);
            if n == self.nth {
                return Err(StoreError::Transport("connection reset".to_owned()));
            }
        }
        self.inner.query(query).await
    }
}

/// Answers every read of `collection` with a result carrying an error string, the way a
/// store reports a query it refused to run.
pub struct RejectingStore {
    pub inner: Arc<MemoryStore>,
    collection: &'static str,
}

impl RejectingStore {
    pub fn new(inner: Arc<MemoryStore>, collection: &'static str) -> Self {
        Self { inner, collection }
    }
}

#[async_trait]
impl Datastore for RejectingStore {
    async fn query(&self, query: Query) -> Result<QueryResult, StoreError> {
        let read = matches!(query.kind, QueryKind::Filter | QueryKind::Get);
        if read && query.collection == self.collection {
            return Ok(QueryResult::rejected(
                "permission denied for relation",
                Some(serde_json::json!({"collection": self.collection})),
            ));
        }
        self.inner.query(query).await
    }
}
