//! Writes aggregated row-sets to the store.
//!
//! Rows are written in dependency order: Bases and Details first, then Instances with
//! their Base and Detail ids filled in, then Periods with their Instance id filled in.
//! Bases, Details and Instances are upserted by hash. Periods are merged into any existing
//! row for the same Instance and bucket with a compare-and-set on `cas_value`.
//!
//! A row that fails is reported under its index, handed to the failure sink, and does not
//! stop the rest of the batch. Rows depending on a failed row fail with it.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use eventsum_common::failures::{FailedRows, FailureSink};
use eventsum_common::metrics::{
    CAS_ATTEMPTS, CAS_CONFLICTS, FLUSH_DURATION, ROWS_FAILED, ROWS_PERSISTED,
};
use eventsum_common::model::{
    timestamp_value, EventBase, EventDetail, EventInstance, EventInstancePeriod, Record, RowKind,
    ID_FIELD,
};
use eventsum_common::retry::RetryPolicy;
use eventsum_common::rules::Rules;
use eventsum_common::store::{row_id, Datastore, Filter, Query, QueryResult, StoreError};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::aggregator::Aggregated;
use crate::error::PersistError;

/// Outcome of persisting one batch.
#[derive(Debug, Default)]
pub struct PersistReport {
    /// Store ids by hash for Bases, Details and Instances, by natural key for Periods.
    pub base_ids: HashMap<String, i64>,
    pub detail_ids: HashMap<String, i64>,
    pub instance_ids: HashMap<String, i64>,
    pub period_ids: HashMap<String, i64>,
    /// Failed rows, keyed by kind and index within the row-set.
    pub errors: HashMap<(RowKind, usize), PersistError>,
}

impl PersistReport {
    pub fn failed(&self, kind: RowKind) -> usize {
        self.errors.keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn Datastore>,
    rules: Arc<Rules>,
    sink: Arc<FailureSink>,
    retry_policy: RetryPolicy,
}

impl Persister {
    pub fn new(
        store: Arc<dyn Datastore>,
        rules: Arc<Rules>,
        sink: Arc<FailureSink>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            rules,
            sink,
            retry_policy,
        }
    }

    pub fn sink(&self) -> &Arc<FailureSink> {
        &self.sink
    }

    /// Persist one aggregated batch. Never fails as a whole: per-row failures are listed
    /// in the report and recorded in the failure sink.
    pub async fn persist(&self, batch: Aggregated) -> PersistReport {
        let start = Instant::now();
        let mut report = PersistReport::default();

        let (bases, details) = tokio::join!(
            self.upsert_bases(&batch.bases),
            self.upsert_details(&batch.details)
        );
        for (index, result) in bases.into_iter().enumerate() {
            let base = &batch.bases[index];
            match result {
                Ok(id) => {
                    report.base_ids.insert(base.processed_data_hash.clone(), id);
                }
                Err(err) => self.fail_base(&mut report, index, base.clone(), err),
            }
        }
        for (index, result) in details.into_iter().enumerate() {
            let detail = &batch.details[index];
            match result {
                Ok(id) => {
                    report
                        .detail_ids
                        .insert(detail.processed_detail_hash.clone(), id);
                }
                Err(err) => self.fail_detail(&mut report, index, detail.clone(), err),
            }
        }

        for (index, mut instance) in batch.instances.into_iter().enumerate() {
            let result = match self.resolve_instance(&report, &mut instance).await {
                Ok(()) => self.upsert_instance(&instance).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(id) => {
                    report
                        .instance_ids
                        .insert(instance.generic_data_hash.clone(), id);
                }
                Err(err) => self.fail_instance(&mut report, index, instance, err),
            }
        }

        for (index, mut period) in batch.periods.into_iter().enumerate() {
            let result = match self.resolve_period(&report, &mut period).await {
                Ok(()) => self.merge_period(&period).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(id) => {
                    report.period_ids.insert(period.natural_key(), id);
                }
                Err(err) => self.fail_period(&mut report, index, period, err),
            }
        }

        for (kind, persisted) in [
            (RowKind::Base, report.base_ids.len()),
            (RowKind::Detail, report.detail_ids.len()),
            (RowKind::Instance, report.instance_ids.len()),
            (RowKind::Period, report.period_ids.len()),
        ] {
            metrics::counter!(ROWS_PERSISTED, "kind" => kind.as_str())
                .increment(persisted as u64);
        }
        metrics::histogram!(FLUSH_DURATION)
            .record(start.elapsed().as_secs_f64());

        debug!(
            bases = report.base_ids.len(),
            details = report.detail_ids.len(),
            instances = report.instance_ids.len(),
            periods = report.period_ids.len(),
            failed = report.errors.len(),
            "persisted batch"
        );

        report
    }

    /// Run a failure sink snapshot through the persistence protocol again.
    pub async fn replay(&self, rows: FailedRows) -> PersistReport {
        let mut batch = Aggregated::default();

        for base in rows.bases {
            batch
                .base_index
                .insert(base.processed_data_hash.clone(), batch.bases.len());
            batch.bases.push(base);
        }
        for detail in rows.details {
            batch
                .detail_index
                .insert(detail.processed_detail_hash.clone(), batch.details.len());
            batch.details.push(detail);
        }
        for instance in rows.instances {
            batch
                .instance_index
                .insert(instance.generic_data_hash.clone(), batch.instances.len());
            batch.instances.push(instance);
        }
        for period in rows.periods {
            batch
                .period_index
                .insert(period.natural_key(), batch.periods.len());
            batch.periods.push(period);
        }

        self.persist(batch).await
    }

    async fn upsert_bases(&self, bases: &[EventBase]) -> Vec<Result<i64, PersistError>> {
        let mut results = Vec::with_capacity(bases.len());
        for base in bases {
            let result = self
                .upsert(
                    RowKind::Base,
                    "processed_data_hash",
                    &base.processed_data_hash,
                    base.to_record(),
                )
                .await;
            results.push(result);
        }
        results
    }

    async fn upsert_details(&self, details: &[EventDetail]) -> Vec<Result<i64, PersistError>> {
        let mut results = Vec::with_capacity(details.len());
        for detail in details {
            let result = self
                .upsert(
                    RowKind::Detail,
                    "processed_detail_hash",
                    &detail.processed_detail_hash,
                    detail.to_record(),
                )
                .await;
            results.push(result);
        }
        results
    }

    async fn upsert_instance(&self, instance: &EventInstance) -> Result<i64, PersistError> {
        self.upsert(
            RowKind::Instance,
            "generic_data_hash",
            &instance.generic_data_hash,
            instance.to_record(),
        )
        .await
    }

    /// Id of the row of `kind` whose `field` equals `hash`, if there is one.
    async fn find_id(
        &self,
        kind: RowKind,
        field: &str,
        hash: &str,
    ) -> Result<Option<i64>, StoreError> {
        let rows = self
            .store
            .query(
                Query::filter(kind.collection())
                    .matching(Filter::eq(field, hash))
                    .limit(1),
            )
            .await?
            .into_rows()?;

        rows.first().map(row_id).transpose()
    }

    /// Insert a row unless a row with the same hash exists, returning the id either way.
    async fn upsert(
        &self,
        kind: RowKind,
        field: &str,
        hash: &str,
        record: Record,
    ) -> Result<i64, PersistError> {
        if let Some(id) = self.find_id(kind, field, hash).await? {
            return Ok(id);
        }

        let inserted = self
            .store
            .query(Query::insert(kind.collection(), record))
            .await
            .and_then(QueryResult::into_rows);

        match inserted {
            Ok(rows) => match rows.first() {
                Some(row) => Ok(row_id(row)?),
                None => {
                    Err(StoreError::Decode(format!("insert into {kind} returned no row")).into())
                }
            },
            // Lost the race against a concurrent flush inserting the same row.
            Err(err @ StoreError::Conflict { .. }) => self
                .find_id(kind, field, hash)
                .await?
                .ok_or_else(|| err.into()),
            Err(err) => Err(err.into()),
        }
    }

    /// Resolve the id of a row this batch depends on: already set on the row, upserted by
    /// this batch, or found in the store.
    async fn resolve(
        &self,
        current: Option<i64>,
        resolved: &HashMap<String, i64>,
        kind: RowKind,
        field: &str,
        hash: &str,
    ) -> Result<i64, PersistError> {
        if let Some(id) = current.or_else(|| resolved.get(hash).copied()) {
            return Ok(id);
        }

        self.find_id(kind, field, hash)
            .await?
            .ok_or_else(|| PersistError::MissingDependency {
                dependency: kind.as_str(),
                hash: hash.to_owned(),
            })
    }

    async fn resolve_instance(
        &self,
        report: &PersistReport,
        instance: &mut EventInstance,
    ) -> Result<(), PersistError> {
        let base_id = self
            .resolve(
                instance.event_base_id,
                &report.base_ids,
                RowKind::Base,
                "processed_data_hash",
                &instance.processed_data_hash,
            )
            .await?;
        let detail_id = self
            .resolve(
                instance.event_detail_id,
                &report.detail_ids,
                RowKind::Detail,
                "processed_detail_hash",
                &instance.processed_detail_hash,
            )
            .await?;

        instance.event_base_id = Some(base_id);
        instance.event_detail_id = Some(detail_id);
        Ok(())
    }

    async fn resolve_period(
        &self,
        report: &PersistReport,
        period: &mut EventInstancePeriod,
    ) -> Result<(), PersistError> {
        let instance_id = self
            .resolve(
                period.event_instance_id,
                &report.instance_ids,
                RowKind::Instance,
                "generic_data_hash",
                &period.generic_data_hash,
            )
            .await?;

        period.event_instance_id = Some(instance_id);
        Ok(())
    }

    /// Add the period's count and accumulator to the stored row for the same Instance and
    /// bucket, inserting the row if there is none yet.
    ///
    /// Each attempt reads the current row and writes the merged state only if `cas_value`
    /// is unchanged. Attempts that lose to a concurrent writer back off per the retry
    /// policy; once it is exhausted the merge fails with `ContentionExhausted`.
    async fn merge_period(&self, period: &EventInstancePeriod) -> Result<i64, PersistError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            if let Some(id) = self.try_merge_period(period).await? {
                metrics::histogram!(CAS_ATTEMPTS).record(f64::from(attempts));
                return Ok(id);
            }

            metrics::counter!(CAS_CONFLICTS).increment(1);
            if !self.retry_policy.should_retry(attempts) {
                return Err(PersistError::ContentionExhausted { attempts });
            }

            let backoff = self.retry_policy.retry_interval(attempts - 1);
            debug!(
                period = %period.natural_key(),
                attempts,
                ?backoff,
                "period changed concurrently, retrying merge"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// One read-merge-write attempt. `None` means a concurrent writer got there first.
    async fn try_merge_period(
        &self,
        period: &EventInstancePeriod,
    ) -> Result<Option<i64>, PersistError> {
        let collection = RowKind::Period.collection();
        let instance_id = period.event_instance_id.ok_or_else(|| {
            PersistError::MissingDependency {
                dependency: RowKind::Instance.as_str(),
                hash: period.generic_data_hash.clone(),
            }
        })?;

        let current = self
            .store
            .query(
                Query::filter(collection)
                    .matching(Filter::eq("event_instance_id", instance_id))
                    .matching(Filter::eq("start_time", timestamp_value(period.start_time)))
                    .matching(Filter::eq("end_time", timestamp_value(period.end_time)))
                    .limit(1),
            )
            .await?
            .decode::<EventInstancePeriod>()?
            .into_iter()
            .next();

        let Some(current) = current else {
            let mut record = period.to_record();
            record.insert("cas_value".to_owned(), 0.into());

            return match self
                .store
                .query(Query::insert(collection, record))
                .await
                .and_then(QueryResult::into_rows)
            {
                Ok(rows) => match rows.first() {
                    Some(row) => Ok(Some(row_id(row)?)),
                    None => {
                        Err(StoreError::Decode("period insert returned no row".to_owned()).into())
                    }
                },
                Err(StoreError::Conflict { .. }) => Ok(None),
                Err(err) => Err(err.into()),
            };
        };

        let current_id = current.id.ok_or_else(|| {
            PersistError::Store(StoreError::Decode(format!("period has no {ID_FIELD}")))
        })?;
        let counter_json = self
            .rules
            .consolidate(current.counter_json, period.counter_json.clone())?;

        let mut changes = Record::new();
        changes.insert("count".to_owned(), (current.count + period.count).into());
        changes.insert("counter_json".to_owned(), Value::Object(counter_json));
        changes.insert(
            "updated".to_owned(),
            timestamp_value(current.updated.max(period.updated)),
        );
        changes.insert("cas_value".to_owned(), (current.cas_value + 1).into());

        let written = self
            .store
            .query(
                Query::update(collection, changes)
                    .matching(Filter::eq(ID_FIELD, current_id))
                    .matching(Filter::eq("cas_value", current.cas_value)),
            )
            .await?
            .into_rows()?;

        Ok((!written.is_empty()).then_some(current_id))
    }

    fn record_failure(
        &self,
        report: &mut PersistReport,
        kind: RowKind,
        index: usize,
        err: PersistError,
    ) {
        metrics::counter!(ROWS_FAILED, "kind" => kind.as_str()).increment(1);
        report.errors.insert((kind, index), err);
    }

    fn fail_base(
        &self,
        report: &mut PersistReport,
        index: usize,
        base: EventBase,
        err: PersistError,
    ) {
        error!(
            kind = %RowKind::Base,
            hash = %base.processed_data_hash,
            error = %err,
            "failed to persist row"
        );
        self.record_failure(report, RowKind::Base, index, err);
        self.sink.record_base(base);
    }

    fn fail_detail(
        &self,
        report: &mut PersistReport,
        index: usize,
        detail: EventDetail,
        err: PersistError,
    ) {
        error!(
            kind = %RowKind::Detail,
            hash = %detail.processed_detail_hash,
            error = %err,
            "failed to persist row"
        );
        self.record_failure(report, RowKind::Detail, index, err);
        self.sink.record_detail(detail);
    }

    fn fail_instance(
        &self,
        report: &mut PersistReport,
        index: usize,
        instance: EventInstance,
        err: PersistError,
    ) {
        warn!(
            kind = %RowKind::Instance,
            hash = %instance.generic_data_hash,
            error = %err,
            "failed to persist row"
        );
        self.record_failure(report, RowKind::Instance, index, err);
        self.sink.record_instance(instance);
    }

    fn fail_period(
        &self,
        report: &mut PersistReport,
        index: usize,
        period: EventInstancePeriod,
        err: PersistError,
    ) {
        warn!(
            kind = %RowKind::Period,
            period = %period.natural_key(),
            error = %err,
            "failed to persist row"
        );
        self.record_failure(report, RowKind::Period, index, err);
        self.sink.record_period(period);
    }
}
