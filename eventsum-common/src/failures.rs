//! In-process record of rows that could not be persisted.
//!
//! Rows are deduplicated by the same natural keys as the store. A Period that fails more
//! than once is merged with the earlier failure: counts add up and accumulators go through
//! the registered consolidation function, the same one used when a Period write races a
//! concurrent writer. Nothing here retries on its own; snapshots are taken for inspection
//! or handed back to the persister for replay.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::metrics::FAILURE_SINK_ROWS;
use crate::model::{EventBase, EventDetail, EventInstance, EventInstancePeriod};
use crate::rules::Rules;

/// A snapshot of failed rows, in natural key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailedRows {
    #[serde(default)]
    pub bases: Vec<EventBase>,
    #[serde(default)]
    pub details: Vec<EventDetail>,
    #[serde(default)]
    pub instances: Vec<EventInstance>,
    #[serde(default)]
    pub periods: Vec<EventInstancePeriod>,
}

impl FailedRows {
    pub fn len(&self) -> usize {
        self.bases.len() + self.details.len() + self.instances.len() + self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Failed {
    bases: BTreeMap<String, EventBase>,
    details: BTreeMap<String, EventDetail>,
    instances: BTreeMap<String, EventInstance>,
    periods: BTreeMap<String, EventInstancePeriod>,
}

impl Failed {
    fn len(&self) -> usize {
        self.bases.len() + self.details.len() + self.instances.len() + self.periods.len()
    }

    fn snapshot(&self) -> FailedRows {
        FailedRows {
            bases: self.bases.values().cloned().collect(),
            details: self.details.values().cloned().collect(),
            instances: self.instances.values().cloned().collect(),
            periods: self.periods.values().cloned().collect(),
        }
    }
}

pub struct FailureSink {
    rules: Arc<Rules>,
    failed: Mutex<Failed>,
}

impl FailureSink {
    pub fn new(rules: Arc<Rules>) -> Self {
        Self {
            rules,
            failed: Mutex::new(Failed::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Failed> {
        // The maps stay consistent across a panic: every mutation is a single insert.
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_size(failed: &Failed) {
        metrics::gauge!(FAILURE_SINK_ROWS).set(failed.len() as f64);
    }

    pub fn record_base(&self, base: EventBase) {
        let mut failed = self.lock();
        failed
            .bases
            .entry(base.processed_data_hash.clone())
            .or_insert(base);
        Self::report_size(&failed);
    }

    pub fn record_detail(&self, detail: EventDetail) {
        let mut failed = self.lock();
        failed
            .details
            .entry(detail.processed_detail_hash.clone())
            .or_insert(detail);
        Self::report_size(&failed);
    }

    /// Record a failed Instance. A later failure of the same Instance replaces the earlier
    /// one, as it may carry ids that were resolved in the meantime.
    pub fn record_instance(&self, instance: EventInstance) {
        let mut failed = self.lock();
        failed
            .instances
            .insert(instance.generic_data_hash.clone(), instance);
        Self::report_size(&failed);
    }

    /// Record a failed Period, merging it into an earlier failure for the same bucket.
    pub fn record_period(&self, period: EventInstancePeriod) {
        let mut failed = self.lock();
        let key = period.natural_key();

        match failed.periods.remove(&key) {
            None => {
                failed.periods.insert(key, period);
            }
            Some(existing) => {
                let merged = self.merge(existing, period);
                failed.periods.insert(key, merged);
            }
        }
        Self::report_size(&failed);
    }

    fn merge(
        &self,
        existing: EventInstancePeriod,
        incoming: EventInstancePeriod,
    ) -> EventInstancePeriod {
        let counter_json = match self
            .rules
            .consolidate(existing.counter_json.clone(), incoming.counter_json.clone())
        {
            Ok(merged) => merged,
            Err(err) => {
                error!(
                    period = %existing.natural_key(),
                    error = %err,
                    "could not consolidate failed periods, keeping the earlier accumulator"
                );
                existing.counter_json.clone()
            }
        };

        EventInstancePeriod {
            event_instance_id: incoming.event_instance_id.or(existing.event_instance_id),
            updated: existing.updated.max(incoming.updated),
            count: existing.count + incoming.count,
            counter_json,
            ..existing
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> FailedRows {
        self.lock().snapshot()
    }

    /// Empty the sink, returning everything it held.
    pub fn take(&self) -> FailedRows {
        let mut failed = self.lock();
        let taken = std::mem::take(&mut *failed).snapshot();
        Self::report_size(&failed);
        taken
    }
}
