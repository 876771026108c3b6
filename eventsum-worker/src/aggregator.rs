//! Turns one drained batch of raw events into the rows to persist.
use std::collections::HashMap;
use std::sync::Arc;

use eventsum_common::bucket::Bucketing;
use eventsum_common::fingerprint::fingerprint;
use eventsum_common::metrics::EVENTS_SKIPPED;
use eventsum_common::model::{
    period_key, Counters, EventBase, EventDetail, EventInstance, EventInstancePeriod, Payload,
    RawEvent,
};
use eventsum_common::rules::{FilterStage, Rules};
use tracing::{debug, warn};

/// The four row-sets produced from one batch, each deduplicated by its natural key.
///
/// The index maps point from a natural key to the row's position in its row-set. Rows
/// reference each other by hash until the persister resolves the hashes into store ids.
#[derive(Debug, Default)]
pub struct Aggregated {
    pub bases: Vec<EventBase>,
    pub instances: Vec<EventInstance>,
    pub periods: Vec<EventInstancePeriod>,
    pub details: Vec<EventDetail>,

    pub base_index: HashMap<String, usize>,
    pub instance_index: HashMap<String, usize>,
    pub period_index: HashMap<String, usize>,
    pub detail_index: HashMap<String, usize>,

    /// Events dropped because one of their filter stages failed.
    pub skipped: usize,
}

impl Aggregated {
    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
            && self.instances.is_empty()
            && self.periods.is_empty()
            && self.details.is_empty()
    }
}

#[derive(Clone)]
pub struct Aggregator {
    rules: Arc<Rules>,
    bucketing: Bucketing,
}

impl Aggregator {
    pub fn new(rules: Arc<Rules>, bucketing: Bucketing) -> Self {
        Self { rules, bucketing }
    }

    /// Aggregate a batch. Events are folded in order; an event failing a filter stage is
    /// skipped, an event with an unparseable timestamp still contributes its Base,
    /// Instance and Detail rows.
    pub fn aggregate(&self, events: &[RawEvent]) -> Aggregated {
        let mut batch = Aggregated::default();

        for event in events {
            self.add(&mut batch, event);
        }

        debug!(
            events = events.len(),
            bases = batch.bases.len(),
            instances = batch.instances.len(),
            periods = batch.periods.len(),
            details = batch.details.len(),
            skipped = batch.skipped,
            "aggregated batch"
        );

        batch
    }

    fn filter(&self, event: &RawEvent, stage: FilterStage, input: Payload) -> Option<Payload> {
        match self.rules.apply_filters(event, stage, input) {
            Ok(output) => Some(output),
            Err(error) => {
                warn!(
                    event = %event.name,
                    service_id = event.service_id,
                    %stage,
                    %error,
                    "skipping event, filter stage failed"
                );
                metrics::counter!(EVENTS_SKIPPED, "stage" => stage.as_str())
                    .increment(1);
                None
            }
        }
    }

    fn add(&self, batch: &mut Aggregated, event: &RawEvent) {
        let Some(generic_data) = self.filter(event, FilterStage::Instance, event.data.clone())
        else {
            batch.skipped += 1;
            return;
        };
        let Some(processed_data) = self.filter(event, FilterStage::Base, generic_data.clone())
        else {
            batch.skipped += 1;
            return;
        };
        let Some(processed_detail) =
            self.filter(event, FilterStage::Detail, event.extra_args.clone())
        else {
            batch.skipped += 1;
            return;
        };

        let generic_data_hash = fingerprint(&generic_data);
        let processed_data_hash = fingerprint(&processed_data);
        let processed_detail_hash = fingerprint(&processed_detail);

        if !batch.base_index.contains_key(&processed_data_hash) {
            batch
                .base_index
                .insert(processed_data_hash.clone(), batch.bases.len());
            batch.bases.push(EventBase {
                id: None,
                service_id: event.service_id,
                event_type: event.kind.clone(),
                event_name: event.name.clone(),
                event_environment_id: event.environment_id,
                event_group_id: None,
                processed_data,
                processed_data_hash: processed_data_hash.clone(),
            });
        }

        if !batch.instance_index.contains_key(&generic_data_hash) {
            batch
                .instance_index
                .insert(generic_data_hash.clone(), batch.instances.len());
            batch.instances.push(EventInstance {
                id: None,
                event_base_id: None,
                event_detail_id: None,
                event_environment_id: event.environment_id,
                event_message: event.message.clone(),
                raw_data: event.data.clone(),
                generic_data,
                generic_data_hash: generic_data_hash.clone(),
                processed_data_hash,
                processed_detail_hash: processed_detail_hash.clone(),
            });
        }

        self.count(batch, event, &generic_data_hash);

        if !batch.detail_index.contains_key(&processed_detail_hash) {
            batch
                .detail_index
                .insert(processed_detail_hash.clone(), batch.details.len());
            batch.details.push(EventDetail {
                id: None,
                raw_detail: event.extra_args.clone(),
                processed_detail,
                processed_detail_hash,
            });
        }
    }

    /// Count the event in the Period of its bucket, creating the Period on first sight.
    fn count(&self, batch: &mut Aggregated, event: &RawEvent, generic_data_hash: &str) {
        let bucketed = self
            .bucketing
            .parse(&event.timestamp)
            .and_then(|t| self.bucketing.bounds(t).map(|bounds| (t, bounds)));
        let (occurred, (start, end)) = match bucketed {
            Ok(bucketed) => bucketed,
            Err(error) => {
                warn!(
                    event = %event.name,
                    service_id = event.service_id,
                    %error,
                    "not counting event, timestamp could not be bucketed"
                );
                metrics::counter!(EVENTS_SKIPPED, "stage" => "bucket")
                    .increment(1);
                return;
            }
        };

        let key = period_key(generic_data_hash, start);
        let index = match batch.period_index.get(&key) {
            Some(index) => *index,
            None => {
                let index = batch.periods.len();
                batch.period_index.insert(key, index);
                batch.periods.push(EventInstancePeriod {
                    id: None,
                    event_instance_id: None,
                    start_time: start,
                    end_time: end,
                    updated: occurred,
                    count: 0,
                    counter_json: Counters::new(),
                    cas_value: 0,
                    generic_data_hash: generic_data_hash.to_owned(),
                });
                index
            }
        };

        let period = &mut batch.periods[index];
        period.count += 1;
        period.updated = period.updated.max(occurred);
        period.counter_json = self
            .rules
            .process_grouping(event, std::mem::take(&mut period.counter_json));
    }
}
