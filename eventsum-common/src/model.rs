//! Rows written and read by the aggregation pipeline.
//!
//! Rows serialize in full (including the hash references used to backfill foreign keys),
//! which is the form kept by the failure sink. `to_record` produces the narrower map that
//! is actually written to a store collection.
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema-less structured payload flowing through filters.
pub type Payload = Value;

/// Per-Period accumulator updated by groupings and merged by the consolidation function.
pub type Counters = Map<String, Value>;

/// A store record: a flat map of column name to value.
pub type Record = Map<String, Value>;

pub const BASE_COLLECTION: &str = "event_base";
pub const INSTANCE_COLLECTION: &str = "event_instance";
pub const PERIOD_COLLECTION: &str = "event_instance_period";
pub const DETAIL_COLLECTION: &str = "event_detail";
pub const GROUP_COLLECTION: &str = "event_group";

/// Name of the group that can be neither renamed away nor deleted.
pub const DEFAULT_GROUP: &str = "default";

/// Primary key column assigned by the store.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKind {
    Base,
    Instance,
    Period,
    Detail,
}

impl RowKind {
    pub fn collection(&self) -> &'static str {
        match self {
            RowKind::Base => BASE_COLLECTION,
            RowKind::Instance => INSTANCE_COLLECTION,
            RowKind::Period => PERIOD_COLLECTION,
            RowKind::Detail => DETAIL_COLLECTION,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Base => "base",
            RowKind::Instance => "instance",
            RowKind::Period => "period",
            RowKind::Detail => "detail",
        }
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a timestamp the way every row stores it: RFC 3339 in UTC.
pub fn timestamp_value(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// An event timestamp as reported by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTime {
    /// Seconds since the Unix epoch, possibly fractional.
    Unix(f64),
    /// A timestamp in the configured textual format.
    Text(String),
}

/// One reported occurrence, before any processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub service_id: i64,
    #[serde(default)]
    pub environment_id: i64,
    #[serde(rename = "event_name")]
    pub name: String,
    #[serde(rename = "event_type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "event_data")]
    pub data: Payload,
    #[serde(default)]
    pub extra_args: Payload,
    pub timestamp: EventTime,
    /// Filter stage name to the ordered filter names run in that stage.
    #[serde(default)]
    pub configurable_filters: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub configurable_groupings: Vec<String>,
}

/// A deduplicated class of event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBase {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub service_id: i64,
    pub event_type: String,
    pub event_name: String,
    #[serde(default)]
    pub event_environment_id: i64,
    #[serde(default)]
    pub event_group_id: Option<i64>,
    pub processed_data: Payload,
    pub processed_data_hash: String,
}

impl EventBase {
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("service_id".to_owned(), self.service_id.into());
        record.insert("event_type".to_owned(), self.event_type.clone().into());
        record.insert("event_name".to_owned(), self.event_name.clone().into());
        record.insert(
            "event_environment_id".to_owned(),
            self.event_environment_id.into(),
        );
        record.insert("event_group_id".to_owned(), self.event_group_id.into());
        record.insert("processed_data".to_owned(), self.processed_data.clone());
        record.insert(
            "processed_data_hash".to_owned(),
            self.processed_data_hash.clone().into(),
        );
        record
    }
}

/// A deduplicated variant of a class, keyed by its instance-filtered payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInstance {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub event_base_id: Option<i64>,
    #[serde(default)]
    pub event_detail_id: Option<i64>,
    #[serde(default)]
    pub event_environment_id: i64,
    #[serde(default)]
    pub event_message: String,
    pub raw_data: Payload,
    pub generic_data: Payload,
    pub generic_data_hash: String,

    // Batch-local references, resolved into the ids above before the row is written.
    #[serde(default)]
    pub processed_data_hash: String,
    #[serde(default)]
    pub processed_detail_hash: String,
}

impl EventInstance {
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("event_base_id".to_owned(), self.event_base_id.into());
        record.insert("event_detail_id".to_owned(), self.event_detail_id.into());
        record.insert(
            "event_environment_id".to_owned(),
            self.event_environment_id.into(),
        );
        record.insert("event_message".to_owned(), self.event_message.clone().into());
        record.insert("raw_data".to_owned(), self.raw_data.clone());
        record.insert("generic_data".to_owned(), self.generic_data.clone());
        record.insert(
            "generic_data_hash".to_owned(),
            self.generic_data_hash.clone().into(),
        );
        record
    }
}

/// Occurrence counts of one Instance within one fixed-width time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInstancePeriod {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub event_instance_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub count: i64,
    #[serde(default)]
    pub counter_json: Counters,
    /// Version token for optimistic concurrency control.
    #[serde(default)]
    pub cas_value: i64,

    #[serde(default)]
    pub generic_data_hash: String,
}

impl EventInstancePeriod {
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert(
            "event_instance_id".to_owned(),
            self.event_instance_id.into(),
        );
        record.insert("start_time".to_owned(), timestamp_value(self.start_time));
        record.insert("end_time".to_owned(), timestamp_value(self.end_time));
        record.insert("updated".to_owned(), timestamp_value(self.updated));
        record.insert("count".to_owned(), self.count.into());
        record.insert(
            "counter_json".to_owned(),
            Value::Object(self.counter_json.clone()),
        );
        record.insert("cas_value".to_owned(), self.cas_value.into());
        record
    }

    /// Natural key of the row within a batch or the failure sink.
    pub fn natural_key(&self) -> String {
        period_key(&self.generic_data_hash, self.start_time)
    }
}

/// Key of the Period counting the Instance with `generic_data_hash` in the bucket
/// starting at `start`.
pub fn period_key(generic_data_hash: &str, start: DateTime<Utc>) -> String {
    format!(
        "{}@{}",
        generic_data_hash,
        start.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Deduplicated extra/context payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDetail {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub raw_detail: Payload,
    pub processed_detail: Payload,
    pub processed_detail_hash: String,
}

impl EventDetail {
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("raw_detail".to_owned(), self.raw_detail.clone());
        record.insert("processed_detail".to_owned(), self.processed_detail.clone());
        record.insert(
            "processed_detail_hash".to_owned(),
            self.processed_detail_hash.clone().into(),
        );
        record
    }
}

/// A named collection of Bases, assigned through a Base's `event_group_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGroup {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub info: String,
}

impl EventGroup {
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("name".to_owned(), self.name.clone().into());
        record.insert("info".to_owned(), self.info.clone().into());
        record
    }
}

/// An Instance row with its Base and Detail rows embedded by a join.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceJoined {
    #[serde(flatten)]
    pub instance: EventInstance,
    #[serde(rename = "event_base", default)]
    pub base: Option<EventBase>,
    #[serde(rename = "event_detail", default)]
    pub detail: Option<EventDetail>,
}

/// A Period row with its Instance (and, transitively, Base) embedded by a join.
#[derive(Debug, Clone, Deserialize)]
pub struct PeriodJoined {
    #[serde(flatten)]
    pub period: EventInstancePeriod,
    #[serde(rename = "event_instance", default)]
    pub instance: Option<InstanceJoined>,
}
