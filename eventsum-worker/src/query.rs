//! Read side: histograms and details assembled from the stored rows.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eventsum_common::model::{
    timestamp_value, Counters, EventBase, EventGroup, EventInstancePeriod, InstanceJoined,
    Payload, PeriodJoined, Record, BASE_COLLECTION, DEFAULT_GROUP, DETAIL_COLLECTION,
    GROUP_COLLECTION, ID_FIELD, INSTANCE_COLLECTION, PERIOD_COLLECTION,
};
use eventsum_common::store::{Datastore, Filter, Join, Op, Query, StoreError};
use serde::Serialize;
use serde_json::Value;

use crate::error::QueryError;

/// Restrictions of a range query. An empty set does not restrict its dimension.
#[derive(Debug, Clone, Default)]
pub struct RangeFilter {
    pub services: BTreeSet<i64>,
    pub environments: BTreeSet<i64>,
    pub groups: BTreeSet<i64>,
    pub bases: BTreeSet<i64>,
    pub names: BTreeSet<String>,
    pub types: BTreeSet<String>,
    /// Order results by most recent update instead of by Base id.
    pub sort_recent: bool,
}

impl RangeFilter {
    fn admits(&self, base: &EventBase, base_id: i64) -> bool {
        fn allowed<T: Ord>(set: &BTreeSet<T>, value: &T) -> bool {
            set.is_empty() || set.contains(value)
        }

        allowed(&self.services, &base.service_id)
            && allowed(&self.environments, &base.event_environment_id)
            && allowed(&self.bases, &base_id)
            && allowed(&self.names, &base.event_name)
            && allowed(&self.types, &base.event_type)
            && (self.groups.is_empty()
                || base
                    .event_group_id
                    .is_some_and(|group| self.groups.contains(&group)))
    }
}

/// Occurrences of one Base over a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseAggregate {
    pub base_id: i64,
    pub service_id: i64,
    pub event_type: String,
    pub event_name: String,
    pub environment_id: i64,
    pub group_id: Option<i64>,
    pub processed_data: Payload,
    pub total: i64,
    pub instance_ids: BTreeSet<i64>,
    /// Bucket start in epoch milliseconds to the count of that bucket.
    pub histogram: BTreeMap<i64, i64>,
    pub last_updated: DateTime<Utc>,
}

/// Flat view of one Instance with its Base and Detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceDetail {
    pub instance_id: i64,
    pub service_id: i64,
    pub event_type: String,
    pub event_name: String,
    pub event_message: String,
    pub raw_data: Payload,
    pub raw_detail: Option<Payload>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodPoint {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub count: i64,
    pub counter_json: Counters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseSummary {
    pub base_id: i64,
    pub event_type: String,
    pub event_name: String,
}

/// A group, by store id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRef {
    Id(i64),
    Name(String),
}

impl fmt::Display for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRef::Id(id) => write!(f, "with id {id}"),
            GroupRef::Name(name) => write!(f, "named {name:?}"),
        }
    }
}

/// How listed event types or names are matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextMatch {
    Exact(String),
    Contains(String),
}

impl TextMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            TextMatch::Exact(expected) => value == expected,
            TextMatch::Contains(part) => value.contains(part.as_str()),
        }
    }
}

/// Occurrences of one Instance over a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountStat {
    pub count: i64,
    pub count_per_minute: f64,
    /// Per-minute rate of the most recently updated Period minus that of the one updated
    /// before it.
    pub increase: f64,
}

fn per_minute(count: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let minutes = (end - start).num_milliseconds() as f64 / 60_000.0;
    if minutes > 0.0 {
        count as f64 / minutes
    } else {
        0.0
    }
}

#[derive(Clone)]
pub struct QueryAssembler {
    store: Arc<dyn Datastore>,
}

impl QueryAssembler {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), QueryError> {
        if start > end {
            return Err(QueryError::InvertedRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(())
    }

    /// Per-Base histograms of the Periods updated within `[start, end]`.
    pub async fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &RangeFilter,
    ) -> Result<Vec<BaseAggregate>, QueryError> {
        Self::check_range(start, end)?;

        let periods = self
            .store
            .query(
                Query::filter(PERIOD_COLLECTION)
                    .matching(Filter::new("updated", Op::Gte, timestamp_value(start)))
                    .matching(Filter::new("updated", Op::Lte, timestamp_value(end)))
                    .join(
                        Join::new("event_instance_id", INSTANCE_COLLECTION)
                            .with(Join::new("event_base_id", BASE_COLLECTION)),
                    ),
            )
            .await?
            .decode::<PeriodJoined>()?;

        let mut aggregates: BTreeMap<i64, BaseAggregate> = BTreeMap::new();
        for joined in periods {
            let period = joined.period;
            let Some(instance) = joined.instance else {
                continue;
            };
            let (Some(instance_id), Some(base)) = (instance.instance.id, instance.base) else {
                continue;
            };
            let Some(base_id) = base.id else {
                continue;
            };
            if !filter.admits(&base, base_id) {
                continue;
            }

            let aggregate = aggregates.entry(base_id).or_insert_with(|| BaseAggregate {
                base_id,
                service_id: base.service_id,
                event_type: base.event_type.clone(),
                event_name: base.event_name.clone(),
                environment_id: base.event_environment_id,
                group_id: base.event_group_id,
                processed_data: base.processed_data.clone(),
                total: 0,
                instance_ids: BTreeSet::new(),
                histogram: BTreeMap::new(),
                last_updated: period.updated,
            });

            aggregate.total += period.count;
            aggregate.instance_ids.insert(instance_id);
            *aggregate
                .histogram
                .entry(period.start_time.timestamp_millis())
                .or_insert(0) += period.count;
            aggregate.last_updated = aggregate.last_updated.max(period.updated);
        }

        let mut aggregates: Vec<BaseAggregate> = aggregates.into_values().collect();
        if filter.sort_recent {
            aggregates.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        }
        Ok(aggregates)
    }

    /// One Instance with its Base and Detail, or `None` if there is no such Instance.
    pub async fn detail(&self, instance_id: i64) -> Result<Option<InstanceDetail>, QueryError> {
        let joined = self
            .store
            .query(
                Query::get(INSTANCE_COLLECTION, instance_id)
                    .join(Join::new("event_base_id", BASE_COLLECTION))
                    .join(Join::new("event_detail_id", DETAIL_COLLECTION)),
            )
            .await?
            .decode::<InstanceJoined>()?
            .into_iter()
            .next();

        let Some(joined) = joined else {
            return Ok(None);
        };
        let base = joined.base.ok_or_else(|| {
            StoreError::Decode(format!("instance {instance_id} has no event_base row"))
        })?;

        let periods = self.periods_of(instance_id, None).await?;

        Ok(Some(InstanceDetail {
            instance_id,
            service_id: base.service_id,
            event_type: base.event_type,
            event_name: base.event_name,
            event_message: joined.instance.event_message,
            raw_data: joined.instance.raw_data,
            raw_detail: joined.detail.map(|detail| detail.raw_detail),
            first_seen: periods.iter().map(|p| p.updated).min(),
            last_seen: periods.iter().map(|p| p.updated).max(),
        }))
    }

    /// The Periods of one Instance updated within `[start, end]`, ordered by bucket start.
    pub async fn instance_histogram(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        instance_id: i64,
    ) -> Result<Vec<PeriodPoint>, QueryError> {
        Self::check_range(start, end)?;

        let points = self
            .periods_of(instance_id, Some((start, end)))
            .await?
            .into_iter()
            .map(|period| PeriodPoint {
                start_time: period.start_time,
                end_time: period.end_time,
                updated: period.updated,
                count: period.count,
                counter_json: period.counter_json,
            })
            .collect();

        Ok(points)
    }

    async fn periods_of(
        &self,
        instance_id: i64,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<EventInstancePeriod>, QueryError> {
        let mut query = Query::filter(PERIOD_COLLECTION)
            .matching(Filter::eq("event_instance_id", instance_id))
            .sort_by("start_time");
        if let Some((start, end)) = window {
            query = query
                .matching(Filter::new("updated", Op::Gte, timestamp_value(start)))
                .matching(Filter::new("updated", Op::Lte, timestamp_value(end)));
        }

        Ok(self
            .store
            .query(query)
            .await?
            .decode::<EventInstancePeriod>()?)
    }

    /// Distinct service ids with at least one Base.
    pub async fn services(&self) -> Result<Vec<i64>, QueryError> {
        let rows = self
            .store
            .query(Query::filter(BASE_COLLECTION))
            .await?
            .into_rows()?;

        let services: BTreeSet<i64> = rows
            .iter()
            .filter_map(|row| row.get("service_id").and_then(Value::as_i64))
            .collect();
        Ok(services.into_iter().collect())
    }

    /// The Bases reported by one service, ordered by id.
    pub async fn events_for_service(
        &self,
        service_id: i64,
    ) -> Result<Vec<BaseSummary>, QueryError> {
        let bases = self
            .store
            .query(
                Query::filter(BASE_COLLECTION)
                    .matching(Filter::eq("service_id", service_id))
                    .sort_by(ID_FIELD),
            )
            .await?
            .decode::<EventBase>()?;

        Ok(bases.into_iter().filter_map(summary).collect())
    }

    /// Total, rate and rate change of one Instance's Periods updated within `[start, end]`.
    pub async fn count_events(
        &self,
        instance_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CountStat, QueryError> {
        Self::check_range(start, end)?;

        let mut periods = self.periods_of(instance_id, Some((start, end))).await?;
        periods.sort_by(|a, b| b.updated.cmp(&a.updated));

        let rate = |period: &EventInstancePeriod| {
            per_minute(period.count, period.start_time, period.end_time)
        };
        let increase = match periods.as_slice() {
            [] => 0.0,
            [latest] => rate(latest),
            [latest, previous, ..] => rate(latest) - rate(previous),
        };
        let count = periods.iter().map(|period| period.count).sum();

        Ok(CountStat {
            count,
            count_per_minute: per_minute(count, start, end),
            increase,
        })
    }

    /// Distinct event types of the stored Bases, sorted.
    pub async fn event_types(&self, matcher: &TextMatch) -> Result<Vec<String>, QueryError> {
        self.base_values("event_type", matcher).await
    }

    /// Distinct event names of the stored Bases, sorted.
    pub async fn event_names(&self, matcher: &TextMatch) -> Result<Vec<String>, QueryError> {
        self.base_values("event_name", matcher).await
    }

    async fn base_values(&self, field: &str, matcher: &TextMatch) -> Result<Vec<String>, QueryError> {
        let mut query = Query::filter(BASE_COLLECTION);
        if let TextMatch::Exact(value) = matcher {
            query = query.matching(Filter::eq(field, value.as_str()));
        }

        let rows = self.store.query(query).await?.into_rows()?;
        let values: BTreeSet<&str> = rows
            .iter()
            .filter_map(|row| row.get(field).and_then(Value::as_str))
            .filter(|value| matcher.matches(value))
            .collect();

        Ok(values.into_iter().map(str::to_owned).collect())
    }

    /// Every group, ordered by id.
    pub async fn groups(&self) -> Result<Vec<EventGroup>, QueryError> {
        Ok(self
            .store
            .query(Query::filter(GROUP_COLLECTION).sort_by(ID_FIELD))
            .await?
            .decode::<EventGroup>()?)
    }

    pub async fn group(&self, group: &GroupRef) -> Result<Option<EventGroup>, QueryError> {
        let query = match group {
            GroupRef::Id(id) => Query::get(GROUP_COLLECTION, *id),
            GroupRef::Name(name) => Query::filter(GROUP_COLLECTION)
                .matching(Filter::eq("name", name.as_str()))
                .limit(1),
        };

        Ok(self
            .store
            .query(query)
            .await?
            .decode::<EventGroup>()?
            .into_iter()
            .next())
    }

    /// Create a group. Names are unique.
    pub async fn add_group(&self, name: &str, info: &str) -> Result<EventGroup, QueryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(QueryError::EmptyGroupName);
        }
        let group = EventGroup {
            id: None,
            name: name.to_owned(),
            info: info.to_owned(),
        };

        self.store
            .query(Query::insert(GROUP_COLLECTION, group.to_record()))
            .await
            .map_err(|err| group_conflict(err, name))?
            .decode::<EventGroup>()?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no row".to_owned()).into())
    }

    /// Rename the group called `name`, replacing its info when `info` is given.
    pub async fn modify_group(
        &self,
        name: &str,
        new_name: &str,
        info: Option<&str>,
    ) -> Result<EventGroup, QueryError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(QueryError::EmptyGroupName);
        }
        if name == DEFAULT_GROUP && new_name != DEFAULT_GROUP {
            return Err(QueryError::DefaultGroup);
        }

        let mut changes = Record::new();
        changes.insert("name".to_owned(), new_name.into());
        if let Some(info) = info {
            changes.insert("info".to_owned(), info.into());
        }

        self.store
            .query(Query::update(GROUP_COLLECTION, changes).matching(Filter::eq("name", name)))
            .await
            .map_err(|err| group_conflict(err, new_name))?
            .decode::<EventGroup>()?
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::GroupNotFound(GroupRef::Name(name.to_owned()).to_string()))
    }

    /// Delete a group and move its Bases out of any group. Returns how many Bases were
    /// ungrouped.
    pub async fn delete_group(&self, group: &GroupRef) -> Result<usize, QueryError> {
        let found = self
            .group(group)
            .await?
            .ok_or_else(|| QueryError::GroupNotFound(group.to_string()))?;
        if found.name == DEFAULT_GROUP {
            return Err(QueryError::DefaultGroup);
        }
        let Some(id) = found.id else {
            return Err(StoreError::Decode(format!("group {group} has no id")).into());
        };

        let mut changes = Record::new();
        changes.insert("event_group_id".to_owned(), Value::Null);
        let ungrouped = self
            .store
            .query(
                Query::update(BASE_COLLECTION, changes)
                    .matching(Filter::eq("event_group_id", id)),
            )
            .await?
            .into_rows()?
            .len();

        self.store
            .query(Query::delete(GROUP_COLLECTION).matching(Filter::eq(ID_FIELD, id)))
            .await?
            .into_rows()?;

        Ok(ungrouped)
    }

    /// The Bases assigned to a group, ordered by id. Unknown groups have no Bases.
    pub async fn events_by_group(&self, group: &GroupRef) -> Result<Vec<BaseSummary>, QueryError> {
        let Some(id) = self.group(group).await?.and_then(|found| found.id) else {
            return Ok(Vec::new());
        };

        let bases = self
            .store
            .query(
                Query::filter(BASE_COLLECTION)
                    .matching(Filter::eq("event_group_id", id))
                    .sort_by(ID_FIELD),
            )
            .await?
            .decode::<EventBase>()?;

        Ok(bases.into_iter().filter_map(summary).collect())
    }

    /// Assign a Base to a group, or clear its group. Returns whether the Base exists.
    pub async fn set_group(
        &self,
        base_id: i64,
        group_id: Option<i64>,
    ) -> Result<bool, QueryError> {
        let mut changes = Record::new();
        changes.insert("event_group_id".to_owned(), group_id.into());

        let updated = self
            .store
            .query(
                Query::update(BASE_COLLECTION, changes).matching(Filter::eq(ID_FIELD, base_id)),
            )
            .await?
            .into_rows()?;

        Ok(!updated.is_empty())
    }
}

fn summary(base: EventBase) -> Option<BaseSummary> {
    Some(BaseSummary {
        base_id: base.id?,
        event_type: base.event_type,
        event_name: base.event_name,
    })
}

fn group_conflict(err: StoreError, name: &str) -> QueryError {
    match err {
        StoreError::Conflict { .. } => QueryError::GroupExists(name.to_owned()),
        other => other.into(),
    }
}
