use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use super::{Datastore, Filter, Join, Op, Query, QueryKind, QueryResult, StoreError};
use crate::model::{
    Record, BASE_COLLECTION, DETAIL_COLLECTION, GROUP_COLLECTION, ID_FIELD, INSTANCE_COLLECTION,
    PERIOD_COLLECTION,
};

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<i64, Record>,
    next_id: i64,
}

/// An in-process `Datastore` keeping every collection in memory.
///
/// Ids are assigned from a per-collection sequence starting at 1. Unique indexes declared
/// with `unique_index` reject inserts and updates that would duplicate the indexed
/// values; rows missing any indexed field are not indexed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    unique: HashMap<String, Vec<Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the natural keys of the aggregated rows declared as unique indexes.
    pub fn with_eventsum_schema() -> Self {
        Self::new()
            .unique_index(BASE_COLLECTION, &["processed_data_hash"])
            .unique_index(DETAIL_COLLECTION, &["processed_detail_hash"])
            .unique_index(INSTANCE_COLLECTION, &["generic_data_hash"])
            .unique_index(PERIOD_COLLECTION, &["event_instance_id", "start_time"])
            .unique_index(GROUP_COLLECTION, &["name"])
    }

    pub fn unique_index(mut self, collection: &str, fields: &[&str]) -> Self {
        self.unique
            .entry(collection.to_owned())
            .or_default()
            .push(fields.iter().map(|f| (*f).to_owned()).collect());
        self
    }

    /// Number of rows currently held in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.tables
            .lock()
            .map(|tables| tables.get(collection).map_or(0, |t| t.rows.len()))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Table>>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Transport("poisoned memory store".to_owned()))
    }

    fn check_unique(
        &self,
        table: &Table,
        collection: &str,
        candidate: &Record,
        skip_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let Some(indexes) = self.unique.get(collection) else {
            return Ok(());
        };

        for fields in indexes {
            let key: Option<Vec<&Value>> = fields
                .iter()
                .map(|f| candidate.get(f).filter(|v| !v.is_null()))
                .collect();
            let Some(key) = key else {
                continue;
            };

            let duplicate = table.rows.iter().any(|(id, row)| {
                Some(*id) != skip_id
                    && fields
                        .iter()
                        .zip(&key)
                        .all(|(f, v)| row.get(f).is_some_and(|existing| equal(existing, v)))
            });

            if duplicate {
                let key = key.iter().map(|v| v.to_string()).collect::<Vec<_>>();
                return Err(StoreError::Conflict {
                    collection: collection.to_owned(),
                    key: key.join(","),
                });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn query(&self, query: Query) -> Result<QueryResult, StoreError> {
        let mut tables = self.lock()?;

        let rows = match query.kind {
            QueryKind::Filter | QueryKind::Get => {
                let Some(table) = tables.get(&query.collection) else {
                    return Ok(QueryResult::default());
                };
                let mut rows: Vec<Record> = table
                    .rows
                    .values()
                    .filter(|row| selected(row, &query))
                    .cloned()
                    .collect();

                sort_rows(&mut rows, &query.sort);
                if let Some(limit) = query.limit {
                    rows.truncate(limit);
                }
                for row in rows.iter_mut() {
                    embed(&tables, row, &query.join);
                }
                rows
            }
            QueryKind::Insert => {
                let Some(mut record) = query.record else {
                    return Ok(QueryResult::rejected("insert without a record", None));
                };
                let table = tables.entry(query.collection.clone()).or_default();
                record.remove(ID_FIELD);
                self.check_unique(table, &query.collection, &record, None)?;

                table.next_id += 1;
                let id = table.next_id;
                record.insert(ID_FIELD.to_owned(), id.into());
                table.rows.insert(id, record.clone());
                vec![record]
            }
            QueryKind::Update => {
                let Some(changes) = query.record.as_ref() else {
                    return Ok(QueryResult::rejected("update without a record", None));
                };
                let Some(table) = tables.get_mut(&query.collection) else {
                    return Ok(QueryResult::default());
                };

                let matched: Vec<i64> = table
                    .rows
                    .iter()
                    .filter(|(_, row)| selected(row, &query))
                    .map(|(id, _)| *id)
                    .collect();

                let mut updated = Vec::with_capacity(matched.len());
                for id in &matched {
                    let mut row = table.rows[id].clone();
                    for (field, value) in changes {
                        if field != ID_FIELD {
                            row.insert(field.clone(), value.clone());
                        }
                    }
                    self.check_unique(table, &query.collection, &row, Some(*id))?;
                    updated.push((*id, row));
                }

                let mut rows = Vec::with_capacity(updated.len());
                for (id, row) in updated {
                    table.rows.insert(id, row.clone());
                    rows.push(row);
                }
                rows
            }
            QueryKind::Delete => {
                let Some(table) = tables.get_mut(&query.collection) else {
                    return Ok(QueryResult::default());
                };
                let matched: Vec<i64> = table
                    .rows
                    .iter()
                    .filter(|(_, row)| selected(row, &query))
                    .map(|(id, _)| *id)
                    .collect();
                matched
                    .into_iter()
                    .filter_map(|id| table.rows.remove(&id))
                    .collect()
            }
        };

        Ok(QueryResult::from_rows(rows))
    }
}

fn selected(row: &Record, query: &Query) -> bool {
    let pkey_matches = query.pkey.as_ref().map_or(true, |pkey| {
        pkey.iter()
            .all(|(field, value)| row.get(field).is_some_and(|v| equal(v, value)))
    });

    pkey_matches && query.filter.as_ref().map_or(true, |f| matches(row, f))
}

fn matches(row: &Record, filter: &Filter) -> bool {
    match filter {
        Filter::And(filters) => filters.iter().all(|f| matches(row, f)),
        Filter::Condition { field, op, value } => {
            let actual = row.get(field).unwrap_or(&Value::Null);
            match op {
                Op::Eq => equal(actual, value),
                Op::Ne => !equal(actual, value),
                Op::Lt => compare(actual, value) == Some(Ordering::Less),
                Op::Lte => matches!(
                    compare(actual, value),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                Op::Gt => compare(actual, value) == Some(Ordering::Greater),
                Op::Gte => matches!(
                    compare(actual, value),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
            }
        }
    }
}

fn equal(left: &Value, right: &Value) -> bool {
    match compare(left, right) {
        Some(ordering) => ordering == Ordering::Equal,
        None => left == right,
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).ok()
}

/// Order two scalar values. Strings that both parse as RFC 3339 timestamps compare as
/// instants. Values of different types are unordered.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => match (parse_timestamp(l), parse_timestamp(r)) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => Some(l.cmp(r)),
        },
        _ => None,
    }
}

fn sort_rows(rows: &mut [Record], keys: &[String]) {
    if keys.is_empty() {
        return;
    }

    rows.sort_by(|a, b| {
        for key in keys {
            let (field, descending) = match key.strip_prefix('-') {
                Some(field) => (field, true),
                None => (key.as_str(), false),
            };
            let left = a.get(field).unwrap_or(&Value::Null);
            let right = b.get(field).unwrap_or(&Value::Null);
            let ordering = compare(left, right).unwrap_or(Ordering::Equal);
            let ordering = if descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn embed(tables: &HashMap<String, Table>, row: &mut Record, joins: &[Join]) {
    for join in joins {
        let related = row
            .get(&join.field)
            .and_then(Value::as_i64)
            .and_then(|id| tables.get(&join.collection)?.rows.get(&id))
            .cloned();

        if let Some(mut related) = related {
            embed(tables, &mut related, &join.nested);
            row.insert(join.collection.clone(), Value::Object(related));
        }
    }
}
