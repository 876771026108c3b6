//! Interface to the record store holding the aggregated rows.
//!
//! The store is reached through a single query operation parameterized by kind,
//! collection, filter, record, primary key, limit, sort and joins. Results carry an
//! optional error string that is a failure in its own right, distinct from a transport
//! error returned by `query`.
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::model::{Record, BASE_COLLECTION, ID_FIELD};

mod memory;

pub use memory::MemoryStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store could not be reached: {0}")]
    Transport(String),
    #[error("store rejected the query: {error}")]
    Rejected {
        error: String,
        validation: Option<Value>,
    },
    #[error("unique key violation on {collection}: {key}")]
    Conflict { collection: String, key: String },
    #[error("row could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Filter,
    Get,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Gt => ">",
            Op::Gte => ">=",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Condition { field: String, op: Op, value: Value },
    And(Vec<Filter>),
}

impl Filter {
    pub fn new(field: &str, op: Op, value: impl Into<Value>) -> Self {
        Filter::Condition {
            field: field.to_owned(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Eq, value)
    }

    /// Combine with another filter. Nested conjunctions are flattened.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), right) => {
                left.push(right);
                Filter::And(left)
            }
            (left, Filter::And(mut right)) => {
                right.insert(0, left);
                Filter::And(right)
            }
            (left, right) => Filter::And(vec![left, right]),
        }
    }
}

/// Embed the row of `collection` whose `_id` equals the row's `field` under the key
/// `collection`. Nested joins apply to the embedded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub field: String,
    pub collection: String,
    pub nested: Vec<Join>,
}

impl Join {
    pub fn new(field: &str, collection: &str) -> Self {
        Self {
            field: field.to_owned(),
            collection: collection.to_owned(),
            nested: Vec::new(),
        }
    }

    pub fn with(mut self, nested: Join) -> Self {
        self.nested.push(nested);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: QueryKind,
    pub collection: String,
    pub filter: Option<Filter>,
    pub record: Option<Record>,
    pub pkey: Option<Record>,
    pub limit: Option<usize>,
    /// Field names to sort by, prefixed with `-` for descending order.
    pub sort: Vec<String>,
    pub join: Vec<Join>,
}

impl Query {
    fn new(kind: QueryKind, collection: &str) -> Self {
        Self {
            kind,
            collection: collection.to_owned(),
            filter: None,
            record: None,
            pkey: None,
            limit: None,
            sort: Vec::new(),
            join: Vec::new(),
        }
    }

    pub fn filter(collection: &str) -> Self {
        Self::new(QueryKind::Filter, collection)
    }

    pub fn get(collection: &str, id: i64) -> Self {
        let mut pkey = Record::new();
        pkey.insert(ID_FIELD.to_owned(), id.into());
        Self::new(QueryKind::Get, collection).pkey(pkey)
    }

    pub fn insert(collection: &str, record: Record) -> Self {
        Self::new(QueryKind::Insert, collection).record(record)
    }

    /// Update the rows matched by the filter. Without a filter, every row is updated.
    pub fn update(collection: &str, record: Record) -> Self {
        Self::new(QueryKind::Update, collection).record(record)
    }

    pub fn delete(collection: &str) -> Self {
        Self::new(QueryKind::Delete, collection)
    }

    /// Add a condition, AND-ed with any existing filter.
    pub fn matching(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn record(mut self, record: Record) -> Self {
        self.record = Some(record);
        self
    }

    pub fn pkey(mut self, pkey: Record) -> Self {
        self.pkey = Some(pkey);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort_by(mut self, field: &str) -> Self {
        self.sort.push(field.to_owned());
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.join.push(join);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Record>,
    pub error: Option<String>,
    pub validation_error: Option<Value>,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Record>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn rejected(error: &str, validation_error: Option<Value>) -> Self {
        Self {
            rows: Vec::new(),
            error: Some(error.to_owned()),
            validation_error,
        }
    }

    /// The returned rows, or `StoreError::Rejected` if the result carries an error string.
    pub fn into_rows(self) -> Result<Vec<Record>, StoreError> {
        match self.error {
            Some(error) if !error.is_empty() => Err(StoreError::Rejected {
                error,
                validation: self.validation_error,
            }),
            _ => Ok(self.rows),
        }
    }

    /// Decode the returned rows into typed values.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Vec<T>, StoreError> {
        self.into_rows()?
            .into_iter()
            .map(|row| {
                serde_json::from_value(Value::Object(row))
                    .map_err(|e| StoreError::Decode(e.to_string()))
            })
            .collect()
    }
}

/// Read the store-assigned id of a row.
pub fn row_id(row: &Record) -> Result<i64, StoreError> {
    row.get(ID_FIELD)
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::Decode(format!("row has no integer {ID_FIELD}")))
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn query(&self, query: Query) -> Result<QueryResult, StoreError>;

    /// Connectivity check run once at startup.
    async fn ping(&self) -> Result<(), StoreError> {
        self.query(Query::filter(BASE_COLLECTION).limit(1))
            .await?
            .into_rows()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_matching_flattens_conjunctions() {
        let query = Query::filter("event_base")
            .matching(Filter::eq("service_id", 1))
            .matching(Filter::new("_id", Op::Gt, 3))
            .matching(Filter::eq("event_type", "python"));

        assert_eq!(
            query.filter,
            Some(Filter::And(vec![
                Filter::eq("service_id", 1),
                Filter::new("_id", Op::Gt, 3),
                Filter::eq("event_type", "python"),
            ]))
        );
    }

    #[test]
    fn test_error_string_is_a_failure() {
        let result = QueryResult::rejected("bad filter", Some(json!({"field": "nope"})));

        assert_eq!(
            result.into_rows(),
            Err(StoreError::Rejected {
                error: "bad filter".to_owned(),
                validation: Some(json!({"field": "nope"})),
            })
        );

        let empty_error = QueryResult {
            error: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(empty_error.into_rows(), Ok(vec![]));
    }

    #[test]
    fn test_row_id() {
        let mut row = Record::new();
        assert!(matches!(row_id(&row), Err(StoreError::Decode(_))));

        row.insert("_id".to_owned(), json!(7));
        assert_eq!(row_id(&row), Ok(7));
    }
}
