//! Named, user-supplied transformations applied to events during aggregation.
//!
//! Three roles exist, each with a fixed call signature checked when the function is
//! registered: filters rewrite a payload, groupings fold an event into a Period's
//! accumulator, and a single consolidation function merges two accumulators.
//! Registration takes `&mut Rules`, so it has to complete before the registry is shared
//! with the pipeline.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Number, Value};
use thiserror::Error;
use tracing::warn;

use crate::model::{Counters, Payload, RawEvent};

pub type FilterFn = Arc<dyn Fn(Payload) -> Result<Payload, RuleError> + Send + Sync>;
pub type GroupingFn = Arc<dyn Fn(&Payload, Counters) -> Result<Counters, RuleError> + Send + Sync>;
pub type ConsolidateFn = Arc<dyn Fn(Counters, Counters) -> Result<Counters, RuleError> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("no filter registered under {0:?}")]
    UnknownFilter(String),
    #[error("no grouping registered under {0:?}")]
    UnknownGrouping(String),
    #[error("{0:?} is not a valid filter stage")]
    UnknownStage(String),
    #[error("filters for the {stage} stage are given under both {first:?} and {second:?}")]
    DuplicateStage {
        stage: &'static str,
        first: String,
        second: String,
    },
    #[error("rule names must not be empty")]
    InvalidName,
    #[error("counter {key:?} holds a non-numeric value: {value}")]
    NonNumericCounter { key: String, value: String },
    #[error("filter failed: {0}")]
    Filter(String),
    #[error("grouping failed: {0}")]
    Grouping(String),
}

/// The part of an event a filter chain is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterStage {
    /// Produces the processed payload that identifies a Base.
    Base,
    /// Produces the generic payload that identifies an Instance.
    Instance,
    /// Produces the processed extra arguments that identify a Detail.
    Detail,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::Base => "base",
            FilterStage::Instance => "instance",
            FilterStage::Detail => "detail",
        }
    }

    /// The part of the raw event this stage reads when run on its own.
    pub fn source<'a>(&self, event: &'a RawEvent) -> &'a Payload {
        match self {
            FilterStage::Base | FilterStage::Instance => &event.data,
            FilterStage::Detail => &event.extra_args,
        }
    }
}

impl FromStr for FilterStage {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" | "data" => Ok(FilterStage::Base),
            "instance" | "generic" => Ok(FilterStage::Instance),
            "detail" | "extra_args" => Ok(FilterStage::Detail),
            invalid => Err(RuleError::UnknownStage(invalid.to_owned())),
        }
    }
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry of filters, groupings and the consolidation function.
#[derive(Clone)]
pub struct Rules {
    filters: HashMap<String, FilterFn>,
    groupings: HashMap<String, GroupingFn>,
    consolidate: ConsolidateFn,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            filters: HashMap::new(),
            groupings: HashMap::new(),
            consolidate: Arc::new(sum_counters),
        }
    }
}

impl fmt::Debug for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut filters: Vec<_> = self.filters.keys().collect();
        filters.sort();
        let mut groupings: Vec<_> = self.groupings.keys().collect();
        groupings.sort();
        f.debug_struct("Rules")
            .field("filters", &filters)
            .field("groupings", &groupings)
            .finish_non_exhaustive()
    }
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter, replacing any filter already registered under `name`.
    pub fn register_filter<F>(&mut self, name: &str, filter: F) -> Result<(), RuleError>
    where
        F: Fn(Payload) -> Result<Payload, RuleError> + Send + Sync + 'static,
    {
        let name = validate_name(name)?;
        self.filters.insert(name, Arc::new(filter));
        Ok(())
    }

    /// Register a grouping, replacing any grouping already registered under `name`.
    pub fn register_grouping<F>(&mut self, name: &str, grouping: F) -> Result<(), RuleError>
    where
        F: Fn(&Payload, Counters) -> Result<Counters, RuleError> + Send + Sync + 'static,
    {
        let name = validate_name(name)?;
        self.groupings.insert(name, Arc::new(grouping));
        Ok(())
    }

    /// Replace the consolidation function. It must be associative and commutative:
    /// concurrent flushes merge into the same Period in no particular order.
    pub fn register_consolidation<F>(&mut self, consolidate: F)
    where
        F: Fn(Counters, Counters) -> Result<Counters, RuleError> + Send + Sync + 'static,
    {
        self.consolidate = Arc::new(consolidate);
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn has_grouping(&self, name: &str) -> bool {
        self.groupings.contains_key(name)
    }

    /// Run the event's filter chain for `stage` over `input`. Each filter receives the
    /// previous filter's output. An unknown filter name or a failing filter abandons the
    /// whole stage, and so does a malformed chain configuration: a key that names no
    /// stage, or two alias keys naming this one.
    pub fn apply_filters(
        &self,
        event: &RawEvent,
        stage: FilterStage,
        input: Payload,
    ) -> Result<Payload, RuleError> {
        let names = filter_chain(event, stage)?;

        let mut payload = input;
        for name in names {
            let filter = self
                .filters
                .get(name)
                .ok_or_else(|| RuleError::UnknownFilter(name.to_owned()))?;
            payload = filter(payload)?;
        }

        Ok(payload)
    }

    /// Run the filter chain of a stage given by name over the part of the event that
    /// stage reads.
    pub fn process_filter(&self, event: &RawEvent, stage: &str) -> Result<Payload, RuleError> {
        let stage: FilterStage = stage.parse()?;
        self.apply_filters(event, stage, stage.source(event).clone())
    }

    /// Fold the event into `counters` with every grouping the event names, in order.
    /// Groupings see the raw event data. Unknown or failing groupings are skipped.
    pub fn process_grouping(&self, event: &RawEvent, counters: Counters) -> Counters {
        let mut counters = counters;

        for name in &event.configurable_groupings {
            let Some(grouping) = self.groupings.get(name) else {
                warn!(grouping = %name, event = %event.name, "skipping unknown grouping");
                continue;
            };

            match grouping(&event.data, counters.clone()) {
                Ok(grouped) => counters = grouped,
                Err(error) => {
                    warn!(grouping = %name, event = %event.name, %error, "grouping failed");
                }
            }
        }

        counters
    }

    /// Merge two accumulators with the registered consolidation function.
    pub fn consolidate(&self, first: Counters, second: Counters) -> Result<Counters, RuleError> {
        (self.consolidate)(first, second)
    }
}

/// The filter names configured for `stage`, looked up under exactly one of its aliases.
fn filter_chain(event: &RawEvent, stage: FilterStage) -> Result<&[String], RuleError> {
    let mut chain: Option<(&str, &[String])> = None;

    for (key, names) in &event.configurable_filters {
        if key.parse::<FilterStage>()? != stage {
            continue;
        }
        if let Some((other, _)) = chain {
            let (first, second) = if other < key.as_str() {
                (other, key.as_str())
            } else {
                (key.as_str(), other)
            };
            return Err(RuleError::DuplicateStage {
                stage: stage.as_str(),
                first: first.to_owned(),
                second: second.to_owned(),
            });
        }
        chain = Some((key.as_str(), names.as_slice()));
    }

    Ok(chain.map(|(_, names)| names).unwrap_or_default())
}

fn validate_name(name: &str) -> Result<String, RuleError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RuleError::InvalidName);
    }
    Ok(name.to_owned())
}

/// Default consolidation: sum the values of every key present in either accumulator,
/// treating a missing key as zero. Integers stay integers unless the sum overflows.
pub fn sum_counters(first: Counters, second: Counters) -> Result<Counters, RuleError> {
    let mut merged = second;

    for (key, value) in first {
        let sum = match merged.get(&key) {
            Some(existing) => add(&key, existing, &value)?,
            None => add(&key, &Value::from(0), &value)?,
        };
        merged.insert(key, sum);
    }

    // Keys only present in `second` still have to be numeric.
    for (key, value) in &merged {
        if !value.is_number() {
            return Err(non_numeric(key, value));
        }
    }

    Ok(merged)
}

fn add(key: &str, left: &Value, right: &Value) -> Result<Value, RuleError> {
    let (Value::Number(l), Value::Number(r)) = (left, right) else {
        let offender = if left.is_number() { right } else { left };
        return Err(non_numeric(key, offender));
    };

    if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
        if let Some(sum) = l.checked_add(r) {
            return Ok(Value::from(sum));
        }
    }

    let (Some(l), Some(r)) = (l.as_f64(), r.as_f64()) else {
        return Err(non_numeric(key, right));
    };
    Number::from_f64(l + r)
        .map(Value::Number)
        .ok_or_else(|| non_numeric(key, &Value::from(format!("{}", l + r))))
}

fn non_numeric(key: &str, value: &Value) -> RuleError {
    RuleError::NonNumericCounter {
        key: key.to_owned(),
        value: value.to_string(),
    }
}

/// Filters and groupings shipped with the worker binary.
pub mod builtin {
    use serde_json::Value;

    use super::{Counters, Payload, RuleError, Rules};

    /// Returns a filter removing every object key in `keys`, at any depth.
    pub fn remove_keys(
        keys: &'static [&'static str],
    ) -> impl Fn(Payload) -> Result<Payload, RuleError> + Send + Sync + 'static {
        move |payload| Ok(strip(payload, keys))
    }

    fn strip(payload: Payload, keys: &[&str]) -> Payload {
        match payload {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| !keys.contains(&key.as_str()))
                    .map(|(key, value)| (key, strip(value, keys)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| strip(item, keys)).collect())
            }
            other => other,
        }
    }

    /// Returns a grouping counting events by the string value found at `field`.
    /// Events without that field are counted under `"unknown"`.
    pub fn count_by(
        field: &'static str,
    ) -> impl Fn(&Payload, Counters) -> Result<Counters, RuleError> + Send + Sync + 'static {
        move |payload, mut counters| {
            let key = match payload.get(field) {
                Some(Value::String(value)) => value.to_owned(),
                Some(Value::Null) | None => "unknown".to_owned(),
                Some(other) => other.to_string(),
            };
            let current = counters.get(&key).and_then(Value::as_i64).unwrap_or(0);
            counters.insert(key, Value::from(current + 1));
            Ok(counters)
        }
    }

    /// Register the built-in rules under their public names.
    pub fn register(rules: &mut Rules) -> Result<(), RuleError> {
        rules.register_filter("exception_python_remove_line_no", remove_keys(&["lineno"]))?;
        rules.register_filter("exception_python_remove_stack_vars", remove_keys(&["vars"]))?;
        rules.register_grouping("count_by_level", count_by("level"))?;
        rules.register_grouping("count_by_logger", count_by("logger"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counters(value: Value) -> Counters {
        match value {
            Value::Object(map) => map,
            _ => panic!("counters must be an object"),
        }
    }

    fn event(filters: Vec<(&str, Vec<&str>)>, groupings: Vec<&str>) -> RawEvent {
        RawEvent {
            service_id: 1,
            environment_id: 0,
            name: "KeyError".to_owned(),
            kind: "python".to_owned(),
            message: "boom".to_owned(),
            data: json!({"message": "boom", "lineno": 12, "level": "error"}),
            extra_args: json!({"host": "web-1"}),
            timestamp: crate::model::EventTime::Unix(0.0),
            configurable_filters: filters
                .into_iter()
                .map(|(stage, names)| {
                    (
                        stage.to_owned(),
                        names.into_iter().map(str::to_owned).collect(),
                    )
                })
                .collect(),
            configurable_groupings: groupings.into_iter().map(str::to_owned).collect(),
        }
    }

    #[test]
    fn test_filters_run_in_order() {
        let mut rules = Rules::new();
        rules
            .register_filter("drop_lineno", builtin::remove_keys(&["lineno"]))
            .unwrap();
        rules
            .register_filter("tag", |mut payload: Payload| {
                let seen_lineno = payload.get("lineno").is_some();
                payload["tagged_after_drop"] = Value::Bool(!seen_lineno);
                Ok(payload)
            })
            .unwrap();
        let event = event(vec![("instance", vec!["drop_lineno", "tag"])], vec![]);

        let generic = rules.process_filter(&event, "instance").unwrap();

        assert_eq!(
            generic,
            json!({"message": "boom", "level": "error", "tagged_after_drop": true})
        );
    }

    #[test]
    fn test_stage_without_filters_returns_its_source() {
        let rules = Rules::new();
        let event = event(vec![], vec![]);

        assert_eq!(rules.process_filter(&event, "data").unwrap(), event.data);
        assert_eq!(
            rules.process_filter(&event, "extra_args").unwrap(),
            event.extra_args
        );
    }

    #[test]
    fn test_unknown_stage_and_filter_are_errors() {
        let rules = Rules::new();
        let event = event(vec![("base", vec!["missing"])], vec![]);

        assert_eq!(
            rules.process_filter(&event, "everything").unwrap_err(),
            RuleError::UnknownStage("everything".to_owned())
        );
        assert_eq!(
            rules.process_filter(&event, "base").unwrap_err(),
            RuleError::UnknownFilter("missing".to_owned())
        );
        // Other stages are unaffected by the broken base chain.
        assert!(rules.process_filter(&event, "detail").is_ok());
    }

    #[test]
    fn test_stage_given_under_two_aliases_is_rejected() {
        fn append(
            suffix: &'static str,
        ) -> impl Fn(Payload) -> Result<Payload, RuleError> + Send + Sync + 'static {
            move |payload| Ok(json!(format!("{}{suffix}", payload.as_str().unwrap_or(""))))
        }
        let mut rules = Rules::new();
        rules.register_filter("a", append("a")).unwrap();
        rules.register_filter("b", append("b")).unwrap();
        let event = event(vec![("base", vec!["a"]), ("data", vec!["b"])], vec![]);
        let expected = RuleError::DuplicateStage {
            stage: "base",
            first: "base".to_owned(),
            second: "data".to_owned(),
        };

        for _ in 0..64 {
            assert_eq!(
                rules.apply_filters(&event, FilterStage::Base, json!("x")),
                Err(expected.clone())
            );
        }
        assert!(rules
            .apply_filters(&event, FilterStage::Instance, json!("x"))
            .is_ok());
    }

    #[test]
    fn test_misspelled_stage_key_fails_every_stage() {
        let rules = Rules::new();
        let event = event(vec![("bsae", vec!["missing"])], vec![]);

        for stage in [FilterStage::Base, FilterStage::Instance, FilterStage::Detail] {
            assert_eq!(
                rules.apply_filters(&event, stage, json!("x")),
                Err(RuleError::UnknownStage("bsae".to_owned()))
            );
        }
    }

    #[test]
    fn test_registration_is_last_writer_wins() {
        let mut rules = Rules::new();
        rules
            .register_filter("f", |_| Ok(json!("first")))
            .unwrap();
        rules
            .register_filter("f", |_| Ok(json!("second")))
            .unwrap();
        let event = event(vec![("base", vec!["f"])], vec![]);

        assert_eq!(rules.process_filter(&event, "base").unwrap(), json!("second"));
        assert_eq!(
            rules.register_filter("  ", |p| Ok(p)).unwrap_err(),
            RuleError::InvalidName
        );
    }

    #[test]
    fn test_grouping_skips_unknown_and_failing_functions() {
        let mut rules = Rules::new();
        rules
            .register_grouping("by_level", builtin::count_by("level"))
            .unwrap();
        rules
            .register_grouping("broken", |_, _| Err(RuleError::Grouping("nope".to_owned())))
            .unwrap();
        let event = event(vec![], vec!["by_level", "missing", "broken", "by_level"]);

        let grouped = rules.process_grouping(&event, Counters::new());

        assert_eq!(grouped, counters(json!({"error": 2})));
    }

    #[test]
    fn test_default_consolidation_sums_union_of_keys() {
        let rules = Rules::new();

        let merged = rules
            .consolidate(
                counters(json!({"a": 1, "b": 2.5})),
                counters(json!({"b": 1, "c": 4})),
            )
            .unwrap();

        assert_eq!(merged, counters(json!({"a": 1, "b": 3.5, "c": 4})));
    }

    #[test]
    fn test_default_consolidation_rejects_non_numeric_values() {
        let rules = Rules::new();

        let err = rules
            .consolidate(counters(json!({"a": "x"})), counters(json!({"a": 1})))
            .unwrap_err();
        assert!(matches!(err, RuleError::NonNumericCounter { ref key, .. } if key == "a"));

        let err = rules
            .consolidate(counters(json!({})), counters(json!({"b": [1]})))
            .unwrap_err();
        assert!(matches!(err, RuleError::NonNumericCounter { ref key, .. } if key == "b"));
    }

    #[test]
    fn test_default_consolidation_is_commutative_and_associative() {
        let a = counters(json!({"x": 1, "y": 7}));
        let b = counters(json!({"y": 2, "z": 5}));
        let c = counters(json!({"x": 10, "z": -3, "w": 0}));

        let ab_c = sum_counters(sum_counters(a.clone(), b.clone()).unwrap(), c.clone()).unwrap();
        let a_bc = sum_counters(a.clone(), sum_counters(b.clone(), c.clone()).unwrap()).unwrap();
        assert_eq!(ab_c, a_bc);

        assert_eq!(
            sum_counters(a.clone(), b.clone()).unwrap(),
            sum_counters(b, a).unwrap()
        );
    }

    #[test]
    fn test_custom_consolidation_replaces_default() {
        let mut rules = Rules::new();
        rules.register_consolidation(|first, _| Ok(first));

        let merged = rules
            .consolidate(counters(json!({"a": 1})), counters(json!({"a": 5})))
            .unwrap();

        assert_eq!(merged, counters(json!({"a": 1})));
    }

    #[test]
    fn test_builtin_registration() {
        let mut rules = Rules::new();
        builtin::register(&mut rules).unwrap();

        assert!(rules.has_filter("exception_python_remove_line_no"));
        assert!(rules.has_filter("exception_python_remove_stack_vars"));
        assert!(rules.has_grouping("count_by_level"));
        assert!(rules.has_grouping("count_by_logger"));
    }

    #[test]
    fn test_builtin_groupings_read_event_data() {
        let mut rules = Rules::new();
        builtin::register(&mut rules).unwrap();
        let mut event = event(vec![], vec!["count_by_level", "count_by_logger"]);
        event.data["logger"] = json!("app.jobs");

        let grouped = rules.process_grouping(&event, Counters::new());

        assert_eq!(grouped, counters(json!({"error": 1, "app.jobs": 1})));
    }
}
