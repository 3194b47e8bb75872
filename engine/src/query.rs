//! Declarative queries over cached records.
//!
//! A query object mixes field filters with the pagination keys `$sort`,
//! `$limit`, `$skip` and `$select`. Field filters are either a plain value
//! (equality) or an object of operators:
//!
//! - always available: `$ne`, `$in`, `$nin`, `$lt`, `$lte`, `$gt`, `$gte`,
//!   and the top-level combinators `$or`, `$and`
//! - whitelisted: `$regex` (with `$options`), `$exists`, and any custom
//!   operator registered in [`QueryOptions::operators`]
//!
//! Everything else starting with `$` is rejected. Dotted paths reach into
//! nested objects and arrays.

use crate::{error::Result, record::json_type_name, Error, Fields, IdFields, Record};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Query keys that shape the result instead of filtering it.
pub const PAGINATION_KEYS: [&str; 4] = ["$sort", "$limit", "$skip", "$select"];

/// A user-supplied filter operator: `(field value, operand) -> matches`.
#[derive(Clone)]
pub struct CustomOperator(Arc<dyn Fn(Option<&Value>, &Value) -> bool + Send + Sync>);

impl CustomOperator {
    pub fn new(test: impl Fn(Option<&Value>, &Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(test))
    }

    fn test(&self, field: Option<&Value>, operand: &Value) -> bool {
        (self.0)(field, operand)
    }
}

impl fmt::Debug for CustomOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomOperator")
    }
}

/// Per-namespace query configuration.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Extra operators allowed in queries.
    pub whitelist: Vec<String>,
    /// Query keys meant for the server only; ignored by local filtering.
    pub params_for_server: Vec<String>,
    /// Implementations of custom operators. They must also be whitelisted.
    pub operators: HashMap<String, CustomOperator>,
}

impl QueryOptions {
    pub fn with_operator(mut self, name: impl Into<String>, operator: CustomOperator) -> Self {
        let name = name.into();
        if !self.whitelist.contains(&name) {
            self.whitelist.push(name.clone());
        }
        self.operators.insert(name, operator);
        self
    }

    fn allows(&self, operator: &str) -> bool {
        self.whitelist.iter().any(|w| w == operator)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Parameters of a find, get or count.
///
/// `temps`, `copies`, `qid` and `eager` are local-only flags; everything in
/// `extra` is passed to the transport untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Fields>,
    /// Include temporary records.
    #[serde(default, skip_serializing_if = "is_false")]
    pub temps: bool,
    /// Substitute working copies for their sources.
    #[serde(default, skip_serializing_if = "is_false")]
    pub copies: bool,
    /// Query id under which pagination state is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qid: Option<String>,
    /// Apply a remove locally before the transport confirms it.
    #[serde(default, skip_serializing_if = "is_false")]
    pub eager: bool,
    #[serde(flatten)]
    pub extra: Fields,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Params with a query object. Non-object values give no query.
    pub fn from_query(query: Value) -> Self {
        Self {
            query: match query {
                Value::Object(map) => Some(map),
                _ => None,
            },
            ..Self::default()
        }
    }

    pub fn with_temps(mut self) -> Self {
        self.temps = true;
        self
    }

    pub fn with_copies(mut self) -> Self {
        self.copies = true;
        self
    }

    pub fn with_qid(mut self, qid: impl Into<String>) -> Self {
        self.qid = Some(qid.into());
        self
    }

    pub fn with_eager(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// The params as the transport sees them: local-only flags cleared.
    pub fn for_server(&self) -> Params {
        Params {
            query: self.query.clone(),
            extra: self.extra.clone(),
            ..Params::default()
        }
    }

    /// Same params with a query key set.
    pub fn with_query_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.query
            .get_or_insert_with(Fields::new)
            .insert(key.into(), value);
        self
    }
}

/// Result of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub total: usize,
    pub limit: Option<usize>,
    pub skip: usize,
    pub data: Vec<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone)]
enum Test {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Cmp(CmpOp, Value),
    Regex(Regex),
    Exists(bool),
    Custom(CustomOperator, Value),
}

#[derive(Debug, Clone)]
enum Filter {
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Field { path: String, tests: Vec<Test> },
}

/// A parsed query.
#[derive(Debug, Clone)]
pub struct Query {
    filter: Filter,
    sort: Vec<(String, Direction)>,
    limit: Option<usize>,
    skip: usize,
    select: Option<Vec<String>>,
}

impl Query {
    /// Parse a query object. No query means "match everything".
    pub fn parse(query: Option<&Fields>, options: &QueryOptions) -> Result<Self> {
        let Some(query) = query else {
            return Ok(Self {
                filter: Filter::All(Vec::new()),
                sort: Vec::new(),
                limit: None,
                skip: 0,
                select: None,
            });
        };

        Ok(Self {
            filter: parse_filter(query, options, true)?,
            sort: match query.get("$sort") {
                Some(value) => parse_sort(value)?,
                None => Vec::new(),
            },
            limit: query.get("$limit").map(|v| parse_count("$limit", v)).transpose()?,
            skip: query
                .get("$skip")
                .map(|v| parse_count("$skip", v))
                .transpose()?
                .unwrap_or(0),
            select: query.get("$select").map(parse_select).transpose()?,
        })
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn skip(&self) -> usize {
        self.skip
    }

    pub fn select(&self) -> Option<&[String]> {
        self.select.as_deref()
    }

    /// Drop sort, skip, limit and select.
    pub fn without_pagination(mut self) -> Self {
        self.sort.clear();
        self.limit = None;
        self.skip = 0;
        self.select = None;
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.filter.matches(record)
    }

    /// Stable multi-key sort.
    pub fn sort(&self, records: &mut Vec<Record>) {
        if self.sort.is_empty() {
            return;
        }
        let mut keyed: Vec<(Vec<Option<Value>>, Record)> = records
            .drain(..)
            .map(|record| {
                let keys = self.sort.iter().map(|(path, _)| lookup(&record, path)).collect();
                (keys, record)
            })
            .collect();

        keyed.sort_by(|(a, _), (b, _)| {
            for (i, (_, direction)) in self.sort.iter().enumerate() {
                let ordering = compare_values(a[i].as_ref(), b[i].as_ref());
                let ordering = match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        records.extend(keyed.into_iter().map(|(_, record)| record));
    }

    /// Apply `$skip`, then `$limit`.
    pub fn paginate(&self, records: Vec<Record>) -> Vec<Record> {
        let iter = records.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// Apply `$select`. Identity fields are always kept.
    pub fn project(&self, records: Vec<Record>, id_fields: &IdFields) -> Vec<Record> {
        let Some(select) = &self.select else {
            return records;
        };
        let mut names = select.clone();
        for field in [&id_fields.id_field, &id_fields.temp_id_field] {
            if !names.contains(field) {
                names.push(field.clone());
            }
        }
        records.iter().map(|record| record.project(&names)).collect()
    }

    /// Filter, count, sort, paginate and project a candidate list.
    pub fn execute(&self, candidates: Vec<Record>, id_fields: &IdFields) -> QueryResult {
        let mut matched: Vec<Record> = candidates.into_iter().filter(|r| self.matches(r)).collect();
        let total = matched.len();
        self.sort(&mut matched);
        let page = self.paginate(matched);
        QueryResult {
            total,
            limit: self.limit,
            skip: self.skip,
            data: self.project(page, id_fields),
        }
    }
}

fn parse_filter(map: &Fields, options: &QueryOptions, top_level: bool) -> Result<Filter> {
    let mut parts = Vec::new();
    for (key, value) in map {
        if top_level
            && (PAGINATION_KEYS.contains(&key.as_str()) || options.params_for_server.contains(key))
        {
            continue;
        }
        match key.as_str() {
            "$or" => parts.push(Filter::Any(parse_branches(key, value, options)?)),
            "$and" => parts.push(Filter::All(parse_branches(key, value, options)?)),
            other if other.starts_with('$') => {
                return Err(Error::invalid_argument(format!(
                    "invalid query parameter '{other}'"
                )))
            }
            _ => parts.push(Filter::Field {
                path: key.clone(),
                tests: parse_tests(value, options)?,
            }),
        }
    }
    Ok(Filter::All(parts))
}

fn parse_branches(key: &str, value: &Value, options: &QueryOptions) -> Result<Vec<Filter>> {
    let branches = value
        .as_array()
        .ok_or_else(|| Error::invalid_argument(format!("'{key}' expects an array")))?;
    branches
        .iter()
        .map(|branch| match branch {
            Value::Object(map) => parse_filter(map, options, false),
            other => Err(Error::invalid_argument(format!(
                "'{key}' branches must be objects, got {}",
                json_type_name(other)
            ))),
        })
        .collect()
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn parse_tests(value: &Value, options: &QueryOptions) -> Result<Vec<Test>> {
    let Value::Object(operators) = value else {
        return Ok(vec![Test::Eq(value.clone())]);
    };
    if !is_operator_object(value) {
        return Ok(vec![Test::Eq(value.clone())]);
    }

    let mut tests = Vec::with_capacity(operators.len());
    for (operator, operand) in operators {
        let test = match operator.as_str() {
            "$ne" => Test::Ne(operand.clone()),
            "$in" => Test::In(as_list(operand)),
            "$nin" => Test::Nin(as_list(operand)),
            "$lt" => Test::Cmp(CmpOp::Lt, operand.clone()),
            "$lte" => Test::Cmp(CmpOp::Lte, operand.clone()),
            "$gt" => Test::Cmp(CmpOp::Gt, operand.clone()),
            "$gte" => Test::Cmp(CmpOp::Gte, operand.clone()),
            "$options" if operators.contains_key("$regex") => continue,
            other if !options.allows(other) => {
                return Err(Error::invalid_argument(format!(
                    "invalid query operator '{other}'"
                )))
            }
            "$regex" => Test::Regex(parse_regex(operand, operators.get("$options"))?),
            "$exists" => Test::Exists(is_truthy(operand)),
            other => match options.operators.get(other) {
                Some(custom) => Test::Custom(custom.clone(), operand.clone()),
                None => {
                    return Err(Error::invalid_argument(format!(
                        "no implementation for query operator '{other}'"
                    )))
                }
            },
        };
        tests.push(test);
    }
    Ok(tests)
}

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn parse_regex(pattern: &Value, flags: Option<&Value>) -> Result<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| Error::invalid_argument("'$regex' expects a string"))?;
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.and_then(Value::as_str).unwrap_or("").chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported regex option '{other}'"
                )))
            }
        };
    }
    builder
        .build()
        .map_err(|e| Error::invalid_argument(e.to_string()))
}

fn parse_count(key: &str, value: &Value) -> Result<usize> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| Error::invalid_argument(format!("'{key}' must be a non-negative integer")))
}

fn parse_direction(field: &str, value: &Value) -> Result<Direction> {
    let numeric = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(1.0),
            "desc" | "descending" => Some(-1.0),
            other => other.parse::<f64>().ok(),
        },
        _ => None,
    };
    match numeric {
        Some(n) if n > 0.0 => Ok(Direction::Ascending),
        Some(n) if n < 0.0 => Ok(Direction::Descending),
        _ => Err(Error::invalid_argument(format!(
            "invalid sort direction for '{field}'"
        ))),
    }
}

fn parse_sort(value: &Value) -> Result<Vec<(String, Direction)>> {
    let keys = value
        .as_object()
        .ok_or_else(|| Error::invalid_argument("'$sort' expects an object"))?;
    keys.iter()
        .map(|(field, direction)| Ok((field.clone(), parse_direction(field, direction)?)))
        .collect()
}

fn parse_select(value: &Value) -> Result<Vec<String>> {
    let fields = match value {
        Value::Array(items) => items,
        Value::String(field) => return Ok(vec![field.clone()]),
        _ => return Err(Error::invalid_argument("'$select' expects an array of field names")),
    };
    fields
        .iter()
        .map(|field| {
            field
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::invalid_argument("'$select' expects an array of field names"))
        })
        .collect()
}

/// Read a possibly dotted path. The first segment goes through accessors.
fn lookup(record: &Record, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current = record.get(head)?;
    for segment in segments {
        current = match current {
            Value::Object(mut map) => map.shift_remove(segment)?,
            Value::Array(mut items) => {
                let index = segment.parse::<usize>().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }
    Some(current)
}

impl Filter {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All(parts) => parts.iter().all(|f| f.matches(record)),
            Filter::Any(parts) => parts.iter().any(|f| f.matches(record)),
            Filter::Field { path, tests } => {
                let value = lookup(record, path);
                tests.iter().all(|test| test.matches(value.as_ref()))
            }
        }
    }
}

impl Test {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Test::Eq(expected) => field_equals(field, expected),
            Test::Ne(expected) => !field_equals(field, expected),
            Test::In(list) => list.iter().any(|v| field_equals(field, v)),
            Test::Nin(list) => !list.iter().any(|v| field_equals(field, v)),
            Test::Cmp(op, operand) => match field {
                Some(Value::Array(items)) => items.iter().any(|item| compare_op(*op, item, operand)),
                Some(value) => compare_op(*op, value, operand),
                None => false,
            },
            Test::Regex(regex) => match field {
                Some(Value::String(s)) => regex.is_match(s),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str().is_some_and(|s| regex.is_match(s))),
                _ => false,
            },
            Test::Exists(expected) => field.is_some() == *expected,
            Test::Custom(operator, operand) => operator.test(field, operand),
        }
    }
}

/// Equality as queries see it: numbers compare numerically, a missing
/// field equals `null`, and an array field matches any of its elements.
fn field_equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(value) => {
            values_equal(value, expected)
                || matches!(value, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
        }
    }
}

pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn compare_op(op: CmpOp, value: &Value, operand: &Value) -> bool {
    let ordering = match (value, operand) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            compare_values(Some(value), Some(operand))
        }
        _ => return false,
    };
    match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Lte => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Gte => ordering != Ordering::Less,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order used by `$sort`: null/absent < bool < number < string <
/// array < object.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Array(xs)), Some(Value::Array(ys))) => {
            for (x, y) in xs.iter().zip(ys) {
                let ordering = compare_values(Some(x), Some(y));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn records(values: Vec<Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| Record::from_value(v).unwrap())
            .collect()
    }

    fn run(query: Value, data: Vec<Value>) -> QueryResult {
        let query = Query::parse(Some(&fields(query)), &QueryOptions::default()).unwrap();
        query.execute(records(data), &IdFields::default())
    }

    fn ids(result: &QueryResult) -> Vec<Value> {
        result
            .data
            .iter()
            .map(|r| r.field("id").cloned().unwrap_or(Value::Null))
            .collect()
    }

    #[test]
    fn equality_filter() {
        let result = run(
            json!({"x": 1}),
            vec![json!({"id": 1, "x": 1}), json!({"id": 2, "x": 2}), json!({"id": 3, "x": 1.0})],
        );
        assert_eq!(result.total, 2);
        assert_eq!(ids(&result), vec![json!(1), json!(3)]);
    }

    #[test]
    fn comparison_and_membership_operators() {
        let data = vec![
            json!({"id": 1, "age": 10, "tag": "a"}),
            json!({"id": 2, "age": 20, "tag": "b"}),
            json!({"id": 3, "age": 30, "tag": "c"}),
        ];
        assert_eq!(ids(&run(json!({"age": {"$gt": 10, "$lte": 30}}), data.clone())), vec![json!(2), json!(3)]);
        assert_eq!(ids(&run(json!({"tag": {"$in": ["a", "c"]}}), data.clone())), vec![json!(1), json!(3)]);
        assert_eq!(ids(&run(json!({"tag": {"$nin": ["a", "c"]}}), data.clone())), vec![json!(2)]);
        assert_eq!(ids(&run(json!({"age": {"$ne": 20}}), data.clone())), vec![json!(1), json!(3)]);
        assert_eq!(
            ids(&run(json!({"$or": [{"age": 10}, {"tag": "c"}]}), data)),
            vec![json!(1), json!(3)]
        );
    }

    #[test]
    fn array_fields_match_elements() {
        let result = run(
            json!({"tags": "red"}),
            vec![json!({"id": 1, "tags": ["red", "blue"]}), json!({"id": 2, "tags": ["green"]})],
        );
        assert_eq!(ids(&result), vec![json!(1)]);
    }

    #[test]
    fn dotted_paths_reach_nested_values() {
        let result = run(
            json!({"address.city": "Oslo"}),
            vec![
                json!({"id": 1, "address": {"city": "Oslo"}}),
                json!({"id": 2, "address": {"city": "Bergen"}}),
            ],
        );
        assert_eq!(ids(&result), vec![json!(1)]);
    }

    #[test]
    fn missing_field_equals_null() {
        let result = run(
            json!({"deletedAt": null}),
            vec![json!({"id": 1}), json!({"id": 2, "deletedAt": 5})],
        );
        assert_eq!(ids(&result), vec![json!(1)]);
    }

    #[test]
    fn sort_is_stable_and_multi_key() {
        let result = run(
            json!({"$sort": {"group": 1, "score": -1}}),
            vec![
                json!({"id": 1, "group": "b", "score": 1}),
                json!({"id": 2, "group": "a", "score": 1}),
                json!({"id": 3, "group": "a", "score": 5}),
                json!({"id": 4, "group": "a", "score": 1}),
            ],
        );
        assert_eq!(ids(&result), vec![json!(3), json!(2), json!(4), json!(1)]);
    }

    #[test]
    fn skip_limit_and_total() {
        let data = (1..=5).map(|i| json!({"id": i})).collect::<Vec<_>>();
        let result = run(json!({"$skip": 1, "$limit": 2}), data.clone());
        assert_eq!(result.total, 5);
        assert_eq!(result.skip, 1);
        assert_eq!(result.limit, Some(2));
        assert_eq!(ids(&result), vec![json!(2), json!(3)]);

        let unbounded = run(json!({"$skip": "3"}), data);
        assert_eq!(unbounded.limit, None);
        assert_eq!(ids(&unbounded), vec![json!(4), json!(5)]);
    }

    #[test]
    fn select_projects_and_keeps_identity() {
        let result = run(
            json!({"$select": ["name"]}),
            vec![json!({"id": 1, "name": "a", "age": 3})],
        );
        assert_eq!(result.data[0].to_json(), json!({"name": "a", "id": 1}));
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let options = QueryOptions::default();
        let err = Query::parse(Some(&fields(json!({"name": {"$regex": "^a"}}))), &options);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));

        let err = Query::parse(Some(&fields(json!({"$where": "x"}))), &options);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn whitelisted_regex() {
        let options = QueryOptions {
            whitelist: vec!["$regex".into()],
            ..QueryOptions::default()
        };
        let query = Query::parse(
            Some(&fields(json!({"name": {"$regex": "^al", "$options": "i"}}))),
            &options,
        )
        .unwrap();
        let result = query.execute(
            records(vec![json!({"id": 1, "name": "Alice"}), json!({"id": 2, "name": "Bob"})]),
            &IdFields::default(),
        );
        assert_eq!(ids(&result), vec![json!(1)]);
    }

    #[test]
    fn custom_operator() {
        let options = QueryOptions::default().with_operator(
            "$startsWith",
            CustomOperator::new(|field, operand| {
                match (field.and_then(Value::as_str), operand.as_str()) {
                    (Some(value), Some(prefix)) => value.starts_with(prefix),
                    _ => false,
                }
            }),
        );
        let query = Query::parse(
            Some(&fields(json!({"name": {"$startsWith": "Bo"}}))),
            &options,
        )
        .unwrap();
        let result = query.execute(
            records(vec![json!({"id": 1, "name": "Alice"}), json!({"id": 2, "name": "Bob"})]),
            &IdFields::default(),
        );
        assert_eq!(ids(&result), vec![json!(2)]);
    }

    #[test]
    fn params_for_server_are_not_filtered_locally() {
        let options = QueryOptions {
            params_for_server: vec!["$populate".into()],
            ..QueryOptions::default()
        };
        let query = Query::parse(Some(&fields(json!({"$populate": "author"}))), &options).unwrap();
        assert!(query.matches(&Record::from_value(json!({"id": 1})).unwrap()));
    }

    #[test]
    fn invalid_pagination_values() {
        let options = QueryOptions::default();
        for query in [json!({"$limit": -1}), json!({"$skip": "x"}), json!({"$sort": {"a": 0}})] {
            assert!(matches!(
                Query::parse(Some(&fields(query)), &options),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn params_serialization_keeps_extra_keys() {
        let params: Params = serde_json::from_value(json!({
            "query": {"x": 1},
            "temps": true,
            "headers": {"authorization": "token"}
        }))
        .unwrap();
        assert!(params.temps);
        assert_eq!(params.extra.get("headers"), Some(&json!({"authorization": "token"})));

        let server = params.for_server();
        assert!(!server.temps);
        assert_eq!(server.query, params.query);
        assert_eq!(server.extra, params.extra);
    }
}
