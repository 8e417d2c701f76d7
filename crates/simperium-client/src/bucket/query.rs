//! Queries over a bucket's indexed values

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use super::object::BucketObject;
use super::schema::Index;

/// Comparison applied by a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonType {
    EqualTo,
    NotEqualTo,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Like,
    NotLike,
    Match,
}

impl ComparisonType {
    pub fn operator(&self) -> &'static str {
        match self {
            ComparisonType::EqualTo => "=",
            ComparisonType::NotEqualTo => "!=",
            ComparisonType::LessThan => "<",
            ComparisonType::LessThanOrEqual => "<=",
            ComparisonType::GreaterThan => ">",
            ComparisonType::GreaterThanOrEqual => ">=",
            ComparisonType::Like => "LIKE",
            ComparisonType::NotLike => "NOT LIKE",
            ComparisonType::Match => "MATCH",
        }
    }

    /// Objects without the value also satisfy the condition
    pub fn includes_null(&self) -> bool {
        matches!(self, ComparisonType::NotEqualTo | ComparisonType::NotLike)
    }
}

impl Display for ComparisonType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.operator())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Index name, `None` for a full text match across all indexed text
    pub key: Option<String>,
    pub comparison: ComparisonType,
    pub subject: Value,
    /// Compiled subject of `LIKE` and `NOT LIKE` conditions
    pattern: Option<LikePattern>,
}

impl Condition {
    fn new(key: Option<String>, comparison: ComparisonType, subject: Value) -> Self {
        let pattern = match comparison {
            ComparisonType::Like | ComparisonType::NotLike => LikePattern::new(&text_of(&subject)),
            _ => None,
        };
        Self {
            key,
            comparison,
            subject,
            pattern,
        }
    }
}

/// SQL `LIKE`: `%` matches any run, `_` one character, case insensitive.
#[derive(Debug, Clone)]
struct LikePattern(Regex);

impl LikePattern {
    fn new(pattern: &str) -> Option<Self> {
        let mut expression = String::from("^");
        for c in pattern.chars() {
            match c {
                '%' => expression.push_str(".*"),
                '_' => expression.push('.'),
                other => expression.push_str(&regex::escape(&other.to_string())),
            }
        }
        expression.push('$');

        RegexBuilder::new(&expression)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .ok()
            .map(Self)
    }

    fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.key.as_deref().unwrap_or("*"),
            self.comparison,
            self.subject
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortType {
    Ascending,
    Descending,
}

impl Display for SortType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SortType::Ascending => f.write_str("ASC"),
            SortType::Descending => f.write_str("DESC"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sorter {
    /// Index name, `None` sorts on the object key
    pub key: Option<String>,
    pub sort: SortType,
}

/// A query builder.
///
/// ```
/// use simperium_client::bucket::{ComparisonType, Query, SortType};
/// use serde_json::json;
///
/// let query = Query::new()
///     .condition("pinned", ComparisonType::EqualTo, json!(true))
///     .order("modified", SortType::Descending)
///     .limit(10);
/// assert_eq!(query.conditions().len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
    sorters: Vec<Sorter>,
    fields: Vec<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// Index and full text values of one stored object
pub struct IndexedValues<'a> {
    pub indexes: &'a [Index],
    pub full_text: &'a BTreeMap<String, String>,
}

/// A matching object and the included fields
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub object: BucketObject,
    pub fields: Map<String, Value>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(mut self, key: &str, comparison: ComparisonType, subject: Value) -> Self {
        self.conditions
            .push(Condition::new(Some(key.to_string()), comparison, subject));
        self
    }

    /// Full text match against every full text indexed property
    pub fn matching(mut self, text: &str) -> Self {
        self.conditions.push(Condition::new(
            None,
            ComparisonType::Match,
            Value::String(text.to_string()),
        ));
        self
    }

    /// Full text match against one property
    pub fn matching_field(self, key: &str, text: &str) -> Self {
        self.condition(key, ComparisonType::Match, Value::String(text.to_string()))
    }

    pub fn order(mut self, key: &str, sort: SortType) -> Self {
        self.sorters.push(Sorter {
            key: Some(key.to_string()),
            sort,
        });
        self
    }

    pub fn order_by_key(mut self, sort: SortType) -> Self {
        self.sorters.push(Sorter { key: None, sort });
        self
    }

    pub fn reorder(mut self) -> Self {
        self.sorters.clear();
        self
    }

    /// Returns the first value of the index with each result
    pub fn include(mut self, key: &str) -> Self {
        self.fields.push(key.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn clear_limit(mut self) -> Self {
        self.limit = None;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn clear_offset(mut self) -> Self {
        self.offset = None;
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn sorters(&self) -> &[Sorter] {
        &self.sorters
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn get_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn get_offset(&self) -> Option<usize> {
        self.offset
    }

    /// Whether all conditions hold for the object
    pub fn matches(&self, values: &IndexedValues<'_>) -> bool {
        self.conditions.iter().all(|condition| condition_matches(condition, values))
    }

    /// Orders two objects by the sorters, then by key
    pub fn compare(
        &self,
        a: (&BucketObject, &IndexedValues<'_>),
        b: (&BucketObject, &IndexedValues<'_>),
    ) -> Ordering {
        for sorter in &self.sorters {
            let ordering = match &sorter.key {
                None => a.0.key().cmp(b.0.key()),
                Some(name) => {
                    let left = first_value(a.1, name).unwrap_or(&Value::Null);
                    let right = first_value(b.1, name).unwrap_or(&Value::Null);
                    compare_values(left, right)
                }
            };
            let ordering = match sorter.sort {
                SortType::Ascending => ordering,
                SortType::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.0.key().cmp(b.0.key())
    }

    /// Included field values for a result row
    pub fn row(&self, object: &BucketObject, values: &IndexedValues<'_>) -> QueryRow {
        let fields = self
            .fields
            .iter()
            .map(|name| {
                let value = first_value(values, name).cloned().unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect();
        QueryRow {
            object: object.clone(),
            fields,
        }
    }

    /// Applies offset and limit to an already ordered result
    pub fn page<T>(&self, rows: Vec<T>) -> Vec<T> {
        let offset = self.offset.unwrap_or(0);
        let rows = rows.into_iter().skip(offset);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }
}

fn first_value<'a>(values: &'a IndexedValues<'_>, name: &str) -> Option<&'a Value> {
    values
        .indexes
        .iter()
        .find(|index| index.name == name)
        .map(|index| &index.value)
}

fn condition_matches(condition: &Condition, values: &IndexedValues<'_>) -> bool {
    if condition.comparison == ComparisonType::Match {
        return full_text_matches(condition, values.full_text);
    }

    let Some(name) = condition.key.as_deref() else {
        return false;
    };
    let mut candidates = values
        .indexes
        .iter()
        .filter(|index| index.name == name)
        .map(|index| &index.value)
        .filter(|value| !value.is_null())
        .peekable();

    if candidates.peek().is_none() {
        return condition.comparison.includes_null();
    }

    let subject = &condition.subject;
    match condition.comparison {
        ComparisonType::EqualTo => candidates.any(|v| compare_values(v, subject) == Ordering::Equal),
        ComparisonType::NotEqualTo => candidates.any(|v| compare_values(v, subject) != Ordering::Equal),
        ComparisonType::LessThan => candidates.any(|v| compare_values(v, subject) == Ordering::Less),
        ComparisonType::LessThanOrEqual => {
            candidates.any(|v| compare_values(v, subject) != Ordering::Greater)
        }
        ComparisonType::GreaterThan => {
            candidates.any(|v| compare_values(v, subject) == Ordering::Greater)
        }
        ComparisonType::GreaterThanOrEqual => {
            candidates.any(|v| compare_values(v, subject) != Ordering::Less)
        }
        ComparisonType::Like => condition
            .pattern
            .as_ref()
            .is_some_and(|pattern| candidates.any(|v| pattern.is_match(&text_of(v)))),
        ComparisonType::NotLike => condition
            .pattern
            .as_ref()
            .is_some_and(|pattern| candidates.any(|v| !pattern.is_match(&text_of(v)))),
        ComparisonType::Match => false,
    }
}

/// Every term must be a word of the indexed text; a trailing `*` matches a
/// prefix.
fn full_text_matches(condition: &Condition, full_text: &BTreeMap<String, String>) -> bool {
    let words: Vec<String> = full_text
        .iter()
        .filter(|(name, _)| condition.key.as_deref().is_none_or(|key| key == name.as_str()))
        .flat_map(|(_, text)| tokenize(text))
        .collect();

    let query = text_of(&condition.subject);
    let mut matched_any = false;
    for term in query.split_whitespace() {
        let prefix = term.ends_with('*');
        let tokens = tokenize(term);
        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            matched_any = true;
            let found = words.iter().any(|word| {
                if prefix && i == last {
                    word.starts_with(token.as_str())
                } else {
                    word == token
                }
            });
            if !found {
                return false;
            }
        }
    }
    matched_any
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Number(_) => 1,
        _ => 2,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

/// Orders values like SQLite: null, then numbers, then text.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => text_of(a).cmp(&text_of(b)),
    }
}
