use crate::core::{Document, Result, ShardError, Value, ID_FIELD};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Predicate applied to a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Exists(bool),
}

impl Condition {
    pub fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Condition::Exists(expected) => field.is_some() == *expected,
            Condition::Eq(expected) => field.map(|v| v == expected).unwrap_or(expected.is_null()),
            Condition::Ne(expected) => !field.map(|v| v == expected).unwrap_or(expected.is_null()),
            Condition::In(options) => {
                let current = field.cloned().unwrap_or(Value::Null);
                options.iter().any(|option| option == &current)
            }
            Condition::Gt(bound) => ordered(field, bound, |ord| ord == Ordering::Greater),
            Condition::Gte(bound) => ordered(field, bound, |ord| ord != Ordering::Less),
            Condition::Lt(bound) => ordered(field, bound, |ord| ord == Ordering::Less),
            Condition::Lte(bound) => ordered(field, bound, |ord| ord != Ordering::Greater),
        }
    }
}

// Range predicates never match missing fields or kind mismatches.
fn ordered(field: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match field {
        Some(value) if !value.is_null() => value.compare(bound).map(accept).unwrap_or(false),
        _ => false,
    }
}

/// Conjunction of field conditions. An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub clauses: Vec<(String, Condition)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.clauses.push((field.into(), condition));
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Ne(value.into()))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gt(value.into()))
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gte(value.into()))
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lt(value.into()))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lte(value.into()))
    }

    pub fn in_list<V: Into<Value>>(
        self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.with(
            field,
            Condition::In(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn exists(self, field: impl Into<String>, expected: bool) -> Self {
        self.with(field, Condition::Exists(expected))
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::all().eq(ID_FIELD, Value::Text(id.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(field, condition)| condition.matches(doc.get(field)))
    }

    /// Conditions on one field, in declaration order.
    pub fn conditions_on<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a Condition> + 'a {
        self.clauses
            .iter()
            .filter(move |(name, _)| name == field)
            .map(|(_, condition)| condition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Orders two documents by a compound sort specification.
///
/// Missing fields sort as NULL.
pub fn compare_documents(a: &Document, b: &Document, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let left = a.get(&key.field).unwrap_or(&Value::Null);
        let right = b.get(&key.field).unwrap_or(&Value::Null);
        let ord = left.sort_cmp(right);
        let ord = match key.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Applies skip then limit to an already ordered result set.
    pub fn paginate(&self, docs: Vec<Document>) -> Vec<Document> {
        let skip = self.skip.unwrap_or(0);
        let iter = docs.into_iter().skip(skip);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    /// The same options with pagination stripped; shards only sort.
    pub fn without_pagination(&self) -> FindOptions {
        FindOptions {
            sort: self.sort.clone(),
            skip: None,
            limit: None,
        }
    }
}

/// Field modifications applied by `update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    #[serde(default)]
    pub set: Vec<(String, Value)>,
    #[serde(default)]
    pub inc: Vec<(String, Value)>,
    #[serde(default)]
    pub unset: Vec<String>,
}

impl UpdateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((field.into(), value.into()));
        self
    }

    pub fn inc(mut self, field: impl Into<String>, delta: impl Into<Value>) -> Self {
        self.inc.push((field.into(), delta.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty() && self.unset.is_empty()
    }

    pub fn touches(&self, field: &str) -> bool {
        self.set.iter().any(|(name, _)| name == field)
            || self.inc.iter().any(|(name, _)| name == field)
            || self.unset.iter().any(|name| name == field)
    }

    /// Applies the modifications in place. Returns whether the document changed.
    pub fn apply(&self, doc: &mut Document) -> Result<bool> {
        let before = doc.clone();
        for (field, value) in &self.set {
            doc.set(field.clone(), value.clone());
        }
        for (field, delta) in &self.inc {
            if !delta.is_numeric() {
                return Err(ShardError::InvalidUpdate(format!(
                    "$inc on '{}' requires a numeric delta, got {}",
                    field,
                    delta.type_name()
                )));
            }
            let current = doc.get(field).cloned().unwrap_or(Value::Integer(0));
            let next = current.add(delta).ok_or_else(|| {
                ShardError::InvalidUpdate(format!(
                    "$inc on '{}' requires a numeric field, got {}",
                    field,
                    current.type_name()
                ))
            })?;
            doc.set(field.clone(), next);
        }
        for field in &self.unset {
            doc.remove(field);
        }
        Ok(*doc != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(age: i64, city: &str) -> Document {
        Document::new().with("age", age).with("city", city)
    }

    #[test]
    fn filters_combine_conditions() {
        let filter = Filter::all().gte("age", 18).lt("age", 65).ne("city", "Oslo");
        assert!(filter.matches(&user(30, "Lima")));
        assert!(!filter.matches(&user(30, "Oslo")));
        assert!(!filter.matches(&user(70, "Lima")));
        assert!(Filter::all().matches(&user(1, "x")));
    }

    #[test]
    fn range_conditions_skip_missing_and_mismatched_fields() {
        let filter = Filter::all().gt("age", 10);
        assert!(!filter.matches(&Document::new()));
        assert!(!filter.matches(&Document::new().with("age", "old")));
        assert!(Filter::all().eq("age", Value::Null).matches(&Document::new()));
        assert!(Filter::all().exists("age", false).matches(&Document::new()));
    }

    #[test]
    fn in_list_matches_any_member() {
        let filter = Filter::all().in_list("city", ["Lima", "Quito"]);
        assert!(filter.matches(&user(1, "Quito")));
        assert!(!filter.matches(&user(1, "Bogota")));
    }

    #[test]
    fn updates_set_increment_and_unset() {
        let mut doc = user(40, "Lima").with("visits", 2);
        let changed = UpdateSpec::new()
            .set("city", "Cusco")
            .inc("visits", 3)
            .inc("score", 1.5)
            .unset("age")
            .apply(&mut doc)
            .unwrap();
        assert!(changed);
        assert_eq!(doc.get("city"), Some(&Value::from("Cusco")));
        assert_eq!(doc.get("visits"), Some(&Value::Integer(5)));
        assert_eq!(doc.get("score"), Some(&Value::Float(1.5)));
        assert!(!doc.contains("age"));

        let err = UpdateSpec::new().inc("city", 1).apply(&mut doc).unwrap_err();
        assert!(matches!(err, ShardError::InvalidUpdate(_)));
    }

    #[test]
    fn pagination_applies_skip_before_limit() {
        let docs: Vec<Document> = (0..10).map(|i| Document::new().with("n", i)).collect();
        let page = FindOptions::new().skip(3).limit(4).paginate(docs);
        let ns: Vec<i64> = page
            .iter()
            .filter_map(|d| d.get("n").and_then(Value::as_i64))
            .collect();
        assert_eq!(ns, vec![3, 4, 5, 6]);
    }
}
