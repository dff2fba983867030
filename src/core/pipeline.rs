//! Aggregation pipeline model and single-collection evaluation.
//!
//! Stages run in order over a document stream. A store executes the whole
//! pipeline locally; the sharded layer merges per-shard outputs afterwards.

use crate::core::{compare_documents, Document, Filter, Result, ShardError, SortKey, Value, ID_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Field(String),
    Literal(Value),
}

impl Operand {
    fn resolve<'a>(&'a self, doc: &'a Document) -> Option<&'a Value> {
        match self {
            Operand::Field(field) => doc.get(field),
            Operand::Literal(value) => Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accumulator {
    Sum(Operand),
    Avg(String),
    Min(String),
    Max(String),
    Push(String),
    /// Number of numeric values of a field within the group.
    Count(String),
}

impl Accumulator {
    /// `{$sum: 1}`
    pub fn count_documents() -> Self {
        Accumulator::Sum(Operand::Literal(Value::Integer(1)))
    }

    pub fn sum_field(field: impl Into<String>) -> Self {
        Accumulator::Sum(Operand::Field(field.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Null,
    Field(String),
}

impl GroupKey {
    fn evaluate(&self, doc: &Document) -> Value {
        match self {
            GroupKey::Null => Value::Null,
            GroupKey::Field(field) => doc.get(field).cloned().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStage {
    pub key: GroupKey,
    pub accumulators: Vec<(String, Accumulator)>,
}

impl GroupStage {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            accumulators: Vec::new(),
        }
    }

    pub fn accumulate(mut self, output: impl Into<String>, accumulator: Accumulator) -> Self {
        self.accumulators.push((output.into(), accumulator));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Match(Filter),
    Sort(Vec<SortKey>),
    Group(GroupStage),
    Project(Vec<String>),
    Skip(usize),
    Limit(usize),
}

/// Running state of one accumulator inside one group.
#[derive(Debug, Clone)]
pub(crate) enum AccumulatorState {
    Sum(Value),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Push(Vec<Value>),
    Count(u64),
}

impl AccumulatorState {
    pub(crate) fn new(accumulator: &Accumulator) -> Self {
        match accumulator {
            Accumulator::Sum(_) => AccumulatorState::Sum(Value::Integer(0)),
            Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
            Accumulator::Min(_) => AccumulatorState::Min(None),
            Accumulator::Max(_) => AccumulatorState::Max(None),
            Accumulator::Push(_) => AccumulatorState::Push(Vec::new()),
            Accumulator::Count(_) => AccumulatorState::Count(0),
        }
    }

    pub(crate) fn fold(&mut self, accumulator: &Accumulator, doc: &Document) {
        match (self, accumulator) {
            (AccumulatorState::Sum(total), Accumulator::Sum(operand)) => {
                if let Some(value) = operand.resolve(doc) {
                    if let Some(next) = total.add(value) {
                        *total = next;
                    }
                }
            }
            (AccumulatorState::Avg { sum, count }, Accumulator::Avg(field)) => {
                if let Some(value) = doc.get(field).and_then(Value::as_f64) {
                    *sum += value;
                    *count += 1;
                }
            }
            (AccumulatorState::Min(current), Accumulator::Min(field)) => {
                if let Some(value) = doc.get(field) {
                    reduce_extreme(current, value, std::cmp::Ordering::Less);
                }
            }
            (AccumulatorState::Max(current), Accumulator::Max(field)) => {
                if let Some(value) = doc.get(field) {
                    reduce_extreme(current, value, std::cmp::Ordering::Greater);
                }
            }
            (AccumulatorState::Push(items), Accumulator::Push(field)) => {
                if let Some(value) = doc.get(field) {
                    items.push(value.clone());
                }
            }
            (AccumulatorState::Count(count), Accumulator::Count(field)) => {
                if doc.get(field).is_some_and(Value::is_numeric) {
                    *count += 1;
                }
            }
            _ => {}
        }
    }

    pub(crate) fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum(total) => total,
            AccumulatorState::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / count as f64)
                }
            }
            AccumulatorState::Min(value) | AccumulatorState::Max(value) => {
                value.unwrap_or(Value::Null)
            }
            AccumulatorState::Push(items) => Value::Array(items),
            AccumulatorState::Count(count) => Value::from(count),
        }
    }
}

/// Keeps the smaller (`Less`) or larger (`Greater`) non-null value.
pub(crate) fn reduce_extreme(
    current: &mut Option<Value>,
    candidate: &Value,
    keep_when: std::cmp::Ordering,
) {
    if candidate.is_null() {
        return;
    }
    match current {
        Some(existing) if candidate.sort_cmp(existing) != keep_when => {}
        _ => *current = Some(candidate.clone()),
    }
}

/// Evaluates a pipeline against one collection's documents.
pub fn run_pipeline(docs: Vec<Document>, pipeline: &[Stage]) -> Result<Vec<Document>> {
    let mut current = docs;
    for stage in pipeline {
        current = match stage {
            Stage::Match(filter) => current.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Sort(keys) => {
                if keys.is_empty() {
                    return Err(ShardError::InvalidConfig(
                        "sort stage requires at least one key".to_string(),
                    ));
                }
                let mut sorted = current;
                sorted.sort_by(|a, b| compare_documents(a, b, keys));
                sorted
            }
            Stage::Group(group) => run_group(current, group),
            Stage::Project(fields) => current.iter().map(|d| d.project(fields)).collect(),
            Stage::Skip(n) => current.into_iter().skip(*n).collect(),
            Stage::Limit(n) => current.into_iter().take(*n).collect(),
        };
    }
    Ok(current)
}

fn run_group(docs: Vec<Document>, group: &GroupStage) -> Vec<Document> {
    let mut order: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in &docs {
        let key = group.key.evaluate(doc);
        let slot = *index.entry(key.canonical_key()).or_insert_with(|| {
            order.push((
                key.clone(),
                group
                    .accumulators
                    .iter()
                    .map(|(_, acc)| AccumulatorState::new(acc))
                    .collect(),
            ));
            order.len() - 1
        });
        for ((_, accumulator), state) in group.accumulators.iter().zip(order[slot].1.iter_mut()) {
            state.fold(accumulator, doc);
        }
    }

    order
        .into_iter()
        .map(|(key, states)| {
            let mut out = Document::new().with(ID_FIELD, key);
            for ((name, _), state) in group.accumulators.iter().zip(states) {
                out.set(name.clone(), state.finish());
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SortKey;

    fn sale(region: &str, amount: i64) -> Document {
        Document::new().with("region", region).with("amount", amount)
    }

    #[test]
    fn group_accumulators_follow_document_order() {
        let docs = vec![sale("north", 10), sale("south", 5), sale("north", 30)];
        let pipeline = vec![Stage::Group(
            GroupStage::new(GroupKey::Field("region".into()))
                .accumulate("total", Accumulator::sum_field("amount"))
                .accumulate("avg", Accumulator::Avg("amount".into()))
                .accumulate("min", Accumulator::Min("amount".into()))
                .accumulate("max", Accumulator::Max("amount".into()))
                .accumulate("all", Accumulator::Push("amount".into()))
                .accumulate("n", Accumulator::count_documents()),
        )];
        let out = run_pipeline(docs, &pipeline).unwrap();
        assert_eq!(out.len(), 2);
        let north = &out[0];
        assert_eq!(north.get("_id"), Some(&Value::from("north")));
        assert_eq!(north.get("total"), Some(&Value::Integer(40)));
        assert_eq!(north.get("avg"), Some(&Value::Float(20.0)));
        assert_eq!(north.get("min"), Some(&Value::Integer(10)));
        assert_eq!(north.get("max"), Some(&Value::Integer(30)));
        assert_eq!(
            north.get("all"),
            Some(&Value::Array(vec![Value::Integer(10), Value::Integer(30)]))
        );
        assert_eq!(north.get("n"), Some(&Value::Integer(2)));
    }

    #[test]
    fn match_sort_limit_chain() {
        let docs = vec![sale("a", 3), sale("b", 9), sale("c", 1), sale("d", 7)];
        let pipeline = vec![
            Stage::Match(Filter::all().gt("amount", 2)),
            Stage::Sort(vec![SortKey::desc("amount")]),
            Stage::Limit(2),
        ];
        let out = run_pipeline(docs, &pipeline).unwrap();
        let regions: Vec<&str> = out
            .iter()
            .filter_map(|d| d.get("region").and_then(Value::as_str))
            .collect();
        assert_eq!(regions, vec!["b", "d"]);
    }

    #[test]
    fn empty_sort_stage_is_rejected() {
        assert!(run_pipeline(vec![], &[Stage::Sort(vec![])]).is_err());
    }
}
