//! Merging of per-shard partial results.

use crate::core::pipeline::{reduce_extreme, Accumulator, GroupStage, Operand};
use crate::core::{compare_documents, Document, SortKey, Stage, Value, ID_FIELD};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Combines per-shard result lists, dropping repeated identities.
///
/// With sort keys the lists are assumed sorted by them and are k-way merged;
/// otherwise they are concatenated in shard order.
pub(crate) fn merge_documents(parts: Vec<Vec<Document>>, sort: &[SortKey]) -> Vec<Document> {
    let merged = if sort.is_empty() {
        parts.into_iter().flatten().collect()
    } else {
        merge_sorted(parts, sort)
    };
    dedupe(merged)
}

fn dedupe(docs: Vec<Document>) -> Vec<Document> {
    let mut seen = HashSet::new();
    docs.into_iter()
        .filter(|doc| match doc.identity_key() {
            Some(identity) => seen.insert(identity),
            None => true,
        })
        .collect()
}

struct Head<'a> {
    doc: Document,
    part: usize,
    sort: &'a [SortKey],
}

impl Ord for Head<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so the smallest document (and on
        // ties the lowest shard) pops first.
        compare_documents(&self.doc, &other.doc, self.sort)
            .then(self.part.cmp(&other.part))
            .reverse()
    }
}

impl PartialOrd for Head<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head<'_> {}

/// K-way merge of individually sorted lists.
pub(crate) fn merge_sorted(parts: Vec<Vec<Document>>, sort: &[SortKey]) -> Vec<Document> {
    let total = parts.iter().map(Vec::len).sum();
    let mut cursors: Vec<std::vec::IntoIter<Document>> =
        parts.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (part, cursor) in cursors.iter_mut().enumerate() {
        if let Some(doc) = cursor.next() {
            heap.push(Head { doc, part, sort });
        }
    }

    let mut out = Vec::with_capacity(total);
    while let Some(Head { doc, part, .. }) = heap.pop() {
        out.push(doc);
        if let Some(next) = cursors[part].next() {
            heap.push(Head { doc: next, part, sort });
        }
    }
    out
}

fn hidden_sum(output: &str) -> String {
    format!("__avg_sum_{}", output)
}

fn hidden_count(output: &str) -> String {
    format!("__avg_count_{}", output)
}

/// Rewrites a trailing group stage so its partial rows can be re-aggregated.
///
/// Averages are not mergeable, so each `Avg` becomes a hidden sum and a hidden
/// count that `merge_groups` turns back into a weighted average.
pub(crate) fn shard_local_pipeline(pipeline: &[Stage]) -> Vec<Stage> {
    let mut local = pipeline.to_vec();
    if let Some(Stage::Group(group)) = local.last_mut() {
        let mut accumulators = Vec::with_capacity(group.accumulators.len());
        for (output, accumulator) in group.accumulators.drain(..) {
            match accumulator {
                Accumulator::Avg(field) => {
                    accumulators.push((
                        hidden_sum(&output),
                        Accumulator::Sum(Operand::Field(field.clone())),
                    ));
                    accumulators.push((hidden_count(&output), Accumulator::Count(field)));
                }
                other => accumulators.push((output, other)),
            }
        }
        group.accumulators = accumulators;
    }
    local
}

enum Partial {
    Sum(Value),
    Extreme(Option<Value>, Ordering),
    Push(Vec<Value>),
    Avg { sum: Value, count: Value },
}

impl Partial {
    fn new(accumulator: &Accumulator) -> Self {
        match accumulator {
            Accumulator::Sum(_) | Accumulator::Count(_) => Partial::Sum(Value::Integer(0)),
            Accumulator::Min(_) => Partial::Extreme(None, Ordering::Less),
            Accumulator::Max(_) => Partial::Extreme(None, Ordering::Greater),
            Accumulator::Push(_) => Partial::Push(Vec::new()),
            Accumulator::Avg(_) => Partial::Avg {
                sum: Value::Integer(0),
                count: Value::Integer(0),
            },
        }
    }

    fn absorb(&mut self, output: &str, row: &Document) {
        match self {
            Partial::Sum(total) => add_into(total, row.get(output)),
            Partial::Extreme(current, keep) => {
                if let Some(value) = row.get(output) {
                    reduce_extreme(current, value, *keep);
                }
            }
            Partial::Push(items) => {
                if let Some(Value::Array(values)) = row.get(output) {
                    items.extend(values.iter().cloned());
                }
            }
            Partial::Avg { sum, count } => {
                add_into(sum, row.get(&hidden_sum(output)));
                add_into(count, row.get(&hidden_count(output)));
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Partial::Sum(total) => total,
            Partial::Extreme(value, _) => value.unwrap_or(Value::Null),
            Partial::Push(items) => Value::Array(items),
            Partial::Avg { sum, count } => match (sum.as_f64(), count.as_f64()) {
                (Some(sum), Some(count)) if count > 0.0 => Value::Float(sum / count),
                _ => Value::Null,
            },
        }
    }
}

fn add_into(total: &mut Value, value: Option<&Value>) {
    if let Some(next) = value.and_then(|value| total.add(value)) {
        *total = next;
    }
}

/// Re-aggregates partial group rows produced by `shard_local_pipeline`.
///
/// Groups keep first-seen order across shards.
pub(crate) fn merge_groups(parts: Vec<Vec<Document>>, group: &GroupStage) -> Vec<Document> {
    let mut order: Vec<(Value, Vec<Partial>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in parts.iter().flatten() {
        let key = row.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        let slot = *index.entry(key.canonical_key()).or_insert_with(|| {
            order.push((
                key.clone(),
                group
                    .accumulators
                    .iter()
                    .map(|(_, accumulator)| Partial::new(accumulator))
                    .collect(),
            ));
            order.len() - 1
        });
        for ((output, _), partial) in group.accumulators.iter().zip(order[slot].1.iter_mut()) {
            partial.absorb(output, row);
        }
    }

    order
        .into_iter()
        .map(|(key, partials)| {
            let mut out = Document::new().with(ID_FIELD, key);
            for ((output, _), partial) in group.accumulators.iter().zip(partials) {
                out.set(output.clone(), partial.finish());
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::GroupKey;
    use crate::core::run_pipeline;

    fn doc(id: &str, score: i64) -> Document {
        Document::new().with(ID_FIELD, id).with("score", score)
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().filter_map(Document::id).collect()
    }

    #[test]
    fn k_way_merge_preserves_global_order() {
        let parts = vec![
            vec![doc("a", 1), doc("d", 7), doc("f", 9)],
            vec![doc("b", 2), doc("c", 3)],
            vec![],
            vec![doc("e", 8)],
        ];
        let merged = merge_documents(parts, &[SortKey::asc("score")]);
        assert_eq!(ids(&merged), vec!["a", "b", "c", "d", "e", "f"]);

        let parts = vec![vec![doc("a", 5), doc("b", 1)], vec![doc("c", 4)]];
        let merged = merge_documents(parts, &[SortKey::desc("score")]);
        assert_eq!(ids(&merged), vec!["a", "c", "b"]);
    }

    #[test]
    fn duplicate_identities_are_dropped() {
        // a document caught mid-migration exists on two shards
        let parts = vec![vec![doc("a", 1), doc("b", 2)], vec![doc("b", 2), doc("c", 3)]];
        assert_eq!(ids(&merge_documents(parts, &[])), vec!["a", "b", "c"]);
    }

    #[test]
    fn averages_are_weighted_across_shards() {
        let group = GroupStage::new(GroupKey::Field("region".into()))
            .accumulate("avg", Accumulator::Avg("amount".into()))
            .accumulate("total", Accumulator::sum_field("amount"))
            .accumulate("n", Accumulator::count_documents())
            .accumulate("low", Accumulator::Min("amount".into()))
            .accumulate("high", Accumulator::Max("amount".into()))
            .accumulate("all", Accumulator::Push("amount".into()));
        let pipeline = vec![Stage::Group(group.clone())];
        let local = shard_local_pipeline(&pipeline);

        let sale = |amount: i64| Document::new().with("region", "north").with("amount", amount);
        let shard_a = vec![sale(10), sale(20), sale(30)];
        let shard_b = vec![sale(100)];

        let parts = vec![
            run_pipeline(shard_a.clone(), &local).unwrap(),
            run_pipeline(shard_b.clone(), &local).unwrap(),
        ];
        let merged = merge_groups(parts, &group);
        assert_eq!(merged.len(), 1);

        let expected = run_pipeline(shard_a.into_iter().chain(shard_b).collect(), &pipeline).unwrap();
        let row = &merged[0];
        // naive average of averages would be 60
        assert_eq!(row.get("avg"), Some(&Value::Float(40.0)));
        assert_eq!(row.get("avg"), expected[0].get("avg"));
        assert_eq!(row.get("total"), Some(&Value::Integer(160)));
        assert_eq!(row.get("n"), Some(&Value::Integer(4)));
        assert_eq!(row.get("low"), Some(&Value::Integer(10)));
        assert_eq!(row.get("high"), Some(&Value::Integer(100)));
        assert_eq!(row.get("all"), expected[0].get("all"));
        assert!(!row.contains("__avg_sum_avg"));
    }
}
