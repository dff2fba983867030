use crate::config::{ShardStrategy, ShardingConfig};
use crate::core::{Condition, Filter, Value};
use crate::resolver::{self, KeyBound};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Which shards a filter can possibly match on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ShardTargets {
    /// The shard key is pinned to these values.
    Keys(Vec<Value>),
    /// Range collection restricted by an interval on the shard key.
    Slots(Vec<usize>),
    All,
}

pub(crate) fn target_shards(config: &ShardingConfig, filter: &Filter) -> ShardTargets {
    let mut keys: Option<Vec<Value>> = None;
    let mut lower: Option<KeyBound> = None;
    let mut upper: Option<KeyBound> = None;

    for condition in filter.conditions_on(&config.shard_key) {
        match condition {
            Condition::Eq(value) => keys = Some(intersect(keys, std::slice::from_ref(value))),
            Condition::In(values) => keys = Some(intersect(keys, values)),
            Condition::Gt(value) => tighten(&mut lower, value, false, Ordering::Greater),
            Condition::Gte(value) => tighten(&mut lower, value, true, Ordering::Greater),
            Condition::Lt(value) => tighten(&mut upper, value, false, Ordering::Less),
            Condition::Lte(value) => tighten(&mut upper, value, true, Ordering::Less),
            Condition::Ne(_) | Condition::Exists(_) => {}
        }
    }

    if let Some(keys) = keys {
        // stored documents never carry a null shard key
        return ShardTargets::Keys(keys.into_iter().filter(|key| !key.is_null()).collect());
    }
    if config.strategy == ShardStrategy::Range && (lower.is_some() || upper.is_some()) {
        return ShardTargets::Slots(resolver::range_slots_for_interval(
            &config.ranges,
            lower.as_ref(),
            upper.as_ref(),
        ));
    }
    ShardTargets::All
}

fn intersect(current: Option<Vec<Value>>, next: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let next: Vec<Value> = next
        .iter()
        .filter(|value| seen.insert(value.canonical_key()))
        .cloned()
        .collect();
    match current {
        None => next,
        Some(current) => {
            let allowed: HashSet<String> = next.iter().map(Value::canonical_key).collect();
            current
                .into_iter()
                .filter(|value| allowed.contains(&value.canonical_key()))
                .collect()
        }
    }
}

// Keeps the more restrictive bound; incomparable bounds keep the first one.
fn tighten(bound: &mut Option<KeyBound>, value: &Value, inclusive: bool, stricter: Ordering) {
    let replace = match bound {
        None => true,
        Some((existing, existing_inclusive)) => match value.compare(existing) {
            Ok(ord) if ord == stricter => true,
            Ok(Ordering::Equal) => *existing_inclusive && !inclusive,
            _ => false,
        },
    };
    if replace {
        *bound = Some((value.clone(), inclusive));
    }
}
