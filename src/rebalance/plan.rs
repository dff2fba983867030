//! Load sampling math and greedy migration planning. No I/O.

use crate::config::ShardingPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardLoadSample {
    pub shard_name: String,
    pub shard_index: usize,
    pub document_count: u64,
    pub storage_bytes: u64,
    /// `storage_bytes / max(document_count, 1)`
    pub load: f64,
}

impl ShardLoadSample {
    pub fn new(
        shard_name: impl Into<String>,
        shard_index: usize,
        document_count: u64,
        storage_bytes: u64,
    ) -> Self {
        Self {
            shard_name: shard_name.into(),
            shard_index,
            document_count,
            storage_bytes,
            load: storage_bytes as f64 / document_count.max(1) as f64,
        }
    }
}

/// One directed move of documents between two shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTask {
    pub source: String,
    pub target: String,
    /// Advisory only; execution moves whatever the source actually holds for the target.
    pub estimated_document_count: u64,
}

impl MigrationTask {
    pub fn new(source: impl Into<String>, target: impl Into<String>, estimated: u64) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            estimated_document_count: estimated,
        }
    }

    pub fn label(&self) -> String {
        format!("{}->{}", self.source, self.target)
    }
}

fn mean_load(samples: &[ShardLoadSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.load).sum::<f64>() / samples.len() as f64
}

/// `(max(load) - mean(load)) / mean(load)`; zero for empty or all-zero samples.
pub fn imbalance(samples: &[ShardLoadSample]) -> f64 {
    let mean = mean_load(samples);
    if mean <= 0.0 {
        return 0.0;
    }
    let max = samples.iter().map(|s| s.load).fold(f64::MIN, f64::max);
    (max - mean) / mean
}

pub fn needs_rebalancing(samples: &[ShardLoadSample], policy: &ShardingPolicy) -> bool {
    imbalance(samples) > policy.imbalance_threshold
}

struct Candidate<'a> {
    sample: &'a ShardLoadSample,
    amount: u64,
}

/// Greedy source/target pairing.
///
/// Sources (load above `source_tolerance * mean`) are taken by descending
/// excess, targets (load below `target_tolerance * mean`) by ascending load;
/// ties fall back to slot order. Each task moves
/// `min(source excess, target capacity)` documents.
pub fn plan(samples: &[ShardLoadSample], policy: &ShardingPolicy) -> Vec<MigrationTask> {
    if samples.len() < 2 || !needs_rebalancing(samples, policy) {
        return Vec::new();
    }
    let mean = mean_load(samples);
    let mean_docs =
        samples.iter().map(|s| s.document_count).sum::<u64>() as f64 / samples.len() as f64;

    let mut sources: Vec<Candidate> = samples
        .iter()
        .filter(|s| s.load > policy.source_tolerance * mean)
        .map(|sample| Candidate {
            sample,
            amount: (sample.document_count as f64 * (sample.load - mean) / sample.load).ceil()
                as u64,
        })
        .collect();
    let mut targets: Vec<Candidate> = samples
        .iter()
        .filter(|s| s.load < policy.target_tolerance * mean)
        .map(|sample| Candidate {
            sample,
            amount: (mean_docs * (mean - sample.load) / mean).ceil() as u64,
        })
        .collect();

    sources.sort_by(|a, b| {
        b.sample
            .load
            .total_cmp(&a.sample.load)
            .then(a.sample.shard_index.cmp(&b.sample.shard_index))
    });
    targets.sort_by(|a, b| {
        a.sample
            .load
            .total_cmp(&b.sample.load)
            .then(a.sample.shard_index.cmp(&b.sample.shard_index))
    });

    let mut tasks = Vec::new();
    for source in sources.iter_mut() {
        for target in targets.iter_mut() {
            if source.amount == 0 {
                break;
            }
            let moved = source.amount.min(target.amount);
            if moved == 0 {
                continue;
            }
            source.amount -= moved;
            target.amount -= moved;
            tasks.push(MigrationTask::new(
                &source.sample.shard_name,
                &target.sample.shard_name,
                moved,
            ));
        }
    }
    tasks
}

/// Orders tasks like `plan` does: hottest sources first, coolest targets first.
pub fn order_by_load(tasks: &mut [MigrationTask], samples: &[ShardLoadSample]) {
    let loads: HashMap<&str, (f64, usize)> = samples
        .iter()
        .map(|s| (s.shard_name.as_str(), (s.load, s.shard_index)))
        .collect();
    let rank = |name: &str| loads.get(name).copied().unwrap_or((0.0, usize::MAX));

    tasks.sort_by(|a, b| {
        let (a_src, a_src_slot) = rank(&a.source);
        let (b_src, b_src_slot) = rank(&b.source);
        let (a_dst, a_dst_slot) = rank(&a.target);
        let (b_dst, b_dst_slot) = rank(&b.target);
        b_src
            .total_cmp(&a_src)
            .then(a_src_slot.cmp(&b_src_slot))
            .then(a_dst.total_cmp(&b_dst))
            .then(a_dst_slot.cmp(&b_dst_slot))
            .then_with(|| a.label().cmp(&b.label()))
    });
}

/// Total estimated documents of a plan.
pub fn estimated_total(tasks: &[MigrationTask]) -> u64 {
    tasks.iter().map(|t| t.estimated_document_count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(index: usize, docs: u64, bytes: u64) -> ShardLoadSample {
        ShardLoadSample::new(format!("c_shard_{}", index), index, docs, bytes)
    }

    #[test]
    fn load_is_bytes_per_document() {
        assert_eq!(sample(0, 4, 400).load, 100.0);
        assert_eq!(sample(0, 0, 0).load, 0.0);
        assert_eq!(sample(0, 0, 50).load, 50.0);
    }

    #[test]
    fn imbalance_is_relative_max_over_mean() {
        let samples = vec![sample(0, 10, 1000), sample(1, 10, 1000), sample(2, 10, 1000), sample(3, 0, 0)];
        // mean 75, max 100
        assert!((imbalance(&samples) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(imbalance(&[]), 0.0);
        assert_eq!(imbalance(&[sample(0, 0, 0), sample(1, 0, 0)]), 0.0);
    }

    #[test]
    fn balanced_samples_plan_nothing() {
        let policy = ShardingPolicy::default();
        let samples = vec![sample(0, 100, 5000), sample(1, 90, 4600), sample(2, 110, 5400)];
        assert!(imbalance(&samples) < policy.imbalance_threshold);
        assert!(plan(&samples, &policy).is_empty());
    }

    #[test]
    fn empty_shard_becomes_the_target() {
        let policy = ShardingPolicy::default();
        let samples = vec![
            sample(0, 250, 25_000),
            sample(1, 250, 25_000),
            sample(2, 250, 25_000),
            sample(3, 250, 25_000),
            sample(4, 0, 0),
        ];
        let tasks = plan(&samples, &policy);
        assert!(!tasks.is_empty());
        assert!(tasks.iter().all(|t| t.target == "c_shard_4"));
        // mean 80: each source sheds ceil(250 * 20 / 100) = 50 docs, the target takes up to 200
        assert_eq!(
            tasks.iter().map(|t| t.source.as_str()).collect::<Vec<_>>(),
            vec!["c_shard_0", "c_shard_1", "c_shard_2", "c_shard_3"]
        );
        assert!(tasks.iter().all(|t| t.estimated_document_count == 50));
        assert_eq!(estimated_total(&tasks), 200);
    }

    #[test]
    fn capacity_limits_the_moves() {
        let policy = ShardingPolicy::default();
        let samples = vec![sample(0, 1000, 300_000), sample(1, 10, 100), sample(2, 1000, 100_000)];
        let tasks = plan(&samples, &policy);
        let mean: f64 = (300.0 + 10.0 + 100.0) / 3.0;
        let mean_docs: f64 = 2010.0 / 3.0;
        let capacity = (mean_docs * (mean - 10.0) / mean).ceil() as u64;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source, "c_shard_0");
        assert_eq!(tasks[0].target, "c_shard_1");
        assert!(tasks[0].estimated_document_count <= capacity);
    }

    #[test]
    fn planning_is_deterministic_on_ties() {
        let policy = ShardingPolicy::default();
        let samples = vec![
            sample(3, 0, 0),
            sample(0, 100, 10_000),
            sample(2, 0, 0),
            sample(1, 100, 10_000),
        ];
        let first = plan(&samples, &policy);
        let mut reversed = samples.clone();
        reversed.reverse();
        assert_eq!(first, plan(&reversed, &policy));
        assert_eq!(first[0].source, "c_shard_0");
        assert_eq!(first[0].target, "c_shard_2");
    }

    #[test]
    fn drift_tasks_follow_load_order() {
        let samples = vec![sample(0, 10, 500), sample(1, 10, 2000), sample(2, 0, 0)];
        let mut tasks = vec![
            MigrationTask::new("c_shard_0", "c_shard_2", 1),
            MigrationTask::new("c_shard_1", "c_shard_0", 1),
            MigrationTask::new("c_shard_1", "c_shard_2", 1),
        ];
        order_by_load(&mut tasks, &samples);
        let labels: Vec<String> = tasks.iter().map(MigrationTask::label).collect();
        assert_eq!(
            labels,
            vec!["c_shard_1->c_shard_2", "c_shard_1->c_shard_0", "c_shard_0->c_shard_2"]
        );
    }
}
