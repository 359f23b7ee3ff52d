//! Top-K ranking metrics.
//!
//! Every metric is computed from a single user's ranked list against that
//! user's test items. Cross-user aggregation is an unweighted mean, see
//! [`MetricAccumulator`].
use std::collections::BTreeMap;
use std::fmt;

use ItemId;

/// The ranking metrics reported at every cutoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    /// Fraction of the top-K list that is relevant.
    Precision,
    /// Fraction of the relevant items found in the top-K list.
    Recall,
    /// Normalised discounted cumulative gain.
    Ndcg,
    /// Harmonic mean of precision and recall.
    F1,
    /// Average precision over the top-K positions.
    Map,
}

impl Metric {
    /// All metrics, in reporting order.
    pub const ALL: [Metric; 5] = [
        Metric::Precision,
        Metric::Recall,
        Metric::Ndcg,
        Metric::F1,
        Metric::Map,
    ];

    /// Lower-case column name.
    pub fn name(&self) -> &'static str {
        match *self {
            Metric::Precision => "precision",
            Metric::Recall => "recall",
            Metric::Ndcg => "ndcg",
            Metric::F1 => "f1",
            Metric::Map => "map",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The value of every [`Metric`] at one cutoff.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    /// Precision@K.
    pub precision: f64,
    /// Recall@K.
    pub recall: f64,
    /// NDCG@K.
    pub ndcg: f64,
    /// F1@K.
    pub f1: f64,
    /// MAP@K.
    pub map: f64,
}

impl MetricValues {
    /// The value of `metric`.
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Precision => self.precision,
            Metric::Recall => self.recall,
            Metric::Ndcg => self.ndcg,
            Metric::F1 => self.f1,
            Metric::Map => self.map,
        }
    }

    fn get_mut(&mut self, metric: Metric) -> &mut f64 {
        match metric {
            Metric::Precision => &mut self.precision,
            Metric::Recall => &mut self.recall,
            Metric::Ndcg => &mut self.ndcg,
            Metric::F1 => &mut self.f1,
            Metric::Map => &mut self.map,
        }
    }
}

/// Metric values keyed by cutoff, in ascending cutoff order.
pub type MetricsAtK = BTreeMap<usize, MetricValues>;

/// Discount of the 1-indexed `position`.
fn discount(position: usize) -> f64 {
    1.0 / ((position + 1) as f64).log2()
}

/// Compute every metric at every cutoff in `ks` for a single user.
///
/// `ranked` is the user's ranked list (best first, already excluding
/// training items) and `test_items` the user's sorted test items. Lists
/// shorter than a cutoff are treated as having no hits past their end;
/// precision is still divided by the cutoff.
///
/// # Panics
///
/// Panics if `test_items` is empty: users without test items are not
/// part of an evaluation population.
pub fn compute_metrics(ranked: &[ItemId], test_items: &[ItemId], ks: &[usize]) -> MetricsAtK {
    assert!(
        !test_items.is_empty(),
        "Metrics are undefined for a user without test items."
    );

    let k_max = ks.iter().cloned().max().unwrap_or(0);
    let depth = k_max.min(ranked.len());

    // Running totals over the first `position` ranks.
    let mut hits = vec![0usize; depth + 1];
    let mut dcg = vec![0.0; depth + 1];
    let mut precision_sum = vec![0.0; depth + 1];

    for (idx, item_id) in ranked[..depth].iter().enumerate() {
        let position = idx + 1;
        let is_hit = test_items.binary_search(item_id).is_ok();

        hits[position] = hits[idx] + is_hit as usize;
        dcg[position] = dcg[idx];
        precision_sum[position] = precision_sum[idx];

        if is_hit {
            dcg[position] += discount(position);
            precision_sum[position] += hits[position] as f64 / position as f64;
        }
    }

    let num_relevant = test_items.len();

    ks.iter()
        .map(|&k| {
            let cutoff = k.min(depth);
            let ideal_hits = k.min(num_relevant);

            let num_hits = hits[cutoff] as f64;
            let idcg: f64 = (1..=ideal_hits).map(discount).sum();

            let precision = if k == 0 { 0.0 } else { num_hits / k as f64 };
            let recall = num_hits / num_relevant as f64;
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            let ndcg = if idcg > 0.0 { dcg[cutoff] / idcg } else { 0.0 };
            let map = if ideal_hits > 0 {
                precision_sum[cutoff] / ideal_hits as f64
            } else {
                0.0
            };

            (
                k,
                MetricValues {
                    precision,
                    recall,
                    ndcg,
                    f1,
                    map,
                },
            )
        })
        .collect()
}

/// Running per-user metric values, averaged on demand.
#[derive(Clone, Debug, Default)]
pub struct MetricAccumulator {
    per_user: BTreeMap<usize, Vec<MetricValues>>,
}

impl MetricAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        MetricAccumulator::default()
    }

    /// Record one user's metrics.
    pub fn push(&mut self, metrics: &MetricsAtK) {
        for (&k, values) in metrics {
            self.per_user.entry(k).or_insert_with(Vec::new).push(*values);
        }
    }

    /// Merge another accumulator, keeping user order.
    pub fn extend(&mut self, other: MetricAccumulator) {
        for (k, values) in other.per_user {
            self.per_user.entry(k).or_insert_with(Vec::new).extend(values);
        }
    }

    /// Number of users recorded.
    pub fn num_users(&self) -> usize {
        self.per_user.values().map(|values| values.len()).max().unwrap_or(0)
    }

    /// Per-user values recorded at cutoff `k`.
    pub fn values(&self, k: usize) -> &[MetricValues] {
        self.per_user.get(&k).map(|values| &values[..]).unwrap_or(&[])
    }

    /// Unweighted mean over users of every metric at every cutoff.
    pub fn mean(&self) -> MetricsAtK {
        self.per_user
            .iter()
            .map(|(&k, values)| {
                let mut mean = MetricValues::default();

                if !values.is_empty() {
                    for metric in Metric::ALL.iter() {
                        let total: f64 = values.iter().map(|value| value.get(*metric)).sum();
                        *mean.get_mut(*metric) = total / values.len() as f64;
                    }
                }

                (k, mean)
            })
            .collect()
    }
}
