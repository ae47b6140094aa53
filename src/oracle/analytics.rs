//! Co-occurrence analytics over the primary numbers of the full draw history.
//!
//! Every pass recomputes the symmetric pair-count matrix from scratch and
//! compares each pair against its expected count under independence:
//! `expected = (k/N) * ((k-1)/(N-1)) * draws`.

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::oracle::storage::{CooccurrenceStorage, DrawStorage, OracleStorage};
use crate::oracle::types::CooccurrencePair;
use crate::types::{DrawRecord, PRIMARY_COUNT};

/// Outcome of one analytics pass, stored in the run metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsSummary {
    pub draws: usize,
    pub pairs: usize,
    pub significant: usize,
    pub expected_per_pair: f64,
    /// Pair with the largest positive deviation
    pub strongest: Option<(u8, u8, f64)>,
}

pub struct CooccurrenceEngine {
    primary_max: u8,
    significance_threshold: f64,
}

impl CooccurrenceEngine {
    pub fn new(primary_max: u8, significance_threshold_percent: f64) -> Self {
        Self {
            primary_max,
            significance_threshold: significance_threshold_percent,
        }
    }

    /// Expected joint count of any one pair over `total_draws` draws.
    pub fn expected_count(&self, total_draws: usize) -> f64 {
        let k = PRIMARY_COUNT as f64;
        let n = self.primary_max as f64;
        (k / n) * ((k - 1.0) / (n - 1.0)) * total_draws as f64
    }

    /// Pair statistics for `draws`, one row per unordered pair ordered by `(a, b)`.
    pub fn compute(&self, draws: &[DrawRecord]) -> Vec<CooccurrencePair> {
        let n = self.primary_max as usize;
        let stride = n + 1;
        let mut counts = vec![0u32; stride * stride];

        for draw in draws {
            let p = &draw.primaries;
            for i in 0..PRIMARY_COUNT {
                for j in (i + 1)..PRIMARY_COUNT {
                    let (a, b) = (p[i] as usize, p[j] as usize);
                    if a > n || b > n {
                        debug!("Draw {} has numbers outside 1..={}, skipping pair", draw.draw_date, n);
                        continue;
                    }
                    counts[a * stride + b] += 1;
                    counts[b * stride + a] += 1;
                }
            }
        }

        let expected = self.expected_count(draws.len());
        let mut pairs = Vec::with_capacity(n * (n.saturating_sub(1)) / 2);
        for a in 1..=n {
            for b in (a + 1)..=n {
                let observed = counts[a * stride + b];
                let deviation_percent = if expected > 0.0 {
                    (observed as f64 - expected) / expected * 100.0
                } else {
                    0.0
                };
                pairs.push(CooccurrencePair {
                    a: a as u8,
                    b: b as u8,
                    observed,
                    expected,
                    deviation_percent,
                    significant: deviation_percent.abs() > self.significance_threshold,
                });
            }
        }
        pairs
    }

    pub fn summarize(&self, draws: usize, pairs: &[CooccurrencePair]) -> AnalyticsSummary {
        let strongest = pairs
            .iter()
            .filter(|p| p.deviation_percent > 0.0)
            .max_by(|x, y| x.deviation_percent.total_cmp(&y.deviation_percent))
            .map(|p| (p.a, p.b, p.deviation_percent));
        AnalyticsSummary {
            draws,
            pairs: pairs.len(),
            significant: pairs.iter().filter(|p| p.significant).count(),
            expected_per_pair: self.expected_count(draws),
            strongest,
        }
    }

    /// Recompute the table from stored history and replace the stored rows.
    #[instrument(skip(self, storage))]
    pub async fn run(&self, storage: &dyn OracleStorage) -> Result<AnalyticsSummary, StorageError> {
        let draws = storage.all_draws().await?;
        let pairs = self.compute(&draws);
        storage.replace_pairs(&pairs).await?;

        let summary = self.summarize(draws.len(), &pairs);
        info!(
            "Co-occurrence pass over {} draws: {} of {} pairs significant",
            summary.draws, summary.significant, summary.pairs
        );
        Ok(summary)
    }
}
