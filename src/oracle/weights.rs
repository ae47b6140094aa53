//! Adaptive strategy weighting.
//!
//! Each strategy's raw score is its win rate plus a small prior, and weights
//! are the raw scores normalized to sum to one. The prior keeps untested
//! strategies in rotation; a uniform split is used when there is nothing to
//! normalize. Confidence grows with sample size and is capped below certainty.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

use crate::config::WeightingConfig;
use crate::error::StorageError;
use crate::oracle::storage::{OracleStorage, StrategyStorage};
use crate::oracle::types::StrategyPerformance;

/// Adaptive weighting engine. Stateless: every pass starts from the stored
/// outcome record.
#[derive(Debug, Clone)]
pub struct AdaptiveWeighting {
    prior: f64,
    confidence_saturation: f64,
    confidence_base: f64,
    confidence_cap: f64,
}

impl AdaptiveWeighting {
    pub fn from_config(config: &WeightingConfig) -> Self {
        Self {
            prior: config.prior,
            confidence_saturation: config.confidence_saturation,
            confidence_base: config.confidence_base,
            confidence_cap: config.confidence_cap,
        }
    }

    /// `min(cap, base + plays / (plays + saturation))`
    pub fn confidence(&self, plays: u64) -> f64 {
        let plays = plays as f64;
        (self.confidence_base + plays / (plays + self.confidence_saturation)).min(self.confidence_cap)
    }

    fn raw_score(&self, row: &StrategyPerformance) -> f64 {
        let win_rate = if row.plays > 0 {
            row.wins as f64 / row.plays as f64
        } else {
            0.0
        };
        let raw = win_rate + self.prior;
        if raw.is_finite() && raw > 0.0 {
            raw
        } else {
            0.0
        }
    }

    /// Recompute win rate, ROI, weight and confidence for every row.
    pub fn compute(&self, rows: &[StrategyPerformance], at: DateTime<Utc>) -> Vec<StrategyPerformance> {
        if rows.is_empty() {
            return Vec::new();
        }

        let raw: Vec<f64> = rows.iter().map(|row| self.raw_score(row)).collect();
        let total: f64 = raw.iter().sum();
        let uniform = !(total.is_finite() && total > 0.0);
        if uniform {
            debug!("No usable outcome data, falling back to uniform weights");
        }

        rows.iter()
            .zip(raw)
            .map(|(row, raw)| {
                let mut next = row.clone();
                next.win_rate = if row.plays > 0 {
                    row.wins as f64 / row.plays as f64
                } else {
                    0.0
                };
                next.roi = if row.total_cost > 0.0 {
                    (row.total_prize - row.total_cost) / row.total_cost
                } else {
                    0.0
                };
                next.weight = if uniform {
                    1.0 / rows.len() as f64
                } else {
                    raw / total
                };
                next.confidence = self.confidence(row.plays);
                next.updated_at = at;
                next
            })
            .collect()
    }

    /// Make sure every registered strategy has a row, then normalize.
    #[instrument(skip(self, storage))]
    pub async fn initialize(
        &self,
        storage: &dyn OracleStorage,
        strategies: &[&str],
        at: DateTime<Utc>,
    ) -> Result<Vec<StrategyPerformance>, StorageError> {
        let mut rows = storage.load_performance().await?;
        let known: HashSet<String> = rows.iter().map(|r| r.strategy.clone()).collect();
        let missing: Vec<&str> = strategies
            .iter()
            .copied()
            .filter(|name| !known.contains(*name))
            .collect();

        if missing.is_empty() && !rows.is_empty() {
            return Ok(rows);
        }

        for name in &missing {
            info!("Seeding performance row for strategy {}", name);
            rows.push(StrategyPerformance::untested(name, at));
        }
        let rows = self.compute(&rows, at);
        storage.save_performance(&rows).await?;
        Ok(rows)
    }

    /// One REWEIGHT pass: load, recompute, store atomically.
    #[instrument(skip(self, storage))]
    pub async fn reweight(
        &self,
        storage: &dyn OracleStorage,
        at: DateTime<Utc>,
    ) -> Result<Vec<StrategyPerformance>, StorageError> {
        let rows = storage.load_performance().await?;
        let rows = self.compute(&rows, at);
        storage.save_performance(&rows).await?;

        for row in &rows {
            debug!(
                "Strategy {}: win rate {:.4} over {} plays -> weight {:.4}, confidence {:.3}",
                row.strategy, row.win_rate, row.plays, row.weight, row.confidence
            );
        }
        Ok(rows)
    }
}
