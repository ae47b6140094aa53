//! Strategy manager: turns weights into a validated ticket batch.
//!
//! The batch is split across strategies by largest-remainder allocation of
//! their weights. Every candidate is validated against the current era and
//! de-duplicated within the batch; a strategy that keeps failing is replaced
//! by uniform random generation after a bounded number of retries. Finally
//! the batch's secondary numbers are spread out if too many share one value.

use chrono::{DateTime, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::GenerationConfig;
use crate::error::{PipelineError, ValidationError};
use crate::oracle::strategies::{random_ticket, HistoryView, StrategyRegistry, TicketCandidate};
use crate::oracle::types::StrategyPerformance;
use crate::types::{GeneratedTicket, NumberDomain, PRIMARY_COUNT};

/// Name recorded on tickets produced by the uniform fallback.
pub const FALLBACK_STRATEGY: &str = "random";

/// A finished batch plus what it took to build it.
#[derive(Debug, Clone)]
pub struct GeneratedBatch {
    pub tickets: Vec<GeneratedTicket>,
    pub report: BatchReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    /// Tickets requested from each strategy
    pub allocation: BTreeMap<String, usize>,
    /// Candidates thrown away, with the reason
    pub rejected: Vec<String>,
    /// Tickets filled in by the uniform fallback
    pub fallbacks: usize,
    /// Tickets whose secondary number was re-rolled for diversity
    pub secondary_rerolls: usize,
}

pub struct StrategyManager {
    registry: Arc<StrategyRegistry>,
    batch_size: usize,
    max_retries: u32,
    max_secondary_share: f64,
}

type TicketKey = ([u8; PRIMARY_COUNT], u8);

/// Check a candidate against the domain currently in force.
pub fn validate_candidate(domain: &NumberDomain, candidate: &TicketCandidate) -> Result<TicketKey, ValidationError> {
    let primaries = domain.normalize_primaries(&candidate.primaries)?;
    domain.check_secondary(candidate.secondary, domain.current_era())?;
    Ok((primaries, candidate.secondary))
}

impl StrategyManager {
    pub fn new(registry: Arc<StrategyRegistry>, config: &GenerationConfig) -> Self {
        Self {
            registry,
            batch_size: config.batch_size,
            max_retries: config.max_generation_retries,
            max_secondary_share: config.max_secondary_share,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Split `total` tickets across the registered strategies in proportion to
    /// their stored weights. Strategies without a row get weight zero; if no
    /// strategy has a positive weight the split is uniform.
    pub fn allocate(&self, performance: &[StrategyPerformance], total: usize) -> Vec<(&'static str, usize)> {
        let names = self.registry.names();
        if names.is_empty() {
            return Vec::new();
        }

        let weights: HashMap<&str, f64> = performance
            .iter()
            .map(|p| (p.strategy.as_str(), p.weight))
            .collect();
        let raw: Vec<f64> = names
            .iter()
            .map(|name| {
                weights
                    .get(name)
                    .copied()
                    .filter(|w| w.is_finite() && *w > 0.0)
                    .unwrap_or(0.0)
            })
            .collect();
        let sum: f64 = raw.iter().sum();
        let shares: Vec<f64> = if sum > 0.0 {
            raw.iter().map(|w| w / sum).collect()
        } else {
            vec![1.0 / names.len() as f64; names.len()]
        };

        let quotas: Vec<f64> = shares.iter().map(|s| s * total as f64).collect();
        let mut counts: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();
        let assigned: usize = counts.iter().sum();

        let mut order: Vec<usize> = (0..names.len()).collect();
        order.sort_by(|&x, &y| {
            let fx = quotas[x] - quotas[x].floor();
            let fy = quotas[y] - quotas[y].floor();
            fy.total_cmp(&fx).then(x.cmp(&y))
        });
        for &i in order.iter().take(total.saturating_sub(assigned)) {
            counts[i] += 1;
        }

        names.into_iter().zip(counts).collect()
    }

    /// Build a batch of tickets for the draw on `target_date`.
    #[instrument(skip(self, history, performance, rng))]
    pub fn generate(
        &self,
        history: &HistoryView<'_>,
        performance: &[StrategyPerformance],
        target_date: NaiveDate,
        at: DateTime<Utc>,
        rng: &mut StdRng,
    ) -> Result<GeneratedBatch, PipelineError> {
        if self.registry.is_empty() {
            return Err(PipelineError::NoStrategies);
        }

        let domain = history.domain();
        let confidence: HashMap<&str, f64> = performance
            .iter()
            .map(|p| (p.strategy.as_str(), p.confidence))
            .collect();
        let confidence_of = |name: &str| confidence.get(name).copied().unwrap_or(0.0);

        let mut report = BatchReport::default();
        let mut tickets: Vec<GeneratedTicket> = Vec::with_capacity(self.batch_size);
        let mut seen: HashSet<TicketKey> = HashSet::new();

        let mut accept = |key: TicketKey, strategy: &str, tickets: &mut Vec<GeneratedTicket>| -> bool {
            if !seen.insert(key) {
                return false;
            }
            tickets.push(GeneratedTicket {
                id: None,
                target_date,
                primaries: key.0,
                secondary: key.1,
                strategy: strategy.to_string(),
                confidence: confidence_of(strategy),
                created_at: at,
                evaluation: None,
            });
            true
        };

        for (name, wanted) in self.allocate(performance, self.batch_size) {
            report.allocation.insert(name.to_string(), wanted);
            let Some(strategy) = self.registry.get(name) else {
                continue;
            };

            let mut accepted = 0;
            let mut retries = 0;
            while accepted < wanted && retries <= self.max_retries {
                for candidate in strategy.generate(history, wanted - accepted, rng) {
                    if accepted == wanted {
                        break;
                    }
                    match validate_candidate(domain, &candidate) {
                        Ok(key) => {
                            if accept(key, name, &mut tickets) {
                                accepted += 1;
                            } else {
                                report.rejected.push(format!("{}: {}", name, ValidationError::DuplicateTicket));
                            }
                        }
                        Err(e) => {
                            debug!("Rejected candidate from {}: {}", name, e);
                            report.rejected.push(format!("{}: {}", name, e));
                        }
                    }
                }
                if accepted < wanted {
                    retries += 1;
                }
            }

            if accepted < wanted {
                warn!(
                    "Strategy {} produced {} of {} valid tickets after {} retries, filling with random tickets",
                    name, accepted, wanted, self.max_retries
                );
            }
            while accepted < wanted {
                let candidate = random_ticket(domain, rng);
                if let Ok(key) = validate_candidate(domain, &candidate) {
                    if accept(key, FALLBACK_STRATEGY, &mut tickets) {
                        accepted += 1;
                        report.fallbacks += 1;
                    }
                }
            }
        }

        report.secondary_rerolls = self.diversify_secondaries(&mut tickets, domain, rng);
        Ok(GeneratedBatch { tickets, report })
    }

    /// Most tickets allowed to share one secondary number in a batch of `n`.
    pub fn max_per_secondary(&self, n: usize, secondary_max: u8) -> usize {
        let by_share = (self.max_secondary_share * n as f64).floor() as usize;
        let pigeonhole = n.div_ceil(secondary_max.max(1) as usize);
        by_share.max(pigeonhole).max(1)
    }

    /// Re-roll secondary numbers of tickets whose value is over-represented.
    fn diversify_secondaries(&self, tickets: &mut [GeneratedTicket], domain: &NumberDomain, rng: &mut StdRng) -> usize {
        let n = tickets.len();
        if n < 2 {
            return 0;
        }
        let secondary_max = domain.current_era().secondary_max;
        let allowed = self.max_per_secondary(n, secondary_max);

        let mut counts = vec![0usize; secondary_max as usize + 1];
        for ticket in tickets.iter() {
            if let Some(c) = counts.get_mut(ticket.secondary as usize) {
                *c += 1;
            }
        }
        let mut seen: HashSet<TicketKey> = tickets.iter().map(|t| t.numbers()).collect();

        let mut rerolls = 0;
        for ticket in tickets.iter_mut() {
            let current = ticket.secondary as usize;
            if counts.get(current).copied().unwrap_or(0) <= allowed {
                continue;
            }
            let options: Vec<u8> = (1..=secondary_max)
                .filter(|&v| counts[v as usize] < allowed && !seen.contains(&(ticket.primaries, v)))
                .collect();
            if options.is_empty() {
                continue;
            }
            let next = options[rng.gen_range(0..options.len())];
            seen.remove(&ticket.numbers());
            counts[current] -= 1;
            counts[next as usize] += 1;
            ticket.secondary = next;
            seen.insert(ticket.numbers());
            rerolls += 1;
        }

        if rerolls > 0 {
            debug!("Re-rolled {} secondary numbers (at most {} per value)", rerolls, allowed);
        }
        rerolls
    }
}
