//! Ticket-generation strategies.
//!
//! Every strategy implements [`TicketStrategy`] and sees history only through a
//! [`HistoryView`]. Primary-number statistics cover the full history, while
//! secondary-number statistics only cover draws of the era currently in force,
//! because older eras used a different secondary domain.
//!
//! The [`StrategyRegistry`] is built once at startup.

pub mod balanced;
pub mod cooccurrence;
pub mod frequency;
pub mod overdue;
pub mod random;

pub use balanced::BalancedStrategy;
pub use cooccurrence::CooccurrenceStrategy;
pub use frequency::FrequencyStrategy;
pub use overdue::OverdueStrategy;
pub use random::{random_ticket, RandomStrategy};

use rand::rngs::StdRng;
use rand::Rng;

use crate::oracle::types::CooccurrencePair;
use crate::types::{DrawRecord, NumberDomain, PRIMARY_COUNT};

/// A ticket as proposed by a strategy, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketCandidate {
    pub primaries: Vec<u8>,
    pub secondary: u8,
}

/// Read-only view of history handed to strategies.
pub struct HistoryView<'a> {
    draws: &'a [DrawRecord],
    domain: &'a NumberDomain,
    pairs: &'a [CooccurrencePair],
}

impl<'a> HistoryView<'a> {
    /// `draws` must be ordered by date, oldest first.
    pub fn new(draws: &'a [DrawRecord], domain: &'a NumberDomain, pairs: &'a [CooccurrencePair]) -> Self {
        Self { draws, domain, pairs }
    }

    pub fn domain(&self) -> &NumberDomain {
        self.domain
    }

    pub fn draw_count(&self) -> usize {
        self.draws.len()
    }

    pub fn primary_max(&self) -> u8 {
        self.domain.primary_max()
    }

    pub fn secondary_max(&self) -> u8 {
        self.domain.current_era().secondary_max
    }

    /// Occurrences of each primary number over the full history, indexed by number.
    pub fn primary_frequencies(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.primary_max() as usize + 1];
        for draw in self.draws {
            for &n in &draw.primaries {
                if let Some(slot) = counts.get_mut(n as usize) {
                    *slot += 1;
                }
            }
        }
        counts
    }

    /// Draws since each primary number last appeared, indexed by number.
    /// Numbers never drawn get the full history length.
    pub fn primary_gaps(&self) -> Vec<usize> {
        let total = self.draws.len();
        let mut gaps = vec![total; self.primary_max() as usize + 1];
        for (i, draw) in self.draws.iter().enumerate() {
            for &n in &draw.primaries {
                if let Some(slot) = gaps.get_mut(n as usize) {
                    *slot = total - 1 - i;
                }
            }
        }
        gaps
    }

    /// Occurrences of each secondary number, current era only, indexed by number.
    pub fn secondary_frequencies(&self) -> Vec<u32> {
        let current = &self.domain.current_era().tag;
        let mut counts = vec![0u32; self.secondary_max() as usize + 1];
        for draw in self.draws.iter().filter(|d| &d.era == current) {
            if let Some(slot) = counts.get_mut(draw.secondary as usize) {
                *slot += 1;
            }
        }
        counts
    }

    /// Significant pairs that occur more often than expected, strongest first.
    pub fn favoured_pairs(&self) -> Vec<&'a CooccurrencePair> {
        let mut pairs: Vec<&CooccurrencePair> = self
            .pairs
            .iter()
            .filter(|p| p.significant && p.deviation_percent > 0.0)
            .collect();
        pairs.sort_by(|x, y| y.deviation_percent.total_cmp(&x.deviation_percent));
        pairs
    }
}

/// Shared generation capability.
pub trait TicketStrategy: Send + Sync {
    /// Unique identifier, stored with every ticket and performance row.
    fn name(&self) -> &'static str;

    /// Propose `count` tickets.
    fn generate(&self, history: &HistoryView<'_>, count: usize, rng: &mut StdRng) -> Vec<TicketCandidate>;
}

/// Registry of ticket strategies.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn TicketStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in strategy set.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FrequencyStrategy));
        registry.register(Box::new(OverdueStrategy));
        registry.register(Box::new(CooccurrenceStrategy));
        registry.register(Box::new(BalancedStrategy::default()));
        registry.register(Box::new(RandomStrategy));
        registry
    }

    /// Register a strategy. A later registration with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, strategy: Box<dyn TicketStrategy>) {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(strategy);
    }

    pub fn strategies(&self) -> &[Box<dyn TicketStrategy>] {
        &self.strategies
    }

    pub fn get(&self, name: &str) -> Option<&dyn TicketStrategy> {
        self.strategies.iter().find(|s| s.name() == name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Pick one index in `1..weights.len()` with probability proportional to its
/// weight. Index 0 is unused. All-zero weights fall back to uniform.
pub(crate) fn weighted_pick(weights: &[f64], rng: &mut StdRng) -> u8 {
    let upper = weights.len().saturating_sub(1).max(1);
    let total: f64 = weights.iter().skip(1).filter(|w| w.is_finite() && **w > 0.0).sum();
    if !(total > 0.0) {
        return rng.gen_range(1..=upper) as u8;
    }
    let mut target = rng.gen::<f64>() * total;
    for (i, &w) in weights.iter().enumerate().skip(1) {
        if !(w.is_finite() && w > 0.0) {
            continue;
        }
        if target < w {
            return i as u8;
        }
        target -= w;
    }
    // Rounding left us past the end: take the last positive weight.
    weights
        .iter()
        .rposition(|w| w.is_finite() && *w > 0.0)
        .unwrap_or(upper) as u8
}

/// Draw `k` distinct indices without replacement, weighted as in [`weighted_pick`].
pub(crate) fn weighted_distinct(weights: &[f64], k: usize, rng: &mut StdRng) -> Vec<u8> {
    let mut remaining = weights.to_vec();
    if let Some(first) = remaining.first_mut() {
        *first = 0.0;
    }
    let mut picked = Vec::with_capacity(k);
    while picked.len() < k {
        let available: Vec<u8> = (1..remaining.len())
            .filter(|i| !picked.contains(&(*i as u8)))
            .map(|i| i as u8)
            .collect();
        if available.is_empty() {
            break;
        }
        let has_weight = available.iter().any(|&i| remaining[i as usize] > 0.0);
        let choice = if has_weight {
            weighted_pick(&remaining, rng)
        } else {
            available[rng.gen_range(0..available.len())]
        };
        remaining[choice as usize] = 0.0;
        picked.push(choice);
    }
    picked
}

/// Counts shifted by one so unseen numbers keep a small chance.
pub(crate) fn smoothed<T: Copy + Into<f64>>(counts: &[T]) -> Vec<f64> {
    counts.iter().map(|&c| c.into() + 1.0).collect()
}

/// Fill `primaries` up to a full ticket using `weights`.
pub(crate) fn complete_primaries(primaries: &mut Vec<u8>, weights: &[f64], rng: &mut StdRng) {
    let mut weights = weights.to_vec();
    for &n in primaries.iter() {
        if let Some(w) = weights.get_mut(n as usize) {
            *w = 0.0;
        }
    }
    let missing = PRIMARY_COUNT.saturating_sub(primaries.len());
    primaries.extend(weighted_distinct(&weights, missing, rng));
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::OracleConfig;
    use chrono::{Duration, NaiveDate};

    pub fn domain() -> NumberDomain {
        OracleConfig::default().number_domain().unwrap()
    }

    /// Draws on consecutive days, starting in the older era.
    pub fn history(domain: &NumberDomain, count: usize) -> Vec<DrawRecord> {
        let start = NaiveDate::from_ymd_opt(2015, 9, 1).unwrap();
        (0..count)
            .map(|i| {
                let date = start + Duration::days(i as i64 * 3);
                let secondary_max = domain.era_for(date).secondary_max as usize;
                let base = (i * 7) % 60 + 1;
                let primaries = [base as u8, base as u8 + 2, base as u8 + 4, base as u8 + 6, 69];
                DrawRecord::new(date, &primaries, ((i * 5) % secondary_max + 1) as u8, domain).unwrap()
            })
            .collect()
    }

    pub fn assert_valid(candidate: &TicketCandidate, domain: &NumberDomain) {
        let primaries = domain.normalize_primaries(&candidate.primaries).unwrap();
        assert_eq!(primaries.len(), PRIMARY_COUNT);
        domain.check_secondary(candidate.secondary, domain.current_era()).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_standard_registry() {
        let registry = StrategyRegistry::standard();
        assert_eq!(registry.len(), 5);
        assert_eq!(
            registry.names(),
            vec!["frequency", "overdue", "cooccurrence", "balanced", "random"]
        );
        assert!(registry.get("overdue").is_some());
        assert!(registry.get("astrology").is_none());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = StrategyRegistry::new();
        assert!(registry.is_empty());
        registry.register(Box::new(RandomStrategy));
        registry.register(Box::new(RandomStrategy));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_secondary_frequencies_use_current_era_only() {
        let domain = domain();
        let draws = history(&domain, 40);
        let view = HistoryView::new(&draws, &domain, &[]);

        let current = draws.iter().filter(|d| d.is_current_era).count() as u32;
        let secondary = view.secondary_frequencies();
        assert_eq!(secondary.len(), 27);
        assert_eq!(secondary.iter().sum::<u32>(), current);
        assert!(current < draws.len() as u32);

        // Primaries count the whole history.
        let primary = view.primary_frequencies();
        assert_eq!(primary[69], 40);
        assert_eq!(primary.iter().sum::<u32>(), 200);
    }

    #[test]
    fn test_gaps() {
        let domain = domain();
        let draws = history(&domain, 10);
        let view = HistoryView::new(&draws, &domain, &[]);
        let gaps = view.primary_gaps();
        assert_eq!(gaps[69], 0);
        // 68 is never drawn by the synthetic history
        assert_eq!(gaps[68], 10);
    }

    #[test]
    fn test_weighted_distinct_respects_zero_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut weights = vec![0.0; 11];
        for w in weights.iter_mut().skip(6) {
            *w = 1.0;
        }
        for _ in 0..50 {
            let picked = weighted_distinct(&weights, 5, &mut rng);
            let mut sorted = picked.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![6, 7, 8, 9, 10]);
        }
        // Asking for more than the positive weights cover falls back to uniform.
        let picked = weighted_distinct(&weights, 7, &mut rng);
        assert_eq!(picked.len(), 7);
    }
}
