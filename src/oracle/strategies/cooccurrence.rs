//! Builds tickets around pairs that co-occur more often than chance predicts.

use rand::rngs::StdRng;

use super::{
    complete_primaries, smoothed, weighted_distinct, weighted_pick, HistoryView, TicketCandidate, TicketStrategy,
};
use crate::types::PRIMARY_COUNT;

/// Strongest pairs considered as seeds.
const SEED_POOL: usize = 25;

pub struct CooccurrenceStrategy;

impl TicketStrategy for CooccurrenceStrategy {
    fn name(&self) -> &'static str {
        "cooccurrence"
    }

    fn generate(&self, history: &HistoryView<'_>, count: usize, rng: &mut StdRng) -> Vec<TicketCandidate> {
        let pairs = history.favoured_pairs();
        let seeds = &pairs[..pairs.len().min(SEED_POOL)];
        // weighted_pick skips index 0
        let mut seed_weights = vec![0.0];
        seed_weights.extend(seeds.iter().map(|p| p.deviation_percent));

        let primary_weights = smoothed(&history.primary_frequencies());
        let secondary_weights = smoothed(&history.secondary_frequencies());

        (0..count)
            .map(|_| {
                let primaries = if seeds.is_empty() {
                    weighted_distinct(&primary_weights, PRIMARY_COUNT, rng)
                } else {
                    let seed = seeds[weighted_pick(&seed_weights, rng) as usize - 1];
                    let mut primaries = vec![seed.a, seed.b];
                    complete_primaries(&mut primaries, &primary_weights, rng);
                    primaries
                };
                TicketCandidate {
                    primaries,
                    secondary: weighted_pick(&secondary_weights, rng),
                }
            })
            .collect()
    }
}
