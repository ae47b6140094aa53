//! Favours numbers that have not appeared for the longest time.

use rand::rngs::StdRng;

use super::{weighted_distinct, weighted_pick, HistoryView, TicketCandidate, TicketStrategy};
use crate::types::PRIMARY_COUNT;

pub struct OverdueStrategy;

impl TicketStrategy for OverdueStrategy {
    fn name(&self) -> &'static str {
        "overdue"
    }

    fn generate(&self, history: &HistoryView<'_>, count: usize, rng: &mut StdRng) -> Vec<TicketCandidate> {
        let primary_weights: Vec<f64> = history.primary_gaps().iter().map(|&gap| gap as f64 + 1.0).collect();

        // Least drawn secondaries of the current era first.
        let secondary = history.secondary_frequencies();
        let most = secondary.iter().copied().max().unwrap_or(0);
        let secondary_weights: Vec<f64> = secondary.iter().map(|&c| (most - c) as f64 + 1.0).collect();

        (0..count)
            .map(|_| TicketCandidate {
                primaries: weighted_distinct(&primary_weights, PRIMARY_COUNT, rng),
                secondary: weighted_pick(&secondary_weights, rng),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_prefers_cold_numbers() {
        let domain = domain();
        let draws = history(&domain, 200);
        let view = HistoryView::new(&draws, &domain, &[]);
        let mut rng = StdRng::seed_from_u64(3);

        let tickets = OverdueStrategy.generate(&view, 100, &mut rng);
        for ticket in &tickets {
            assert_valid(ticket, &domain);
        }
        // 69 was drawn last time; 67 and 68 never were.
        let with_69 = tickets.iter().filter(|t| t.primaries.contains(&69)).count();
        let with_cold = tickets
            .iter()
            .filter(|t| t.primaries.contains(&67) || t.primaries.contains(&68))
            .count();
        assert!(with_cold > with_69);
    }
}
