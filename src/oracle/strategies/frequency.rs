//! Favours numbers that have been drawn most often.

use rand::rngs::StdRng;

use super::{smoothed, weighted_distinct, weighted_pick, HistoryView, TicketCandidate, TicketStrategy};
use crate::types::PRIMARY_COUNT;

pub struct FrequencyStrategy;

impl TicketStrategy for FrequencyStrategy {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn generate(&self, history: &HistoryView<'_>, count: usize, rng: &mut StdRng) -> Vec<TicketCandidate> {
        let primary_weights = smoothed(&history.primary_frequencies());
        let secondary_weights = smoothed(&history.secondary_frequencies());

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
    fn test_generates_valid_tickets() {
        let domain = domain();
        let draws = history(&domain, 60);
        let view = HistoryView::new(&draws, &domain, &[]);
        let mut rng = StdRng::seed_from_u64(1);

        let tickets = FrequencyStrategy.generate(&view, 20, &mut rng);
        assert_eq!(tickets.len(), 20);
        for ticket in &tickets {
            assert_valid(ticket, &domain);
        }
    }

    #[test]
    fn test_hot_number_dominates() {
        let domain = domain();
        // 69 appears in every synthetic draw
        let draws = history(&domain, 200);
        let view = HistoryView::new(&draws, &domain, &[]);
        let mut rng = StdRng::seed_from_u64(2);

        let tickets = FrequencyStrategy.generate(&view, 100, &mut rng);
        let with_69 = tickets.iter().filter(|t| t.primaries.contains(&69)).count();
        assert!(with_69 > 40);
    }
}
