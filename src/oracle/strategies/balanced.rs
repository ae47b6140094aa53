//! Uniform tickets constrained to a balanced odd/even and low/high split.

use rand::rngs::StdRng;

use super::random::random_primaries;
use super::{smoothed, weighted_pick, HistoryView, TicketCandidate, TicketStrategy};

pub struct BalancedStrategy {
    /// Attempts at finding a balanced set before accepting an unbalanced one
    max_attempts: usize,
}

impl Default for BalancedStrategy {
    fn default() -> Self {
        Self { max_attempts: 64 }
    }
}

/// Two or three odd numbers and two or three in the lower half.
pub fn is_balanced(primaries: &[u8], primary_max: u8) -> bool {
    let odd = primaries.iter().filter(|n| *n % 2 == 1).count();
    let low = primaries.iter().filter(|n| **n <= primary_max / 2).count();
    (2..=3).contains(&odd) && (2..=3).contains(&low)
}

impl TicketStrategy for BalancedStrategy {
    fn name(&self) -> &'static str {
        "balanced"
    }

    fn generate(&self, history: &HistoryView<'_>, count: usize, rng: &mut StdRng) -> Vec<TicketCandidate> {
        let primary_max = history.primary_max();
        let secondary_weights = smoothed(&history.secondary_frequencies());

        (0..count)
            .map(|_| {
                let mut primaries = random_primaries(primary_max, rng);
                for _ in 1..self.max_attempts {
                    if is_balanced(&primaries, primary_max) {
                        break;
                    }
                    primaries = random_primaries(primary_max, rng);
                }
                TicketCandidate {
                    primaries,
                    secondary: weighted_pick(&secondary_weights, rng),
                }
            })
            .collect()
    }
}
