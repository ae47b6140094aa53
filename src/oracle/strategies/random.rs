//! Uniformly random tickets. Also the fallback when another strategy keeps
//! producing invalid tickets.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::Rng;

use super::{HistoryView, TicketCandidate, TicketStrategy};
use crate::types::{NumberDomain, PRIMARY_COUNT};

pub struct RandomStrategy;

/// Five distinct numbers from `1..=primary_max`, unsorted.
pub(crate) fn random_primaries(primary_max: u8, rng: &mut StdRng) -> Vec<u8> {
    sample(rng, primary_max as usize, PRIMARY_COUNT)
        .into_iter()
        .map(|i| i as u8 + 1)
        .collect()
}

/// A uniformly random ticket valid in the current era.
pub fn random_ticket(domain: &NumberDomain, rng: &mut StdRng) -> TicketCandidate {
    TicketCandidate {
        primaries: random_primaries(domain.primary_max(), rng),
        secondary: rng.gen_range(1..=domain.current_era().secondary_max),
    }
}

impl TicketStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn generate(&self, history: &HistoryView<'_>, count: usize, rng: &mut StdRng) -> Vec<TicketCandidate> {
        (0..count).map(|_| random_ticket(history.domain(), rng)).collect()
    }
}
