//! Outcome evaluation.
//!
//! Checks persisted tickets against the draws they targeted once those draws
//! are in the historical record, and folds the results into the per-strategy
//! counters that the weighting engine reads.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument};

use crate::config::PrizeTable;
use crate::error::StorageError;
use crate::oracle::storage::{DrawStorage, OracleStorage, StrategyStorage, TicketStorage};
use crate::oracle::types::OutcomeDelta;
use crate::types::{DrawRecord, GeneratedTicket, TicketEvaluation};

/// Result of one EVALUATE pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub evaluated: usize,
    pub wins: usize,
    pub prize_total: f64,
    /// Tickets whose target draw is not in the record yet
    pub pending: usize,
    pub by_strategy: BTreeMap<String, OutcomeDelta>,
}

pub struct OutcomeEvaluator {
    prizes: PrizeTable,
}

impl OutcomeEvaluator {
    pub fn new(prizes: PrizeTable) -> Self {
        Self { prizes }
    }

    /// Compare one ticket with the real draw.
    pub fn evaluate(&self, ticket: &GeneratedTicket, draw: &DrawRecord, at: DateTime<Utc>) -> TicketEvaluation {
        let matched_primary = ticket
            .primaries
            .iter()
            .filter(|n| draw.primaries.contains(n))
            .count() as u8;
        let matched_secondary = ticket.secondary == draw.secondary;
        TicketEvaluation {
            matched_primary,
            matched_secondary,
            prize: self.prizes.prize_for(matched_primary, matched_secondary),
            evaluated_at: at,
        }
    }

    /// Evaluate every pending ticket whose draw is known and record the
    /// outcomes in one storage transaction.
    #[instrument(skip(self, storage))]
    pub async fn run(&self, storage: &dyn OracleStorage, at: DateTime<Utc>) -> Result<EvaluationSummary, StorageError> {
        let mut summary = EvaluationSummary::default();
        let Some(latest) = storage.latest_draw().await? else {
            debug!("No draws stored yet, nothing to evaluate");
            return Ok(summary);
        };

        let tickets = storage.unevaluated_tickets(latest.draw_date).await?;
        let mut draws: HashMap<_, Option<DrawRecord>> = HashMap::new();
        let mut evaluations: Vec<(i64, TicketEvaluation)> = Vec::new();

        for ticket in &tickets {
            let Some(id) = ticket.id else {
                continue;
            };
            if !draws.contains_key(&ticket.target_date) {
                let draw = storage.draw_by_date(ticket.target_date).await?;
                draws.insert(ticket.target_date, draw);
            }
            let Some(Some(draw)) = draws.get(&ticket.target_date) else {
                summary.pending += 1;
                continue;
            };

            let evaluation = self.evaluate(ticket, draw, at);
            let delta = summary
                .by_strategy
                .entry(ticket.strategy.clone())
                .or_insert_with(|| OutcomeDelta {
                    strategy: ticket.strategy.clone(),
                    plays: 0,
                    wins: 0,
                    prize: 0.0,
                    cost: 0.0,
                });
            delta.plays += 1;
            delta.cost += self.prizes.ticket_cost;
            delta.prize += evaluation.prize;
            if evaluation.is_win() {
                delta.wins += 1;
                summary.wins += 1;
            }
            summary.evaluated += 1;
            summary.prize_total += evaluation.prize;
            evaluations.push((id, evaluation));
        }

        if evaluations.is_empty() {
            debug!("No tickets ready for evaluation ({} pending)", summary.pending);
            return Ok(summary);
        }

        let deltas: Vec<OutcomeDelta> = summary.by_strategy.values().cloned().collect();
        storage.record_outcomes(&evaluations, &deltas, at).await?;

        info!(
            "Evaluated {} tickets: {} wins, {:.2} in prizes",
            summary.evaluated, summary.wins, summary.prize_total
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;
    use crate::oracle::sqlite_ledger::SqliteLedger;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ticket(target: NaiveDate, primaries: [u8; 5], secondary: u8, strategy: &str) -> GeneratedTicket {
        GeneratedTicket {
            id: None,
            target_date: target,
            primaries,
            secondary,
            strategy: strategy.into(),
            confidence: 0.1,
            created_at: Utc::now(),
            evaluation: None,
        }
    }

    #[test]
    fn test_match_counting() {
        let domain = OracleConfig::default().number_domain().unwrap();
        let draw = DrawRecord::new(date(2024, 3, 4), &[3, 14, 15, 35, 65], 9, &domain).unwrap();
        let evaluator = OutcomeEvaluator::new(PrizeTable::default());

        let three = evaluator.evaluate(&ticket(draw.draw_date, [3, 14, 15, 40, 50], 1, "a"), &draw, Utc::now());
        assert_eq!(three.matched_primary, 3);
        assert!(!three.matched_secondary);
        assert_eq!(three.prize, 7.0);

        let miss = evaluator.evaluate(&ticket(draw.draw_date, [1, 2, 4, 5, 6], 2, "a"), &draw, Utc::now());
        assert_eq!(miss.matched_primary, 0);
        assert!(!miss.is_win());

        let secondary_only = evaluator.evaluate(&ticket(draw.draw_date, [1, 2, 4, 5, 6], 9, "a"), &draw, Utc::now());
        assert!(secondary_only.is_win());
    }

    #[tokio::test]
    async fn test_run_folds_outcomes_into_strategies() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let domain = OracleConfig::default().number_domain().unwrap();
        let drawn = date(2024, 3, 4);
        let later = date(2024, 3, 6);
        ledger
            .upsert_draw(&DrawRecord::new(drawn, &[3, 14, 15, 35, 65], 9, &domain).unwrap(), &domain)
            .await
            .unwrap();
        ledger
            .insert_tickets(&[
                ticket(drawn, [3, 14, 15, 40, 50], 1, "frequency"),
                ticket(drawn, [1, 2, 4, 5, 6], 2, "frequency"),
                ticket(drawn, [1, 2, 4, 5, 6], 3, "overdue"),
                ticket(later, [1, 2, 4, 5, 6], 3, "overdue"),
            ])
            .await
            .unwrap();

        let evaluator = OutcomeEvaluator::new(PrizeTable::default());
        let summary = evaluator.run(&*ledger, Utc::now()).await.unwrap();
        assert_eq!(summary.evaluated, 3);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.by_strategy["frequency"].plays, 2);
        assert_eq!(summary.by_strategy["frequency"].cost, 4.0);

        let perf = ledger.load_performance().await.unwrap();
        let frequency = perf.iter().find(|p| p.strategy == "frequency").unwrap();
        assert_eq!((frequency.plays, frequency.wins), (2, 1));
        assert_eq!(frequency.total_prize, 7.0);

        // Already evaluated tickets are not counted twice.
        let again = evaluator.run(&*ledger, Utc::now()).await.unwrap();
        assert_eq!(again.evaluated, 0);
        assert!(ledger.tickets_for(drawn).await.unwrap().iter().all(|t| t.evaluation.is_some()));
    }
}
