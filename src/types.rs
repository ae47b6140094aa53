//! Core types and data structures for the draw oracle.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ConfigError, ValidationError};

/// Primary numbers drawn per round.
pub const PRIMARY_COUNT: usize = 5;

/// A historical period during which the secondary-number domain was fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Era {
    /// Short tag stored with every draw of this era (e.g. "pb26")
    pub tag: String,
    /// First draw date of the era
    pub starts_on: NaiveDate,
    /// Largest valid secondary number during the era
    pub secondary_max: u8,
}

/// The number domains in force: one fixed primary domain and a sequence of
/// secondary-domain eras ordered by start date.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberDomain {
    primary_max: u8,
    eras: Vec<Era>,
}

impl NumberDomain {
    /// Build a domain, rejecting empty or unordered era tables.
    pub fn new(primary_max: u8, mut eras: Vec<Era>) -> Result<Self, ConfigError> {
        if (primary_max as usize) < PRIMARY_COUNT {
            return Err(ConfigError::InvalidValue {
                field: "domain.primary_max",
                reason: format!("must be at least {}", PRIMARY_COUNT),
            });
        }
        if eras.is_empty() {
            return Err(ConfigError::MissingField { field: "domain.eras" });
        }
        eras.sort_by_key(|era| era.starts_on);
        for pair in eras.windows(2) {
            if pair[0].starts_on == pair[1].starts_on {
                return Err(ConfigError::InvalidValue {
                    field: "domain.eras",
                    reason: format!("two eras start on {}", pair[0].starts_on),
                });
            }
        }
        let mut tags = HashSet::new();
        for era in &eras {
            if era.secondary_max == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "domain.eras",
                    reason: format!("era {} has an empty secondary domain", era.tag),
                });
            }
            if !tags.insert(era.tag.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "domain.eras",
                    reason: format!("duplicate era tag {}", era.tag),
                });
            }
        }
        Ok(Self { primary_max, eras })
    }

    pub fn primary_max(&self) -> u8 {
        self.primary_max
    }

    pub fn eras(&self) -> &[Era] {
        &self.eras
    }

    /// Era in force on `date`. Dates before the first era belong to the first one.
    pub fn era_for(&self, date: NaiveDate) -> &Era {
        self.eras
            .iter()
            .rev()
            .find(|era| era.starts_on <= date)
            .unwrap_or(&self.eras[0])
    }

    /// The era currently in force (the latest one).
    pub fn current_era(&self) -> &Era {
        &self.eras[self.eras.len() - 1]
    }

    /// Check five distinct in-domain primaries and return them sorted.
    pub fn normalize_primaries(&self, numbers: &[u8]) -> Result<[u8; PRIMARY_COUNT], ValidationError> {
        if numbers.len() != PRIMARY_COUNT {
            return Err(ValidationError::WrongCount {
                expected: PRIMARY_COUNT,
                actual: numbers.len(),
            });
        }
        let mut sorted = [0u8; PRIMARY_COUNT];
        sorted.copy_from_slice(numbers);
        sorted.sort_unstable();
        for (i, &value) in sorted.iter().enumerate() {
            if value == 0 || value > self.primary_max {
                return Err(ValidationError::PrimaryOutOfDomain {
                    value,
                    max: self.primary_max,
                });
            }
            if i > 0 && sorted[i - 1] == value {
                return Err(ValidationError::DuplicatePrimary(value));
            }
        }
        Ok(sorted)
    }

    /// Check a secondary number against the domain of `era`.
    pub fn check_secondary(&self, value: u8, era: &Era) -> Result<(), ValidationError> {
        if value == 0 || value > era.secondary_max {
            return Err(ValidationError::SecondaryOutOfDomain {
                value,
                max: era.secondary_max,
                era: era.tag.clone(),
            });
        }
        Ok(())
    }
}

/// One historical draw outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawRecord {
    /// Occurrence date, unique per draw
    pub draw_date: NaiveDate,
    /// Five distinct primary numbers, ascending
    pub primaries: [u8; PRIMARY_COUNT],
    /// Secondary number, valid for `era`
    pub secondary: u8,
    /// Tag of the secondary-domain era the draw belongs to
    pub era: String,
    /// Whether `era` is the era currently in force
    pub is_current_era: bool,
}

impl DrawRecord {
    /// Validate and normalize a raw draw against `domain`, deriving its era.
    pub fn new(
        draw_date: NaiveDate,
        primaries: &[u8],
        secondary: u8,
        domain: &NumberDomain,
    ) -> Result<Self, ValidationError> {
        let primaries = domain.normalize_primaries(primaries)?;
        let era = domain.era_for(draw_date);
        domain.check_secondary(secondary, era)?;
        Ok(Self {
            draw_date,
            primaries,
            secondary,
            era: era.tag.clone(),
            is_current_era: era.tag == domain.current_era().tag,
        })
    }

    /// Re-run validation, e.g. for records handed over by an external adapter.
    pub fn revalidate(&self, domain: &NumberDomain) -> Result<Self, ValidationError> {
        Self::new(self.draw_date, &self.primaries, self.secondary, domain)
    }
}

/// Result of checking a ticket against the real draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketEvaluation {
    pub matched_primary: u8,
    pub matched_secondary: bool,
    /// Prize value won, 0.0 when the ticket did not win
    pub prize: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl TicketEvaluation {
    pub fn is_win(&self) -> bool {
        self.prize > 0.0
    }
}

/// A candidate ticket produced by the strategy manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTicket {
    /// Database record ID (set by DB)
    pub id: Option<i64>,
    /// Draw date this ticket is a prediction for
    pub target_date: NaiveDate,
    pub primaries: [u8; PRIMARY_COUNT],
    pub secondary: u8,
    /// Name of the originating strategy
    pub strategy: String,
    /// Confidence of the originating strategy when the ticket was made
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// Filled in once the target draw is known
    pub evaluation: Option<TicketEvaluation>,
}

impl GeneratedTicket {
    /// Key used for duplicate detection within a batch.
    pub fn numbers(&self) -> ([u8; PRIMARY_COUNT], u8) {
        (self.primaries, self.secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn test_domain() -> NumberDomain {
        NumberDomain::new(
            69,
            vec![
                Era { tag: "pb26".into(), starts_on: date(2015, 10, 7), secondary_max: 26 },
                Era { tag: "pb35".into(), starts_on: date(2012, 1, 15), secondary_max: 35 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_eras_are_ordered_and_resolved() {
        let domain = test_domain();
        assert_eq!(domain.eras()[0].tag, "pb35");
        assert_eq!(domain.era_for(date(2013, 5, 1)).tag, "pb35");
        assert_eq!(domain.era_for(date(2015, 10, 7)).tag, "pb26");
        assert_eq!(domain.era_for(date(2001, 1, 1)).tag, "pb35");
        assert_eq!(domain.current_era().tag, "pb26");
    }

    #[test]
    fn test_draw_record_is_normalized() {
        let domain = test_domain();
        let draw = DrawRecord::new(date(2024, 3, 2), &[40, 3, 69, 12, 1], 26, &domain).unwrap();
        assert_eq!(draw.primaries, [1, 3, 12, 40, 69]);
        assert_eq!(draw.era, "pb26");
        assert!(draw.is_current_era);
    }

    #[test]
    fn test_secondary_checked_against_draw_era() {
        let domain = test_domain();
        // 30 was valid before the 2015 change but not after it
        let old = DrawRecord::new(date(2014, 6, 1), &[1, 2, 3, 4, 5], 30, &domain).unwrap();
        assert!(!old.is_current_era);
        let err = DrawRecord::new(date(2016, 6, 1), &[1, 2, 3, 4, 5], 30, &domain).unwrap_err();
        assert!(matches!(err, ValidationError::SecondaryOutOfDomain { max: 26, .. }));
    }

    #[test]
    fn test_invalid_primaries_rejected() {
        let domain = test_domain();
        assert_eq!(
            domain.normalize_primaries(&[1, 2, 3, 4]),
            Err(ValidationError::WrongCount { expected: 5, actual: 4 })
        );
        assert_eq!(
            domain.normalize_primaries(&[1, 2, 3, 4, 70]),
            Err(ValidationError::PrimaryOutOfDomain { value: 70, max: 69 })
        );
        assert_eq!(
            domain.normalize_primaries(&[0, 2, 3, 4, 5]),
            Err(ValidationError::PrimaryOutOfDomain { value: 0, max: 69 })
        );
        assert_eq!(
            domain.normalize_primaries(&[9, 2, 9, 4, 5]),
            Err(ValidationError::DuplicatePrimary(9))
        );
    }

    #[test]
    fn test_domain_rejects_bad_era_tables() {
        assert!(NumberDomain::new(69, vec![]).is_err());
        assert!(NumberDomain::new(4, test_domain().eras().to_vec()).is_err());
        let same_start = vec![
            Era { tag: "a".into(), starts_on: date(2020, 1, 1), secondary_max: 10 },
            Era { tag: "b".into(), starts_on: date(2020, 1, 1), secondary_max: 12 },
        ];
        assert!(NumberDomain::new(69, same_start).is_err());
    }
}
