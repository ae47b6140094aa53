//! Configuration for the draw oracle.
//!
//! All numeric knobs carry defaults; a TOML file only needs to name what it
//! changes. [`OracleConfig::validate`] is the gate that turns a bad setup into a
//! fatal [`ConfigError`] before any run starts.

use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::ConfigError;
use crate::types::{Era, NumberDomain};

/// Environment variable overriding `database_url`.
pub const DATABASE_URL_ENV: &str = "DRAW_ORACLE_DATABASE_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub database_url: String,
    pub polling: PollingConfig,
    pub analytics: AnalyticsConfig,
    pub weighting: WeightingConfig,
    pub generation: GenerationConfig,
    pub domain: DomainConfig,
    pub schedule: ScheduleConfig,
    pub prizes: PrizeTable,
    pub providers: Vec<ProviderConfig>,
    pub logging: LoggingConfig,
}

/// Draw availability polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Polling ceiling; must stay below the supervisor grace period minus the margin
    pub timeout_seconds: u64,
    /// Seconds the host supervisor waits before killing a run
    pub supervisor_grace_seconds: u64,
    pub safety_margin_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Absolute deviation (%) above which a pair is flagged significant
    pub significance_threshold_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingConfig {
    /// Additive prior on each strategy's win rate
    pub prior: f64,
    /// Plays at which confidence has covered half its range
    pub confidence_saturation: f64,
    pub confidence_base: f64,
    pub confidence_cap: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub batch_size: usize,
    pub max_generation_retries: u32,
    /// Largest share of a batch allowed to carry the same secondary number
    pub max_secondary_share: f64,
    /// Fixed RNG seed, for reproducible batches
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub primary_max: u8,
    pub eras: Vec<Era>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub draw_weekdays: Vec<Weekday>,
    /// Hours after midnight UTC of the draw date at which results are published
    pub availability_offset_hours: i64,
}

/// One prize tier: matching `primary_matches` primaries (and the secondary, if
/// `secondary` is set) pays `amount`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrizeTier {
    pub primary_matches: u8,
    pub secondary: bool,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrizeTable {
    pub ticket_cost: f64,
    pub tiers: Vec<PrizeTier>,
}

impl PrizeTable {
    /// Prize for a ticket with the given match counts.
    pub fn prize_for(&self, primary_matches: u8, secondary: bool) -> f64 {
        self.tiers
            .iter()
            .find(|tier| tier.primary_matches == primary_matches && tier.secondary == secondary)
            .map(|tier| tier.amount)
            .unwrap_or(0.0)
    }
}

/// An ingestion provider, tried in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the provider credential, if it needs one
    #[serde(default)]
    pub api_token_env: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_second: u32,
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
}

fn default_rate_limit() -> u32 {
    2
}

fn default_request_timeout() -> u64 {
    10
}

fn default_retry_attempts() -> usize {
    3
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    /// Initialize the tracing subscriber with this logging configuration.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).init();
            }
            _ => {
                fmt().with_env_filter(filter).init();
            }
        }
    }
}

impl OracleConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        let mut config: OracleConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DRAW_ORACLE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.is_empty() {
                self.database_url = url;
            }
        }
    }

    /// Check every invariant the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::MissingField { field: "database_url" });
        }

        let polling = &self.polling;
        if polling.interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "polling.interval_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if polling.interval_seconds > polling.timeout_seconds {
            return Err(ConfigError::InvalidValue {
                field: "polling.interval_seconds",
                reason: format!(
                    "interval {}s exceeds timeout {}s",
                    polling.interval_seconds, polling.timeout_seconds
                ),
            });
        }
        // The poller must always give up on its own before the supervisor kills the run.
        let bounded = polling
            .timeout_seconds
            .checked_add(polling.safety_margin_seconds)
            .is_some_and(|ceiling| ceiling < polling.supervisor_grace_seconds);
        if !bounded {
            return Err(ConfigError::InvalidValue {
                field: "polling.timeout_seconds",
                reason: format!(
                    "timeout {}s plus margin {}s must stay below the supervisor grace period {}s",
                    polling.timeout_seconds,
                    polling.safety_margin_seconds,
                    polling.supervisor_grace_seconds
                ),
            });
        }

        let threshold = self.analytics.significance_threshold_percent;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "analytics.significance_threshold_percent",
                reason: "must be a non-negative number".into(),
            });
        }

        let weighting = &self.weighting;
        if !weighting.prior.is_finite() || weighting.prior < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "weighting.prior",
                reason: "must be a non-negative number".into(),
            });
        }
        if !(weighting.confidence_saturation > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "weighting.confidence_saturation",
                reason: "must be positive".into(),
            });
        }
        if !(weighting.confidence_cap > 0.0 && weighting.confidence_cap <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "weighting.confidence_cap",
                reason: "must lie in (0, 1]".into(),
            });
        }
        if !(weighting.confidence_base >= 0.0 && weighting.confidence_base <= weighting.confidence_cap) {
            return Err(ConfigError::InvalidValue {
                field: "weighting.confidence_base",
                reason: "must lie in [0, confidence_cap]".into(),
            });
        }

        let generation = &self.generation;
        if generation.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "generation.batch_size",
                reason: "must be greater than zero".into(),
            });
        }
        if !(generation.max_secondary_share > 0.0 && generation.max_secondary_share <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "generation.max_secondary_share",
                reason: "must lie in (0, 1]".into(),
            });
        }

        if self.schedule.draw_weekdays.is_empty() {
            return Err(ConfigError::MissingField { field: "schedule.draw_weekdays" });
        }
        if !(self.prizes.ticket_cost > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "prizes.ticket_cost",
                reason: "must be positive".into(),
            });
        }
        if self.providers.is_empty() {
            return Err(ConfigError::MissingField { field: "providers" });
        }
        for provider in &self.providers {
            if provider.rate_limit_per_second == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "providers.rate_limit_per_second",
                    reason: format!("provider {} must allow at least one request per second", provider.name),
                });
            }
        }

        self.number_domain()?;
        Ok(())
    }

    /// Number domain described by `[domain]`.
    pub fn number_domain(&self) -> Result<NumberDomain, ConfigError> {
        NumberDomain::new(self.domain.primary_max, self.domain.eras.clone())
    }

    /// Upper bound on a single poll.
    pub fn poll_ceiling(&self) -> Duration {
        Duration::from_secs(self.polling.timeout_seconds)
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./draw_oracle.db?mode=rwc".into(),
            polling: PollingConfig::default(),
            analytics: AnalyticsConfig::default(),
            weighting: WeightingConfig::default(),
            generation: GenerationConfig::default(),
            domain: DomainConfig::default(),
            schedule: ScheduleConfig::default(),
            prizes: PrizeTable::default(),
            providers: vec![ProviderConfig {
                name: "ny-open-data".into(),
                base_url: "https://data.ny.gov/resource/d6yy-54nr.json".into(),
                api_token_env: None,
                rate_limit_per_second: default_rate_limit(),
                timeout_seconds: default_request_timeout(),
                retry_attempts: default_retry_attempts(),
            }],
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            timeout_seconds: 25 * 60,
            supervisor_grace_seconds: 30 * 60,
            safety_margin_seconds: 60,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            significance_threshold_percent: 20.0,
        }
    }
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            prior: 0.01,
            confidence_saturation: 100.0,
            confidence_base: 0.1,
            confidence_cap: 0.95,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_generation_retries: 5,
            max_secondary_share: 0.5,
            seed: None,
        }
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            primary_max: 69,
            eras: vec![
                Era {
                    tag: "pb35".into(),
                    starts_on: ymd(2012, 1, 15),
                    secondary_max: 35,
                },
                Era {
                    tag: "pb26".into(),
                    starts_on: ymd(2015, 10, 7),
                    secondary_max: 26,
                },
            ],
        }
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            draw_weekdays: vec![Weekday::Mon, Weekday::Wed, Weekday::Sat],
            availability_offset_hours: 28,
        }
    }
}

impl Default for PrizeTable {
    fn default() -> Self {
        let tier = |primary_matches, secondary, amount| PrizeTier {
            primary_matches,
            secondary,
            amount,
        };
        Self {
            ticket_cost: 2.0,
            tiers: vec![
                tier(5, true, 20_000_000.0),
                tier(5, false, 1_000_000.0),
                tier(4, true, 50_000.0),
                tier(4, false, 100.0),
                tier(3, true, 100.0),
                tier(3, false, 7.0),
                tier(2, true, 7.0),
                tier(1, true, 4.0),
                tier(0, true, 4.0),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = OracleConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.polling.timeout_seconds < config.polling.supervisor_grace_seconds);
        assert_eq!(config.analytics.significance_threshold_percent, 20.0);
        assert_eq!(config.number_domain().unwrap().current_era().secondary_max, 26);
    }

    #[test]
    fn test_poll_timeout_must_stay_below_grace_period() {
        let mut config = OracleConfig::default();
        config.polling.timeout_seconds = 1750;
        config.polling.safety_margin_seconds = 60;
        config.polling.supervisor_grace_seconds = 1800;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "polling.timeout_seconds", .. }));

        config.polling.timeout_seconds = 1739;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overflowing_poll_ceiling_rejected() {
        let mut config = OracleConfig::default();
        config.polling.timeout_seconds = u64::MAX - 10;
        config.polling.safety_margin_seconds = 60;
        config.polling.supervisor_grace_seconds = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "polling.timeout_seconds", .. }));
    }

    #[test]
    fn test_interval_bounds() {
        let mut config = OracleConfig::default();
        config.polling.interval_seconds = 0;
        assert!(config.validate().is_err());

        config.polling.interval_seconds = config.polling.timeout_seconds + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_providers_rejected() {
        let mut config = OracleConfig::default();
        config.providers.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { field: "providers" })
        ));
    }

    #[test]
    fn test_prize_lookup() {
        let prizes = PrizeTable::default();
        assert_eq!(prizes.prize_for(3, false), 7.0);
        assert_eq!(prizes.prize_for(0, true), 4.0);
        assert_eq!(prizes.prize_for(2, false), 0.0);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
database_url = "sqlite::memory:"

[polling]
interval_seconds = 30
timeout_seconds = 600
supervisor_grace_seconds = 900

[generation]
batch_size = 4
seed = 7

[schedule]
draw_weekdays = ["Tue", "Fri"]

[[providers]]
name = "mirror"
base_url = "http://localhost:9999/draws.json"
"#
        )
        .unwrap();

        let config = OracleConfig::load(file.path()).unwrap();
        assert_eq!(config.polling.interval_seconds, 30);
        assert_eq!(config.polling.safety_margin_seconds, 60);
        assert_eq!(config.generation.batch_size, 4);
        assert_eq!(config.generation.seed, Some(7));
        assert_eq!(config.schedule.draw_weekdays, vec![Weekday::Tue, Weekday::Fri]);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].retry_attempts, 3);
        assert_eq!(config.weighting.prior, 0.01);
    }

    #[test]
    fn test_load_rejects_unsafe_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[polling]\ntimeout_seconds = 1800\nsupervisor_grace_seconds = 1800\n"
        )
        .unwrap();
        assert!(matches!(
            OracleConfig::load(file.path()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
