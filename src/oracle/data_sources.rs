//! Ingestion adapters for published draw results.
//!
//! Every adapter implements [`DrawSource`]. `Ok(None)` means the provider
//! answered but has no such draw yet; errors are reserved for providers that
//! could not be reached or returned something unusable.

use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use moka::future::Cache;
use nonempty::NonEmpty;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, instrument, warn};

use crate::config::ProviderConfig;
use crate::error::{ConfigError, IngestError};
use crate::oracle::circuit_breaker::CircuitBreaker;
use crate::types::{DrawRecord, NumberDomain, PRIMARY_COUNT};

/// Contract consumed by the poller and the INGEST stage.
#[async_trait]
pub trait DrawSource: Send + Sync {
    fn name(&self) -> &str;

    /// Most recently published draw.
    async fn fetch_latest(&self) -> Result<Option<DrawRecord>, IngestError>;

    /// The draw held on `date`, if published.
    async fn fetch_by_date(&self, date: NaiveDate) -> Result<Option<DrawRecord>, IngestError>;

    /// Fails when a credential this source requires is not available.
    fn check_credentials(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Row shape of the open-data draw feed.
#[derive(Debug, Deserialize)]
struct FeedRow {
    draw_date: String,
    winning_numbers: String,
}

/// Convert one feed row into a validated draw.
fn parse_row(provider: &str, row: &FeedRow, domain: &NumberDomain) -> Result<DrawRecord, IngestError> {
    let malformed = |reason: String| IngestError::Malformed {
        provider: provider.to_string(),
        reason,
    };

    // "2024-03-04T00:00:00.000"
    let date_part = row.draw_date.get(..10).unwrap_or(&row.draw_date);
    let draw_date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|e| malformed(format!("bad draw_date '{}': {}", row.draw_date, e)))?;

    let numbers = row
        .winning_numbers
        .split_whitespace()
        .map(|n| n.parse::<u8>())
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| malformed(format!("bad winning_numbers '{}': {}", row.winning_numbers, e)))?;
    if numbers.len() != PRIMARY_COUNT + 1 {
        return Err(malformed(format!(
            "expected {} numbers, got {}",
            PRIMARY_COUNT + 1,
            numbers.len()
        )));
    }

    Ok(DrawRecord::new(
        draw_date,
        &numbers[..PRIMARY_COUNT],
        numbers[PRIMARY_COUNT],
        domain,
    )?)
}

/// HTTP adapter for a Socrata-style JSON feed.
pub struct HttpDrawSource {
    name: String,
    base_url: String,
    token_env: Option<String>,
    token: Option<String>,
    client: Client,
    limiter: Arc<DefaultDirectRateLimiter>,
    retry_attempts: usize,
    domain: NumberDomain,
    /// Published draws never change, so lookups by date are cached.
    published: Cache<NaiveDate, DrawRecord>,
}

impl HttpDrawSource {
    pub fn from_config(config: &ProviderConfig, domain: NumberDomain) -> Result<Self, IngestError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        let per_second = NonZeroU32::new(config.rate_limit_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        let token = config
            .api_token_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|token| !token.is_empty());

        let published = Cache::builder()
            .max_capacity(4096)
            .time_to_live(Duration::from_secs(6 * 3600))
            .build();

        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            token_env: config.api_token_env.clone(),
            token,
            client,
            limiter,
            retry_attempts: config.retry_attempts,
            domain,
            published,
        })
    }

    async fn request(&self, query: &[(&str, String)]) -> Result<Vec<FeedRow>, IngestError> {
        self.limiter.until_ready().await;

        let mut request = self.client.get(&self.base_url).query(query);
        if let Some(token) = &self.token {
            request = request.header("X-App-Token", token);
        }

        let response = request.send().await.map_err(|e| IngestError::Unreachable {
            provider: self.name.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Unreachable {
                provider: self.name.clone(),
                reason: format!("HTTP {}", status),
            });
        }

        response.json().await.map_err(|e| IngestError::Malformed {
            provider: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Request with exponential backoff; only connectivity failures are retried.
    async fn request_with_retries(&self, query: Vec<(&str, String)>) -> Result<Vec<FeedRow>, IngestError> {
        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.retry_attempts);

        RetryIf::start(
            strategy,
            || self.request(&query),
            |e: &IngestError| matches!(e, IngestError::Unreachable { .. } | IngestError::Http(_)),
        )
        .await
    }

    async fn first_draw(&self, rows: Vec<FeedRow>) -> Result<Option<DrawRecord>, IngestError> {
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let draw = parse_row(&self.name, row, &self.domain)?;
        self.published.insert(draw.draw_date, draw.clone()).await;
        Ok(Some(draw))
    }
}

#[async_trait]
impl DrawSource for HttpDrawSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(provider = %self.name))]
    async fn fetch_latest(&self) -> Result<Option<DrawRecord>, IngestError> {
        let rows = self
            .request_with_retries(vec![
                ("$order", "draw_date DESC".to_string()),
                ("$limit", "1".to_string()),
            ])
            .await?;
        self.first_draw(rows).await
    }

    #[instrument(skip(self), fields(provider = %self.name))]
    async fn fetch_by_date(&self, date: NaiveDate) -> Result<Option<DrawRecord>, IngestError> {
        if let Some(draw) = self.published.get(&date).await {
            debug!("Draw {} served from cache", date);
            return Ok(Some(draw));
        }
        let rows = self
            .request_with_retries(vec![
                ("$where", format!("draw_date='{}T00:00:00.000'", date)),
                ("$limit", "1".to_string()),
            ])
            .await?;
        self.first_draw(rows).await
    }

    fn check_credentials(&self) -> Result<(), ConfigError> {
        match (&self.token_env, &self.token) {
            (Some(env_var), None) => Err(ConfigError::MissingCredential {
                provider: self.name.clone(),
                env_var: env_var.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy)]
enum Lookup {
    Latest,
    ByDate(NaiveDate),
}

/// Tries providers in declaration order, skipping those the circuit breaker
/// has put in cool-down.
pub struct FallbackDrawSource {
    providers: NonEmpty<Arc<dyn DrawSource>>,
    breaker: Mutex<CircuitBreaker>,
}

impl FallbackDrawSource {
    pub fn new(providers: NonEmpty<Arc<dyn DrawSource>>) -> Self {
        Self {
            providers,
            breaker: Mutex::new(CircuitBreaker::new(3, Duration::from_secs(300))),
        }
    }

    /// One [`HttpDrawSource`] per configured provider.
    pub fn from_config(configs: &[ProviderConfig], domain: &NumberDomain) -> Result<Self, IngestError> {
        let sources = configs
            .iter()
            .map(|config| {
                HttpDrawSource::from_config(config, domain.clone())
                    .map(|source| Arc::new(source) as Arc<dyn DrawSource>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let providers = NonEmpty::from_vec(sources)
            .ok_or_else(|| IngestError::Exhausted("no providers configured".into()))?;
        Ok(Self::new(providers))
    }

    async fn lookup(&self, lookup: Lookup) -> Result<Option<DrawRecord>, IngestError> {
        let mut errors: Vec<IngestError> = Vec::new();
        let mut answered = false;

        for provider in self.providers.iter() {
            let name = provider.name().to_string();
            if !self.breaker.lock().await.is_available(&name) {
                debug!("Skipping provider {} (cooling down)", name);
                continue;
            }

            let result = match lookup {
                Lookup::Latest => provider.fetch_latest().await,
                Lookup::ByDate(date) => provider.fetch_by_date(date).await,
            };

            match result {
                Ok(Some(draw)) => {
                    self.breaker.lock().await.record_success(&name);
                    return Ok(Some(draw));
                }
                Ok(None) => {
                    self.breaker.lock().await.record_success(&name);
                    answered = true;
                }
                Err(e) => {
                    warn!("Provider {} failed: {}", name, e);
                    self.breaker.lock().await.record_failure(&name);
                    errors.push(e);
                }
            }
        }

        if answered {
            return Ok(None);
        }
        debug!("No provider answered, health: {:?}", self.breaker.lock().await.stats());
        match errors.len() {
            0 => Err(IngestError::Exhausted("every provider is cooling down".into())),
            1 => Err(errors.remove(0)),
            _ => Err(IngestError::Exhausted(
                errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "),
            )),
        }
    }
}

#[async_trait]
impl DrawSource for FallbackDrawSource {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn fetch_latest(&self) -> Result<Option<DrawRecord>, IngestError> {
        self.lookup(Lookup::Latest).await
    }

    async fn fetch_by_date(&self, date: NaiveDate) -> Result<Option<DrawRecord>, IngestError> {
        self.lookup(Lookup::ByDate(date)).await
    }

    fn check_credentials(&self) -> Result<(), ConfigError> {
        self.providers.iter().try_for_each(|p| p.check_credentials())
    }
}

/// In-process source backed by a map of draws. Used for offline runs and as a
/// controllable provider in tests.
#[derive(Default)]
pub struct StaticDrawSource {
    draws: RwLock<BTreeMap<NaiveDate, DrawRecord>>,
    unreachable: AtomicBool,
    calls: AtomicU32,
}

impl StaticDrawSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_draws(draws: impl IntoIterator<Item = DrawRecord>) -> Self {
        let map = draws.into_iter().map(|d| (d.draw_date, d)).collect();
        Self {
            draws: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Make a draw visible to subsequent fetches.
    pub async fn publish(&self, draw: DrawRecord) {
        self.draws.write().await.insert(draw.draw_date, draw);
    }

    /// Simulate an outage: every fetch fails until switched back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of fetch calls served so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(IngestError::Unreachable {
                provider: "static".into(),
                reason: "simulated outage".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DrawSource for StaticDrawSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_latest(&self) -> Result<Option<DrawRecord>, IngestError> {
        self.check_reachable()?;
        Ok(self.draws.read().await.values().next_back().cloned())
    }

    async fn fetch_by_date(&self, date: NaiveDate) -> Result<Option<DrawRecord>, IngestError> {
        self.check_reachable()?;
        Ok(self.draws.read().await.get(&date).cloned())
    }
}
