//! Configuration types.
//!
//! Built once from the environment and passed to constructors; nothing
//! reads configuration after startup.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::ConfigError;
use crate::pacing::{FixedPacer, Pacer, TokenBucket};

/// Triage pipeline configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Our own addresses. A sender containing any of these is outbound.
    pub self_addresses: Vec<String>,
    /// Local zone for working hours and slot labels.
    pub timezone: Tz,
    /// Calendar lookahead for raw slots and event counts.
    pub calendar_lookahead_days: u32,
    /// How many recent contacts an outbound email is matched against.
    pub contact_scan_limit: usize,
    /// Pause between emails in a batch.
    pub batch_delay: Duration,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            self_addresses: Vec::new(),
            timezone: chrono_tz::UTC,
            calendar_lookahead_days: 7,
            contact_scan_limit: 50,
            batch_delay: Duration::from_secs(1),
        }
    }
}

impl TriageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let self_addresses: Vec<String> = std::env::var("TRIAGE_SELF_ADDRESSES")
            .or_else(|_| std::env::var("EMAIL_FROM_ADDRESS"))
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let timezone = match std::env::var("TRIAGE_TIMEZONE") {
            Ok(name) => name.parse::<Tz>().map_err(|e| ConfigError::InvalidValue {
                key: "TRIAGE_TIMEZONE".into(),
                message: e.to_string(),
            })?,
            Err(_) => defaults.timezone,
        };

        let calendar_lookahead_days =
            env_parse("TRIAGE_CALENDAR_DAYS")?.unwrap_or(defaults.calendar_lookahead_days);
        let batch_delay = env_parse::<u64>("TRIAGE_BATCH_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.batch_delay);

        Ok(Self {
            self_addresses,
            timezone,
            calendar_lookahead_days,
            contact_scan_limit: defaults.contact_scan_limit,
            batch_delay,
        })
    }
}

/// Correspondence resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub batch_size: usize,
    /// Delay before each contact inside a batch.
    pub stagger: Duration,
    /// Delay between batches.
    pub batch_pause: Duration,
    /// When set, pace mail searches with a token bucket at this rate
    /// instead of the fixed delays.
    pub rate_per_sec: Option<f64>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            stagger: Duration::from_millis(200),
            batch_pause: Duration::from_millis(2000),
            rate_per_sec: None,
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let batch_size: usize = env_parse("RESOLVER_BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RESOLVER_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        let rate_per_sec: Option<f64> = env_parse("RESOLVER_RATE_PER_SEC")?;
        if let Some(rate) = rate_per_sec
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(ConfigError::InvalidValue {
                key: "RESOLVER_RATE_PER_SEC".into(),
                message: "must be a positive number".into(),
            });
        }
        Ok(Self {
            batch_size,
            stagger: env_parse::<u64>("RESOLVER_STAGGER_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.stagger),
            batch_pause: env_parse::<u64>("RESOLVER_BATCH_PAUSE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_pause),
            rate_per_sec,
        })
    }
}

/// The production pacer for these settings.
pub fn fixed_pacer(triage: &TriageConfig, resolver: &ResolverConfig) -> FixedPacer {
    FixedPacer {
        stagger: resolver.stagger,
        batch_pause: resolver.batch_pause,
        between_emails: triage.batch_delay,
    }
}

/// The pacer for these settings: a token bucket bursting up to one batch
/// when a rate is configured, fixed delays otherwise.
pub fn pacer(triage: &TriageConfig, resolver: &ResolverConfig) -> Arc<dyn Pacer> {
    match resolver.rate_per_sec {
        Some(rate) => {
            let capacity = u32::try_from(resolver.batch_size).unwrap_or(u32::MAX);
            Arc::new(TokenBucket::new(capacity, rate))
        }
        None => Arc::new(fixed_pacer(triage, resolver)),
    }
}

/// Where the local database lives.
pub fn database_path() -> String {
    std::env::var("TRIAGE_DB_PATH").unwrap_or_else(|_| "./data/triage.db".to_string())
}

/// Parse an optional env var. Unset is `None`; set but unparsable is an error.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::PaceKind;

    #[test]
    fn defaults_match_documented_values() {
        let triage = TriageConfig::default();
        assert_eq!(triage.calendar_lookahead_days, 7);
        assert_eq!(triage.contact_scan_limit, 50);
        assert_eq!(triage.batch_delay, Duration::from_secs(1));

        let resolver = ResolverConfig::default();
        assert_eq!(resolver.batch_size, 5);
        assert_eq!(resolver.stagger, Duration::from_millis(200));
        assert_eq!(resolver.batch_pause, Duration::from_millis(2000));
    }

    #[test]
    fn pacer_uses_configured_delays() {
        let pacer = fixed_pacer(&TriageConfig::default(), &ResolverConfig::default());
        assert_eq!(pacer.between_emails, Duration::from_secs(1));
        assert_eq!(pacer.batch_pause, Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn configured_rate_selects_token_bucket() {
        let resolver = ResolverConfig {
            batch_size: 2,
            rate_per_sec: Some(0.5),
            ..ResolverConfig::default()
        };
        let pacer = pacer(&TriageConfig::default(), &resolver);
        let start = tokio::time::Instant::now();
        pacer.pause(PaceKind::Stagger).await;
        pacer.pause(PaceKind::Stagger).await;
        assert!(start.elapsed() < Duration::from_millis(10));
        pacer.pause(PaceKind::BatchPause).await;
        assert!(start.elapsed() >= Duration::from_millis(1990));
    }

    #[tokio::test(start_paused = true)]
    async fn no_rate_keeps_fixed_delays() {
        let pacer = pacer(&TriageConfig::default(), &ResolverConfig::default());
        let start = tokio::time::Instant::now();
        pacer.pause(PaceKind::Stagger).await;
        pacer.pause(PaceKind::Stagger).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn env_parse_unset_is_none() {
        let parsed: Option<u32> = env_parse("INBOX_TRIAGE_TEST_SURELY_UNSET").unwrap();
        assert!(parsed.is_none());
    }
}
