//! Environment-driven configuration.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::poller::BackoffSchedule;
use crate::retry::TransientRetry;
use crate::types::TaskKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidVar { name: String, reason: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider_url: String,
    pub provider_login: String,
    pub provider_password: String,
    pub listen_addr: String,
    /// Per-call network timeout, distinct from the poll budgets.
    pub call_timeout: Duration,
    pub poll_max_requests: usize,
    pub poll_window: Duration,
    pub volume_budget: Duration,
    pub related_budget: Duration,
    pub trends_budget: Duration,
    pub backoff_schedule: BackoffSchedule,
    pub cache_ttl: Duration,
    pub trends_cache_ttl: Duration,
    pub cache_capacity: u64,
    /// Pending entries older than this many largest-budgets are reaped.
    pub pending_stale_factor: u32,
    pub transient_attempts: u32,
    /// Extra time a caller waits beyond the poll budget before giving up.
    pub deadline_grace: Duration,
    pub maintenance_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_url: "https://api.dataforseo.com/v3".to_string(),
            provider_login: String::new(),
            provider_password: String::new(),
            listen_addr: "0.0.0.0:5000".to_string(),
            call_timeout: Duration::from_secs(10),
            poll_max_requests: 600,
            poll_window: Duration::from_secs(60),
            volume_budget: Duration::from_secs(8),
            related_budget: Duration::from_secs(8),
            trends_budget: Duration::from_secs(30),
            backoff_schedule: BackoffSchedule::default(),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            trends_cache_ttl: Duration::from_secs(6 * 60 * 60),
            cache_capacity: 10_000,
            pending_stale_factor: 4,
            transient_attempts: 3,
            deadline_grace: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_var(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_var(lookup, name, default.as_secs()).map(Duration::from_secs)
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset or blank variables keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let backoff_schedule = match lookup("KEYWORD_BACKOFF_SCHEDULE_MS") {
            Some(raw) if !raw.trim().is_empty() => BackoffSchedule::parse_millis(&raw)?,
            _ => defaults.backoff_schedule.clone(),
        };
        let config = Self {
            provider_url: parse_var(&lookup, "KEYWORD_PROVIDER_URL", defaults.provider_url)?,
            provider_login: parse_var(&lookup, "KEYWORD_PROVIDER_LOGIN", defaults.provider_login)?,
            provider_password: parse_var(
                &lookup,
                "KEYWORD_PROVIDER_PASSWORD",
                defaults.provider_password,
            )?,
            listen_addr: parse_var(&lookup, "KEYWORD_LISTEN_ADDR", defaults.listen_addr)?,
            call_timeout: parse_millis(&lookup, "KEYWORD_CALL_TIMEOUT_MS", defaults.call_timeout)?,
            poll_max_requests: parse_var(
                &lookup,
                "KEYWORD_POLL_MAX_REQUESTS",
                defaults.poll_max_requests,
            )?,
            poll_window: parse_millis(&lookup, "KEYWORD_POLL_WINDOW_MS", defaults.poll_window)?,
            volume_budget: parse_millis(&lookup, "KEYWORD_VOLUME_BUDGET_MS", defaults.volume_budget)?,
            related_budget: parse_millis(
                &lookup,
                "KEYWORD_RELATED_BUDGET_MS",
                defaults.related_budget,
            )?,
            trends_budget: parse_millis(&lookup, "KEYWORD_TRENDS_BUDGET_MS", defaults.trends_budget)?,
            backoff_schedule,
            cache_ttl: parse_secs(&lookup, "KEYWORD_CACHE_TTL_SECS", defaults.cache_ttl)?,
            trends_cache_ttl: parse_secs(
                &lookup,
                "KEYWORD_TRENDS_CACHE_TTL_SECS",
                defaults.trends_cache_ttl,
            )?,
            cache_capacity: parse_var(&lookup, "KEYWORD_CACHE_CAPACITY", defaults.cache_capacity)?,
            pending_stale_factor: parse_var(
                &lookup,
                "KEYWORD_PENDING_STALE_FACTOR",
                defaults.pending_stale_factor,
            )?,
            transient_attempts: parse_var(
                &lookup,
                "KEYWORD_TRANSIENT_ATTEMPTS",
                defaults.transient_attempts,
            )?,
            deadline_grace: defaults.deadline_grace,
            maintenance_interval: defaults.maintenance_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.provider_url).map_err(|e| ConfigError::InvalidVar {
            name: "KEYWORD_PROVIDER_URL".into(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidVar {
                name: "KEYWORD_PROVIDER_URL".into(),
                reason: "must use http or https".into(),
            });
        }
        if self.poll_max_requests == 0 {
            return Err(ConfigError::Invalid("poll_max_requests must be greater than 0".into()));
        }
        if self.poll_window.is_zero() {
            return Err(ConfigError::Invalid("poll_window must be greater than 0".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid("call_timeout must be greater than 0".into()));
        }
        for (name, budget) in [
            ("volume_budget", self.volume_budget),
            ("related_budget", self.related_budget),
            ("trends_budget", self.trends_budget),
        ] {
            if budget.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.pending_stale_factor == 0 {
            return Err(ConfigError::Invalid(
                "pending_stale_factor must be greater than 0".into(),
            ));
        }
        if self.transient_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transient_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Poll budget for one ticket of `kind`.
    pub fn budget_for(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::SearchVolume => self.volume_budget,
            TaskKind::RelatedKeywords => self.related_budget,
            TaskKind::Trends => self.trends_budget,
        }
    }

    pub fn ttl_for(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::SearchVolume | TaskKind::RelatedKeywords => self.cache_ttl,
            TaskKind::Trends => self.trends_cache_ttl,
        }
    }

    /// Age after which a pending entry, parked or not, is considered
    /// abandoned and replaced by a fresh submission.
    pub fn stale_pending_after(&self) -> Duration {
        let largest = self
            .volume_budget
            .max(self.related_budget)
            .max(self.trends_budget);
        largest * self.pending_stale_factor
    }

    pub fn transient_retry(&self) -> TransientRetry {
        TransientRetry {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_attempts: self.transient_attempts,
            call_timeout: self.call_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.volume_budget, Duration::from_secs(8));
        assert_eq!(config.trends_budget, Duration::from_secs(30));
        assert_eq!(config.stale_pending_after(), Duration::from_secs(120));
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("KEYWORD_POLL_MAX_REQUESTS", "20"),
            ("KEYWORD_POLL_WINDOW_MS", "60000"),
            ("KEYWORD_BACKOFF_SCHEDULE_MS", "250, 500,1000"),
            ("KEYWORD_TRENDS_BUDGET_MS", ""),
        ]))
        .unwrap();
        assert_eq!(config.poll_max_requests, 20);
        assert_eq!(config.backoff_schedule.delay(0), Duration::from_millis(250));
        assert_eq!(config.backoff_schedule.delay(9), Duration::from_secs(1));
        assert_eq!(config.trends_budget, Duration::from_secs(30));
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = EngineConfig::from_lookup(lookup(&[("KEYWORD_CALL_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { ref name, .. } if name == "KEYWORD_CALL_TIMEOUT_MS"));
    }

    #[test]
    fn rejects_zero_limiter_capacity() {
        assert!(EngineConfig::from_lookup(lookup(&[("KEYWORD_POLL_MAX_REQUESTS", "0")])).is_err());
    }

    #[test]
    fn rejects_non_http_provider_url() {
        assert!(
            EngineConfig::from_lookup(lookup(&[("KEYWORD_PROVIDER_URL", "ftp://example.com")]))
                .is_err()
        );
    }

    #[test]
    fn budgets_and_ttls_follow_kind() {
        let config = EngineConfig::default();
        assert!(config.budget_for(TaskKind::Trends) > config.budget_for(TaskKind::SearchVolume));
        assert!(config.ttl_for(TaskKind::Trends) < config.ttl_for(TaskKind::RelatedKeywords));
    }
}
