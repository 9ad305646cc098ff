//! Session configuration.
//!
//! Defaults reproduce the observed client behavior: 1 s save debounce, one
//! fixed 5 s retry per failed save, a 10 s dirty sweep, a 30 s keepalive and
//! a fixed 5 s reconnect delay that retries forever.

use std::time::Duration;

/// Delay schedule for a repeated operation (reconnect, save retry).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor per attempt (1.0 = fixed delay)
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Attempts before giving up (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Same delay every time, no attempt limit.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            max_attempts: None,
        }
    }

    /// Doubling delay capped at `max_delay`, at most `max_attempts` tries.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            multiplier: 2.0,
            max_delay,
            max_attempts: Some(max_attempts),
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// attempt limit is reached.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Some(Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(5000))
    }
}

/// Sync session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Message router WebSocket URL
    pub router_url: String,
    /// Router realm
    pub realm: String,
    /// Storage service base URL
    pub api_url: String,
    /// Quiet period after the last mutation before saving
    pub debounce: Duration,
    /// Retry schedule for failed saves
    pub save_retry: RetryPolicy,
    /// Interval of the dirty-state safety sweep; zero disables it
    pub sweep_interval: Duration,
    /// Interval between keepalive pings while connected; zero disables them
    pub keepalive_interval: Duration,
    /// Reconnect schedule after the connection closes
    pub reconnect: RetryPolicy,
    /// Deadline for opening a router connection
    pub open_timeout: Duration,
    /// Deadline for router requests (subscribe)
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            router_url: "ws://localhost:8080/ws".to_string(),
            realm: "realm1".to_string(),
            api_url: "http://localhost:8000".to_string(),
            debounce: Duration::from_millis(1000),
            save_retry: RetryPolicy::default(),
            sweep_interval: Duration::from_millis(10_000),
            keepalive_interval: Duration::from_millis(30_000),
            reconnect: RetryPolicy::default(),
            open_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Keys: `WAMP_URL`, `WAMP_REALM`, `API_URL`, and millisecond timings
    /// `COEDIT_DEBOUNCE_MS`, `COEDIT_SAVE_RETRY_MS`, `COEDIT_SWEEP_MS`,
    /// `COEDIT_KEEPALIVE_MS`, `COEDIT_RECONNECT_MS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("WAMP_URL") {
            config.router_url = url;
        }
        if let Some(realm) = lookup("WAMP_REALM") {
            config.realm = realm;
        }
        if let Some(url) = lookup("API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }

        let millis = |key: &'static str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|_| ConfigError::InvalidNumber { key, value: raw })
                })
                .transpose()
        };

        if let Some(d) = millis("COEDIT_DEBOUNCE_MS")? {
            config.debounce = d;
        }
        if let Some(d) = millis("COEDIT_SAVE_RETRY_MS")? {
            config.save_retry = RetryPolicy::fixed(d);
        }
        if let Some(d) = millis("COEDIT_SWEEP_MS")? {
            config.sweep_interval = nonzero("COEDIT_SWEEP_MS", d)?;
        }
        if let Some(d) = millis("COEDIT_KEEPALIVE_MS")? {
            config.keepalive_interval = nonzero("COEDIT_KEEPALIVE_MS", d)?;
        }
        if let Some(d) = millis("COEDIT_RECONNECT_MS")? {
            config.reconnect = RetryPolicy::fixed(d);
        }
        Ok(config)
    }
}

/// Periods re-arm from the moment they fire, so zero would fire continuously.
fn nonzero(key: &'static str, interval: Duration) -> Result<Duration, ConfigError> {
    if interval.is_zero() {
        return Err(ConfigError::ZeroInterval { key });
    }
    Ok(interval)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a whole number of milliseconds, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} is a period and must be greater than zero")]
    ZeroInterval { key: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.router_url, "ws://localhost:8080/ws");
        assert_eq!(config.realm, "realm1");
        assert_eq!(config.debounce, Duration::from_millis(1000));
        assert_eq!(config.sweep_interval, Duration::from_millis(10_000));
        assert_eq!(config.keepalive_interval, Duration::from_millis(30_000));
        assert_eq!(config.reconnect.delay_for(0), Some(Duration::from_millis(5000)));
        assert_eq!(config.save_retry.delay_for(0), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_fixed_policy_never_grows_or_stops() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5000));
        for attempt in [0, 1, 10, 1_000, u32::MAX] {
            assert_eq!(policy.delay_for(attempt), Some(Duration::from_millis(5000)));
        }
    }

    #[test]
    fn test_exponential_policy() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1), 5);
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(5), None);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WAMP_URL", "ws://router:9000/ws"),
            ("WAMP_REALM", "editor"),
            ("API_URL", "http://api:8000/"),
            ("COEDIT_DEBOUNCE_MS", "250"),
            ("COEDIT_RECONNECT_MS", "0"),
        ]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.router_url, "ws://router:9000/ws");
        assert_eq!(config.realm, "editor");
        assert_eq!(config.api_url, "http://api:8000");
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.reconnect.delay_for(7), Some(Duration::ZERO));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = SyncConfig::from_lookup(|k| (k == "COEDIT_SWEEP_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                key: "COEDIT_SWEEP_MS",
                value: "soon".into()
            }
        );
    }

    #[test]
    fn test_from_lookup_rejects_zero_periods() {
        for key in ["COEDIT_SWEEP_MS", "COEDIT_KEEPALIVE_MS"] {
            let err = SyncConfig::from_lookup(|k| (k == key).then(|| "0".to_string())).unwrap_err();
            assert_eq!(err, ConfigError::ZeroInterval { key });
        }
        // One-shot delays may be zero
        let config = SyncConfig::from_lookup(|k| (k == "COEDIT_DEBOUNCE_MS").then(|| "0".to_string())).unwrap();
        assert_eq!(config.debounce, Duration::ZERO);
    }
}
