//! Synchronization tuning and exchange endpoints.

use std::time::Duration;

use url::Url;

use crate::error::{Result, SyncError};

/// All tuneable parameters for order-book synchronization.
///
/// Use [`Default::default()`] for the reference values and override what you
/// need before handing the config to the [`crate::TrackingManager`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows requested per REST snapshot fetch.
    pub snapshot_depth_limit: usize,
    /// Applied diffs retained per symbol for replay after a snapshot (K).
    pub replay_window_capacity: usize,
    /// Diffs held per symbol before its tracker exists (N).
    pub pending_buffer_capacity: usize,
    /// Silence on the stream before a ping is sent.
    pub ws_read_timeout: Duration,
    /// Time allowed for any frame to arrive after a ping.
    pub ws_pong_timeout: Duration,
    /// Fixed delay before reconnecting and resubscribing.
    pub reconnect_backoff: Duration,
    /// Interval between counter flushes.
    pub stats_interval: Duration,
    /// Interval between forced re-snapshots of a healthy symbol.
    pub full_refresh_interval: Duration,
    /// Deadline for a single REST snapshot request.
    pub rest_timeout: Duration,
    /// First retry delay after a failed snapshot fetch; doubles per failure.
    pub snapshot_retry_backoff: Duration,
    /// Upper bound for the snapshot retry delay.
    pub snapshot_retry_max_backoff: Duration,
    /// Consecutive snapshot failures before a symbol is reported unhealthy.
    pub unhealthy_after_failures: u32,
    /// Pause between initial snapshot fetches when many symbols start at once.
    pub snapshot_pacing: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_depth_limit: 100,
            replay_window_capacity: 1000,
            pending_buffer_capacity: 1000,
            ws_read_timeout: Duration::from_secs(30),
            ws_pong_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
            full_refresh_interval: Duration::from_secs(60 * 60),
            rest_timeout: Duration::from_secs(10),
            snapshot_retry_backoff: Duration::from_secs(1),
            snapshot_retry_max_backoff: Duration::from_secs(60),
            unhealthy_after_failures: 5,
            snapshot_pacing: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_depth_limit == 0 {
            return Err(SyncError::Config("snapshot_depth_limit must be > 0".into()));
        }
        if self.replay_window_capacity == 0 {
            return Err(SyncError::Config(
                "replay_window_capacity must be > 0".into(),
            ));
        }
        if self.pending_buffer_capacity == 0 {
            return Err(SyncError::Config(
                "pending_buffer_capacity must be > 0".into(),
            ));
        }
        let durations = [
            ("ws_read_timeout", self.ws_read_timeout),
            ("ws_pong_timeout", self.ws_pong_timeout),
            ("stats_interval", self.stats_interval),
            ("full_refresh_interval", self.full_refresh_interval),
            ("rest_timeout", self.rest_timeout),
            ("snapshot_retry_backoff", self.snapshot_retry_backoff),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SyncError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.snapshot_retry_max_backoff < self.snapshot_retry_backoff {
            return Err(SyncError::Config(
                "snapshot_retry_max_backoff must be >= snapshot_retry_backoff".into(),
            ));
        }
        Ok(())
    }

    /// Retry delay after `failures` consecutive snapshot failures.
    pub fn snapshot_backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.snapshot_retry_backoff
            .saturating_mul(1u32 << shift)
            .min(self.snapshot_retry_max_backoff)
    }
}

/// REST and WebSocket base URLs for one exchange.
#[derive(Debug, Clone)]
pub struct ExchangeEndpoints {
    /// REST base, e.g. `https://api-pub.bitfinex.com`.
    pub rest_url: String,
    /// WebSocket URL, e.g. `wss://api-pub.bitfinex.com/ws/2`.
    pub ws_url: String,
}

impl ExchangeEndpoints {
    pub fn new(rest_url: &str, ws_url: &str) -> Result<Self> {
        let rest = Url::parse(rest_url)
            .map_err(|e| SyncError::Config(format!("invalid REST url {rest_url}: {e}")))?;
        if !matches!(rest.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "REST url must be http(s): {rest_url}"
            )));
        }
        let ws = Url::parse(ws_url)
            .map_err(|e| SyncError::Config(format!("invalid WebSocket url {ws_url}: {e}")))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(SyncError::Config(format!(
                "WebSocket url must be ws(s): {ws_url}"
            )));
        }
        Ok(Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = SyncConfig {
            pending_buffer_capacity: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pending_buffer_capacity"));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = SyncConfig {
            stats_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_snapshot_backoff_doubles_and_caps() {
        let config = SyncConfig {
            snapshot_retry_backoff: Duration::from_secs(1),
            snapshot_retry_max_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.snapshot_backoff(1), Duration::from_secs(1));
        assert_eq!(config.snapshot_backoff(2), Duration::from_secs(2));
        assert_eq!(config.snapshot_backoff(3), Duration::from_secs(4));
        assert_eq!(config.snapshot_backoff(5), Duration::from_secs(10));
        assert_eq!(config.snapshot_backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn test_endpoints_validate_schemes() {
        let ok = ExchangeEndpoints::new("https://api.example.com/", "wss://ws.example.com/ws/2");
        assert_eq!(ok.unwrap().rest_url, "https://api.example.com");

        assert!(ExchangeEndpoints::new("wss://api.example.com", "wss://ws.example.com").is_err());
        assert!(ExchangeEndpoints::new("https://api.example.com", "https://ws.example.com").is_err());
        assert!(ExchangeEndpoints::new("not a url", "wss://ws.example.com").is_err());
    }
}
