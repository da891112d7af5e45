//! Gavel Settings

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Complete settings for Gavel
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GavelSettings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub hot_state: HotStateSettings,
    pub events: EventSettings,
    pub bidding: BiddingSettings,
    pub scheduler: SchedulerSettings,
    pub sessions: SessionSettings,
}

impl GavelSettings {
    /// Parse settings from a TOML document. Missing sections keep defaults.
    pub fn from_toml(doc: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(doc)
    }

    /// Apply environment overrides (`GAVEL_*`) on top of the current values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = env::var("GAVEL_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = env::var("GAVEL_STORE_URL") {
            self.store.url = v;
        }
        if let Ok(v) = env::var("GAVEL_SIGNING_KEY") {
            self.sessions.signing_key = v;
        }
        if let Some(v) = env_parse("GAVEL_BID_RATE_LIMIT") {
            self.bidding.rate_limit = v;
        }
        if let Some(v) = env_parse("GAVEL_BID_RATE_WINDOW_SECS") {
            self.bidding.rate_window_secs = v;
        }
        if let Some(v) = env_parse("GAVEL_MAX_BID_AMOUNT") {
            self.bidding.max_bid_amount = v;
        }
        if let Some(v) = env_parse("GAVEL_SCHEDULER_TICK_SECS") {
            self.scheduler.tick_secs = v;
        }
        if let Some(v) = env_parse("GAVEL_CONNECTION_INFLIGHT_CAP") {
            self.server.connection_inflight_cap = v;
        }
        if let Some(v) = env_parse("GAVEL_SESSION_TTL_SECS") {
            self.sessions.ttl_secs = v;
        }
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Listener and per-connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
    /// Max client messages being processed concurrently on one connection.
    pub connection_inflight_cap: usize,
    /// Outbound frames buffered per subscriber before it is dropped as slow.
    pub outbound_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8090".to_string(),
            connection_inflight_cap: 10,
            outbound_buffer: 64,
        }
    }
}

/// Durable store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:gavel.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

/// Derived-cache TTLs and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotStateSettings {
    pub highest_ttl_secs: u64,
    pub history_len: usize,
    pub history_ttl_secs: u64,
}

impl Default for HotStateSettings {
    fn default() -> Self {
        Self {
            highest_ttl_secs: 3600,
            history_len: 50,
            history_ttl_secs: 7 * 24 * 3600,
        }
    }
}

/// Event queue behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// How long a pulled message stays invisible before redelivery.
    pub visibility_timeout_secs: u64,
    /// Deliveries after which a message is dead-lettered.
    pub max_attempts: u32,
    /// Consumer poll interval when the queue is empty.
    pub poll_interval_ms: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 30,
            max_attempts: 8,
            poll_interval_ms: 250,
        }
    }
}

/// Bid acceptance limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiddingSettings {
    /// Bids admitted per user per auction within one rate window.
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub max_bid_amount: Decimal,
    /// Bounded internal retries for the transient store error class.
    pub commit_retries: u32,
}

impl Default for BiddingSettings {
    fn default() -> Self {
        Self {
            rate_limit: 5,
            rate_window_secs: 30,
            max_bid_amount: Decimal::from(100_000_000),
            commit_retries: 3,
        }
    }
}

/// Auction lifecycle sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { tick_secs: 30 }
    }
}

/// Session tokens and presence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub signing_key: String,
    pub ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            signing_key: "change-me".to_string(),
            ttl_secs: 7200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let settings = GavelSettings::default();
        assert_eq!(settings.bidding.rate_limit, 5);
        assert_eq!(settings.bidding.rate_window_secs, 30);
        assert_eq!(settings.server.connection_inflight_cap, 10);
        assert_eq!(settings.scheduler.tick_secs, 30);
        assert_eq!(settings.sessions.ttl_secs, 7200);
        assert_eq!(settings.hot_state.history_len, 50);
    }

    #[test]
    fn toml_overrides_single_section() {
        let settings = GavelSettings::from_toml(
            r#"
            [server]
            listen_addr = "0.0.0.0:9000"

            [bidding]
            rate_limit = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(settings.bidding.rate_limit, 3);
        // untouched sections keep defaults
        assert_eq!(settings.scheduler.tick_secs, 30);
    }
}
