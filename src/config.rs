use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:8081";
pub const STATS_INTERVAL_SECS: u64 = 60;

// Upstream Feed Configuration
pub const DEFAULT_KIS_WS_URL: &str = "wss://openapi.koreainvestment.com:9443/websocket";
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// Chart Poller Configuration
pub const DEFAULT_CHART_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_CHART_POLL_WINDOW_MINS: i64 = 10;
pub const MAX_CHART_POLL_WINDOW_MINS: i64 = 7 * 24 * 60;
pub const DEFAULT_TICKER: &str = "005930";

// Data Configuration
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_STOCK_FILE: &str = "./data/stocks.csv";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub approval_key: String,
    pub kis_ws_url: String,
    /// Ticker to connect at startup, if any.
    pub feed_ticker: Option<String>,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub chart_poll_interval_secs: u64,
    pub chart_poll_window_mins: i64,
    pub default_ticker: String,
    pub data_dir: String,
    pub stock_file: String,
    pub log_level: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{}={} is not a valid value, using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            api_bind_address: env_or("API_BIND_ADDRESS", DEFAULT_API_BIND_ADDRESS),
            approval_key: env::var("KIS_APPROVAL_KEY").unwrap_or_default(),
            kis_ws_url: env_or("KIS_WS_URL", DEFAULT_KIS_WS_URL),
            feed_ticker: env::var("FEED_TICKER")
                .ok()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            reconnect_delay_secs: env_parse("RECONNECT_DELAY_SECS", DEFAULT_RECONNECT_DELAY_SECS),
            connect_timeout_secs: env_parse("CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            chart_poll_interval_secs: env_parse("CHART_POLL_INTERVAL_SECS", DEFAULT_CHART_POLL_INTERVAL_SECS),
            chart_poll_window_mins: env_parse("CHART_POLL_WINDOW_MINS", DEFAULT_CHART_POLL_WINDOW_MINS),
            default_ticker: env_or("DEFAULT_TICKER", DEFAULT_TICKER),
            data_dir: env_or("DATA_DIR", DEFAULT_DATA_DIR),
            stock_file: env_or("STOCK_FILE", DEFAULT_STOCK_FILE),
            log_level: env_or("RUST_LOG", "info"),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.approval_key.trim().is_empty() {
            warn!("KIS_APPROVAL_KEY not set - upstream feed connections will be refused");
        }

        if self.bind_address == self.api_bind_address {
            return Err(format!(
                "BIND_ADDRESS and API_BIND_ADDRESS must differ (both {})",
                self.bind_address
            ));
        }

        let durations = [
            ("RECONNECT_DELAY_SECS", self.reconnect_delay_secs as i64),
            ("CONNECT_TIMEOUT_SECS", self.connect_timeout_secs as i64),
            ("CHART_POLL_INTERVAL_SECS", self.chart_poll_interval_secs as i64),
            ("CHART_POLL_WINDOW_MINS", self.chart_poll_window_mins),
        ];
        for (name, value) in durations {
            if value <= 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }

        if self.chart_poll_window_mins > MAX_CHART_POLL_WINDOW_MINS {
            return Err(format!(
                "CHART_POLL_WINDOW_MINS must be at most {} (got {})",
                MAX_CHART_POLL_WINDOW_MINS, self.chart_poll_window_mins
            ));
        }

        if self.default_ticker.trim().is_empty() {
            return Err("DEFAULT_TICKER must not be empty".to_string());
        }

        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn chart_poll_interval(&self) -> Duration {
        Duration::from_secs(self.chart_poll_interval_secs)
    }

    pub fn chart_poll_window(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.chart_poll_window_mins)
            .unwrap_or_else(|| chrono::Duration::minutes(DEFAULT_CHART_POLL_WINDOW_MINS))
    }

    pub fn log_config(&self) {
        info!("Server Configuration:");
        info!("  Bind Address: {}", self.bind_address);
        info!("  API Bind Address: {}", self.api_bind_address);
        info!("  KIS WebSocket URL: {}", self.kis_ws_url);
        info!(
            "  Approval Key: {}",
            if self.approval_key.is_empty() { "<not set>" } else { "***" }
        );
        info!("  Feed Ticker: {}", self.feed_ticker.as_deref().unwrap_or("<none>"));
        info!("  Reconnect Delay: {}s", self.reconnect_delay_secs);
        info!("  Connect Timeout: {}s", self.connect_timeout_secs);
        info!(
            "  Chart Poll: {} every {}s over {} minutes",
            self.default_ticker, self.chart_poll_interval_secs, self.chart_poll_window_mins
        );
        info!("  Data Dir: {}", self.data_dir);
        info!("  Stock File: {}", self.stock_file);
        info!("  Log Level: {}", self.log_level);
    }
}
