use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::common::error::{NotifyError, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub log_level: String,
    pub max_message_length: usize,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub away_after: Duration,
    pub offline_after: Duration,
    pub presence_sweep_interval: Duration,
    pub presence_sync_interval: Duration,
    pub rate_limit_messages: u32,
    pub rate_limit_window: Duration,
    pub rate_window_ttl: Duration,
    pub rate_cleanup_interval: Duration,
    pub broadcast_timeout: Duration,
    pub stats_log_path: String,
    pub stats_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            database_url: "sqlite:data/ruggine_notify.db".to_string(),
            redis_url: None,
            log_level: "info".to_string(),
            max_message_length: 2048,
            auth_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            away_after: Duration::from_secs(10 * 60),
            offline_after: Duration::from_secs(30 * 60),
            presence_sweep_interval: Duration::from_secs(120),
            presence_sync_interval: Duration::from_secs(60),
            rate_limit_messages: 60,
            rate_limit_window: Duration::from_secs(60),
            rate_window_ttl: Duration::from_secs(60 * 60),
            rate_cleanup_interval: Duration::from_secs(300),
            broadcast_timeout: Duration::from_secs(10),
            stats_log_path: "data/ruggine_notify_stats.log".to_string(),
            stats_interval: Duration::from_secs(120),
        }
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed(key, default.as_secs()))
}

fn minutes(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed(key, default.as_secs() / 60) * 60)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let d = Self::default();

        Self {
            host: env::var("SERVER_HOST").unwrap_or(d.host),
            port: parsed("SERVER_PORT", d.port),
            database_url: env::var("DATABASE_URL").unwrap_or(d.database_url),
            redis_url: env::var("REDIS_URL").ok().filter(|u| !u.trim().is_empty()),
            log_level: env::var("LOG_LEVEL").unwrap_or(d.log_level),
            max_message_length: parsed("MAX_MESSAGE_LENGTH", d.max_message_length),
            auth_timeout: secs("AUTH_TIMEOUT_SECS", d.auth_timeout),
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", d.heartbeat_interval),
            idle_timeout: secs("IDLE_TIMEOUT_SECS", d.idle_timeout),
            away_after: minutes("AWAY_AFTER_MINUTES", d.away_after),
            offline_after: minutes("OFFLINE_AFTER_MINUTES", d.offline_after),
            presence_sweep_interval: secs("PRESENCE_SWEEP_SECS", d.presence_sweep_interval),
            presence_sync_interval: secs("PRESENCE_SYNC_SECS", d.presence_sync_interval),
            rate_limit_messages: parsed("RATE_LIMIT_MESSAGES", d.rate_limit_messages),
            rate_limit_window: secs("RATE_LIMIT_WINDOW_SECS", d.rate_limit_window),
            rate_window_ttl: secs("RATE_WINDOW_TTL_SECS", d.rate_window_ttl),
            rate_cleanup_interval: secs("RATE_CLEANUP_SECS", d.rate_cleanup_interval),
            broadcast_timeout: secs("BROADCAST_TIMEOUT_SECS", d.broadcast_timeout),
            stats_log_path: env::var("STATS_LOG_PATH").unwrap_or(d.stats_log_path),
            stats_interval: secs("STATS_INTERVAL_SECS", d.stats_interval),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit_messages == 0 {
            return Err(NotifyError::Config("RATE_LIMIT_MESSAGES must be greater than zero".into()));
        }
        let intervals = [
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window),
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
            ("IDLE_TIMEOUT_SECS", self.idle_timeout),
            ("PRESENCE_SWEEP_SECS", self.presence_sweep_interval),
            ("PRESENCE_SYNC_SECS", self.presence_sync_interval),
            ("RATE_CLEANUP_SECS", self.rate_cleanup_interval),
            ("BROADCAST_TIMEOUT_SECS", self.broadcast_timeout),
            ("AWAY_AFTER_MINUTES", self.away_after),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(NotifyError::Config(format!("{} must be greater than zero", key)));
        }
        if self.offline_after <= self.away_after {
            return Err(NotifyError::Config(
                "OFFLINE_AFTER_MINUTES must be greater than AWAY_AFTER_MINUTES".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit_messages, 60);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.away_after, Duration::from_secs(600));
        assert_eq!(config.offline_after, Duration::from_secs(1800));
    }

    #[test]
    fn offline_threshold_must_exceed_away_threshold() {
        let config = ServerConfig {
            offline_after: Duration::from_secs(600),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(NotifyError::Config(_))));
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let config = ServerConfig { rate_limit_messages: 0, ..ServerConfig::default() };
        assert!(config.validate().is_err());
    }
}
