//! Recorder configuration from CLI flags and environment.

use std::time::Duration;

use clap::Parser;

use crate::feed::{connection::ConnectionConfig, session::SessionConfig};

pub const DEFAULT_FEED_URL: &str = "wss://masterswift-beta.mastertrust.co.in/ws/v1/feeds";

#[derive(Parser, Debug, Clone)]
#[command(name = "ltp-recorder")]
#[command(about = "Record last traded prices from a binary market-data feed")]
pub struct RecorderConfig {
    /// Streaming endpoint (the token is appended as a query parameter)
    #[arg(long, env = "LTP_FEED_URL", default_value = DEFAULT_FEED_URL)]
    pub feed_url: String,

    /// Instrument list (JSON object keyed by segment)
    #[arg(long, env = "LTP_INSTRUMENTS", default_value = "instruments.json")]
    pub instruments: String,

    /// Segment key to subscribe
    #[arg(long, env = "LTP_SEGMENT", default_value = "NSE-OTH")]
    pub segment: String,

    /// SQLite file holding the last-price table
    #[arg(long, env = "LTP_TABLE_DB", default_value = "marketdata.db")]
    pub table_db: String,

    #[arg(long, env = "LTP_HEARTBEAT_SECS", default_value = "10")]
    pub heartbeat_secs: u64,

    #[arg(long, env = "LTP_SNAPSHOT_SECS", default_value = "20")]
    pub snapshot_secs: u64,

    /// Max ticks awaiting the next snapshot before frames are rejected
    #[arg(long, env = "LTP_BUFFER_CAPACITY", default_value = "1000000")]
    pub buffer_capacity: usize,

    /// Stop in ERROR on the first transport fault instead of reconnecting
    #[arg(long, env = "LTP_NO_RECONNECT")]
    pub no_reconnect: bool,

    #[arg(long, env = "LTP_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: Option<u32>,

    #[arg(long, env = "LTP_BACKOFF_BASE_MS", default_value = "500")]
    pub backoff_base_ms: u64,

    #[arg(long, env = "LTP_BACKOFF_MAX_MS", default_value = "30000")]
    pub backoff_max_ms: u64,

    /// Pre-issued access token
    #[arg(long, env = "LTP_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long, env = "LTP_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "LTP_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// OAuth2 token endpoint for the client-credentials grant
    #[arg(long, env = "LTP_TOKEN_URL")]
    pub token_url: Option<String>,
}

/// Client-credentials settings, present only when all three are configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl RecorderConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_secs.max(1))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: self.heartbeat_interval(),
            reconnect: !self.no_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms.max(self.backoff_base_ms),
            ..SessionConfig::default()
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            feed_url: self.feed_url.clone(),
            session: self.session_config(),
        }
    }

    pub fn oauth_client(&self) -> Option<OAuthClient> {
        match (&self.token_url, &self.client_id, &self.client_secret) {
            (Some(token_url), Some(client_id), Some(client_secret)) => Some(OAuthClient {
                token_url: token_url.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecorderConfig::try_parse_from(["ltp-recorder"]).unwrap();

        assert_eq!(config.feed_url, DEFAULT_FEED_URL);
        assert_eq!(config.segment, "NSE-OTH");
        assert_eq!(config.buffer_capacity, 1_000_000);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.snapshot_interval(), Duration::from_secs(20));

        let session = config.session_config();
        assert!(session.reconnect);
        assert_eq!(session.backoff_base_ms, 500);
        assert_eq!(session.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_flags_override() {
        let config = RecorderConfig::try_parse_from([
            "ltp-recorder",
            "--no-reconnect",
            "--heartbeat-secs",
            "3",
            "--token",
            "abc",
        ])
        .unwrap();

        assert!(!config.session_config().reconnect);
        assert_eq!(config.session_config().heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_oauth_client_needs_all_fields() {
        let partial = RecorderConfig::try_parse_from([
            "ltp-recorder",
            "--client-id",
            "id",
            "--token-url",
            "https://auth.example/token",
        ])
        .unwrap();
        assert_eq!(partial.oauth_client(), None);

        let full = RecorderConfig::try_parse_from([
            "ltp-recorder",
            "--client-id",
            "id",
            "--client-secret",
            "secret",
            "--token-url",
            "https://auth.example/token",
        ])
        .unwrap();
        assert_eq!(full.oauth_client().unwrap().client_id, "id");
    }
}
