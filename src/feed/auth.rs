//! Bearer token providers for the feed connection.
//!
//! The connection asks for a token on every connect attempt, so a provider
//! that caches with expiry hands out a fresh token after reconnects.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;
/// Refresh this long before the server-side expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response has no access_token")]
    MissingToken,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;

    /// Drop any cached token, e.g. after the feed rejected it.
    fn invalidate(&self) {}
}

/// Fixed token supplied by configuration.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AuthProvider for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

/// OAuth2 client-credentials grant with an in-memory token cache.
///
/// A pre-issued token, when given, is used until it is invalidated.
pub struct ClientCredentialsAuth {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsAuth {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        preissued: Option<String>,
    ) -> Self {
        let cached = preissued
            .filter(|t| !t.trim().is_empty())
            .map(|value| CachedToken {
                value,
                expires_at: None,
            });

        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(cached),
        }
    }

    async fn fetch(&self) -> Result<CachedToken, AuthError> {
        let response: TokenResponse = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let value = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let ttl = Duration::from_secs(response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));

        info!(expires_in_secs = ttl.as_secs(), "access token obtained");
        Ok(CachedToken {
            value,
            expires_at: Some(Instant::now() + ttl.saturating_sub(EXPIRY_MARGIN)),
        })
    }
}

#[async_trait]
impl AuthProvider for ClientCredentialsAuth {
    async fn token(&self) -> Result<String, AuthError> {
        let cached = self.cached.lock().clone();
        if let Some(cached) = cached {
            if cached.expires_at.map_or(true, |at| Instant::now() < at) {
                return Ok(cached.value);
            }
        }

        let token = self.fetch().await?;
        let value = token.value.clone();
        *self.cached.lock() = Some(token);
        Ok(value)
    }

    fn invalidate(&self) {
        debug!("cached access token invalidated");
        *self.cached.lock() = None;
    }
}
