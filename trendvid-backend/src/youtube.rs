//! YouTube OAuth2 access tokens
//!
//! The upload script receives a fresh access token through the environment;
//! the refresh token never leaves this process.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::YoutubeCredentials;
use crate::error::{Error, Result};
use crate::http_retry::{is_retryable_status, BackoffManager};

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

pub struct TokenRefresher {
    client: reqwest::Client,
    credentials: YoutubeCredentials,
    token_url: String,
    cached: Mutex<Option<CachedToken>>,
    backoff: BackoffManager,
}

impl TokenRefresher {
    pub fn new(credentials: YoutubeCredentials) -> Self {
        Self::with_token_url(credentials, TOKEN_URL)
    }

    pub fn with_token_url(credentials: YoutubeCredentials, token_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            credentials,
            token_url: token_url.to_string(),
            cached: Mutex::new(None),
            backoff: BackoffManager::new(),
        }
    }

    /// A valid access token, refreshed when missing or about to expire
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .backoff
            .run("youtube-oauth", || self.request_token())
            .await?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(EXPIRY_MARGIN);
        log::info!(
            "[YOUTUBE] Access token refreshed, valid for {}s",
            response.expires_in
        );

        *cached = Some(CachedToken {
            access_token: response.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    /// Drop the cached token (e.g. after the API rejected it)
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn request_token(&self) -> Result<TokenResponse> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", self.credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let resp = self.client.post(&self.token_url).form(&params).send().await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp.json::<TokenResponse>().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<TokenError>(&body) {
            Ok(e) => match e.error_description {
                Some(desc) => format!("{}: {}", e.error, desc),
                None => e.error,
            },
            Err(_) => body,
        };

        if is_retryable_status(status.as_u16()) {
            // Leading status code marks this as retryable for the backoff
            Err(Error::Other(format!("{} token refresh: {}", status.as_u16(), detail)))
        } else {
            Err(Error::Config(format!(
                "YouTube token refresh rejected ({}): {}",
                status.as_u16(),
                detail
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> YoutubeCredentials {
        YoutubeCredentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
        }
    }

    #[test]
    fn test_token_response_defaults_expiry() {
        let parsed: TokenResponse = serde_json::from_str(r#"{"access_token":"abc"}"#).unwrap();
        assert_eq!(parsed.access_token, "abc");
        assert_eq!(parsed.expires_in, 3600);
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let refresher = TokenRefresher::with_token_url(credentials(), "http://127.0.0.1:9/token");
        *refresher.cached.lock().await = Some(CachedToken {
            access_token: "cached".to_string(),
            refresh_at: Instant::now() + Duration::from_secs(600),
        });

        assert_eq!(refresher.access_token().await.unwrap(), "cached");

        refresher.invalidate().await;
        assert!(refresher.cached.lock().await.is_none());
    }
}
