//! Bearer token sources for ARM requests.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Supplies bearer tokens for the resource manager audience.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> ClientResult<String>;
}

/// A pre-issued token, e.g. from `AZURE_ACCESS_TOKEN`.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> ClientResult<String> {
        Ok(self.0.clone())
    }
}

/// OAuth2 client-credentials flow against Microsoft Entra ID.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: Mutex<Option<(String, Instant)>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        authority: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        resource: &str,
    ) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                authority.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: format!("{}/.default", resource.trim_end_matches('/')),
            cached: Mutex::new(None),
        }
    }

    async fn request_token(&self) -> ClientResult<TokenResponse> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let resp = self.http.post(&self.token_url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Auth(format!("token request failed ({status}): {body}")));
        }
        Ok(resp.json::<TokenResponse>().await?)
    }
}

#[async_trait]
impl TokenSource for ClientSecretCredential {
    async fn token(&self) -> ClientResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() + REFRESH_MARGIN < *expires_at {
                return Ok(token.clone());
            }
        }

        let fresh = self.request_token().await?;
        let expires_at = Instant::now() + Duration::from_secs(fresh.expires_in);
        debug!(expires_in = fresh.expires_in, "acquired resource manager token");
        *cached = Some((fresh.access_token.clone(), expires_at));
        Ok(fresh.access_token)
    }
}
