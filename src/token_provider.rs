//! Installation-token provider: mints short-lived bot access tokens from an
//! application identity (RSA private key + numeric app id).

use crate::model::InstallationToken;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    #[serde(rename = "expires_at")]
    expires_at: chrono::DateTime<Utc>,
}

struct Inner {
    cached: Option<InstallationToken>,
    installation_id: Option<u64>,
}

/// Mints and caches installation tokens, serialising concurrent refreshes
/// behind a single mutex so at most one mint is ever in flight (§4.4).
pub struct TokenProvider {
    app_id: String,
    encoding_key: EncodingKey,
    api_base: String,
    client: reqwest::Client,
    installation_id: Option<u64>,
    inner: Arc<Mutex<Inner>>,
}

impl TokenProvider {
    pub fn new(app_id: impl Into<String>, private_key_pem: &[u8], installation_id: Option<u64>) -> Result<Self, String> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| format!("invalid RSA private key (expected PKCS#1 or PKCS#8 PEM): {e}"))?;
        Ok(TokenProvider {
            app_id: app_id.into(),
            encoding_key,
            api_base: "https://api.github.com".to_string(),
            client: reqwest::Client::new(),
            installation_id,
            inner: Arc::new(Mutex::new(Inner { cached: None, installation_id })),
        })
    }

    #[cfg(test)]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn build_jwt(&self) -> Result<String, String> {
        let now = Utc::now();
        let claims = Claims {
            iss: self.app_id.clone(),
            iat: (now - ChronoDuration::seconds(60)).timestamp(),
            exp: (now + ChronoDuration::minutes(10)).timestamp(),
        };
        let header = Header::new(Algorithm::RS256);
        encode(&header, &claims, &self.encoding_key).map_err(|e| format!("jwt sign failed: {e}"))
    }

    async fn discover_installation_id(&self, jwt: &str) -> Result<u64, String> {
        let url = format!("{}/app/installations", self.api_base);
        let resp = self
            .client
            .get(url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "campaign-runner")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let installations: Vec<Installation> = resp.json().await.map_err(|e| e.to_string())?;
        installations
            .first()
            .map(|i| i.id)
            .ok_or_else(|| "no installations found for app".to_string())
    }

    async fn exchange_for_token(&self, jwt: &str, installation_id: u64) -> Result<InstallationToken, String> {
        let url = format!("{}/app/installations/{}/access_tokens", self.api_base, installation_id);
        let resp = self
            .client
            .post(url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "campaign-runner")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("token exchange failed: status {}", resp.status()));
        }
        let body: InstallationTokenResponse = resp.json().await.map_err(|e| e.to_string())?;
        Ok(InstallationToken { token: body.token, expires_at: body.expires_at })
    }

    /// Returns a valid token, minting a fresh one if the cached token has
    /// less than 10 minutes of remaining life.
    pub async fn token(&self) -> Result<InstallationToken, String> {
        let mut guard = self.inner.lock().await;
        let now = Utc::now();
        if let Some(cached) = &guard.cached {
            if cached.remaining(now) > ChronoDuration::minutes(10) {
                debug!("campaign_runner::token_provider::token(...): reusing cached token");
                return Ok(cached.clone());
            }
        }

        let jwt = self.build_jwt()?;
        let installation_id = match guard.installation_id.or(self.installation_id) {
            Some(id) => id,
            None => {
                let id = self.discover_installation_id(&jwt).await?;
                guard.installation_id = Some(id);
                id
            }
        };

        match self.exchange_for_token(&jwt, installation_id).await {
            Ok(fresh) => {
                info!("campaign_runner::token_provider::token(...): minted fresh installation token, expires {}", fresh.expires_at);
                guard.cached = Some(fresh.clone());
                Ok(fresh)
            }
            Err(e) => {
                if let Some(cached) = &guard.cached {
                    if cached.remaining(now) > ChronoDuration::zero() {
                        warn!("campaign_runner::token_provider::token(...): refresh failed ({e}), falling back to prior cached token");
                        return Ok(cached.clone());
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = include_str!("../tests/fixtures/test_rsa_key.pem");

    #[test]
    fn builds_jwt_with_expected_claims() {
        let provider = TokenProvider::new("12345", TEST_KEY.as_bytes(), Some(1))
            .expect("valid test key")
            .with_api_base("http://127.0.0.1:0");
        let jwt = provider.build_jwt().expect("jwt should sign");
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
    }
}
