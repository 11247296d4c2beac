//! Bearer tokens for the Blob service.
//!
//! - [`ManagedIdentitySource`]: the instance metadata service (IMDS), system
//!   assigned or user assigned via client id
//! - [`StaticTokenSource`]: a token handed in from outside
//!   (`AZURE_STORAGE_BEARER_TOKEN`)
//!
//! [`CachedCredential`] sits in front of either and reuses a token until it
//! is within [`REFRESH_MARGIN`] of its expiry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use replicator_core::ports::Clock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AzureError;

/// Default IMDS address.
pub const IMDS_BASE_URL: &str = "http://169.254.169.254";

const IMDS_API_VERSION: &str = "2018-02-01";

/// Audience of Blob service tokens.
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

pub const BEARER_TOKEN_ENV: &str = "AZURE_STORAGE_BEARER_TOKEN";

/// Tokens closer than this to expiry are fetched again.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Somewhere a fresh token can be fetched from.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, AzureError>;
}

/// Token from the instance metadata service.
pub struct ManagedIdentitySource {
    client: reqwest::Client,
    base_url: String,
    client_id: Option<String>,
}

impl ManagedIdentitySource {
    pub fn new(client: reqwest::Client, client_id: Option<String>) -> Self {
        Self::with_base_url(client, IMDS_BASE_URL, client_id)
    }

    /// Point at another metadata endpoint, e.g. a local mock.
    pub fn with_base_url(
        client: reqwest::Client,
        base_url: &str,
        client_id: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id,
        }
    }

    fn token_url(&self) -> String {
        let mut url = format!(
            "{}/metadata/identity/oauth2/token?api-version={IMDS_API_VERSION}&resource={STORAGE_RESOURCE}",
            self.base_url
        );
        if let Some(client_id) = &self.client_id {
            url.push_str("&client_id=");
            url.push_str(client_id);
        }
        url
    }
}

#[derive(Deserialize)]
struct ImdsToken {
    access_token: String,
    /// Unix seconds. IMDS sends a string, some emulators a number.
    expires_on: serde_json::Value,
}

impl ImdsToken {
    fn into_access_token(self) -> Result<AccessToken, AzureError> {
        let seconds = match &self.expires_on {
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        };
        let expires_at = seconds
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
            .ok_or_else(|| AzureError::Malformed {
                operation: "managed identity token",
                detail: format!("bad expires_on `{}`", self.expires_on),
            })?;
        Ok(AccessToken {
            secret: self.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenSource for ManagedIdentitySource {
    async fn fetch(&self) -> Result<AccessToken, AzureError> {
        const OPERATION: &str = "managed identity token";
        let resp = self
            .client
            .get(self.token_url())
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|source| AzureError::Credential(format!("{OPERATION}: {source}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|source| AzureError::Credential(format!("{OPERATION}: {source}")))?;
        if !status.is_success() {
            return Err(AzureError::Credential(format!(
                "{OPERATION}: HTTP {status}: {body}"
            )));
        }
        let token: ImdsToken = serde_json::from_str(&body).map_err(|e| AzureError::Malformed {
            operation: OPERATION,
            detail: e.to_string(),
        })?;
        token.into_access_token()
    }
}

/// A token that never changes. Expiry is unknown, so it is treated as
/// never expiring.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// `None` if the variable is unset or empty.
    pub fn from_env() -> Option<Self> {
        std::env::var(BEARER_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<AccessToken, AzureError> {
        Ok(AccessToken {
            secret: self.token.clone(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        })
    }
}

/// Caches the last token of a [`TokenSource`]. Concurrent callers share a
/// single fetch.
pub struct CachedCredential {
    source: Box<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<AccessToken>>,
}

impl CachedCredential {
    pub fn new(source: Box<dyn TokenSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, fetching a new one if needed.
    pub async fn bearer(&self) -> Result<String, AzureError> {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now();
        if let Some(token) = cached.as_ref() {
            if !needs_refresh(token, now) {
                return Ok(token.secret.clone());
            }
        }
        let token = self.source.fetch().await?;
        debug!(expires_at = %token.expires_at, "bearer token fetched");
        let secret = token.secret.clone();
        *cached = Some(token);
        Ok(secret)
    }
}

fn needs_refresh(token: &AccessToken, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(REFRESH_MARGIN) {
        Ok(margin) => match now.checked_add_signed(margin) {
            Some(threshold) => threshold >= token.expires_at,
            None => true,
        },
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicator_core::ports::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        fetches: Arc<AtomicUsize>,
        lifetime: chrono::Duration,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self) -> Result<AccessToken, AzureError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                secret: format!("token-{n}"),
                expires_at: self.clock.now() + self.lifetime,
            })
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn token_is_reused_until_near_expiry() {
        let clock = Arc::new(ManualClock::new(start()));
        let fetches = Arc::new(AtomicUsize::new(0));
        let credential = CachedCredential::new(
            Box::new(CountingSource {
                fetches: fetches.clone(),
                lifetime: chrono::Duration::hours(1),
                clock: clock.clone(),
            }),
            clock.clone(),
        );

        assert_eq!(credential.bearer().await.unwrap(), "token-0");
        clock.advance(Duration::from_secs(50 * 60));
        assert_eq!(credential.bearer().await.unwrap(), "token-0");

        // inside the five minute margin
        clock.advance(Duration::from_secs(6 * 60));
        assert_eq!(credential.bearer().await.unwrap(), "token-1");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn static_token_never_refreshes() {
        let clock = Arc::new(ManualClock::new(start()));
        let credential =
            CachedCredential::new(Box::new(StaticTokenSource::new("fixed")), clock.clone());
        assert_eq!(credential.bearer().await.unwrap(), "fixed");
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(credential.bearer().await.unwrap(), "fixed");
    }

    #[test]
    fn imds_expiry_accepts_string_or_number() {
        let from_string: ImdsToken =
            serde_json::from_str(r#"{"access_token":"t","expires_on":"1704110400"}"#).unwrap();
        let from_number: ImdsToken =
            serde_json::from_str(r#"{"access_token":"t","expires_on":1704110400}"#).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(from_string.into_access_token().unwrap().expires_at, expected);
        assert_eq!(from_number.into_access_token().unwrap().expires_at, expected);

        let bad: ImdsToken =
            serde_json::from_str(r#"{"access_token":"t","expires_on":"soon"}"#).unwrap();
        assert!(matches!(
            bad.into_access_token(),
            Err(AzureError::Malformed { .. })
        ));
    }

    #[test]
    fn token_url_carries_client_id() {
        let source = ManagedIdentitySource::with_base_url(
            reqwest::Client::new(),
            "http://localhost:9999/",
            Some("abc-123".into()),
        );
        assert_eq!(
            source.token_url(),
            "http://localhost:9999/metadata/identity/oauth2/token?api-version=2018-02-01\
             &resource=https://storage.azure.com/&client_id=abc-123"
        );
    }

    #[test]
    fn access_token_debug_is_redacted() {
        let token = AccessToken {
            secret: "eyJhbGciOi".into(),
            expires_at: start(),
        };
        assert!(!format!("{token:?}").contains("eyJhbGciOi"));
    }
}
