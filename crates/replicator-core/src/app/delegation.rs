//! Delegation provider and the shared, refreshable credential cell.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use super::retry::RetryPolicy;
use crate::config::MAX_DELEGATION_WINDOW_SECS;
use crate::domain::{AccountName, DelegationCredential, ReplicationError, StoreError, ValidityWindow};
use crate::ports::{Clock, DelegationIssuer};

/// Obtains delegation credentials for the identity behind the issuer.
pub struct DelegationProvider {
    issuer: Arc<dyn DelegationIssuer>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    clock_skew: Duration,
}

impl DelegationProvider {
    pub fn new(
        issuer: Arc<dyn DelegationIssuer>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        clock_skew: Duration,
    ) -> Self {
        Self {
            issuer,
            clock,
            retry,
            clock_skew,
        }
    }

    /// Obtain a credential valid from `now - clock_skew` to `now + window`.
    ///
    /// Transient issuer failures are retried. An issuer that answers
    /// unauthorized, or hands out a credential that is already expired,
    /// yields [`ReplicationError::Auth`].
    pub async fn obtain(
        &self,
        account: &AccountName,
        window: Duration,
    ) -> Result<DelegationCredential, ReplicationError> {
        if window.is_zero() || window.as_secs() > MAX_DELEGATION_WINDOW_SECS {
            return Err(ReplicationError::Config(format!(
                "delegation window must be positive and at most 7 days, got {window:?}"
            )));
        }
        let window = chrono::Duration::from_std(window)
            .map_err(|e| ReplicationError::Config(e.to_string()))?;
        let skew = chrono::Duration::from_std(self.clock_skew)
            .map_err(|e| ReplicationError::Config(e.to_string()))?;

        let mut attempt = 1;
        loop {
            let now = self.clock.now();
            let requested = ValidityWindow::new(now - skew, now + window);

            match self.issuer.mint_delegation(account, requested).await {
                Ok(credential) => {
                    if credential.is_expired_at(self.clock.now()) {
                        return Err(ReplicationError::Auth {
                            account: account.clone(),
                            message: format!(
                                "issued credential expired at {}",
                                credential.window.end
                            ),
                        });
                    }
                    info!(
                        account = %account,
                        start = %credential.window.start,
                        end = %credential.window.end,
                        "delegation credential obtained"
                    );
                    return Ok(credential);
                }
                Err(StoreError::Unauthorized(message)) => {
                    return Err(ReplicationError::Auth {
                        account: account.clone(),
                        message,
                    });
                }
                Err(err) if err.is_transient() && self.retry.allows_another(attempt) => {
                    let delay = self.retry.next_delay(attempt);
                    warn!(account = %account, attempt, ?delay, error = %err, "delegation request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(ReplicationError::Delegation(err)),
            }
        }
    }
}

/// A credential together with its position in the replacement sequence.
#[derive(Debug, Clone)]
pub struct VersionedCredential {
    pub version: u64,
    pub credential: DelegationCredential,
}

/// Holds the run's current delegation credential.
///
/// Readers take a snapshot with [`current`](Self::current) before each mint.
/// Replacement goes through [`refresh`](Self::refresh), which is single-flight
/// and version-gated: only a caller that still saw the latest version triggers
/// a request, everyone else gets the replacement that is already there.
pub struct DelegationCell {
    provider: Arc<DelegationProvider>,
    window: Duration,
    current: watch::Sender<Arc<VersionedCredential>>,
    refresh_lock: Mutex<()>,
}

impl DelegationCell {
    pub fn new(
        provider: Arc<DelegationProvider>,
        window: Duration,
        initial: DelegationCredential,
    ) -> Self {
        let (current, _) = watch::channel(Arc::new(VersionedCredential {
            version: 0,
            credential: initial,
        }));
        Self {
            provider,
            window,
            current,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<VersionedCredential> {
        self.current.borrow().clone()
    }

    /// Receiver that observes every replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<VersionedCredential>> {
        self.current.subscribe()
    }

    /// Replace the credential the caller observed as `observed_version`.
    pub async fn refresh(
        &self,
        observed_version: u64,
    ) -> Result<Arc<VersionedCredential>, ReplicationError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current();
        if current.version != observed_version {
            return Ok(current);
        }

        let credential = self
            .provider
            .obtain(&current.credential.account, self.window)
            .await?;
        let next = Arc::new(VersionedCredential {
            version: current.version + 1,
            credential,
        });
        self.current.send_replace(Arc::clone(&next));
        info!(version = next.version, "delegation credential replaced");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryObjectStore;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    fn source() -> AccountName {
        AccountName::new("src").unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryObjectStore>, Arc<DelegationProvider>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryObjectStore::new(clock.clone()));
        store.add_account(&source());
        let provider = Arc::new(DelegationProvider::new(
            store.clone(),
            clock.clone(),
            RetryPolicy::new(Duration::from_millis(100), 2.0, 3),
            Duration::from_secs(300),
        ));
        (clock, store, provider)
    }

    #[tokio::test]
    async fn window_start_is_backdated_by_clock_skew() {
        let (clock, _, provider) = setup();
        let credential = provider
            .obtain(&source(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            credential.window.start,
            clock.now() - chrono::Duration::minutes(5)
        );
        assert_eq!(credential.window.end, clock.now() + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn missing_delegation_rights_is_auth_error() {
        let (_, store, provider) = setup();
        store.deny_delegation(&source());
        let err = provider
            .obtain(&source(), Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Auth { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_budget() {
        let (_, store, provider) = setup();
        store.fail_next_delegations([
            StoreError::Transient("503".into()),
            StoreError::Transient("503".into()),
        ]);
        assert!(provider.obtain(&source(), Duration::from_secs(3600)).await.is_ok());

        store.fail_next_delegations([
            StoreError::Transient("503".into()),
            StoreError::Transient("503".into()),
            StoreError::Transient("503".into()),
        ]);
        let err = provider
            .obtain(&source(), Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Delegation(StoreError::Transient(_))));
    }

    #[tokio::test]
    async fn window_longer_than_seven_days_is_rejected() {
        let (_, store, provider) = setup();
        let err = provider
            .obtain(&source(), Duration::from_secs(8 * 24 * 3600))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
        assert_eq!(store.delegations_issued(), 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_of_the_same_version_issue_once() {
        let (_, store, provider) = setup();
        let window = Duration::from_secs(3600);
        let initial = provider.obtain(&source(), window).await.unwrap();
        let cell = Arc::new(DelegationCell::new(provider, window, initial));

        let refreshes = (0..16).map(|_| {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.refresh(0).await.unwrap().version })
        });
        for version in futures::future::join_all(refreshes).await {
            assert_eq!(version.unwrap(), 1);
        }

        assert_eq!(store.delegations_issued(), 2);
        assert_eq!(cell.current().version, 1);

        // a stale observer gets the newer credential without a new request
        assert_eq!(cell.refresh(0).await.unwrap().version, 1);
        assert_eq!(store.delegations_issued(), 2);
    }
}
