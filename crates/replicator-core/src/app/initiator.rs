//! Copy initiator: asks a destination to pull one object from the source.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::retry::RetryPolicy;
use crate::domain::{
    ContainerHandle, CopyStartError, CopyStartFailure, CopyTaskHandle, ObjectIdentity,
    ScopedAuthorization, StoreError, TaskId,
};
use crate::ports::{Clock, ObjectStore};

/// Tokens with less validity left than this are not sent.
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

pub struct CopyInitiator {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    expiry_margin: Duration,
}

impl CopyInitiator {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
        }
    }

    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Start a server-side copy of `source` into `destination` under the same
    /// object name.
    ///
    /// Transient failures are retried here. Everything else is classified and
    /// handed back, the caller decides whether to mint a new authorization.
    pub async fn start_copy(
        &self,
        task_id: TaskId,
        source: &ObjectIdentity,
        authorization: &ScopedAuthorization,
        destination: &ContainerHandle,
    ) -> Result<CopyTaskHandle, CopyStartError> {
        if authorization.object != *source {
            return Err(CopyStartError::new(
                CopyStartFailure::Malformed,
                0,
                format!(
                    "authorization is scoped to {}, not {source}",
                    authorization.object
                ),
            ));
        }
        let mut url = self
            .store
            .object_url(source)
            .map_err(|e| CopyStartError::new(CopyStartFailure::Malformed, 0, e.to_string()))?;
        url.set_query(Some(authorization.token.as_query()));

        let mut attempt: u32 = 1;
        loop {
            if !authorization.is_usable_at(self.clock.now(), self.expiry_margin) {
                return Err(CopyStartError::new(
                    CopyStartFailure::AuthorizationExpired,
                    attempt - 1,
                    format!("authorization expires at {}", authorization.expires_at),
                ));
            }

            match self
                .store
                .start_server_side_copy(destination, &source.name, &url)
                .await
            {
                Ok((store_handle, initial)) => {
                    debug!(%task_id, %destination, object = %source.name, attempt, "copy started");
                    return Ok(CopyTaskHandle {
                        task_id,
                        source: source.clone(),
                        store_handle,
                        initial_status: initial.map(|report| report.status),
                        start_attempts: attempt,
                    });
                }
                Err(err) if err.is_transient() => {
                    if !self.retry.allows_another(attempt) {
                        return Err(CopyStartError::new(
                            CopyStartFailure::Transport,
                            attempt,
                            err.to_string(),
                        ));
                    }
                    let delay = self.retry.next_delay(attempt);
                    warn!(%task_id, %destination, attempt, ?delay, error = %err, "copy start failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(classify(err, attempt)),
            }
        }
    }
}

fn classify(err: StoreError, attempts: u32) -> CopyStartError {
    let reason = match &err {
        StoreError::Unauthorized(_) => CopyStartFailure::AuthorizationRejected,
        StoreError::NotFound(_) => CopyStartFailure::DestinationMissing,
        StoreError::InvalidInput(_) | StoreError::AlreadyExists(_) => CopyStartFailure::Malformed,
        StoreError::Transient(_) | StoreError::Other(_) => CopyStartFailure::Transport,
    };
    let mut error = CopyStartError::new(reason, attempts, err.to_string());
    if matches!(err, StoreError::Other(_)) {
        error.retryable = false;
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::delegation::VersionedCredential;
    use crate::app::minter::AuthorizationMinter;
    use crate::domain::{AccountName, ContainerName, CopyStatus, Permission, ValidityWindow};
    use crate::impls::{InMemoryObjectStore, UserDelegationSigner};
    use crate::ports::{DelegationIssuer, ManualClock};
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryObjectStore>,
        object: ObjectIdentity,
        authorization: ScopedAuthorization,
        destination: ContainerHandle,
    }

    fn account(s: &str) -> AccountName {
        AccountName::new(s).unwrap()
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryObjectStore::new(clock.clone()));
        store.add_account(&account("src"));
        store.add_account(&account("dst"));
        let container = ContainerName::new("blobs").unwrap();
        let source = store
            .create_container_if_absent(&account("src"), &container)
            .await
            .unwrap();
        let destination = store
            .create_container_if_absent(&account("dst"), &container)
            .await
            .unwrap();
        store
            .put_object(&source, "a.txt", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        let object = source.object("a.txt").unwrap();

        let now = clock.now();
        let credential = store
            .mint_delegation(
                &account("src"),
                ValidityWindow::new(now, now + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        let authorization = AuthorizationMinter::new(Arc::new(UserDelegationSigner::new()), clock.clone())
            .mint(
                &VersionedCredential {
                    version: 0,
                    credential,
                },
                &object,
                Permission::Read,
                Duration::from_secs(900),
            )
            .unwrap();

        Fixture {
            clock,
            store,
            object,
            authorization,
            destination,
        }
    }

    fn initiator(f: &Fixture) -> CopyInitiator {
        CopyInitiator::new(
            f.store.clone(),
            f.clock.clone(),
            RetryPolicy::new(Duration::from_millis(100), 2.0, 3),
        )
    }

    fn task_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn starts_copy_with_embedded_token() {
        let f = fixture().await;
        let handle = initiator(&f)
            .start_copy(task_id(), &f.object, &f.authorization, &f.destination)
            .await
            .unwrap();
        assert_eq!(handle.start_attempts, 1);
        assert_eq!(handle.initial_status, Some(CopyStatus::Pending));
        assert_eq!(handle.store_handle.object_name, "a.txt");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_in_place() {
        let f = fixture().await;
        f.store.fail_next_copy_starts(
            &account("dst"),
            [
                StoreError::Transient("throttled".into()),
                StoreError::Transient("throttled".into()),
            ],
        );
        let handle = initiator(&f)
            .start_copy(task_id(), &f.object, &f.authorization, &f.destination)
            .await
            .unwrap();
        assert_eq!(handle.start_attempts, 3);
        assert_eq!(f.store.copy_start_calls(&account("dst")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_retryable_transport_errors() {
        let f = fixture().await;
        f.store
            .fail_all_copy_starts(&account("dst"), StoreError::Transient("503".into()));
        let err = initiator(&f)
            .start_copy(task_id(), &f.object, &f.authorization, &f.destination)
            .await
            .unwrap_err();
        assert_eq!(err.reason, CopyStartFailure::Transport);
        assert!(err.retryable);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn mismatched_authorization_is_malformed() {
        let f = fixture().await;
        let other = ObjectIdentity::new(account("src"), ContainerName::new("blobs").unwrap(), "b.txt")
            .unwrap();
        let err = initiator(&f)
            .start_copy(task_id(), &other, &f.authorization, &f.destination)
            .await
            .unwrap_err();
        assert_eq!(err.reason, CopyStartFailure::Malformed);
        assert!(!err.retryable);
        assert_eq!(f.store.copy_start_calls(&account("dst")), 0);
    }

    #[tokio::test]
    async fn rejected_token_needs_remint() {
        let f = fixture().await;
        f.store.fail_next_copy_starts(
            &account("dst"),
            [StoreError::Unauthorized("CannotVerifyCopySource".into())],
        );
        let err = initiator(&f)
            .start_copy(task_id(), &f.object, &f.authorization, &f.destination)
            .await
            .unwrap_err();
        assert_eq!(err.reason, CopyStartFailure::AuthorizationRejected);
        assert!(err.needs_remint());
    }

    #[tokio::test]
    async fn nearly_expired_token_is_not_sent() {
        let f = fixture().await;
        f.clock.advance(Duration::from_secs(900 - 10));
        let err = initiator(&f)
            .start_copy(task_id(), &f.object, &f.authorization, &f.destination)
            .await
            .unwrap_err();
        assert_eq!(err.reason, CopyStartFailure::AuthorizationExpired);
        assert_eq!(f.store.copy_start_calls(&account("dst")), 0);
    }

    #[tokio::test]
    async fn missing_destination_container_is_reported() {
        let f = fixture().await;
        let missing = ContainerHandle::new(account("dst"), ContainerName::new("nothere").unwrap());
        let err = initiator(&f)
            .start_copy(task_id(), &f.object, &f.authorization, &missing)
            .await
            .unwrap_err();
        assert_eq!(err.reason, CopyStartFailure::DestinationMissing);
    }
}
