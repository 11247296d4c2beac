//! Authorization minter: object-scoped, read-only, short-lived tokens.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::delegation::VersionedCredential;
use crate::domain::{MintError, ObjectIdentity, Permission, ScopedAuthorization};
use crate::ports::{Clock, TokenSigner};

/// What to do when the requested ttl outlives the delegation credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlOverflow {
    /// Fail with [`MintError::ExpiredDelegation`].
    #[default]
    Reject,
    /// Cut the expiry back to the end of the delegation window.
    Clamp,
}

pub struct AuthorizationMinter {
    signer: Arc<dyn TokenSigner>,
    clock: Arc<dyn Clock>,
    overflow: TtlOverflow,
    min_ttl: Duration,
    start_backdate: Duration,
}

impl AuthorizationMinter {
    pub fn new(signer: Arc<dyn TokenSigner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            signer,
            clock,
            overflow: TtlOverflow::Reject,
            min_ttl: Duration::from_secs(60),
            start_backdate: Duration::ZERO,
        }
    }

    pub fn with_overflow(mut self, overflow: TtlOverflow, min_ttl: Duration) -> Self {
        self.overflow = overflow;
        self.min_ttl = min_ttl;
        self
    }

    /// Backdate token start times so a store with a slightly late clock
    /// accepts them. Never earlier than the delegation window start.
    pub fn with_start_backdate(mut self, backdate: Duration) -> Self {
        self.start_backdate = backdate;
        self
    }

    /// Mint a token that lets its holder read `object` for `ttl`.
    ///
    /// The expiry never passes the end of the credential's window.
    pub fn mint(
        &self,
        credential: &VersionedCredential,
        object: &ObjectIdentity,
        permission: Permission,
        ttl: Duration,
    ) -> Result<ScopedAuthorization, MintError> {
        let delegation = &credential.credential;
        if delegation.account != object.account {
            return Err(MintError::ScopeMismatch {
                credential: delegation.account.clone(),
                object: object.account.clone(),
            });
        }

        let now = self.clock.now();
        let remaining = delegation.remaining_at(now);
        let expired = || MintError::ExpiredDelegation {
            requested: ttl,
            remaining,
        };
        if delegation.is_expired_at(now) {
            return Err(expired());
        }

        let expires_at = if ttl <= remaining {
            now + chrono::Duration::from_std(ttl).map_err(|_| expired())?
        } else {
            match self.overflow {
                TtlOverflow::Reject => return Err(expired()),
                TtlOverflow::Clamp if remaining < self.min_ttl => return Err(expired()),
                TtlOverflow::Clamp => delegation.window.end,
            }
        };
        let backdate = chrono::Duration::from_std(self.start_backdate)
            .map_err(|e| MintError::Signing(e.to_string()))?;
        let starts_at = (now - backdate).max(delegation.window.start);

        let token = self
            .signer
            .sign(delegation, object, permission, starts_at, expires_at)
            .map_err(|e| MintError::Signing(e.to_string()))?;

        Ok(ScopedAuthorization {
            object: object.clone(),
            permission,
            starts_at,
            expires_at,
            token,
            delegation_version: credential.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountName, ContainerName, DelegationCredential, DelegationKey, ValidityWindow};
    use crate::impls::UserDelegationSigner;
    use crate::ports::ManualClock;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use rstest::rstest;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn object(account: &str) -> ObjectIdentity {
        ObjectIdentity::new(
            AccountName::new(account).unwrap(),
            ContainerName::new("blobs").unwrap(),
            "a.txt",
        )
        .unwrap()
    }

    fn credential(window: Duration) -> VersionedCredential {
        let end = start() + chrono::Duration::from_std(window).unwrap();
        VersionedCredential {
            version: 3,
            credential: DelegationCredential {
                account: AccountName::new("src").unwrap(),
                window: ValidityWindow::new(start(), end),
                key: DelegationKey {
                    signed_oid: "oid".into(),
                    signed_tid: "tid".into(),
                    signed_start: start(),
                    signed_expiry: end,
                    signed_service: "b".into(),
                    signed_version: "2022-11-02".into(),
                    value: "c2VjcmV0LWtleS1tYXRlcmlhbA==".into(),
                },
            },
        }
    }

    fn minter(clock: Arc<ManualClock>, overflow: TtlOverflow) -> AuthorizationMinter {
        AuthorizationMinter::new(Arc::new(UserDelegationSigner::new()), clock)
            .with_overflow(overflow, Duration::from_secs(60))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn ttl_within_window_is_honored() {
        let clock = Arc::new(ManualClock::new(start()));
        let auth = minter(clock, TtlOverflow::Reject)
            .mint(&credential(HOUR), &object("src"), Permission::Read, Duration::from_secs(900))
            .unwrap();
        assert_eq!(auth.expires_at, start() + chrono::Duration::minutes(15));
        assert_eq!(auth.delegation_version, 3);
        assert!(auth.token.as_query().contains("sp=r"));
    }

    #[rstest]
    #[case::reject(TtlOverflow::Reject, None)]
    #[case::clamp(TtlOverflow::Clamp, Some(start() + chrono::Duration::hours(1)))]
    fn ttl_beyond_window(#[case] overflow: TtlOverflow, #[case] expected: Option<DateTime<Utc>>) {
        let clock = Arc::new(ManualClock::new(start()));
        let result = minter(clock, overflow).mint(
            &credential(HOUR),
            &object("src"),
            Permission::Read,
            2 * HOUR,
        );
        match expected {
            Some(expires_at) => assert_eq!(result.unwrap().expires_at, expires_at),
            None => assert!(matches!(result, Err(MintError::ExpiredDelegation { .. }))),
        }
    }

    #[test]
    fn clamp_refuses_uselessly_short_tokens() {
        let clock = Arc::new(ManualClock::new(start()));
        clock.advance(HOUR - Duration::from_secs(30));
        let result = minter(clock, TtlOverflow::Clamp).mint(
            &credential(HOUR),
            &object("src"),
            Permission::Read,
            Duration::from_secs(900),
        );
        assert!(matches!(result, Err(MintError::ExpiredDelegation { .. })));
    }

    #[test]
    fn expired_credential_cannot_mint() {
        let clock = Arc::new(ManualClock::new(start()));
        clock.advance(2 * HOUR);
        let result = minter(clock, TtlOverflow::Clamp).mint(
            &credential(HOUR),
            &object("src"),
            Permission::Read,
            Duration::from_secs(60),
        );
        assert!(matches!(
            result,
            Err(MintError::ExpiredDelegation { remaining, .. }) if remaining == Duration::ZERO
        ));
    }

    #[test]
    fn credential_of_another_account_is_a_scope_mismatch() {
        let clock = Arc::new(ManualClock::new(start()));
        let result = minter(clock, TtlOverflow::Reject).mint(
            &credential(HOUR),
            &object("other"),
            Permission::Read,
            Duration::from_secs(60),
        );
        assert!(matches!(result, Err(MintError::ScopeMismatch { .. })));
    }

    #[test]
    fn start_backdate_stops_at_window_start() {
        let clock = Arc::new(ManualClock::new(start()));
        clock.advance(Duration::from_secs(120));
        let auth = minter(clock, TtlOverflow::Reject)
            .with_start_backdate(Duration::from_secs(300))
            .mint(&credential(HOUR), &object("src"), Permission::Read, Duration::from_secs(60))
            .unwrap();
        assert_eq!(auth.starts_at, start());
    }

    proptest! {
        #[test]
        fn expiry_never_passes_window_end(
            window_secs in 60u64..7 * 24 * 3600,
            elapsed_secs in 0u64..8 * 24 * 3600,
            ttl_secs in 1u64..10 * 24 * 3600,
            clamp in any::<bool>(),
        ) {
            let window = Duration::from_secs(window_secs);
            let clock = Arc::new(ManualClock::new(start()));
            clock.advance(Duration::from_secs(elapsed_secs));
            let overflow = if clamp { TtlOverflow::Clamp } else { TtlOverflow::Reject };
            let credential = credential(window);

            match minter(clock, overflow).mint(
                &credential,
                &object("src"),
                Permission::Read,
                Duration::from_secs(ttl_secs),
            ) {
                Ok(auth) => {
                    prop_assert!(auth.expires_at <= credential.credential.window.end);
                    prop_assert!(auth.starts_at < auth.expires_at);
                }
                Err(err) => prop_assert!(
                    matches!(err, MintError::ExpiredDelegation { .. }),
                    "unexpected error: {err}"
                ),
            }
        }
    }
}
