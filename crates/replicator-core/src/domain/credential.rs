//! Delegation credential and authorization values.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::names::{AccountName, ObjectIdentity};

/// A time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ValidityWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Time left until `end`, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.end - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Key material returned by the delegation issuer.
///
/// Field names follow the signed-key fields of a user delegation SAS
/// (`skoid`, `sktid`, `skt`, `ske`, `sks`, `skv`).
#[derive(Clone, PartialEq, Eq)]
pub struct DelegationKey {
    pub signed_oid: String,
    pub signed_tid: String,
    pub signed_start: DateTime<Utc>,
    pub signed_expiry: DateTime<Utc>,
    pub signed_service: String,
    pub signed_version: String,
    /// Base64 encoded signing key. Never logged.
    pub value: String,
}

impl fmt::Debug for DelegationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegationKey")
            .field("signed_oid", &self.signed_oid)
            .field("signed_tid", &self.signed_tid)
            .field("signed_start", &self.signed_start)
            .field("signed_expiry", &self.signed_expiry)
            .field("signed_service", &self.signed_service)
            .field("signed_version", &self.signed_version)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Short-lived credential issued by the source account.
///
/// Immutable once issued. When it runs out it is replaced as a whole through
/// [`crate::app::delegation::DelegationCell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationCredential {
    pub account: AccountName,
    pub window: ValidityWindow,
    pub key: DelegationKey,
}

impl DelegationCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.window.is_expired_at(now)
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        self.window.remaining_at(now)
    }
}

/// Permission carried by a scoped authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
}

impl Permission {
    /// SAS `sp` value.
    pub fn as_sas(&self) -> &'static str {
        match self {
            Permission::Read => "r",
        }
    }
}

/// Signed query string granting access to one object.
#[derive(Clone, PartialEq, Eq)]
pub struct SasToken(String);

impl SasToken {
    pub fn new(query: impl Into<String>) -> Self {
        Self(query.into())
    }

    pub fn as_query(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the token is a bearer capability
        f.write_str("SasToken(<redacted>)")
    }
}

/// Read-only capability for exactly one object, valid until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedAuthorization {
    pub object: ObjectIdentity,
    pub permission: Permission,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: SasToken,
    /// Version of the delegation credential this was derived from.
    pub delegation_version: u64,
}

impl ScopedAuthorization {
    /// Whether at least `margin` of validity is left at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => now + margin < self.expires_at,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn window_remaining_is_zero_after_expiry() {
        let window = ValidityWindow::new(at(12, 0), at(13, 0));
        assert_eq!(window.remaining_at(at(12, 30)), Duration::from_secs(1800));
        assert_eq!(window.remaining_at(at(13, 0)), Duration::ZERO);
        assert_eq!(window.remaining_at(at(14, 0)), Duration::ZERO);
        assert!(window.is_expired_at(at(13, 0)));
        assert!(!window.is_expired_at(at(12, 59)));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let key = DelegationKey {
            signed_oid: "oid".into(),
            signed_tid: "tid".into(),
            signed_start: at(12, 0),
            signed_expiry: at(13, 0),
            signed_service: "b".into(),
            signed_version: "2022-11-02".into(),
            value: "c2VjcmV0".into(),
        };
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("c2VjcmV0"));
        assert!(rendered.contains("<redacted>"));

        let token = SasToken::new("sig=abc");
        assert!(!format!("{token:?}").contains("abc"));
    }
}
