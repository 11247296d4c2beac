//! UserDelegationSigner - user delegation SAS tokens.
//!
//! Builds and checks blob-scoped shared access signatures derived from a
//! delegation key (signed version 2022-11-02). Signing is
//! `base64(HMAC-SHA256(base64decode(key), string_to_sign))`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;
use thiserror::Error;
use url::form_urlencoded;

use crate::domain::{
    DelegationCredential, DelegationKey, ObjectIdentity, Permission, SasToken, StoreError,
};
use crate::ports::TokenSigner;

type HmacSha256 = Hmac<Sha256>;

/// Signed version (`sv`) of the tokens we produce.
pub const SAS_VERSION: &str = "2022-11-02";

/// Encode everything except unreserved characters.
const QUERY_VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Why a presented token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SasVerifyError {
    #[error("missing query parameter `{0}`")]
    Missing(&'static str),
    #[error("malformed `{0}` parameter")]
    Malformed(&'static str),
    #[error("signature mismatch")]
    BadSignature,
    #[error("token is not valid at this time")]
    OutsideValidity,
    #[error("delegation key expired")]
    KeyExpired,
    #[error("token does not grant `{0}`")]
    PermissionDenied(&'static str),
    #[error("token is scoped to a different resource")]
    WrongResource,
}

/// Every field that goes into the string-to-sign.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SasFields {
    permissions: String,
    start: String,
    expiry: String,
    key_oid: String,
    key_tid: String,
    key_start: String,
    key_expiry: String,
    key_service: String,
    key_version: String,
    protocol: String,
    version: String,
    resource: String,
}

impl SasFields {
    fn string_to_sign(&self, canonicalized_resource: &str) -> String {
        // authorized/unauthorized oid, correlation id, ip, snapshot time,
        // encryption scope and the five response headers are always empty
        let parts: [&str; 24] = [
            self.permissions.as_str(),
            self.start.as_str(),
            self.expiry.as_str(),
            canonicalized_resource,
            self.key_oid.as_str(),
            self.key_tid.as_str(),
            self.key_start.as_str(),
            self.key_expiry.as_str(),
            self.key_service.as_str(),
            self.key_version.as_str(),
            "",
            "",
            "",
            "",
            self.protocol.as_str(),
            self.version.as_str(),
            self.resource.as_str(),
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ];
        parts.join("\n")
    }

    fn to_query(&self, signature: &str) -> String {
        let pairs: [(&str, &str); 13] = [
            ("sp", self.permissions.as_str()),
            ("st", self.start.as_str()),
            ("se", self.expiry.as_str()),
            ("skoid", self.key_oid.as_str()),
            ("sktid", self.key_tid.as_str()),
            ("skt", self.key_start.as_str()),
            ("ske", self.key_expiry.as_str()),
            ("sks", self.key_service.as_str()),
            ("skv", self.key_version.as_str()),
            ("spr", self.protocol.as_str()),
            ("sv", self.version.as_str()),
            ("sr", self.resource.as_str()),
            ("sig", signature),
        ];
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={}", utf8_percent_encode(v, QUERY_VALUE_ENCODE_SET)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn from_query(query: &str) -> Result<(Self, String), SasVerifyError> {
        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |name: &'static str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .ok_or(SasVerifyError::Missing(name))
        };
        let fields = Self {
            permissions: get("sp")?,
            start: get("st")?,
            expiry: get("se")?,
            key_oid: get("skoid")?,
            key_tid: get("sktid")?,
            key_start: get("skt")?,
            key_expiry: get("ske")?,
            key_service: get("sks")?,
            key_version: get("skv")?,
            protocol: get("spr")?,
            version: get("sv")?,
            resource: get("sr")?,
        };
        Ok((fields, get("sig")?))
    }
}

/// Format a timestamp the way SAS fields expect (`2024-01-01T12:00:00Z`).
pub fn sas_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_sas_time(raw: &str, field: &'static str) -> Result<DateTime<Utc>, SasVerifyError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| SasVerifyError::Malformed(field))
}

/// `/blob/{account}/{container}/{object}`
pub fn canonicalized_resource(object: &ObjectIdentity) -> String {
    format!(
        "/blob/{}/{}/{}",
        object.account, object.container, object.name
    )
}

fn keyed_mac(key: &DelegationKey) -> Result<HmacSha256, StoreError> {
    let key_bytes = BASE64_STANDARD
        .decode(&key.value)
        .map_err(|e| StoreError::InvalidInput(format!("delegation key is not base64: {e}")))?;
    HmacSha256::new_from_slice(&key_bytes)
        .map_err(|e| StoreError::InvalidInput(format!("HMAC key error: {e}")))
}

/// Default [`TokenSigner`].
#[derive(Debug, Clone, Default)]
pub struct UserDelegationSigner;

impl UserDelegationSigner {
    pub fn new() -> Self {
        Self
    }

    /// Check a token presented for `object` against the key it claims to be
    /// derived from.
    pub fn verify(
        &self,
        key: &DelegationKey,
        object: &ObjectIdentity,
        query: &str,
        required: Permission,
        now: DateTime<Utc>,
    ) -> Result<(), SasVerifyError> {
        let (fields, signature) = SasFields::from_query(query)?;

        let string_to_sign = fields.string_to_sign(&canonicalized_resource(object));
        let mut mac = keyed_mac(key).map_err(|_| SasVerifyError::BadSignature)?;
        mac.update(string_to_sign.as_bytes());
        let presented = BASE64_STANDARD
            .decode(signature.as_bytes())
            .map_err(|_| SasVerifyError::Malformed("sig"))?;
        mac.verify_slice(&presented)
            .map_err(|_| SasVerifyError::BadSignature)?;

        if fields.resource != "b" {
            return Err(SasVerifyError::WrongResource);
        }
        if !fields.permissions.contains(required.as_sas()) {
            return Err(SasVerifyError::PermissionDenied(required.as_sas()));
        }
        let start = parse_sas_time(&fields.start, "st")?;
        let expiry = parse_sas_time(&fields.expiry, "se")?;
        if now < start || now >= expiry {
            return Err(SasVerifyError::OutsideValidity);
        }
        if now >= key.signed_expiry {
            return Err(SasVerifyError::KeyExpired);
        }
        Ok(())
    }
}

impl TokenSigner for UserDelegationSigner {
    fn sign(
        &self,
        credential: &DelegationCredential,
        object: &ObjectIdentity,
        permission: Permission,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<SasToken, StoreError> {
        let key = &credential.key;
        let fields = SasFields {
            permissions: permission.as_sas().to_string(),
            start: sas_time(start),
            expiry: sas_time(expiry),
            key_oid: key.signed_oid.clone(),
            key_tid: key.signed_tid.clone(),
            key_start: sas_time(key.signed_start),
            key_expiry: sas_time(key.signed_expiry),
            key_service: key.signed_service.clone(),
            key_version: key.signed_version.clone(),
            protocol: "https".to_string(),
            version: SAS_VERSION.to_string(),
            resource: "b".to_string(),
        };

        let mut mac = keyed_mac(key)?;
        mac.update(fields.string_to_sign(&canonicalized_resource(object)).as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(SasToken::new(fields.to_query(&signature)))
    }
}
