//! Blob service XML bodies.
//!
//! Responses are deserialized with `quick_xml::de`. Unknown elements are
//! ignored, entity and character references are decoded by the reader.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use replicator_core::domain::DelegationKey;
use serde::{Deserialize, Serialize};

use crate::error::AzureError;

/// `EnumerationResults` of List Blobs.
#[derive(Debug, Deserialize)]
#[serde(rename = "EnumerationResults")]
struct EnumerationResults {
    #[serde(rename = "Blobs", default)]
    blobs: Blobs,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Blobs {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
struct BlobItem {
    #[serde(rename = "Name")]
    name: BlobName,
}

/// Names with characters XML cannot carry come back percent-encoded with
/// `Encoded="true"`.
#[derive(Debug, Deserialize)]
struct BlobName {
    #[serde(rename = "@Encoded", default)]
    encoded: bool,
    #[serde(rename = "$text", default)]
    text: String,
}

impl BlobName {
    fn decode(self) -> Result<String, AzureError> {
        if !self.encoded {
            return Ok(self.text);
        }
        percent_decode_str(&self.text)
            .decode_utf8()
            .map(|name| name.into_owned())
            .map_err(|e| AzureError::Malformed {
                operation: "list blobs",
                detail: format!("encoded blob name `{}`: {e}", self.text),
            })
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub names: Vec<String>,
    /// Marker of the next page, `None` on the last one.
    pub next_marker: Option<String>,
}

pub fn parse_listing(body: &str) -> Result<Listing, AzureError> {
    let results: EnumerationResults =
        quick_xml::de::from_str(body).map_err(|e| AzureError::Malformed {
            operation: "list blobs",
            detail: e.to_string(),
        })?;
    let names = results
        .blobs
        .blob
        .into_iter()
        .map(|item| item.name.decode())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Listing {
        names,
        next_marker: results.next_marker.filter(|m| !m.is_empty()),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename = "UserDelegationKey")]
struct UserDelegationKey {
    #[serde(rename = "SignedOid")]
    signed_oid: String,
    #[serde(rename = "SignedTid")]
    signed_tid: String,
    #[serde(rename = "SignedStart")]
    signed_start: String,
    #[serde(rename = "SignedExpiry")]
    signed_expiry: String,
    #[serde(rename = "SignedService")]
    signed_service: String,
    #[serde(rename = "SignedVersion")]
    signed_version: String,
    #[serde(rename = "Value")]
    value: String,
}

pub fn parse_delegation_key(body: &str) -> Result<DelegationKey, AzureError> {
    const OPERATION: &str = "get user delegation key";
    let key: UserDelegationKey =
        quick_xml::de::from_str(body).map_err(|e| AzureError::Malformed {
            operation: OPERATION,
            detail: e.to_string(),
        })?;
    let time = |tag: &str, raw: &str| -> Result<DateTime<Utc>, AzureError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| AzureError::Malformed {
                operation: OPERATION,
                detail: format!("<{tag}> `{raw}`: {e}"),
            })
    };
    Ok(DelegationKey {
        signed_start: time("SignedStart", &key.signed_start)?,
        signed_expiry: time("SignedExpiry", &key.signed_expiry)?,
        signed_oid: key.signed_oid,
        signed_tid: key.signed_tid,
        signed_service: key.signed_service,
        signed_version: key.signed_version,
        value: key.value,
    })
}

/// Service `Error` body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename = "Error")]
pub struct ErrorBody {
    #[serde(rename = "Code", default)]
    pub code: Option<String>,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
}

/// Empty or non-XML bodies (HEAD responses, proxies) give an empty result.
pub fn parse_error(body: &str) -> ErrorBody {
    if body.trim().is_empty() {
        return ErrorBody::default();
    }
    quick_xml::de::from_str(body).unwrap_or_default()
}

#[derive(Debug, Serialize)]
#[serde(rename = "KeyInfo")]
struct KeyInfo<'a> {
    #[serde(rename = "Start")]
    start: &'a str,
    #[serde(rename = "Expiry")]
    expiry: &'a str,
}

/// Request body for Get User Delegation Key.
pub fn key_info(start: &str, expiry: &str) -> Result<String, AzureError> {
    let body = quick_xml::se::to_string(&KeyInfo { start, expiry }).map_err(|e| {
        AzureError::Malformed {
            operation: "get user delegation key",
            detail: e.to_string(),
        }
    })?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>{body}"))
}
