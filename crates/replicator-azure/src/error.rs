//! Azure REST failures and their mapping onto [`StoreError`].

use replicator_core::domain::StoreError;
use reqwest::StatusCode;
use thiserror::Error;

use crate::xml;

#[derive(Debug, Error)]
pub enum AzureError {
    /// The service answered with a non-success status.
    #[error("azure {operation}: HTTP {status}: {message}")]
    Status {
        operation: &'static str,
        status: StatusCode,
        /// `x-ms-error-code` header or `<Code>` element, when present.
        code: Option<String>,
        message: String,
    },

    /// The request never got a response.
    #[error("azure {operation}: request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("azure {operation}: unexpected response: {detail}")]
    Malformed {
        operation: &'static str,
        detail: String,
    },

    #[error("bearer token unavailable: {0}")]
    Credential(String),
}

impl AzureError {
    /// Build a status error from a failed response body.
    pub fn from_response(
        operation: &'static str,
        status: StatusCode,
        header_code: Option<String>,
        body: &str,
    ) -> Self {
        let parsed = xml::parse_error(body);
        let code = header_code.or(parsed.code);
        let message = parsed
            .message
            .or_else(|| code.clone())
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("no error message")
                    .to_string()
            });
        AzureError::Status {
            operation,
            status,
            code,
            message,
        }
    }
}

/// Classify an HTTP status the way the replication logic needs it.
pub fn map_status(status: StatusCode, message: String) -> StoreError {
    match status.as_u16() {
        404 => StoreError::NotFound(message),
        409 => StoreError::AlreadyExists(message),
        401 | 403 => StoreError::Unauthorized(message),
        400 => StoreError::InvalidInput(message),
        408 | 429 => StoreError::Transient(message),
        s if s >= 500 => StoreError::Transient(message),
        _ => StoreError::Other(message),
    }
}

impl From<AzureError> for StoreError {
    fn from(err: AzureError) -> Self {
        let rendered = err.to_string();
        match err {
            AzureError::Status { status, .. } => map_status(status, rendered),
            AzureError::Transport { source, .. } => {
                if source.is_timeout() || source.is_connect() || source.is_request() {
                    StoreError::Transient(rendered)
                } else {
                    StoreError::Other(rendered)
                }
            }
            AzureError::Malformed { .. } => StoreError::Other(rendered),
            AzureError::Credential(_) => StoreError::Unauthorized(rendered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(404, "not_found")]
    #[case(409, "already_exists")]
    #[case(401, "unauthorized")]
    #[case(403, "unauthorized")]
    #[case(400, "invalid_input")]
    #[case(408, "transient")]
    #[case(429, "transient")]
    #[case(500, "transient")]
    #[case(503, "transient")]
    #[case(412, "other")]
    fn statuses_are_classified(#[case] status: u16, #[case] expected: &str) {
        let status = StatusCode::from_u16(status).unwrap();
        let kind = match map_status(status, "x".into()) {
            StoreError::NotFound(_) => "not_found",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::Unauthorized(_) => "unauthorized",
            StoreError::InvalidInput(_) => "invalid_input",
            StoreError::Transient(_) => "transient",
            StoreError::Other(_) => "other",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn error_body_fills_code_and_message() {
        let body = "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error>\
                    <Code>AuthorizationPermissionMismatch</Code>\
                    <Message>This request is not authorized &amp; denied.</Message></Error>";
        let err = AzureError::from_response("copy", StatusCode::FORBIDDEN, None, body);
        match &err {
            AzureError::Status { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("AuthorizationPermissionMismatch"));
                assert_eq!(message, "This request is not authorized & denied.");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(StoreError::from(err).is_unauthorized());
    }

    #[test]
    fn empty_body_falls_back_to_header_code() {
        let err = AzureError::from_response(
            "copy status",
            StatusCode::NOT_FOUND,
            Some("BlobNotFound".into()),
            "",
        );
        assert_eq!(err.to_string(), "azure copy status: HTTP 404 Not Found: BlobNotFound");
        assert!(matches!(StoreError::from(err), StoreError::NotFound(_)));
    }

    #[test]
    fn credential_failure_is_unauthorized() {
        let err = AzureError::Credential("imds unreachable".into());
        assert!(StoreError::from(err).is_unauthorized());
    }
}
