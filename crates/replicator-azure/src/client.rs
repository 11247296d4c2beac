//! Azure Blob Storage over its REST API.
//!
//! One client serves every account: the account only changes the host
//! (or path, for emulators), which comes from an endpoint template.
//! Requests authenticate with an Entra ID bearer token, so the identity
//! needs data-plane roles on every account involved.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use replicator_core::domain::{
    AccountName, ContainerHandle, ContainerName, CopyHandle, CopyStatus, CopyStatusReport,
    DelegationCredential, ObjectIdentity, StoreError, ValidityWindow,
};
use replicator_core::ports::{DelegationIssuer, ObjectStore};
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::credential::CachedCredential;
use crate::error::AzureError;
use crate::xml::{self, Listing};

/// REST API version sent as `x-ms-version`.
pub const AZURE_API_VERSION: &str = "2023-11-03";

pub const DEFAULT_ENDPOINT_TEMPLATE: &str = "https://{account}.blob.core.windows.net";

const ACCOUNT_PLACEHOLDER: &str = "{account}";

/// Blob names: everything but unreserved characters and `/`.
const AZURE_BLOB_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Query values such as list markers.
const QUERY_ENCODE_SET: &AsciiSet = &AZURE_BLOB_ENCODE_SET.add(b'/');

#[derive(Debug, Clone)]
pub struct AzureBlobConfig {
    /// Service endpoint with an `{account}` placeholder, no trailing slash.
    pub endpoint_template: String,
    pub request_timeout: Duration,
}

impl Default for AzureBlobConfig {
    fn default() -> Self {
        Self {
            endpoint_template: DEFAULT_ENDPOINT_TEMPLATE.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub struct AzureBlobStore {
    client: reqwest::Client,
    endpoint_template: String,
    credential: CachedCredential,
}

impl AzureBlobStore {
    pub fn new(
        config: AzureBlobConfig,
        client: reqwest::Client,
        credential: CachedCredential,
    ) -> Result<Self, AzureError> {
        let template = config.endpoint_template.trim_end_matches('/').to_string();
        if !template.contains(ACCOUNT_PLACEHOLDER) {
            return Err(AzureError::Malformed {
                operation: "endpoint template",
                detail: format!("`{template}` has no {ACCOUNT_PLACEHOLDER} placeholder"),
            });
        }
        Ok(Self {
            client,
            endpoint_template: template,
            credential,
        })
    }

    /// HTTP client shared by the store and the managed identity source.
    pub fn http_client(config: &AzureBlobConfig) -> Result<reqwest::Client, AzureError> {
        reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| AzureError::Transport {
                operation: "client setup",
                source,
            })
    }

    fn account_url(&self, account: &AccountName) -> String {
        self.endpoint_template
            .replace(ACCOUNT_PLACEHOLDER, account.as_str())
    }

    fn container_url(&self, account: &AccountName, container: &ContainerName) -> String {
        format!("{}/{}", self.account_url(account), container)
    }

    fn blob_url(&self, account: &AccountName, container: &ContainerName, name: &str) -> String {
        format!(
            "{}/{}",
            self.container_url(account, container),
            utf8_percent_encode(name, AZURE_BLOB_ENCODE_SET)
        )
    }

    /// Request with the version, date and authorization headers set.
    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, AzureError> {
        let bearer = self.credential.bearer().await?;
        Ok(self
            .client
            .request(method, url)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("x-ms-date", rfc1123(Utc::now()))
            .bearer_auth(bearer))
    }

    /// Send, turning any non-success status into [`AzureError::Status`].
    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, AzureError> {
        let resp = request
            .send()
            .await
            .map_err(|source| AzureError::Transport { operation, source })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let code = header(resp.headers(), "x-ms-error-code");
        let body = resp.text().await.unwrap_or_default();
        Err(AzureError::from_response(operation, status, code, &body))
    }

    async fn list_page(
        &self,
        container: &ContainerHandle,
        marker: Option<&str>,
    ) -> Result<Listing, AzureError> {
        const OPERATION: &str = "list blobs";
        let mut url = format!(
            "{}?restype=container&comp=list",
            self.container_url(&container.account, &container.container)
        );
        if let Some(marker) = marker {
            url.push_str("&marker=");
            url.push_str(&utf8_percent_encode(marker, QUERY_ENCODE_SET).to_string());
        }

        let resp = self
            .send(OPERATION, self.request(Method::GET, &url).await?)
            .await?;
        let body = resp
            .text()
            .await
            .map_err(|source| AzureError::Transport {
                operation: OPERATION,
                source,
            })?;
        xml::parse_listing(&body)
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    async fn create_container_if_absent(
        &self,
        account: &AccountName,
        container: &ContainerName,
    ) -> Result<ContainerHandle, StoreError> {
        let url = format!("{}?restype=container", self.container_url(account, container));
        let request = self.request(Method::PUT, &url).await?;
        match self.send("create container", request).await {
            Ok(_) => info!(%account, %container, "container created"),
            Err(AzureError::Status { status, code, .. })
                if status == StatusCode::CONFLICT
                    && code.as_deref() != Some("ContainerBeingDeleted") =>
            {
                debug!(%account, %container, "container already exists");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(ContainerHandle::new(account.clone(), container.clone()))
    }

    async fn list_objects(
        &self,
        container: &ContainerHandle,
    ) -> Result<Vec<ObjectIdentity>, StoreError> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list_page(container, marker.as_deref()).await?;
            names.extend(page.names);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        debug!(%container, count = names.len(), "listed blobs");

        names
            .into_iter()
            .map(|name| {
                container
                    .object(name)
                    .map_err(|e| StoreError::InvalidInput(e.to_string()))
            })
            .collect()
    }

    async fn put_object(
        &self,
        container: &ContainerHandle,
        name: &str,
        bytes: Bytes,
    ) -> Result<(), StoreError> {
        let url = self.blob_url(&container.account, &container.container, name);
        let request = self
            .request(Method::PUT, &url)
            .await?
            .header("x-ms-blob-type", "BlockBlob")
            .body(bytes);
        self.send("put blob", request).await?;
        Ok(())
    }

    fn object_url(&self, object: &ObjectIdentity) -> Result<Url, StoreError> {
        let raw = self.blob_url(&object.account, &object.container, &object.name);
        Url::parse(&raw).map_err(|e| StoreError::InvalidInput(format!("bad object url `{raw}`: {e}")))
    }

    async fn start_server_side_copy(
        &self,
        destination: &ContainerHandle,
        name: &str,
        source_url: &Url,
    ) -> Result<(CopyHandle, Option<CopyStatusReport>), StoreError> {
        let url = self.blob_url(&destination.account, &destination.container, name);
        let request = self
            .request(Method::PUT, &url)
            .await?
            .header("x-ms-copy-source", source_url.as_str());
        let resp = self.send("copy blob", request).await?;

        let handle = CopyHandle {
            destination: destination.clone(),
            object_name: name.to_string(),
            copy_id: header(resp.headers(), "x-ms-copy-id"),
        };
        Ok((handle, copy_report(resp.headers())))
    }

    async fn get_copy_status(&self, handle: &CopyHandle) -> Result<CopyStatusReport, StoreError> {
        let url = self.blob_url(
            &handle.destination.account,
            &handle.destination.container,
            &handle.object_name,
        );
        let request = self.request(Method::HEAD, &url).await?;
        let resp = self.send("get blob properties", request).await?;
        let headers = resp.headers();

        if let Some(expected) = &handle.copy_id {
            let current = header(headers, "x-ms-copy-id");
            if current.as_deref() != Some(expected.as_str()) {
                return Ok(CopyStatusReport::new(CopyStatus::Aborted).with_description(format!(
                    "copy {expected} was superseded by {}",
                    current.as_deref().unwrap_or("a non-copy write")
                )));
            }
        }
        copy_report(headers).ok_or_else(|| {
            StoreError::Other(format!(
                "{}/{} has no copy status",
                handle.destination, handle.object_name
            ))
        })
    }
}

#[async_trait]
impl DelegationIssuer for AzureBlobStore {
    async fn mint_delegation(
        &self,
        account: &AccountName,
        window: ValidityWindow,
    ) -> Result<DelegationCredential, StoreError> {
        const OPERATION: &str = "get user delegation key";
        let url = format!(
            "{}/?restype=service&comp=userdelegationkey",
            self.account_url(account)
        );
        let body = xml::key_info(&iso8601(window.start), &iso8601(window.end))?;
        let request = self
            .request(Method::POST, &url)
            .await?
            .header("content-type", "application/xml")
            .body(body);
        let resp = self.send(OPERATION, request).await?;
        let text = resp
            .text()
            .await
            .map_err(|source| AzureError::Transport {
                operation: OPERATION,
                source,
            })?;

        let key = xml::parse_delegation_key(&text)?;
        info!(%account, expiry = %key.signed_expiry, "user delegation key issued");
        Ok(DelegationCredential {
            account: account.clone(),
            window: ValidityWindow::new(key.signed_start, key.signed_expiry),
            key,
        })
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn copy_report(headers: &HeaderMap) -> Option<CopyStatusReport> {
    let status = CopyStatus::parse(&header(headers, "x-ms-copy-status")?);
    let report = CopyStatusReport::new(status);
    Some(match header(headers, "x-ms-copy-status-description") {
        Some(description) if !description.is_empty() => report.with_description(description),
        _ => report,
    })
}

fn rfc1123(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::StaticTokenSource;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;
    use replicator_core::ports::SystemClock;
    use std::sync::Arc;

    fn store(template: &str) -> AzureBlobStore {
        let config = AzureBlobConfig {
            endpoint_template: template.to_string(),
            ..AzureBlobConfig::default()
        };
        let client = AzureBlobStore::http_client(&config).unwrap();
        let credential =
            CachedCredential::new(Box::new(StaticTokenSource::new("t")), Arc::new(SystemClock));
        AzureBlobStore::new(config, client, credential).unwrap()
    }

    fn object(name: &str) -> ObjectIdentity {
        ObjectIdentity::new(
            AccountName::new("srcacct").unwrap(),
            ContainerName::new("blobdefaultcontainer").unwrap(),
            name,
        )
        .unwrap()
    }

    #[test]
    fn object_url_encodes_name_but_keeps_slashes() {
        let url = store(DEFAULT_ENDPOINT_TEMPLATE)
            .object_url(&object("dir/a b+c.txt"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://srcacct.blob.core.windows.net/blobdefaultcontainer/dir/a%20b%2Bc.txt"
        );
    }

    #[test]
    fn path_style_template_for_emulators() {
        let url = store("http://127.0.0.1:10000/{account}/")
            .object_url(&object("blob_1.txt"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:10000/srcacct/blobdefaultcontainer/blob_1.txt"
        );
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let config = AzureBlobConfig {
            endpoint_template: "https://fixed.blob.core.windows.net".into(),
            ..AzureBlobConfig::default()
        };
        let client = AzureBlobStore::http_client(&config).unwrap();
        let credential =
            CachedCredential::new(Box::new(StaticTokenSource::new("t")), Arc::new(SystemClock));
        assert!(matches!(
            AzureBlobStore::new(config, client, credential),
            Err(AzureError::Malformed { .. })
        ));
    }

    #[test]
    fn listing_pages_until_marker_is_empty() {
        let first = "<EnumerationResults><Blobs><Blob><Name>a.txt</Name></Blob>\
                     <Blob><Name>b.txt</Name></Blob></Blobs>\
                     <NextMarker>2!72!b.txt</NextMarker></EnumerationResults>";
        let last = "<EnumerationResults><Blobs><Blob><Name>c.txt</Name></Blob></Blobs>\
                    <NextMarker></NextMarker></EnumerationResults>";

        assert_eq!(
            xml::parse_listing(first).unwrap(),
            Listing {
                names: vec!["a.txt".to_string(), "b.txt".to_string()],
                next_marker: Some("2!72!b.txt".to_string()),
            }
        );
        assert_eq!(
            xml::parse_listing(last).unwrap(),
            Listing {
                names: vec!["c.txt".to_string()],
                next_marker: None,
            }
        );
    }

    #[test]
    fn copy_headers_become_a_report() {
        let mut headers = HeaderMap::new();
        assert_eq!(copy_report(&headers), None);

        headers.insert("x-ms-copy-status", HeaderValue::from_static("failed"));
        headers.insert(
            "x-ms-copy-status-description",
            HeaderValue::from_static("500 InternalError Copy failed."),
        );
        assert_eq!(
            copy_report(&headers),
            Some(
                CopyStatusReport::new(CopyStatus::Failed)
                    .with_description("500 InternalError Copy failed.")
            )
        );
    }

    #[test]
    fn request_dates_use_rfc1123() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(rfc1123(at), "Mon, 01 Jan 2024 12:00:00 GMT");
        assert_eq!(iso8601(at), "2024-01-01T12:00:00Z");
    }
}
