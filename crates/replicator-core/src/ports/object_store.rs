//! Object store ports - the storage service this system drives.
//!
//! Transport, connection pooling and request signing for the service's own
//! API live behind these traits. The replication logic only sees names,
//! handles, and classified [`StoreError`]s.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use url::Url;

use crate::domain::{
    AccountName, ContainerHandle, ContainerName, CopyHandle, CopyStatusReport,
    DelegationCredential, ObjectIdentity, Permission, SasToken, StoreError, ValidityWindow,
};

/// Container, object and copy operations.
///
/// # Contract
/// - `create_container_if_absent` is idempotent: an existing container is not
///   an error, including when creation races with another creator.
/// - `get_copy_status` is a read and safe to repeat.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_container_if_absent(
        &self,
        account: &AccountName,
        container: &ContainerName,
    ) -> Result<ContainerHandle, StoreError>;

    async fn list_objects(
        &self,
        container: &ContainerHandle,
    ) -> Result<Vec<ObjectIdentity>, StoreError>;

    /// Upload a whole object, replacing any existing one.
    async fn put_object(
        &self,
        container: &ContainerHandle,
        name: &str,
        bytes: Bytes,
    ) -> Result<(), StoreError>;

    /// Plain (unauthorized) URL of an object.
    fn object_url(&self, object: &ObjectIdentity) -> Result<Url, StoreError>;

    /// Ask the destination to pull `source_url` into `destination/name`.
    async fn start_server_side_copy(
        &self,
        destination: &ContainerHandle,
        name: &str,
        source_url: &Url,
    ) -> Result<(CopyHandle, Option<CopyStatusReport>), StoreError>;

    async fn get_copy_status(&self, handle: &CopyHandle) -> Result<CopyStatusReport, StoreError>;
}

/// Issues delegation credentials for an account.
#[async_trait]
pub trait DelegationIssuer: Send + Sync {
    /// Fails with [`StoreError::Unauthorized`] when the identity has no
    /// delegation rights on `account`.
    async fn mint_delegation(
        &self,
        account: &AccountName,
        window: ValidityWindow,
    ) -> Result<DelegationCredential, StoreError>;
}

/// Turns a delegation credential into an object-scoped token.
///
/// Pure computation, no I/O.
pub trait TokenSigner: Send + Sync {
    fn sign(
        &self,
        credential: &DelegationCredential,
        object: &ObjectIdentity,
        permission: Permission,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<SasToken, StoreError>;
}
