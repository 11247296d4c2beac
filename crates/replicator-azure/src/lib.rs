//! Azure Blob Storage backend for replicator-core.
//!
//! [`AzureBlobStore`] implements both `ObjectStore` and `DelegationIssuer`,
//! so one instance can be handed to the replicator builder as its backend.

pub mod client;
pub mod credential;
pub mod error;
mod xml;

use std::sync::Arc;

use replicator_core::ports::Clock;

pub use client::{AZURE_API_VERSION, AzureBlobConfig, AzureBlobStore, DEFAULT_ENDPOINT_TEMPLATE};
pub use credential::{
    AccessToken, CachedCredential, ManagedIdentitySource, StaticTokenSource, TokenSource,
};
pub use error::AzureError;

/// How the backend authenticates.
#[derive(Debug, Clone, Default)]
pub enum AuthMode {
    /// `AZURE_STORAGE_BEARER_TOKEN` if set, managed identity otherwise.
    #[default]
    Auto,
    ManagedIdentity { client_id: Option<String> },
    StaticToken(String),
}

/// Build a store with the chosen authentication.
pub fn connect(
    config: AzureBlobConfig,
    auth: AuthMode,
    clock: Arc<dyn Clock>,
) -> Result<AzureBlobStore, AzureError> {
    let client = AzureBlobStore::http_client(&config)?;
    let source: Box<dyn TokenSource> = match auth {
        AuthMode::Auto => match StaticTokenSource::from_env() {
            Some(source) => {
                tracing::info!("using bearer token from {}", credential::BEARER_TOKEN_ENV);
                Box::new(source)
            }
            None => Box::new(ManagedIdentitySource::new(client.clone(), None)),
        },
        AuthMode::ManagedIdentity { client_id } => {
            Box::new(ManagedIdentitySource::new(client.clone(), client_id))
        }
        AuthMode::StaticToken(token) => Box::new(StaticTokenSource::new(token)),
    };
    AzureBlobStore::new(config, client, CachedCredential::new(source, clock))
}
