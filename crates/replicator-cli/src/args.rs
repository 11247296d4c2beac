//! Command line arguments and how they map onto the run.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use replicator_core::ReplicationConfig;
use replicator_core::ReplicationRequest;
use replicator_core::domain::{AccountName, ContainerName};

pub const DEFAULT_CONTAINER: &str = "blobdefaultcontainer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Azure Blob Storage
    Azure,
    /// In-process store, for dry runs
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "replicate")]
#[command(
    about = "Replicate a blob container to other storage accounts with server-side copies",
    long_about = None
)]
pub struct Args {
    /// Source storage account
    #[arg(long, visible_alias = "src-storage")]
    pub source: String,

    /// Comma-separated destination storage accounts
    #[arg(long, visible_alias = "dest-storage", value_delimiter = ',')]
    pub destinations: Vec<String>,

    /// Container name, same in every account
    #[arg(long, visible_alias = "container-name", default_value = DEFAULT_CONTAINER)]
    pub container: String,

    /// Upload sample blobs to the source container first
    #[arg(long, visible_alias = "upload")]
    pub populate: bool,

    /// Number of copies in flight
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-copy completion timeout in seconds
    #[arg(long)]
    pub timeout_seconds: Option<u64>,

    /// Timeout for the whole run in seconds
    #[arg(long)]
    pub run_timeout_seconds: Option<u64>,

    /// TOML config file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::Azure)]
    pub backend: Backend,

    /// Client id of a user-assigned managed identity
    #[arg(long)]
    pub managed_identity_client_id: Option<String>,

    /// Blob endpoint with an `{account}` placeholder
    #[arg(long)]
    pub endpoint_template: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// `None` for missing or blank values.
fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Args {
    pub fn request(&self) -> Result<ReplicationRequest> {
        let Some(source) = non_empty(Some(&self.source)) else {
            bail!("--source must not be empty");
        };
        let source = AccountName::new(source).context("invalid --source")?;
        let container = non_empty(Some(&self.container)).unwrap_or(DEFAULT_CONTAINER);
        let container = ContainerName::new(container).context("invalid --container")?;
        let destinations = self
            .destinations
            .iter()
            .filter_map(|d| non_empty(Some(d)))
            .map(|d| AccountName::new(d).with_context(|| format!("invalid destination `{d}`")))
            .collect::<Result<Vec<_>>>()?;

        Ok(ReplicationRequest::new(source, container, destinations).with_populate(self.populate))
    }

    /// Config file (or defaults) with flag overrides applied, validated.
    pub fn config(&self) -> Result<ReplicationConfig> {
        let mut config = match &self.config {
            Some(path) => ReplicationConfig::load(path)?,
            None => ReplicationConfig::default(),
        };
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeout) = self.timeout_seconds {
            config.poll.timeout_secs = timeout;
        }
        if let Some(run_timeout) = self.run_timeout_seconds {
            config.run_timeout_secs = Some(run_timeout);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn managed_identity_client_id(&self) -> Option<String> {
        non_empty(self.managed_identity_client_id.as_deref()).map(str::to_string)
    }

    pub fn endpoint_template(&self) -> Option<String> {
        non_empty(self.endpoint_template.as_deref()).map(str::to_string)
    }
}
