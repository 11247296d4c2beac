//! `replicate`: copy one container from a source account to every destination
//! account.
//!
//! Exit codes: 0 every pair copied, 1 some pairs failed, 2 the run could not
//! be carried out at all.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use replicator_azure::{AuthMode, AzureBlobConfig};
use replicator_core::domain::ReplicationReport;
use replicator_core::impls::InMemoryObjectStore;
use replicator_core::ports::{Clock, SystemClock};
use replicator_core::{CancelSignal, Replicator, ReplicatorBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod args;

use args::{Args, Backend};

const EXIT_PARTIAL: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args).await {
        Ok(report) => {
            if let Err(err) = print_report(&report, args.json) {
                error!(error = %err, "failed to print report");
                return ExitCode::from(EXIT_FATAL);
            }
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_PARTIAL)
            }
        }
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// `RUST_LOG` wins; otherwise `debug` with `-v`, `info` without. Logs go
/// to stderr so `--json` output stays parseable.
fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: &Args) -> Result<ReplicationReport> {
    let request = args.request()?;
    let config = args.config()?;
    let replicator = build(args, config)?;

    let (cancel, signal) = CancelSignal::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    info!(
        source = %request.source,
        container = %request.container,
        destinations = request.destinations.len(),
        "starting replication"
    );
    let report = replicator
        .run(request, signal)
        .await
        .context("replication failed")?;
    Ok(report)
}

fn build(args: &Args, config: replicator_core::ReplicationConfig) -> Result<Replicator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let builder = ReplicatorBuilder::new(config).clock(Arc::clone(&clock));

    let builder = match args.backend {
        Backend::Azure => {
            let mut azure = AzureBlobConfig::default();
            if let Some(template) = args.endpoint_template() {
                azure.endpoint_template = template;
            }
            let auth = match args.managed_identity_client_id() {
                Some(client_id) => AuthMode::ManagedIdentity {
                    client_id: Some(client_id),
                },
                None => AuthMode::Auto,
            };
            let store = replicator_azure::connect(azure, auth, clock)
                .context("failed to set up the Azure backend")?;
            builder.backend(Arc::new(store))
        }
        Backend::Memory => {
            warn!("using the in-memory backend, nothing leaves this process");
            builder.backend(Arc::new(InMemoryObjectStore::with_auto_accounts(clock)))
        }
    };
    Ok(builder.build()?)
}

fn print_report(report: &ReplicationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}
