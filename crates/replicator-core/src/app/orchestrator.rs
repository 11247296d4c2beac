//! Replication orchestrator: one run from source container to report.
//!
//! # Flow
//! 1. ensure the source container exists
//! 2. upload sample objects (optional)
//! 3. obtain the run's delegation credential
//! 4. list the source container once
//! 5. ensure every destination container, isolating the ones that fail
//! 6. drain (object, destination) pairs through the worker pool
//! 7. aggregate results from the channel into the report

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{Instrument, info, info_span, warn};

use super::aggregator::{Aggregator, PairOutcome, PairResult};
use super::cancel::CancelSignal;
use super::delegation::{DelegationCell, DelegationProvider};
use super::initiator::CopyInitiator;
use super::minter::AuthorizationMinter;
use super::pair::PairReplicator;
use super::retry::RetryPolicy;
use super::tracker::CompletionTracker;
use super::worker_pool::{WorkQueue, WorkerPool};
use crate::config::{ConfigError, ReplicationConfig};
use crate::domain::{
    AccountName, ContainerHandle, ContainerName, CopyTask, Decider, DefaultDecider, ErrorKind,
    ObjectIdentity, PopulateFailure, ReplicationError, ReplicationReport, RunId, StopReason,
    StoreError,
};
use crate::impls::UserDelegationSigner;
use crate::ports::{
    Clock, DelegationIssuer, IdGenerator, ObjectStore, SystemClock, TokenSigner, UlidGenerator,
};

/// What to replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRequest {
    pub source: AccountName,
    pub container: ContainerName,
    pub destinations: Vec<AccountName>,
    pub populate: bool,
}

impl ReplicationRequest {
    pub fn new(
        source: AccountName,
        container: ContainerName,
        destinations: impl IntoIterator<Item = AccountName>,
    ) -> Self {
        Self {
            source,
            container,
            destinations: destinations.into_iter().collect(),
            populate: false,
        }
    }

    pub fn with_populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Destinations in first-seen order, without repeats.
    pub fn unique_destinations(&self) -> Vec<AccountName> {
        let mut seen = std::collections::HashSet::new();
        self.destinations
            .iter()
            .filter(|d| seen.insert((*d).clone()))
            .cloned()
            .collect()
    }
}

/// Wiring error, reported before any request is made.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no {0} configured")]
    Missing(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Builds a [`Replicator`].
///
/// The object store and delegation issuer are required. Everything else
/// defaults to the production implementation.
///
/// ```ignore
/// let replicator = ReplicatorBuilder::new(config)
///     .backend(Arc::new(store))
///     .build()?;
/// ```
pub struct ReplicatorBuilder {
    config: ReplicationConfig,
    store: Option<Arc<dyn ObjectStore>>,
    issuer: Option<Arc<dyn DelegationIssuer>>,
    signer: Option<Arc<dyn TokenSigner>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
}

impl ReplicatorBuilder {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            store: None,
            issuer: None,
            signer: None,
            clock: None,
            ids: None,
            decider: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn issuer(mut self, issuer: Arc<dyn DelegationIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Use one value as both object store and delegation issuer.
    pub fn backend<B>(self, backend: Arc<B>) -> Self
    where
        B: ObjectStore + DelegationIssuer + 'static,
    {
        let store: Arc<dyn ObjectStore> = backend.clone();
        self.store(store).issuer(backend)
    }

    pub fn signer(mut self, signer: Arc<dyn TokenSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> Result<Replicator, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::Missing("object store"))?;
        let issuer = self.issuer.ok_or(BuildError::Missing("delegation issuer"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let signer = self
            .signer
            .unwrap_or_else(|| Arc::new(UserDelegationSigner::new()));
        let retry = self.config.copy_start.policy();
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(DefaultDecider::new(
                self.config.max_remints,
                self.config.completion_retries,
                retry.clone(),
            ))
        });
        let provider = Arc::new(DelegationProvider::new(
            issuer,
            Arc::clone(&clock),
            retry.clone(),
            self.config.clock_skew(),
        ));

        Ok(Replicator {
            store,
            provider,
            signer,
            clock,
            ids,
            decider,
            retry,
            config: self.config,
        })
    }
}

pub struct Replicator {
    store: Arc<dyn ObjectStore>,
    provider: Arc<DelegationProvider>,
    signer: Arc<dyn TokenSigner>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    retry: RetryPolicy,
    config: ReplicationConfig,
}

impl Replicator {
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Replicate every object of the source container to each destination.
    ///
    /// Only setup failures are returned as errors. Per-pair failures end up
    /// in the report.
    pub async fn run(
        &self,
        request: ReplicationRequest,
        cancel: CancelSignal,
    ) -> Result<ReplicationReport, ReplicationError> {
        let run_id = self.ids.generate_run_id();
        let span = info_span!(
            "run",
            %run_id,
            source = %request.source,
            container = %request.container,
        );
        self.run_inner(run_id, request, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: RunId,
        request: ReplicationRequest,
        cancel: CancelSignal,
    ) -> Result<ReplicationReport, ReplicationError> {
        let started_at = self.clock.now();
        let run_deadline = self.config.run_timeout().map(|t| Instant::now() + t);
        let destinations = request.unique_destinations();

        let mut setup = Setup::default();
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StopReason::Cancelled),
            _ = deadline(run_deadline) => Err(StopReason::RunTimedOut),
            cell = self.setup(&request, &destinations, &mut setup) => Ok(cell?),
        };

        let objects = setup.objects;
        let mut aggregator = Aggregator::new(&destinations, &request.container, objects.len());
        for (account, err) in &setup.unavailable {
            warn!(destination = %account, error = %err, "destination unavailable");
            aggregator.fail_destination(
                account,
                &objects,
                ErrorKind::DestinationUnavailableError,
                &err.to_string(),
            );
        }

        let stop_reason = match prepared {
            Ok(cell) => {
                self.replicate_all(
                    cell,
                    &objects,
                    &setup.available,
                    &mut aggregator,
                    cancel,
                    run_deadline,
                )
                .await
            }
            Err(stop_reason) => {
                warn!(?stop_reason, "run stopped before replication started");
                stop_reason
            }
        };

        let interrupted = match stop_reason {
            StopReason::Completed => "worker stopped before reporting",
            StopReason::Cancelled => "run cancelled before the copy finished",
            StopReason::RunTimedOut => "run timed out before the copy finished",
        };
        aggregator.fail_unrecorded(&objects, ErrorKind::CancelledError, interrupted);

        let report = ReplicationReport {
            run_id,
            source: request.source,
            container: request.container,
            objects: objects.len(),
            destinations: aggregator.finish(),
            populated: setup.populated,
            populate_failures: setup.populate_failures,
            stop_reason,
            started_at,
            finished_at: self.clock.now(),
        };
        info!(
            success = report.is_success(),
            failed = report.total_failed(),
            ?stop_reason,
            "replication finished"
        );
        Ok(report)
    }

    /// Steps before any copy: source container, samples, credential,
    /// listing, destination containers. Progress lands in `setup` as each
    /// step completes so an interrupted run can still report it.
    async fn setup(
        &self,
        request: &ReplicationRequest,
        destinations: &[AccountName],
        setup: &mut Setup,
    ) -> Result<Arc<DelegationCell>, ReplicationError> {
        let source = self
            .ensure_container(&request.source, &request.container)
            .await
            .map_err(|source| ReplicationError::SourceUnavailable {
                target: format!("{}/{}", request.source, request.container),
                source,
            })?;

        if request.populate {
            self.populate(&source, setup).await;
        }

        let window = self.config.delegation_window();
        let credential = self.provider.obtain(&request.source, window).await?;
        let cell = Arc::new(DelegationCell::new(
            Arc::clone(&self.provider),
            window,
            credential,
        ));

        setup.objects = self.store.list_objects(&source).await.map_err(|e| {
            ReplicationError::SourceUnavailable {
                target: source.to_string(),
                source: e,
            }
        })?;
        info!(objects = setup.objects.len(), "source container listed");

        for (account, ensured) in self
            .prepare_destinations(destinations, &request.container)
            .await
        {
            match ensured {
                Ok(handle) => setup.available.push(handle),
                Err(err) => setup.unavailable.push((account, err)),
            }
        }
        Ok(cell)
    }

    /// Queue every (object, destination) pair and drain it. Pairs left in
    /// the queue when the run stops are recorded as not started.
    async fn replicate_all(
        &self,
        cell: Arc<DelegationCell>,
        objects: &[ObjectIdentity],
        available: &[ContainerHandle],
        aggregator: &mut Aggregator,
        cancel: CancelSignal,
        run_deadline: Option<Instant>,
    ) -> StopReason {
        // interleave destinations so every destination makes progress early
        let tasks: Vec<CopyTask> = objects
            .iter()
            .flat_map(|object| available.iter().map(move |destination| (object, destination)))
            .map(|(object, destination)| {
                CopyTask::new(self.ids.generate_task_id(), object.clone(), destination.clone())
            })
            .collect();
        info!(
            pairs = tasks.len(),
            workers = self.config.concurrency,
            "replication started"
        );

        let queue = Arc::new(WorkQueue::new(tasks));
        let stop_reason = self
            .drain(Arc::clone(&queue), cell, aggregator, cancel, run_deadline)
            .await;

        for task in queue.drain() {
            aggregator.record(PairResult {
                destination: task.destination.account,
                object: task.object,
                outcome: PairOutcome::Failed {
                    kind: ErrorKind::CancelledError,
                    message: "not started".to_string(),
                },
            });
        }
        stop_reason
    }

    /// Run the worker pool until the queue is drained, the run is cancelled,
    /// or the run deadline passes. Results are aggregated as they arrive.
    async fn drain(
        &self,
        queue: Arc<WorkQueue<CopyTask>>,
        cell: Arc<DelegationCell>,
        aggregator: &mut Aggregator,
        cancel: CancelSignal,
        run_deadline: Option<Instant>,
    ) -> StopReason {
        let pair = Arc::new(PairReplicator {
            cell,
            minter: AuthorizationMinter::new(Arc::clone(&self.signer), Arc::clone(&self.clock))
                .with_overflow(self.config.ttl_overflow, self.config.min_authorization_ttl())
                .with_start_backdate(self.config.clock_skew()),
            initiator: CopyInitiator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                self.retry.clone(),
            ),
            tracker: CompletionTracker::new(Arc::clone(&self.store)),
            decider: Arc::clone(&self.decider),
            ids: Arc::clone(&self.ids),
            authorization_ttl: self.config.authorization_ttl(),
            poll: self.config.poll.policy(),
        });

        let (tx, mut rx) = mpsc::channel::<PairResult>(self.config.concurrency * 2);
        let mut pool = WorkerPool::spawn(self.config.concurrency, queue, move |_, task| {
            let pair = Arc::clone(&pair);
            let tx = tx.clone();
            async move {
                let result = pair.replicate(task).await;
                // the receiver only goes away once every worker is done
                let _ = tx.send(result).await;
            }
        });

        let grace = self.config.grace_period();
        let supervise = async {
            let stop_reason = tokio::select! {
                _ = pool.join() => StopReason::Completed,
                _ = cancel.cancelled() => StopReason::Cancelled,
                _ = deadline(run_deadline) => StopReason::RunTimedOut,
            };
            if stop_reason != StopReason::Completed {
                warn!(?stop_reason, ?grace, "stopping workers");
                if pool.stop(grace).await {
                    warn!("in-flight copies aborted after the grace period");
                }
            }
            stop_reason
        };
        let collect = async {
            while let Some(result) = rx.recv().await {
                aggregator.record(result);
            }
        };

        let (stop_reason, ()) = tokio::join!(supervise, collect);
        stop_reason
    }

    async fn ensure_container(
        &self,
        account: &AccountName,
        container: &ContainerName,
    ) -> Result<ContainerHandle, StoreError> {
        let mut attempt = 1;
        loop {
            match self.store.create_container_if_absent(account, container).await {
                Ok(handle) => return Ok(handle),
                Err(err) if err.is_transient() && self.retry.allows_another(attempt) => {
                    let delay = self.retry.next_delay(attempt);
                    warn!(%account, %container, attempt, ?delay, error = %err, "container ensure failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn prepare_destinations(
        &self,
        destinations: &[AccountName],
        container: &ContainerName,
    ) -> Vec<(AccountName, Result<ContainerHandle, StoreError>)> {
        stream::iter(destinations)
            .map(|account| async move {
                (account.clone(), self.ensure_container(account, container).await)
            })
            .buffered(self.config.concurrency)
            .collect()
            .await
    }

    /// Upload `blob_1.txt` .. `blob_{n}.txt` with the sample content.
    async fn populate(&self, container: &ContainerHandle, setup: &mut Setup) {
        let content = Bytes::from(self.config.populate_content.clone());
        let results: Vec<(String, Result<(), StoreError>)> =
            stream::iter(1..=self.config.populate_count)
                .map(|i| {
                    let content = content.clone();
                    async move {
                        let name = format!("blob_{i}.txt");
                        let uploaded = self.store.put_object(container, &name, content).await;
                        (name, uploaded)
                    }
                })
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;

        for (name, uploaded) in results {
            match uploaded {
                Ok(()) => setup.populated += 1,
                Err(err) => {
                    warn!(object = %name, error = %err, "sample upload failed");
                    setup.populate_failures.push(PopulateFailure {
                        name,
                        message: err.to_string(),
                    });
                }
            }
        }
        setup.populate_failures.sort_by(|a, b| a.name.cmp(&b.name));
        info!(
            populated = setup.populated,
            failed = setup.populate_failures.len(),
            "source container populated"
        );
    }
}

/// Setup progress of one run.
#[derive(Default)]
struct Setup {
    populated: usize,
    populate_failures: Vec<PopulateFailure>,
    objects: Vec<ObjectIdentity>,
    available: Vec<ContainerHandle>,
    unavailable: Vec<(AccountName, StoreError)>,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
