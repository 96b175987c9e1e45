//! Bounded fan-out collection of remote entities.
//!
//! The `FanoutCollector` queries every entity of a `RemoteEntityClient` with
//! a fixed number of concurrent workers. Each worker performs the detail call
//! and, only if it succeeds, the metrics call. A worker's single outcome is
//! handed back through its `JoinHandle` and merged by the coordinator after
//! every dispatched task has finished, so workers never share a mutable
//! result vector.
//!
//! Workers listen on a child of the collector's cancellation token that is
//! cancelled when `collect` returns or its future is dropped, so no worker
//! outlives the batch that spawned it.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{
    error::{EntityError, FetchStage, PreconditionError},
    traits::RemoteEntityClient,
    types::{CollectResult, CollectedResult, Collection, EntityHandle},
};
use crate::config::collector::CollectorConfig;

type EntityOutcome<C> = Result<
    CollectedResult<<C as RemoteEntityClient>::Detail, <C as RemoteEntityClient>::Metrics>,
    EntityError,
>;

/// Collects detail and metrics for many entities with bounded parallelism.
pub struct FanoutCollector<C: RemoteEntityClient> {
    client: Arc<C>,
    concurrency: usize,
    fetch_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<C: RemoteEntityClient> Clone for FanoutCollector<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            concurrency: self.concurrency,
            fetch_timeout: self.fetch_timeout,
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: RemoteEntityClient> FanoutCollector<C> {
    /// Creates a collector whose worker pool holds `concurrency` slots.
    ///
    /// # Errors
    ///
    /// Returns `PreconditionError::InvalidConcurrency` if `concurrency` is zero.
    pub fn new(client: Arc<C>, concurrency: usize) -> CollectResult<Self> {
        if concurrency == 0 {
            return Err(PreconditionError::InvalidConcurrency(concurrency));
        }
        Ok(Self {
            client,
            concurrency,
            fetch_timeout: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Creates a collector sized and bounded by the collector configuration.
    pub fn from_config(client: Arc<C>, config: &CollectorConfig) -> CollectResult<Self> {
        Ok(Self::new(client, config.concurrency)?.with_fetch_timeout(config.fetch_timeout()))
    }

    /// Sets a deadline for each entity's detail + metrics pair.
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Threads an external cancellation signal through dispatch and all workers.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Lists every entity of the backend and collects all of them.
    ///
    /// # Errors
    ///
    /// Only a failed listing is fatal; per-entity failures end up in
    /// `Collection::errors`.
    pub async fn collect_all(&self) -> CollectResult<Collection<C::Detail, C::Metrics>> {
        let entities = self
            .client
            .list_entities()
            .await
            .map_err(PreconditionError::Listing)?;
        debug!("Listed {} entities", entities.len());
        Ok(self.collect(entities).await)
    }

    /// Collects the given entities.
    ///
    /// Returns only after every dispatched worker has terminated. Each entity
    /// appears exactly once, either in `results` or in `errors`. Result order
    /// follows dispatch order but callers must not rely on it.
    pub async fn collect(&self, entities: Vec<EntityHandle>) -> Collection<C::Detail, C::Metrics> {
        let total = entities.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: Vec<(EntityHandle, JoinHandle<EntityOutcome<C>>)> =
            Vec::with_capacity(total);
        let mut collection = Collection::with_capacity(total);
        let stop = self.cancel.child_token();
        let _stop_workers = stop.clone().drop_guard();

        let mut pending = entities.into_iter();
        while let Some(handle) = pending.next() {
            // Blocks while the pool is saturated.
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                let skipped = std::iter::once(handle).chain(pending.by_ref());
                collection
                    .errors
                    .extend(skipped.map(|handle| EntityError::Cancelled { handle }));
                warn!(
                    "Collection cancelled, {} entities were not dispatched",
                    collection.errors.len()
                );
                break;
            };

            let client = self.client.clone();
            let stop = stop.clone();
            let timeout = self.fetch_timeout;
            let task_handle = handle.clone();
            let worker = tokio::spawn(
                async move {
                    let _permit = permit;
                    fetch_entity(client.as_ref(), task_handle, timeout, &stop).await
                }
                .in_current_span(),
            );
            workers.push((handle, worker));
        }

        // Join barrier over every dispatched worker.
        for (handle, worker) in workers {
            match worker.await {
                Ok(Ok(result)) => collection.results.push(result),
                Ok(Err(err)) => {
                    warn!(handle = %handle, "{}", err);
                    collection.errors.push(err);
                }
                Err(join_err) => {
                    let err = EntityError::WorkerPanicked {
                        handle,
                        reason: join_err.to_string(),
                    };
                    warn!("{}", err);
                    collection.errors.push(err);
                }
            }
        }

        info!(
            "Collected {} of {} entities ({} failed)",
            collection.results.len(),
            total,
            collection.errors.len()
        );
        collection
    }
}

/// Runs the detail then metrics pair for one entity, bounded by the optional
/// deadline and abandoned on cancellation.
async fn fetch_entity<C: RemoteEntityClient>(
    client: &C,
    handle: EntityHandle,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> EntityOutcome<C> {
    let pair = async {
        let detail = client
            .fetch_detail(&handle)
            .await
            .map_err(|source| EntityError::Fetch {
                handle: handle.clone(),
                stage: FetchStage::Detail,
                source,
            })?;
        let metrics = client
            .fetch_metrics(&handle)
            .await
            .map_err(|source| EntityError::Fetch {
                handle: handle.clone(),
                stage: FetchStage::Metrics,
                source,
            })?;
        Ok::<_, EntityError>(CollectedResult {
            handle: handle.clone(),
            detail,
            metrics,
        })
    };

    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, pair)
                .await
                .unwrap_or_else(|_| {
                    Err(EntityError::TimedOut {
                        handle: handle.clone(),
                        timeout: limit,
                    })
                }),
            None => pair.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EntityError::Cancelled { handle: handle.clone() }),
        outcome = bounded => outcome,
    }
}
