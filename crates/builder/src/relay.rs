// This file is part of opbundler.
//
// opbundler is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// opbundler is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with opbundler.
// If not, see https://www.gnu.org/licenses/.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256};
use futures::future;
use metrics::Counter;
use metrics_derive::Metrics;
use opbundler_pool::{
    BanThreshold, Context, CycleState, Database, Mempool, OpRemovalReason, Pipeline, PoolEvent,
    ReputationStore,
};
use opbundler_provider::{EntryPoint, EvmProvider, HandleOpsOut, ProviderError};
use opbundler_types::{pool::PoolOperation, UserOperation};
use opbundler_utils::emit::WithEntryPoint;
use tokio::{
    sync::{broadcast, Mutex},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::emit::BuilderEvent;

/// Relay settings
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Receives the bundle fees, and sends the bundle transaction
    pub beneficiary: Address,
    /// Maximum number of operations in a bundle
    pub max_bundle_size: usize,
    /// Time between bundling cycles
    pub bundle_interval: Duration,
}

/// Bundle submission error
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The entry point rejected an operation of the bundle
    #[error("op at index {0} failed in bundle: {1}")]
    FailedOp(usize, String),
    /// An aggregator rejected the bundle signature
    #[error("signature validation failed for aggregator {0}")]
    SignatureValidationFailed(Address),
    /// The node failed the call or the transaction
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// An operation left out of a bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedOp {
    /// Operation hash
    pub op_hash: B256,
    /// Sender of the operation
    pub sender: Address,
    /// Reason for dropping
    pub reason: String,
    /// Whether the operation was removed from the pool
    pub removed: bool,
}

/// Result of a bundling cycle
#[derive(Debug)]
pub enum BundleOutcome {
    /// A bundle transaction was sent
    Submitted {
        /// Transaction hash
        tx_hash: B256,
        /// Bundled operation hashes, in bundle order
        ops: Vec<B256>,
        /// Operations left out of the bundle
        dropped: Vec<DroppedOp>,
    },
    /// No operation survived selection
    NothingToSend {
        /// Operations left out of the bundle
        dropped: Vec<DroppedOp>,
    },
    /// Submission failed
    Failed {
        /// Submission error
        error: BundleError,
        /// Operations left out of the bundle
        dropped: Vec<DroppedOp>,
    },
    /// Another cycle was running, nothing was done
    CycleInProgress,
}

/// Builds bundles from the pool and submits them to an entry point.
///
/// At most one cycle runs at a time, and at most one bundle transaction is
/// in flight.
pub struct Relay<D, R, P, E> {
    mempool: Arc<Mempool<D>>,
    reputation: Arc<R>,
    provider: Arc<P>,
    entry_point: Arc<E>,
    pipeline: Pipeline,
    included_pipeline: Pipeline,
    settings: Settings,
    cycle_lock: Mutex<()>,
    submission_lock: Mutex<()>,
    event_sender: broadcast::Sender<WithEntryPoint<BuilderEvent>>,
    pool_event_sender: broadcast::Sender<WithEntryPoint<PoolEvent>>,
    metrics: RelayMetrics,
}

impl<D, R, P, E> Relay<D, R, P, E>
where
    D: Database,
    R: ReputationStore,
    P: EvmProvider,
    E: EntryPoint,
{
    /// Create a relay.
    ///
    /// `pipeline` re-validates each candidate, `included_pipeline` runs for
    /// each operation of a submitted bundle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mempool: Arc<Mempool<D>>,
        reputation: Arc<R>,
        provider: Arc<P>,
        entry_point: Arc<E>,
        pipeline: Pipeline,
        included_pipeline: Pipeline,
        settings: Settings,
        event_sender: broadcast::Sender<WithEntryPoint<BuilderEvent>>,
        pool_event_sender: broadcast::Sender<WithEntryPoint<PoolEvent>>,
    ) -> Self {
        Self {
            mempool,
            reputation,
            provider,
            entry_point,
            pipeline,
            included_pipeline,
            settings,
            cycle_lock: Mutex::new(()),
            submission_lock: Mutex::new(()),
            event_sender,
            pool_event_sender,
            metrics: RelayMetrics::default(),
        }
    }

    /// Run bundling cycles on the configured interval, forever
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            "relay for entry point {:?} bundling every {:?}",
            self.entry_point.address(),
            self.settings.bundle_interval
        );
        let mut tick = time::interval(self.settings.bundle_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            log_outcome(&self.bundle_once().await);
        }
    }

    /// Run one cycle, unless one is already running
    pub async fn bundle_once(&self) -> BundleOutcome {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("bundling cycle already in progress, skipping");
            self.metrics.cycles_skipped.increment(1);
            return BundleOutcome::CycleInProgress;
        };
        self.run_cycle().await
    }

    /// Run one cycle now, waiting for a running one to finish first
    pub async fn send_bundle_now(&self) -> BundleOutcome {
        let _cycle = self.cycle_lock.lock().await;
        let outcome = self.run_cycle().await;
        log_outcome(&outcome);
        outcome
    }

    /// Change the ban tier of the reputation store
    pub fn set_ban_threshold(&self, threshold: BanThreshold) {
        info!("setting ban threshold to {threshold:?}");
        self.reputation.set_ban_threshold(threshold);
    }

    async fn run_cycle(&self) -> BundleOutcome {
        let entry_point = self.entry_point.address();
        let candidates: Vec<_> = self
            .mempool
            .eligible(usize::MAX)
            .filter(|op| op.entry_point == entry_point)
            .take(self.settings.max_bundle_size)
            .collect();
        if candidates.is_empty() {
            return BundleOutcome::NothingToSend { dropped: vec![] };
        }

        let cycle = Arc::new(CycleState::default());
        let evaluations = candidates.into_iter().map(|po| {
            let mut ctx = Context::new(
                po.uo.clone(),
                po.entry_point,
                po.chain_id,
                &*self.reputation,
            )
            .with_cycle(Arc::clone(&cycle));
            async move {
                let result = self.pipeline.run(&mut ctx).await;
                (po, ctx, result)
            }
        });

        let mut accepted = vec![];
        let mut dropped = vec![];
        for (po, ctx, result) in future::join_all(evaluations).await {
            match result {
                Ok(()) => accepted.push((po, ctx)),
                Err(e) => {
                    dropped.push(self.drop_op(&po, e.into_caller_error().to_string(), false))
                }
            }
        }
        if accepted.is_empty() {
            return BundleOutcome::NothingToSend { dropped };
        }

        let _submission = self.submission_lock.lock().await;
        let ops = accepted.iter().map(|(po, _)| po.uo.clone()).collect();
        match self.submit(ops).await {
            Ok(tx_hash) => {
                let hashes: Vec<_> = accepted.iter().map(|(po, _)| po.hash()).collect();
                for (po, mut ctx) in accepted {
                    self.remove(&po, OpRemovalReason::Submitted { tx_hash });
                    if let Err(e) = self.included_pipeline.run(&mut ctx).await {
                        warn!("included bookkeeping failed for {:?}: {e}", po.hash());
                    }
                }

                self.metrics.bundles_submitted.increment(1);
                self.metrics.ops_bundled.increment(hashes.len() as u64);
                self.emit(BuilderEvent::BundleSubmitted {
                    tx_hash,
                    ops: hashes.clone(),
                });
                BundleOutcome::Submitted {
                    tx_hash,
                    ops: hashes,
                    dropped,
                }
            }
            Err(BundleError::FailedOp(index, reason)) => {
                // the op cannot succeed as is, the rest are retried next cycle
                if let Some((po, _)) = accepted.get(index) {
                    let removed = self.remove(
                        po,
                        OpRemovalReason::Failed {
                            reason: reason.clone(),
                        },
                    );
                    dropped.push(self.drop_op(po, reason.clone(), removed));
                }
                self.submission_failed(BundleError::FailedOp(index, reason), dropped)
            }
            Err(error) => self.submission_failed(error, dropped),
        }
    }

    async fn submit(&self, ops: Vec<UserOperation>) -> Result<B256, BundleError> {
        let beneficiary = self.settings.beneficiary;
        match self
            .entry_point
            .call_handle_ops(ops.clone(), beneficiary)
            .await?
        {
            HandleOpsOut::Success => {}
            HandleOpsOut::FailedOp(index, reason) => {
                return Err(BundleError::FailedOp(index, reason));
            }
            HandleOpsOut::SignatureValidationFailed(aggregator) => {
                return Err(BundleError::SignatureValidationFailed(aggregator));
            }
        }

        let tx = self
            .entry_point
            .get_send_bundle_transaction(ops, beneficiary, beneficiary);
        Ok(self.provider.send_transaction(tx).await?)
    }

    // returns true if the op was still pending
    fn remove(&self, po: &PoolOperation, reason: OpRemovalReason) -> bool {
        let op_hash = po.hash();
        match self.mempool.remove_by_hash(op_hash) {
            Ok(Some(_)) => {
                let _ = self.pool_event_sender.send(WithEntryPoint {
                    entry_point: po.entry_point,
                    event: PoolEvent::RemovedOp { op_hash, reason },
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("failed to remove op {op_hash:?} from pool: {e}");
                false
            }
        }
    }

    fn drop_op(&self, po: &PoolOperation, reason: String, removed: bool) -> DroppedOp {
        let dropped = DroppedOp {
            op_hash: po.hash(),
            sender: po.uo.sender,
            reason,
            removed,
        };
        self.metrics.ops_dropped.increment(1);
        self.emit(BuilderEvent::OpDropped {
            op_hash: dropped.op_hash,
            sender: dropped.sender,
            reason: dropped.reason.clone(),
            removed,
        });
        dropped
    }

    fn submission_failed(&self, error: BundleError, dropped: Vec<DroppedOp>) -> BundleOutcome {
        self.metrics.submission_failures.increment(1);
        self.emit(BuilderEvent::SubmissionFailed {
            error: error.to_string(),
        });
        BundleOutcome::Failed { error, dropped }
    }

    fn emit(&self, event: BuilderEvent) {
        let _ = self.event_sender.send(WithEntryPoint {
            entry_point: self.entry_point.address(),
            event,
        });
    }
}

fn log_outcome(outcome: &BundleOutcome) {
    match outcome {
        BundleOutcome::Submitted {
            tx_hash,
            ops,
            dropped,
        } => info!(
            "submitted bundle {tx_hash:?} with {} ops, {} dropped",
            ops.len(),
            dropped.len()
        ),
        BundleOutcome::NothingToSend { dropped } => {
            debug!("nothing to bundle, {} dropped", dropped.len())
        }
        BundleOutcome::Failed { error, .. } => warn!("bundle submission failed: {error:?}"),
        BundleOutcome::CycleInProgress => {}
    }
}

#[derive(Metrics)]
#[metrics(scope = "builder")]
struct RelayMetrics {
    #[metric(describe = "the count of bundle transactions sent.")]
    bundles_submitted: Counter,
    #[metric(describe = "the count of operations in sent bundles.")]
    ops_bundled: Counter,
    #[metric(describe = "the count of operations dropped from bundles.")]
    ops_dropped: Counter,
    #[metric(describe = "the count of failed bundle submissions.")]
    submission_failures: Counter,
    #[metric(describe = "the count of cycles skipped because one was running.")]
    cycles_skipped: Counter,
}
