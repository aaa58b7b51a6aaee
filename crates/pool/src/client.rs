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

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use alloy_primitives::{Address, B256, U256};
use metrics::Counter;
use metrics_derive::Metrics;
use opbundler_provider::EvmProvider;
use opbundler_sim::{call_gas_estimate, GasOverheads};
use opbundler_types::{
    pool::{MempoolError, PoolOperation, Reputation, ReputationStatus},
    UserOperation,
};
use opbundler_utils::emit::WithEntryPoint;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    db::Database,
    emit::PoolEvent,
    mempool::{AdmitOutcome, Mempool},
    pipeline::{Context, Pipeline},
    reputation::ReputationStore,
};

/// Gas values for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    /// Pre verification gas
    pub pre_verification_gas: U256,
    /// Verification gas limit
    pub verification_gas_limit: U256,
    /// Call gas limit
    pub call_gas_limit: U256,
}

/// Client settings
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Chain id operations are admitted for
    pub chain_id: u64,
    /// Verification gas limit returned by estimation
    pub max_verification_gas: U256,
    /// Gas overhead model
    pub overheads: GasOverheads,
}

/// Admission API of the bundler.
///
/// Each supported entry point has its own inbound pipeline. Operations
/// passing the pipeline are admitted to the shared pending store.
pub struct Client<D, R, P> {
    mempool: Arc<Mempool<D>>,
    reputation: Arc<R>,
    provider: Arc<P>,
    pipelines: HashMap<Address, Pipeline>,
    settings: Settings,
    event_sender: broadcast::Sender<WithEntryPoint<PoolEvent>>,
    metrics: PoolMetrics,
}

impl<D, R, P> Client<D, R, P>
where
    D: Database,
    R: ReputationStore,
    P: EvmProvider,
{
    /// Create a client with no supported entry points
    pub fn new(
        mempool: Arc<Mempool<D>>,
        reputation: Arc<R>,
        provider: Arc<P>,
        settings: Settings,
        event_sender: broadcast::Sender<WithEntryPoint<PoolEvent>>,
    ) -> Self {
        Self {
            mempool,
            reputation,
            provider,
            pipelines: HashMap::new(),
            settings,
            event_sender,
            metrics: PoolMetrics::default(),
        }
    }

    /// Support an entry point, admitting its operations through `pipeline`
    pub fn with_entry_point(mut self, entry_point: Address, pipeline: Pipeline) -> Self {
        info!(
            "entry point {entry_point:?} admission pipeline: {:?}",
            pipeline.module_names()
        );
        self.pipelines.insert(entry_point, pipeline);
        self
    }

    /// Validate and admit an operation, returning its hash
    pub async fn send_user_operation(
        &self,
        op: UserOperation,
        entry_point: Address,
    ) -> Result<B256, MempoolError> {
        let Some(pipeline) = self.pipelines.get(&entry_point) else {
            return Err(MempoolError::UnsupportedEntryPoint(entry_point));
        };

        let op_hash = op.hash(entry_point, self.settings.chain_id);
        let sender = op.sender;
        match self.admit(op, entry_point, pipeline).await {
            Ok(AdmitOutcome { hash, replaced }) => {
                self.metrics.ops_admitted.increment(1);
                if replaced.is_some() {
                    self.metrics.ops_replaced.increment(1);
                }
                if let Some(entry) = self.mempool.get_by_hash(hash) {
                    self.emit(
                        entry_point,
                        PoolEvent::ReceivedOp {
                            op_hash: hash,
                            entities: entry.uo.entities(),
                            op: entry.uo,
                            replaced,
                        },
                    );
                }
                Ok(hash)
            }
            Err(error) => {
                let error = error.into_caller_error();
                metrics::counter!("op_pool_ops_rejected", "kind" => error.kind()).increment(1);
                self.emit(
                    entry_point,
                    PoolEvent::RejectedOp {
                        op_hash,
                        sender,
                        reason: error.to_string(),
                    },
                );
                Err(error)
            }
        }
    }

    async fn admit(
        &self,
        op: UserOperation,
        entry_point: Address,
        pipeline: &Pipeline,
    ) -> Result<AdmitOutcome, MempoolError> {
        let mut entry = PoolOperation {
            uo: op.clone(),
            entry_point,
            chain_id: self.settings.chain_id,
            admitted_at: 0,
        };
        // fail underpriced replacements before simulating
        self.mempool.check_replacement(&entry)?;

        let mut ctx = Context::new(op, entry_point, self.settings.chain_id, &*self.reputation);
        pipeline.run(&mut ctx).await?;

        entry.admitted_at = now_millis();
        let outcome = self.mempool.admit(entry)?;
        debug!("admitted op {:?}", outcome.hash);
        Ok(outcome)
    }

    /// Pending operation with the given hash
    pub fn get_user_operation_by_hash(&self, hash: B256) -> Option<PoolOperation> {
        self.mempool.get_by_hash(hash)
    }

    /// Estimate gas values for an operation
    pub async fn estimate_user_operation_gas(
        &self,
        op: UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, MempoolError> {
        if !self.pipelines.contains_key(&entry_point) {
            return Err(MempoolError::UnsupportedEntryPoint(entry_point));
        }

        let overheads = &self.settings.overheads;
        let call_gas = call_gas_estimate(&*self.provider, entry_point, &op).await?;
        Ok(GasEstimate {
            pre_verification_gas: overheads.static_pre_verification_gas(&op),
            verification_gas_limit: self.settings.max_verification_gas,
            call_gas_limit: call_gas.max(overheads.non_zero_value_call()),
        })
    }

    /// Supported entry points, sorted
    pub fn supported_entry_points(&self) -> Vec<Address> {
        let mut eps: Vec<_> = self.pipelines.keys().copied().collect();
        eps.sort();
        eps
    }

    /// Chain id operations are admitted for
    pub fn chain_id(&self) -> u64 {
        self.settings.chain_id
    }

    /// Debug: all pending operations of an entry point
    pub fn dump_mempool(&self, entry_point: Address) -> Result<Vec<PoolOperation>, MempoolError> {
        if !self.pipelines.contains_key(&entry_point) {
            return Err(MempoolError::UnsupportedEntryPoint(entry_point));
        }
        Ok(self.mempool.all(entry_point))
    }

    /// Debug: all reputation counters with their status
    pub fn dump_reputation(&self) -> Vec<(Reputation, ReputationStatus)> {
        self.reputation.dump_reputation()
    }

    /// Debug: overwrite the counters of an address
    pub fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64) {
        self.reputation
            .set_reputation(address, ops_seen, ops_included);
    }

    /// Debug: drop every pending operation and reputation counter
    pub fn clear_state(&self) -> Result<(), MempoolError> {
        self.mempool.clear()?;
        self.reputation.clear();
        info!("cleared pool and reputation state");
        Ok(())
    }

    fn emit(&self, entry_point: Address, event: PoolEvent) {
        let _ = self.event_sender.send(WithEntryPoint { entry_point, event });
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Metrics)]
#[metrics(scope = "op_pool")]
struct PoolMetrics {
    #[metric(describe = "the count of admitted operations.")]
    ops_admitted: Counter,
    #[metric(describe = "the count of admissions that replaced a pending operation.")]
    ops_replaced: Counter,
}
