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
    collections::{HashMap, HashSet},
    sync::Arc,
};

use alloy_primitives::Address;
#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;
use opbundler_sim::SimulationResult;
use opbundler_types::{
    pool::{MempoolError, ReputationStatus},
    UserOperation, UserOperationKey,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::reputation::ReputationStore;

/// Per-operation state threaded through a [`Pipeline`]
#[derive(Debug, Clone)]
pub struct Context {
    /// The operation being evaluated
    pub op: UserOperation,
    /// Entry point the operation targets
    pub entry_point: Address,
    /// Chain the operation targets
    pub chain_id: u64,
    /// Set by the simulation module
    pub simulation: Option<SimulationResult>,
    /// Status of each entity of the operation when evaluation started
    pub reputation: HashMap<Address, ReputationStatus>,
    /// Shared state of the bundling cycle, unset during admission
    pub cycle: Option<Arc<CycleState>>,
}

impl Context {
    /// Create a context, snapshotting the reputation of the operation's entities
    pub fn new<R: ReputationStore + ?Sized>(
        op: UserOperation,
        entry_point: Address,
        chain_id: u64,
        reputation: &R,
    ) -> Self {
        let reputation = op
            .entities()
            .into_iter()
            .map(|e| (e.address, reputation.status(e.address)))
            .collect();
        Self {
            op,
            entry_point,
            chain_id,
            simulation: None,
            reputation,
            cycle: None,
        }
    }

    /// Attach the state of the current bundling cycle
    pub fn with_cycle(self, cycle: Arc<CycleState>) -> Self {
        Self {
            cycle: Some(cycle),
            ..self
        }
    }

    /// Pool key of the operation
    pub fn key(&self) -> UserOperationKey {
        self.op.key(self.entry_point)
    }

    /// Snapshotted status of an entity address
    pub fn status(&self, address: Address) -> ReputationStatus {
        self.reputation
            .get(&address)
            .copied()
            .unwrap_or(ReputationStatus::Ok)
    }
}

/// State shared by every operation evaluated in one bundling cycle
#[derive(Debug, Default)]
pub struct CycleState {
    throttled_included: Mutex<HashSet<Address>>,
}

impl CycleState {
    /// Claim the single slot a throttled entity has in this cycle.
    ///
    /// Returns false if the slot was already taken.
    pub fn claim_throttled_slot(&self, address: Address) -> bool {
        self.throttled_included.lock().insert(address)
    }
}

/// A step of a [`Pipeline`]
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait::async_trait]
pub trait Module: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Evaluate the operation in `ctx`, failing with an admission error
    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError>;
}

/// Ordered list of modules run in sequence.
///
/// The first failing module aborts the run, later modules never see the
/// operation. Effects of modules that already ran are kept.
#[derive(Clone, Default)]
pub struct Pipeline {
    modules: Vec<Arc<dyn Module>>,
}

impl Pipeline {
    /// Create a pipeline from an ordered list of modules
    pub fn new(modules: Vec<Arc<dyn Module>>) -> Self {
        Self { modules }
    }

    /// Append a module
    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    /// Names of the modules, in order
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Run every module on `ctx`, stopping at the first error
    pub async fn run(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        for module in &self.modules {
            if let Err(e) = module.handle(ctx).await {
                debug!(
                    "module {} rejected op from {:?}: {e}",
                    module.name(),
                    ctx.op.sender
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("modules", &self.module_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use mockall::Sequence;

    use super::*;
    use crate::reputation::MockReputationStore;

    fn context() -> Context {
        let mut reputation = MockReputationStore::new();
        reputation
            .expect_status()
            .returning(|_| ReputationStatus::Ok);
        Context::new(UserOperation::default(), Address::ZERO, 1, &reputation)
    }

    fn module(name: &'static str) -> MockModule {
        let mut m = MockModule::new();
        m.expect_name().return_const(name);
        m
    }

    #[tokio::test]
    async fn runs_modules_in_order() {
        let mut seq = Sequence::new();
        let mut m1 = module("m1");
        m1.expect_handle()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut m2 = module("m2");
        m2.expect_handle()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ctx| {
                ctx.chain_id = 2;
                Ok(())
            });

        let pipeline = Pipeline::new(vec![Arc::new(m1), Arc::new(m2)]);
        let mut ctx = context();
        pipeline.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.chain_id, 2);
    }

    #[tokio::test]
    async fn first_failure_short_circuits() {
        let mut m1 = module("m1");
        m1.expect_handle().times(1).returning(|_| {
            Err(MempoolError::BelowGasFloor(
                U256::from(1),
                U256::from(9100),
            ))
        });
        let mut m2 = module("m2");
        m2.expect_handle().never();

        let pipeline = Pipeline::new(vec![Arc::new(m1)]).with_module(Arc::new(m2));
        let err = pipeline.run(&mut context()).await.unwrap_err();
        assert!(
            matches!(err, MempoolError::BelowGasFloor(got, floor)
                if got == U256::from(1) && floor == U256::from(9100))
        );
    }

    #[tokio::test]
    async fn empty_pipeline_passes() {
        Pipeline::default().run(&mut context()).await.unwrap();
    }

    #[test]
    fn context_snapshots_entity_status() {
        let paymaster = Address::repeat_byte(0x11);
        let op = UserOperation {
            sender: Address::repeat_byte(0x22),
            paymaster_and_data: paymaster.to_vec().into(),
            ..Default::default()
        };
        let mut reputation = MockReputationStore::new();
        reputation.expect_status().returning(move |a| {
            if a == paymaster {
                ReputationStatus::Throttled
            } else {
                ReputationStatus::Ok
            }
        });

        let ctx = Context::new(op, Address::ZERO, 1, &reputation);
        assert_eq!(ctx.reputation.len(), 2);
        assert_eq!(ctx.status(paymaster), ReputationStatus::Throttled);
        assert_eq!(ctx.status(Address::random()), ReputationStatus::Ok);
    }

    #[test]
    fn throttled_slot_claimed_once() {
        let cycle = CycleState::default();
        let addr = Address::random();
        assert!(cycle.claim_throttled_slot(addr));
        assert!(!cycle.claim_throttled_slot(addr));
        assert!(cycle.claim_throttled_slot(Address::random()));
    }
}
