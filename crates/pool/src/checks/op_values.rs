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

use std::sync::Arc;

use alloy_primitives::U256;
use anyhow::Context as _;
use opbundler_provider::EntryPoint;
use opbundler_sim::GasOverheads;
use opbundler_types::pool::MempoolError;

use crate::{
    db::Database,
    mempool::Mempool,
    pipeline::{Context, Module},
};

/// Limits on the values of an operation
#[derive(Debug, Clone, Copy)]
pub struct OpValueSettings {
    /// Maximum verification gas limit
    pub max_verification_gas: U256,
    /// Maximum number of pending operations referencing an unstaked sender
    pub max_ops_for_unstaked_sender: usize,
}

impl Default for OpValueSettings {
    fn default() -> Self {
        Self {
            max_verification_gas: U256::from(5_000_000),
            max_ops_for_unstaked_sender: 4,
        }
    }
}

/// Checks the gas floor, the verification gas cap and the pending op count of
/// unstaked senders.
pub struct ValidateOpValues<D, E> {
    mempool: Arc<Mempool<D>>,
    entry_point: Arc<E>,
    overheads: GasOverheads,
    settings: OpValueSettings,
}

impl<D, E> ValidateOpValues<D, E> {
    /// Create the module
    pub fn new(
        mempool: Arc<Mempool<D>>,
        entry_point: Arc<E>,
        overheads: GasOverheads,
        settings: OpValueSettings,
    ) -> Self {
        Self {
            mempool,
            entry_point,
            overheads,
            settings,
        }
    }
}

#[async_trait::async_trait]
impl<D, E> Module for ValidateOpValues<D, E>
where
    D: Database,
    E: EntryPoint + 'static,
{
    fn name(&self) -> &'static str {
        "ValidateOpValues"
    }

    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        let op = &ctx.op;

        let floor = self.overheads.non_zero_value_call();
        if op.call_gas_limit < floor {
            return Err(MempoolError::BelowGasFloor(op.call_gas_limit, floor));
        }

        if op.verification_gas_limit > self.settings.max_verification_gas {
            return Err(MempoolError::AboveVerificationCap(
                op.verification_gas_limit,
                self.settings.max_verification_gas,
            ));
        }

        // a replacement does not add to the count
        let key = ctx.key();
        let pending = self.mempool.count_by_address(op.sender, Some(&key));
        if pending >= self.settings.max_ops_for_unstaked_sender {
            let info = self
                .entry_point
                .get_deposit_info(op.sender)
                .await
                .context("failed to query sender stake")?;
            if !info.staked {
                return Err(MempoolError::TooManyOpsForUnstakedSender(
                    op.sender,
                    self.settings.max_ops_for_unstaked_sender,
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;
    use opbundler_provider::{DepositInfo, MockEntryPoint};
    use opbundler_types::pool::PoolOperation;

    use super::*;
    use crate::{
        checks::test_utils::{context, op, EP},
        db::MemoryDatabase,
        mempool::PoolConfig,
    };

    fn module(
        mempool: Arc<Mempool<MemoryDatabase>>,
        entry_point: MockEntryPoint,
    ) -> ValidateOpValues<MemoryDatabase, MockEntryPoint> {
        ValidateOpValues::new(
            mempool,
            Arc::new(entry_point),
            GasOverheads::default(),
            OpValueSettings {
                max_verification_gas: U256::from(1_000_000),
                max_ops_for_unstaked_sender: 1,
            },
        )
    }

    fn empty_pool() -> Arc<Mempool<MemoryDatabase>> {
        Arc::new(Mempool::new(Arc::new(MemoryDatabase::new()), PoolConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn gas_floor_boundary() {
        let check = module(empty_pool(), MockEntryPoint::new());
        let floor = GasOverheads::default().non_zero_value_call();

        let mut below = op();
        below.call_gas_limit = floor - U256::from(1);
        let err = check.handle(&mut context(below)).await.unwrap_err();
        assert!(matches!(err, MempoolError::BelowGasFloor(got, f) if got == floor - U256::from(1) && f == floor));

        let mut at = op();
        at.call_gas_limit = floor;
        check.handle(&mut context(at)).await.unwrap();
    }

    #[tokio::test]
    async fn verification_cap() {
        let check = module(empty_pool(), MockEntryPoint::new());

        let mut at_cap = op();
        at_cap.verification_gas_limit = U256::from(1_000_000);
        check.handle(&mut context(at_cap)).await.unwrap();

        let mut above = op();
        above.verification_gas_limit = U256::from(1_000_001);
        let err = check.handle(&mut context(above)).await.unwrap_err();
        assert!(matches!(err, MempoolError::AboveVerificationCap(_, _)));
    }

    fn pool_with_paymaster_op(sender: Address) -> Arc<Mempool<MemoryDatabase>> {
        let pool = empty_pool();
        // a pending op of another sender, sponsored by `sender`
        let mut pending = op();
        pending.sender = Address::repeat_byte(0x99);
        pending.paymaster_and_data = sender.to_vec().into();
        pool.admit(PoolOperation {
            uo: pending,
            entry_point: EP,
            chain_id: 1,
            admitted_at: 0,
        })
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn unstaked_sender_limit() {
        let op = op();
        let mut entry_point = MockEntryPoint::new();
        entry_point
            .expect_get_deposit_info()
            .returning(|_| Ok(DepositInfo::default()));
        let check = module(pool_with_paymaster_op(op.sender), entry_point);

        let err = check.handle(&mut context(op)).await.unwrap_err();
        assert!(matches!(err, MempoolError::TooManyOpsForUnstakedSender(_, 1)));
    }

    #[tokio::test]
    async fn staked_sender_not_limited() {
        let op = op();
        let mut entry_point = MockEntryPoint::new();
        entry_point.expect_get_deposit_info().returning(|_| {
            Ok(DepositInfo {
                staked: true,
                ..Default::default()
            })
        });
        let check = module(pool_with_paymaster_op(op.sender), entry_point);

        check.handle(&mut context(op)).await.unwrap();
    }

    #[tokio::test]
    async fn replacement_not_counted() {
        let pool = empty_pool();
        let op = op();
        pool.admit(PoolOperation {
            uo: op.clone(),
            entry_point: EP,
            chain_id: 1,
            admitted_at: 0,
        })
        .unwrap();

        let mut entry_point = MockEntryPoint::new();
        entry_point.expect_get_deposit_info().never();
        let check = module(pool, entry_point);

        check.handle(&mut context(op)).await.unwrap();
    }
}
