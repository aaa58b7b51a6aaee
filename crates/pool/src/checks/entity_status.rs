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

use opbundler_types::pool::{MempoolError, ReputationStatus};

use crate::{
    db::Database,
    mempool::Mempool,
    pipeline::{Context, Module},
};

/// Rejects banned entities, and throttled entities that already have an
/// operation pending.
pub struct EntityStatus<D> {
    mempool: Arc<Mempool<D>>,
}

impl<D> EntityStatus<D> {
    /// Create the module
    pub fn new(mempool: Arc<Mempool<D>>) -> Self {
        Self { mempool }
    }
}

#[async_trait::async_trait]
impl<D: Database> Module for EntityStatus<D> {
    fn name(&self) -> &'static str {
        "EntityStatus"
    }

    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        let key = ctx.key();
        for entity in ctx.op.entities() {
            match ctx.status(entity.address) {
                ReputationStatus::Ok => {}
                ReputationStatus::Throttled => {
                    if self.mempool.count_by_address(entity.address, Some(&key)) > 0 {
                        return Err(MempoolError::EntityBanned(
                            entity,
                            ReputationStatus::Throttled,
                        ));
                    }
                }
                ReputationStatus::Banned => {
                    return Err(MempoolError::EntityBanned(entity, ReputationStatus::Banned));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;
    use opbundler_types::{pool::PoolOperation, Entity};

    use super::*;
    use crate::{
        checks::test_utils::{context, context_with, op, EP},
        db::MemoryDatabase,
        mempool::PoolConfig,
    };

    const PAYMASTER: Address = Address::repeat_byte(0x50);

    fn pool() -> Arc<Mempool<MemoryDatabase>> {
        Arc::new(Mempool::new(Arc::new(MemoryDatabase::new()), PoolConfig::default()).unwrap())
    }

    fn sponsored_op(sender: Address) -> opbundler_types::UserOperation {
        let mut op = op();
        op.sender = sender;
        op.paymaster_and_data = PAYMASTER.to_vec().into();
        op
    }

    #[tokio::test]
    async fn ok_entities_pass() {
        EntityStatus::new(pool())
            .handle(&mut context(sponsored_op(Address::random())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn banned_entity_rejected() {
        let mut ctx = context_with(
            sponsored_op(Address::random()),
            vec![(PAYMASTER, ReputationStatus::Banned)],
        );
        let err = EntityStatus::new(pool()).handle(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            MempoolError::EntityBanned(e, ReputationStatus::Banned) if e == Entity::paymaster(PAYMASTER)
        ));
    }

    #[tokio::test]
    async fn throttled_entity_allowed_without_pending_op() {
        let mut ctx = context_with(
            sponsored_op(Address::random()),
            vec![(PAYMASTER, ReputationStatus::Throttled)],
        );
        EntityStatus::new(pool()).handle(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn throttled_entity_rejected_with_pending_op() {
        let pool = pool();
        pool.admit(PoolOperation {
            uo: sponsored_op(Address::random()),
            entry_point: EP,
            chain_id: 1,
            admitted_at: 0,
        })
        .unwrap();

        let mut ctx = context_with(
            sponsored_op(Address::random()),
            vec![(PAYMASTER, ReputationStatus::Throttled)],
        );
        let err = EntityStatus::new(pool).handle(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            MempoolError::EntityBanned(_, ReputationStatus::Throttled)
        ));
    }

    #[tokio::test]
    async fn throttled_sender_may_replace_own_op() {
        let pool = pool();
        let op = sponsored_op(Address::random());
        pool.admit(PoolOperation {
            uo: op.clone(),
            entry_point: EP,
            chain_id: 1,
            admitted_at: 0,
        })
        .unwrap();

        let mut ctx = context_with(op.clone(), vec![(op.sender, ReputationStatus::Throttled)]);
        EntityStatus::new(pool).handle(&mut ctx).await.unwrap();
    }
}
