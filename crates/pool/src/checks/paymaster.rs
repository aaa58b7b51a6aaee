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

use anyhow::Context as _;
use opbundler_provider::EntryPoint;
use opbundler_types::pool::MempoolError;

use crate::pipeline::{Context, Module};

/// Checks that the paymaster's entry point deposit covers the worst case
/// cost of the operation.
pub struct PaymasterDeposit<E> {
    entry_point: Arc<E>,
}

impl<E> PaymasterDeposit<E> {
    /// Create the module
    pub fn new(entry_point: Arc<E>) -> Self {
        Self { entry_point }
    }
}

#[async_trait::async_trait]
impl<E: EntryPoint + 'static> Module for PaymasterDeposit<E> {
    fn name(&self) -> &'static str {
        "PaymasterDeposit"
    }

    async fn handle(&self, ctx: &mut Context) -> Result<(), MempoolError> {
        let Some(paymaster) = ctx.op.paymaster() else {
            return Ok(());
        };

        let deposit = self
            .entry_point
            .balance_of(paymaster)
            .await
            .context("failed to query paymaster deposit")?;
        let max_cost = ctx.op.max_gas_cost();
        if deposit < max_cost {
            return Err(MempoolError::InsufficientPaymasterDeposit(deposit, max_cost));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, U256};
    use opbundler_provider::{MockEntryPoint, ProviderError};

    use super::*;
    use crate::checks::test_utils::{context, op};

    const PAYMASTER: Address = Address::repeat_byte(0x50);

    fn sponsored() -> opbundler_types::UserOperation {
        let mut op = op();
        op.paymaster_and_data = PAYMASTER.to_vec().into();
        op
    }

    fn entry_point(balance: U256) -> MockEntryPoint {
        let mut ep = MockEntryPoint::new();
        ep.expect_balance_of()
            .withf(|a| *a == PAYMASTER)
            .returning(move |_| Ok(balance));
        ep
    }

    #[tokio::test]
    async fn no_paymaster_skips_query() {
        let mut ep = MockEntryPoint::new();
        ep.expect_balance_of().never();
        PaymasterDeposit::new(Arc::new(ep))
            .handle(&mut context(op()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deposit_covers_cost() {
        let op = sponsored();
        let cost = op.max_gas_cost();
        PaymasterDeposit::new(Arc::new(entry_point(cost)))
            .handle(&mut context(op))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insufficient_deposit() {
        let op = sponsored();
        let cost = op.max_gas_cost();
        let err = PaymasterDeposit::new(Arc::new(entry_point(cost - U256::from(1))))
            .handle(&mut context(op))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MempoolError::InsufficientPaymasterDeposit(deposit, required)
                if deposit == cost - U256::from(1) && required == cost
        ));
    }

    #[tokio::test]
    async fn extreme_fee_does_not_wrap_cost() {
        let mut op = sponsored();
        op.max_fee_per_gas = U256::from(1) << 255;
        op.call_gas_limit = U256::from(2);
        op.verification_gas_limit = U256::ZERO;
        op.pre_verification_gas = U256::ZERO;

        let err = PaymasterDeposit::new(Arc::new(entry_point(U256::ZERO)))
            .handle(&mut context(op))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MempoolError::InsufficientPaymasterDeposit(deposit, required)
                if deposit.is_zero() && required == U256::MAX
        ));
    }

    #[tokio::test]
    async fn provider_error_is_internal() {
        let mut ep = MockEntryPoint::new();
        ep.expect_balance_of()
            .returning(|_| Err(ProviderError::Other(anyhow::anyhow!("connection refused"))));
        let err = PaymasterDeposit::new(Arc::new(ep))
            .handle(&mut context(sponsored()))
            .await
            .unwrap_err();
        assert!(matches!(err, MempoolError::Other(_)));
    }
}
