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

use alloy_primitives::{Address, U256};
use alloy_provider::Provider as AlloyProvider;
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::ContractError as SolContractError;
use alloy_transport::{Transport, TransportError};
use anyhow::Context;
use opbundler_contracts::v0_6::{
    DepositInfo as DepositInfoV0_6,
    IEntryPoint::{FailedOp, IEntryPointErrors, IEntryPointInstance, SignatureValidationFailed},
    UserOperation as ContractUserOperation,
};
use opbundler_types::UserOperation;
use tracing::debug;

use crate::{DepositInfo, EntryPoint, HandleOpsOut, ProviderResult};

/// Entry point provider for v0.6
pub struct EntryPointProvider<AP, T> {
    i_entry_point: IEntryPointInstance<T, AP>,
}

impl<AP, T> EntryPointProvider<AP, T>
where
    T: Transport + Clone,
    AP: AlloyProvider<T>,
{
    /// Create a new `EntryPoint` instance for v0.6
    pub fn new(entry_point_address: Address, provider: AP) -> Self {
        Self {
            i_entry_point: IEntryPointInstance::new(entry_point_address, provider),
        }
    }
}

#[async_trait::async_trait]
impl<AP, T> EntryPoint for EntryPointProvider<AP, T>
where
    T: Transport + Clone,
    AP: AlloyProvider<T>,
{
    fn address(&self) -> Address {
        *self.i_entry_point.address()
    }

    async fn balance_of(&self, address: Address) -> ProviderResult<U256> {
        Ok(self.i_entry_point.balanceOf(address).call().await?._0)
    }

    async fn get_deposit_info(&self, address: Address) -> ProviderResult<DepositInfo> {
        self.i_entry_point
            .getDepositInfo(address)
            .call()
            .await
            .map_err(Into::into)
            .map(|r| r.info.into())
    }

    async fn call_handle_ops(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
    ) -> ProviderResult<HandleOpsOut> {
        let tx = handle_ops_call(&self.i_entry_point, ops, beneficiary);
        let res = self.i_entry_point.provider().call(&tx).await;

        match res {
            Ok(_) => Ok(HandleOpsOut::Success),
            Err(TransportError::ErrorResp(resp)) => {
                let Some(err) = resp.as_decoded_error::<SolContractError<IEntryPointErrors>>(false)
                else {
                    return Err(TransportError::ErrorResp(resp).into());
                };
                match err {
                    SolContractError::CustomError(IEntryPointErrors::FailedOp(FailedOp {
                        opIndex,
                        reason,
                    })) => {
                        // AA95 is an out of gas for the whole bundle, not attributable to the op
                        if reason.starts_with("AA95") {
                            return Err(anyhow::anyhow!(
                                "handle ops called with insufficient gas"
                            )
                            .into());
                        }
                        debug!("handleOps dry run failed op {opIndex}: {reason}");
                        Ok(HandleOpsOut::FailedOp(
                            opIndex
                                .try_into()
                                .context("returned opIndex out of bounds")?,
                            reason,
                        ))
                    }
                    SolContractError::CustomError(IEntryPointErrors::SignatureValidationFailed(
                        SignatureValidationFailed { aggregator },
                    )) => Ok(HandleOpsOut::SignatureValidationFailed(aggregator)),
                    _ => Err(TransportError::ErrorResp(resp).into()),
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    fn get_send_bundle_transaction(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
        from: Address,
    ) -> TransactionRequest {
        handle_ops_call(&self.i_entry_point, ops, beneficiary).from(from)
    }

    fn get_simulate_validation_transaction(&self, op: UserOperation) -> TransactionRequest {
        self.i_entry_point
            .simulateValidation(op.into())
            .into_transaction_request()
    }
}

fn handle_ops_call<AP: AlloyProvider<T>, T: Transport + Clone>(
    entry_point: &IEntryPointInstance<T, AP>,
    ops: Vec<UserOperation>,
    beneficiary: Address,
) -> TransactionRequest {
    let ops: Vec<ContractUserOperation> = ops.into_iter().map(Into::into).collect();
    entry_point
        .handleOps(ops, beneficiary)
        .into_transaction_request()
}

impl From<DepositInfoV0_6> for DepositInfo {
    fn from(deposit_info: DepositInfoV0_6) -> Self {
        Self {
            deposit: U256::from(deposit_info.deposit),
            staked: deposit_info.staked,
            stake: U256::from(deposit_info.stake),
            unstake_delay_sec: deposit_info.unstakeDelaySec,
            withdraw_time: deposit_info.withdrawTime.to(),
        }
    }
}
