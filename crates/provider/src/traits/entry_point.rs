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
use alloy_rpc_types_eth::TransactionRequest;
#[cfg(feature = "test-utils")]
use mockall::automock;
use opbundler_types::UserOperation;

use crate::ProviderResult;

/// Deposit info for an address from the entry point contract
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DepositInfo {
    /// Amount deposited on the entry point
    pub deposit: U256,
    /// Whether the address has staked
    pub staked: bool,
    /// Amount staked on the entry point
    pub stake: U256,
    /// The amount of time that must elapse before a withdrawal
    pub unstake_delay_sec: u32,
    /// The time at which the address can withdraw
    pub withdraw_time: u64,
}

/// Result of a dry run `handleOps` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOpsOut {
    /// Every operation in the bundle would succeed
    Success,
    /// The operation at the index failed validation with the reason
    FailedOp(usize, String),
    /// An aggregator rejected the bundle signature
    SignatureValidationFailed(Address),
}

/// Entry point contract interface
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait::async_trait]
pub trait EntryPoint: Send + Sync {
    /// Address of the entry point
    fn address(&self) -> Address;

    /// Deposit balance of an address on the entry point
    async fn balance_of(&self, address: Address) -> ProviderResult<U256>;

    /// Full deposit and stake info of an address
    async fn get_deposit_info(&self, address: Address) -> ProviderResult<DepositInfo>;

    /// Dry run `handleOps` with an `eth_call` and decode the outcome
    async fn call_handle_ops(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
    ) -> ProviderResult<HandleOpsOut>;

    /// Build the `handleOps` transaction sent from `from`
    fn get_send_bundle_transaction(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
        from: Address,
    ) -> TransactionRequest;

    /// Build the `simulateValidation` call for a single operation
    fn get_simulate_validation_transaction(&self, op: UserOperation) -> TransactionRequest;
}
