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

//! Gas overhead model.
//!
//! Deterministic gas floors used at admission, plus the RPC backed call gas
//! estimate used when filling in an operation's gas fields.

use alloy_primitives::{Address, Bytes, U256};
use opbundler_provider::{EvmProvider, ProviderError, TransactionRequest};
use opbundler_types::{pool::MempoolError, UserOperation};
use tracing::debug;

/// Gas cost of a warm account access (EIP-2929)
pub const WARM_ACCESS_GAS: u64 = 100;
/// Surcharge for a call that transfers a nonzero value
pub const NON_ZERO_VALUE_CALL_GAS: u64 = 9_000;

/// Gas overheads for user operations
///
/// The calldata related fields are used in calculating the static
/// pre-verification gas.
/// see: https://github.com/eth-infinitism/bundler/blob/main/packages/sdk/src/calcPreVerificationGas.ts
#[derive(Clone, Copy, Debug)]
pub struct GasOverheads {
    /// Intrinsic gas of the bundle transaction
    pub fixed: U256,
    /// Per operation overhead in the entry point
    pub per_user_op: U256,
    /// Per word of encoded operation
    pub per_user_op_word: U256,
    /// Calldata zero byte cost
    pub zero_byte: U256,
    /// Calldata nonzero byte cost
    pub non_zero_byte: U256,
    /// Number of operations the fixed overhead is amortized over
    pub bundle_size: U256,
    /// Signature length assumed when estimating an unsigned operation
    pub sig_size: usize,
    /// Warm account access cost
    pub warm_access: U256,
    /// Nonzero value transfer surcharge
    pub non_zero_value: U256,
}

impl Default for GasOverheads {
    fn default() -> Self {
        Self {
            fixed: U256::from(21_000),
            per_user_op: U256::from(18_300),
            per_user_op_word: U256::from(4),
            zero_byte: U256::from(4),
            non_zero_byte: U256::from(16),
            bundle_size: U256::from(1),
            sig_size: 65,
            warm_access: U256::from(WARM_ACCESS_GAS),
            non_zero_value: U256::from(NON_ZERO_VALUE_CALL_GAS),
        }
    }
}

impl GasOverheads {
    /// Minimum gas for a call that transfers value to a warm account.
    ///
    /// Any operation with a lower call gas limit cannot execute a value
    /// transferring call.
    pub fn non_zero_value_call(&self) -> U256 {
        self.warm_access + self.non_zero_value
    }

    /// Static pre-verification gas of the operation.
    ///
    /// Signatures shorter than `sig_size` are padded with nonzero bytes so that
    /// estimates for unsigned operations are not too low.
    pub fn static_pre_verification_gas(&self, op: &UserOperation) -> U256 {
        let calldata_gas = if op.signature.len() < self.sig_size {
            let padded = UserOperation {
                signature: Bytes::from(vec![1u8; self.sig_size]),
                ..op.clone()
            };
            padded.calldata_gas_cost(self.zero_byte, self.non_zero_byte, self.per_user_op_word)
        } else {
            op.calldata_gas_cost(self.zero_byte, self.non_zero_byte, self.per_user_op_word)
        };
        let bundle_size = self.bundle_size.max(U256::from(1));

        calldata_gas + self.fixed / bundle_size + self.per_user_op
    }
}

/// Estimates the gas of the operation's execution phase.
///
/// The call is simulated from `from` (the entry point) to the sender with the
/// operation's calldata. An error response from the node means the call
/// reverted and is returned as `ExecutionReverted` with the node's message.
pub async fn call_gas_estimate<P: EvmProvider + ?Sized>(
    provider: &P,
    from: Address,
    op: &UserOperation,
) -> Result<U256, MempoolError> {
    let tx = TransactionRequest::default()
        .from(from)
        .to(op.sender)
        .input(op.call_data.clone().into());

    match provider.estimate_gas(tx).await {
        Ok(gas) => Ok(U256::from(gas)),
        Err(ProviderError::ErrorResponse(resp)) => {
            debug!("call gas estimation reverted: {}", resp.message);
            Err(MempoolError::ExecutionReverted(resp.message.to_string()))
        }
        Err(err) => Err(anyhow::Error::from(err)
            .context("call gas estimation failed")
            .into()),
    }
}
