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

use super::ReputationStatus;
use crate::{Entity, EntityType};

/// Mempool error type.
///
/// The named variants are the admission errors surfaced to callers verbatim.
#[derive(Debug, thiserror::Error, strum::IntoStaticStr)]
pub enum MempoolError {
    /// Some other error occurred
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    /// An operation with the same sender and entry point is pending and the
    /// replacement does not raise the priority fee by the required margin.
    #[error("replacement underpriced: maxPriorityFeePerGas is {0} but must be at least {1}")]
    FeeTooLow(U256, U256),
    /// The call gas limit cannot cover a value transferring call.
    #[error("callGasLimit is {0} but must be at least {1}")]
    BelowGasFloor(U256, U256),
    /// The verification gas limit is above the configured cap.
    #[error("verificationGasLimit is {0} but must be at most {1}")]
    AboveVerificationCap(U256, U256),
    /// The unstaked sender already has the maximum number of pending operations.
    #[error("sender {0} has reached the maximum of {1} pending operations for an unstaked sender")]
    TooManyOpsForUnstakedSender(Address, usize),
    /// The paymaster deposit cannot cover the worst case cost of the operation.
    #[error("paymaster deposit is {0} but must be at least {1} to pay for this operation")]
    InsufficientPaymasterDeposit(U256, U256),
    /// A forbidden opcode was used during validation by the given entity phase.
    #[error("{0} uses banned opcode {1}")]
    OpcodeBanned(EntityType, String),
    /// An entity referenced by the operation is throttled or banned.
    #[error("entity banned: {0} is {1}")]
    EntityBanned(Entity, ReputationStatus),
    /// Simulation failed, timed out, or produced an unusable trace.
    #[error("simulation failed: {0}")]
    SimulationFailed(String),
    /// Gas estimation reverted.
    #[error("execution reverted: {0}")]
    ExecutionReverted(String),
    /// The simulation trace was not balanced.
    #[error("malformed trace: {0}")]
    MalformedTrace(String),
    /// The operation targets an entry point this bundler does not serve.
    #[error("unsupported entry point {0}")]
    UnsupportedEntryPoint(Address),
}

impl MempoolError {
    /// Short name of the error kind, stable for metrics labels
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Surface internal trace faults to callers as simulation failures.
    pub fn into_caller_error(self) -> Self {
        match self {
            Self::MalformedTrace(msg) => Self::SimulationFailed(format!("malformed trace: {msg}")),
            e => e,
        }
    }
}
