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

use std::fmt::Display;

use alloy_primitives::{Address, B256};
use opbundler_types::{Entity, UserOperation};

/// Event type for the pool
#[derive(Clone, Debug)]
pub enum PoolEvent {
    /// An operation was received and added to the pool
    ReceivedOp {
        /// Operation hash
        op_hash: B256,
        /// The full operation
        op: UserOperation,
        /// Operation entities
        entities: Vec<Entity>,
        /// Hash of the operation this one replaced
        replaced: Option<B256>,
    },
    /// An operation was rejected by admission
    RejectedOp {
        /// Operation hash
        op_hash: B256,
        /// Sender of the operation
        sender: Address,
        /// Rejection reason
        reason: String,
    },
    /// An operation was removed from the pool
    RemovedOp {
        /// Operation hash
        op_hash: B256,
        /// Removal reason
        reason: OpRemovalReason,
    },
}

/// Reason an operation was removed from the pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpRemovalReason {
    /// Removal was requested
    Requested,
    /// Op was submitted in a bundle
    Submitted {
        /// Bundle transaction hash
        tx_hash: B256,
    },
    /// Op failed during bundle submission and cannot succeed as is
    Failed {
        /// Failure reason reported by the entry point
        reason: String,
    },
}

impl Display for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolEvent::ReceivedOp {
                op_hash,
                op,
                entities,
                replaced,
            } => {
                write!(
                    f,
                    concat!(
                        "Pool accepted op.",
                        "    Op hash: {:?}",
                        "    Entities: {}",
                        "{}",
                        "    maxFeePerGas: {}",
                        "    maxPriorityFeePerGas: {}"
                    ),
                    op_hash,
                    entities
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                    replaced
                        .map(|h| format!("    Replaced: {h:?}"))
                        .unwrap_or_default(),
                    op.max_fee_per_gas,
                    op.max_priority_fee_per_gas,
                )
            }
            PoolEvent::RejectedOp {
                op_hash,
                sender,
                reason,
            } => {
                write!(
                    f,
                    concat!(
                        "Pool rejected op.",
                        "    Op hash: {:?}",
                        "    Sender: {:?}",
                        "    Reason: {}",
                    ),
                    op_hash, sender, reason,
                )
            }
            PoolEvent::RemovedOp { op_hash, reason } => {
                write!(
                    f,
                    concat!(
                        "Removed op from pool.",
                        "    Op hash: {:?}",
                        "    Reason: {:?}",
                    ),
                    op_hash, reason,
                )
            }
        }
    }
}
