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

/// Builder event
#[derive(Clone, Debug)]
pub enum BuilderEvent {
    /// A bundle transaction was sent
    BundleSubmitted {
        /// Transaction hash
        tx_hash: B256,
        /// Hashes of the bundled operations, in bundle order
        ops: Vec<B256>,
    },
    /// An operation was left out of the bundle
    OpDropped {
        /// Operation hash
        op_hash: B256,
        /// Sender of the operation
        sender: Address,
        /// Reason for dropping
        reason: String,
        /// Whether the operation was also removed from the pool
        removed: bool,
    },
    /// The bundle could not be submitted, its operations stay pending
    SubmissionFailed {
        /// Failure description
        error: String,
    },
}

impl Display for BuilderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuilderEvent::BundleSubmitted { tx_hash, ops } => {
                write!(
                    f,
                    concat!(
                        "Bundle transaction sent!",
                        "    Transaction hash: {:?}",
                        "    Number of ops: {}",
                        "    Op hashes: {}",
                    ),
                    tx_hash,
                    ops.len(),
                    ops.iter()
                        .map(|h| format!("{h:?}"))
                        .collect::<Vec<_>>()
                        .join(", "),
                )
            }
            BuilderEvent::OpDropped {
                op_hash,
                sender,
                reason,
                removed,
            } => {
                write!(
                    f,
                    concat!(
                        "Op dropped from bundle.",
                        "    Op hash: {:?}",
                        "    Sender: {:?}",
                        "    Reason: {}",
                        "    Removed from pool: {}",
                    ),
                    op_hash, sender, reason, removed,
                )
            }
            BuilderEvent::SubmissionFailed { error } => {
                write!(f, "Bundle submission failed.    Error: {error}")
            }
        }
    }
}
