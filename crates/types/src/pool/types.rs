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

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::{UserOperation, UserOperationKey};

/// The reputation of an entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reputation {
    /// The entity's address
    pub address: Address,
    /// Number of ops seen by admission
    pub ops_seen: u64,
    /// Number of ops included in submitted bundles
    pub ops_included: u64,
}

/// Reputation status for an entity
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "lowercase")]
pub enum ReputationStatus {
    /// Entity is not throttled or banned
    Ok,
    /// Entity is throttled
    Throttled,
    /// Entity is banned
    Banned,
}

/// A pending entry in the pool: an admitted operation with its admission context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolOperation {
    /// The user operation stored in the pool
    pub uo: UserOperation,
    /// The entry point address for this operation
    pub entry_point: Address,
    /// Chain id the operation was admitted for
    pub chain_id: u64,
    /// Admission time, in milliseconds since the unix epoch
    pub admitted_at: u64,
}

impl PoolOperation {
    /// Key of the entry in the pool
    pub fn key(&self) -> UserOperationKey {
        self.uo.key(self.entry_point)
    }

    /// Hash of the operation
    pub fn hash(&self) -> B256 {
        self.uo.hash(self.entry_point, self.chain_id)
    }
}
