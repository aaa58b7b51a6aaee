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

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use alloy_primitives::Address;
#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;
use opbundler_types::pool::{Reputation, ReputationStatus};
use parking_lot::RwLock;
use tracing::warn;

use crate::db::{self, Database, DbError, REPUTATION_PREFIX};

/// Threshold above which an entity is banned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanThreshold {
    /// Ban once `ops_seen - ops_included` exceeds the value
    Value(u64),
    /// Never ban
    Disabled,
}

/// Reputation thresholds
#[derive(Debug, Clone, Copy)]
pub struct ReputationParams {
    /// Throttle once `ops_seen - ops_included` exceeds this value
    pub throttling_threshold: u64,
    /// Ban tier
    pub ban_threshold: BanThreshold,
}

impl Default for ReputationParams {
    fn default() -> Self {
        Self {
            throttling_threshold: 10,
            ban_threshold: BanThreshold::Value(50),
        }
    }
}

/// Reputation store trait
///
/// Interior mutability pattern used as the store is shared between
/// the admission and bundling sides.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
pub trait ReputationStore: Send + Sync + 'static {
    /// Current status of the address
    fn status(&self, address: Address) -> ReputationStatus;

    /// Called when an operation referencing the address is seen by admission
    fn add_seen(&self, address: Address);

    /// Called when an operation referencing the address is included in a
    /// submitted bundle
    fn add_included(&self, address: Address);

    /// Called by debug API
    fn dump_reputation(&self) -> Vec<(Reputation, ReputationStatus)>;

    /// Called by debug API
    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64);

    /// Update the ban tier
    fn set_ban_threshold(&self, threshold: BanThreshold);

    /// Called by debug API
    fn clear(&self);
}

/// Reputation store persisting its counters to a [`Database`]
#[derive(Debug)]
pub struct DbReputation<D> {
    db: Arc<D>,
    reputation: RwLock<AddressReputation>,
}

impl<D: Database> DbReputation<D> {
    /// Create a store, loading any counters persisted in `db`
    pub fn new(
        db: Arc<D>,
        params: ReputationParams,
        blocklist: Option<HashSet<Address>>,
        allowlist: Option<HashSet<Address>>,
    ) -> Result<Self, DbError> {
        let mut rep = AddressReputation::new(params)
            .with_blocklist(blocklist.unwrap_or_default())
            .with_allowlist(allowlist.unwrap_or_default());

        for (_, value) in db.iter_prefix(REPUTATION_PREFIX)? {
            let count: Reputation = serde_json::from_slice(&value)?;
            rep.counts.insert(count.address, count);
        }

        Ok(Self {
            db,
            reputation: RwLock::new(rep),
        })
    }

    // called with the write lock held so writes for one address land in order
    fn persist(&self, count: &Reputation) {
        if let Err(e) = db::set_json(&*self.db, &reputation_key(count.address), count) {
            warn!("failed to persist reputation of {:?}: {e}", count.address);
        }
    }
}

impl<D: Database> ReputationStore for DbReputation<D> {
    fn status(&self, address: Address) -> ReputationStatus {
        self.reputation.read().status(address)
    }

    fn add_seen(&self, address: Address) {
        let mut rep = self.reputation.write();
        let count = rep.add_seen(address);
        self.persist(&count);
    }

    fn add_included(&self, address: Address) {
        let mut rep = self.reputation.write();
        let count = rep.add_included(address);
        self.persist(&count);
    }

    fn dump_reputation(&self) -> Vec<(Reputation, ReputationStatus)> {
        let rep = self.reputation.read();
        let mut dump: Vec<_> = rep
            .counts
            .values()
            .map(|count| (*count, rep.status(count.address)))
            .collect();
        dump.sort_by_key(|(count, _)| count.address);
        dump
    }

    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64) {
        let mut rep = self.reputation.write();
        let count = rep.set_reputation(address, ops_seen, ops_included);
        self.persist(&count);
    }

    fn set_ban_threshold(&self, threshold: BanThreshold) {
        self.reputation.write().params.ban_threshold = threshold;
    }

    fn clear(&self) {
        let mut rep = self.reputation.write();
        for address in rep.counts.keys() {
            if let Err(e) = self.db.delete(&reputation_key(*address)) {
                warn!("failed to delete reputation of {address:?}: {e}");
            }
        }
        rep.counts.clear();
    }
}

fn reputation_key(address: Address) -> String {
    format!("{REPUTATION_PREFIX}{address}")
}

#[derive(Debug)]
struct AddressReputation {
    // Addresses that are always banned
    blocklist: HashSet<Address>,
    // Addresses that are always exempt from throttling and banning
    allowlist: HashSet<Address>,
    counts: HashMap<Address, Reputation>,
    params: ReputationParams,
}

impl AddressReputation {
    fn new(params: ReputationParams) -> Self {
        Self {
            blocklist: HashSet::new(),
            allowlist: HashSet::new(),
            counts: HashMap::new(),
            params,
        }
    }

    fn with_blocklist(self, blocklist: HashSet<Address>) -> Self {
        Self { blocklist, ..self }
    }

    fn with_allowlist(self, allowlist: HashSet<Address>) -> Self {
        Self { allowlist, ..self }
    }

    fn status(&self, address: Address) -> ReputationStatus {
        if self.blocklist.contains(&address) {
            return ReputationStatus::Banned;
        } else if self.allowlist.contains(&address) {
            return ReputationStatus::Ok;
        }

        let Some(count) = self.counts.get(&address) else {
            return ReputationStatus::Ok;
        };

        let outstanding = count.ops_seen.saturating_sub(count.ops_included);
        match self.params.ban_threshold {
            BanThreshold::Value(ban) if outstanding > ban => ReputationStatus::Banned,
            _ if outstanding > self.params.throttling_threshold => ReputationStatus::Throttled,
            _ => ReputationStatus::Ok,
        }
    }

    fn entry(&mut self, address: Address) -> &mut Reputation {
        self.counts.entry(address).or_insert(Reputation {
            address,
            ..Default::default()
        })
    }

    fn add_seen(&mut self, address: Address) -> Reputation {
        let count = self.entry(address);
        count.ops_seen = count.ops_seen.saturating_add(1);
        *count
    }

    fn add_included(&mut self, address: Address) -> Reputation {
        let count = self.entry(address);
        count.ops_included = count.ops_included.saturating_add(1);
        *count
    }

    fn set_reputation(&mut self, address: Address, ops_seen: u64, ops_included: u64) -> Reputation {
        let count = self.entry(address);
        count.ops_seen = ops_seen;
        count.ops_included = ops_included;
        *count
    }
}
