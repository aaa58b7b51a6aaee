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
    cmp::Ordering,
    collections::{hash_map::DefaultHasher, BTreeSet, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use alloy_primitives::{Address, B256, U256};
use anyhow::Context;
use opbundler_types::{
    pool::{MempoolError, PoolOperation},
    UserOperation, UserOperationKey,
};
use opbundler_utils::math;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::db::{self, Database, DbError, MEMPOOL_PREFIX};

/// Pending store configuration
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// A replacement must raise the priority fee by at least this percentage
    pub min_replacement_fee_increase_percentage: u32,
    /// Number of lock stripes used to serialize mutations per key
    pub lock_stripes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_replacement_fee_increase_percentage: 10,
            lock_stripes: 64,
        }
    }
}

/// Result of a successful admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitOutcome {
    /// Hash of the admitted operation
    pub hash: B256,
    /// Hash of the operation it replaced, if any
    pub replaced: Option<B256>,
}

/// Pending operation store.
///
/// Holds at most one operation per [`UserOperationKey`]. Mutations of one key
/// are serialized by a striped lock, mutations of distinct keys run
/// concurrently. Every mutation is written through to the database before the
/// in-memory index is updated.
#[derive(Debug)]
pub struct Mempool<D> {
    db: Arc<D>,
    config: PoolConfig,
    key_locks: Vec<Mutex<()>>,
    index: RwLock<PoolIndex>,
}

impl<D: Database> Mempool<D> {
    /// Create the store and rebuild its index from the database
    pub fn new(db: Arc<D>, config: PoolConfig) -> Result<Self, DbError> {
        let mut ops = db
            .iter_prefix(MEMPOOL_PREFIX)?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice::<PoolOperation>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        ops.sort_by(|a, b| {
            a.admitted_at.cmp(&b.admitted_at).then_with(|| {
                b.uo.max_priority_fee_per_gas
                    .cmp(&a.uo.max_priority_fee_per_gas)
            })
        });

        let mut index = PoolIndex::default();
        for op in ops {
            index.insert(op);
        }
        if !index.by_key.is_empty() {
            info!("restored {} pending operations", index.by_key.len());
        }

        let stripes = config.lock_stripes.max(1);
        Ok(Self {
            db,
            config,
            key_locks: (0..stripes).map(|_| Mutex::new(())).collect(),
            index: RwLock::new(index),
        })
    }

    /// Admit an operation.
    ///
    /// If an operation is pending under the same key it is replaced, provided
    /// the new priority fee is high enough. Otherwise fails with `FeeTooLow`
    /// and the pending operation is left untouched.
    pub fn admit(&self, op: PoolOperation) -> Result<AdmitOutcome, MempoolError> {
        let key = op.key();
        let _guard = self.key_lock(&key).lock();

        self.check_replacement(&op)?;
        db::set_json(&*self.db, &pool_key(&key), &op).context("failed to persist operation")?;

        let hash = op.hash();
        let replaced = self.index.write().insert(op);
        Ok(AdmitOutcome { hash, replaced })
    }

    /// Check that `op` could replace the operation pending under its key.
    ///
    /// Passes when nothing is pending under the key.
    pub fn check_replacement(&self, op: &PoolOperation) -> Result<(), MempoolError> {
        let index = self.index.read();
        match index.by_key.get(&op.key()) {
            Some(existing) => check_replacement_fee(
                &existing.op.uo,
                &op.uo,
                self.config.min_replacement_fee_increase_percentage,
            ),
            None => Ok(()),
        }
    }

    /// Remove the operation pending under `key`
    pub fn remove(&self, key: &UserOperationKey) -> Result<Option<PoolOperation>, MempoolError> {
        let _guard = self.key_lock(key).lock();
        self.db
            .delete(&pool_key(key))
            .context("failed to delete operation")?;
        Ok(self
            .index
            .write()
            .remove(key)
            .map(Arc::unwrap_or_clone))
    }

    /// Remove the operation with the given hash.
    ///
    /// A newer operation that replaced it under the same key is left pending.
    pub fn remove_by_hash(&self, hash: B256) -> Result<Option<PoolOperation>, MempoolError> {
        let Some(key) = self.index.read().by_hash.get(&hash).copied() else {
            return Ok(None);
        };
        let _guard = self.key_lock(&key).lock();
        if !self.index.read().by_hash.contains_key(&hash) {
            return Ok(None);
        }
        self.db
            .delete(&pool_key(&key))
            .context("failed to delete operation")?;
        Ok(self
            .index
            .write()
            .remove(&key)
            .map(Arc::unwrap_or_clone))
    }

    /// Pending operations in bundling order, at most `limit` of them.
    ///
    /// The returned sequence is a snapshot: mutations after this call are not
    /// reflected in it.
    pub fn eligible(&self, limit: usize) -> Eligible {
        let index = self.index.read();
        let ops = index
            .ordered
            .iter()
            .take(limit)
            .filter_map(|o| index.by_key.get(&o.key).map(|e| Arc::clone(&e.op)))
            .collect();
        Eligible { ops, pos: 0 }
    }

    /// Operation pending under `key`
    pub fn get(&self, key: &UserOperationKey) -> Option<PoolOperation> {
        self.index
            .read()
            .by_key
            .get(key)
            .map(|e| PoolOperation::clone(&e.op))
    }

    /// Operation pending with the given hash
    pub fn get_by_hash(&self, hash: B256) -> Option<PoolOperation> {
        let index = self.index.read();
        index
            .by_hash
            .get(&hash)
            .and_then(|key| index.by_key.get(key))
            .map(|e| PoolOperation::clone(&e.op))
    }

    /// Number of pending operations referencing `address` as any entity,
    /// not counting the one pending under `exclude`.
    pub fn count_by_address(&self, address: Address, exclude: Option<&UserOperationKey>) -> usize {
        self.index
            .read()
            .by_key
            .iter()
            .filter(|(key, _)| Some(*key) != exclude)
            .filter(|(_, e)| e.op.uo.entities().iter().any(|en| en.address == address))
            .count()
    }

    /// All pending operations for an entry point, in bundling order
    pub fn all(&self, entry_point: Address) -> Vec<PoolOperation> {
        let index = self.index.read();
        index
            .ordered
            .iter()
            .filter(|o| o.key.entry_point == entry_point)
            .filter_map(|o| index.by_key.get(&o.key).map(|e| PoolOperation::clone(&e.op)))
            .collect()
    }

    /// Number of pending operations
    pub fn len(&self) -> usize {
        self.index.read().by_key.len()
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every pending operation
    pub fn clear(&self) -> Result<(), MempoolError> {
        // stripes are always taken in index order
        let _guards: Vec<_> = self.key_locks.iter().map(|l| l.lock()).collect();
        let mut index = self.index.write();
        // the index is reset even if a delete fails
        let mut result = Ok(());
        for key in index.by_key.keys() {
            if let Err(e) = self.db.delete(&pool_key(key)) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        *index = PoolIndex::default();
        result.context("failed to delete operation")?;
        Ok(())
    }

    fn key_lock(&self, key: &UserOperationKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.key_locks[(hasher.finish() % self.key_locks.len() as u64) as usize]
    }
}

/// Snapshot of eligible operations, iterated lazily.
#[derive(Debug, Clone)]
pub struct Eligible {
    ops: Vec<Arc<PoolOperation>>,
    pos: usize,
}

impl Eligible {
    /// Rewind to the first operation
    pub fn restart(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for Eligible {
    type Item = Arc<PoolOperation>;

    fn next(&mut self) -> Option<Self::Item> {
        let op = self.ops.get(self.pos).cloned();
        if op.is_some() {
            self.pos += 1;
        }
        op
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ops.len() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Eligible {}

fn check_replacement_fee(
    existing: &UserOperation,
    new: &UserOperation,
    min_increase_percentage: u32,
) -> Result<(), MempoolError> {
    let old_fee = existing.max_priority_fee_per_gas;
    let required = math::increase_by_percent_ceil(old_fee, min_increase_percentage)
        .max(old_fee.saturating_add(U256::from(1)));
    if new.max_priority_fee_per_gas < required {
        return Err(MempoolError::FeeTooLow(
            new.max_priority_fee_per_gas,
            required,
        ));
    }
    Ok(())
}

fn pool_key(key: &UserOperationKey) -> String {
    format!("{MEMPOOL_PREFIX}{}/{}", key.entry_point, key.sender)
}

#[derive(Debug, Default)]
struct PoolIndex {
    by_key: HashMap<UserOperationKey, IndexedOp>,
    by_hash: HashMap<B256, UserOperationKey>,
    ordered: BTreeSet<OrderedKey>,
    next_submission_id: u64,
}

impl PoolIndex {
    // returns the hash of the replaced operation
    fn insert(&mut self, op: PoolOperation) -> Option<B256> {
        let key = op.key();
        let replaced = self.remove(&key).map(|old| old.hash());

        let order = OrderedKey {
            admitted_at: op.admitted_at,
            priority_fee: op.uo.max_priority_fee_per_gas,
            submission_id: self.next_submission_id,
            key,
        };
        self.next_submission_id += 1;

        self.by_hash.insert(op.hash(), key);
        self.ordered.insert(order.clone());
        self.by_key.insert(
            key,
            IndexedOp {
                op: Arc::new(op),
                order,
            },
        );
        replaced
    }

    fn remove(&mut self, key: &UserOperationKey) -> Option<Arc<PoolOperation>> {
        let removed = self.by_key.remove(key)?;
        self.ordered.remove(&removed.order);
        self.by_hash.remove(&removed.op.hash());
        Some(removed.op)
    }
}

#[derive(Debug)]
struct IndexedOp {
    op: Arc<PoolOperation>,
    order: OrderedKey,
}

#[derive(Debug, Clone)]
struct OrderedKey {
    admitted_at: u64,
    priority_fee: U256,
    submission_id: u64,
    key: UserOperationKey,
}

impl Eq for OrderedKey {}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Sort by admission time, then priority fee descending, then id ascending
        self.admitted_at
            .cmp(&other.admitted_at)
            .then_with(|| other.priority_fee.cmp(&self.priority_fee))
            .then_with(|| self.submission_id.cmp(&other.submission_id))
    }
}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
