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

//! Key/value persistence for pool state

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::atomic::{AtomicU64, Ordering},
};

#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;
use parking_lot::RwLock;
use serde::Serialize;

/// Key prefix of pending operations
pub(crate) const MEMPOOL_PREFIX: &str = "mempool/";
/// Key prefix of reputation counters
pub(crate) const REPUTATION_PREFIX: &str = "reputation/";

/// Database error
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The storage backend failed
    #[error("storage error: {0}")]
    Storage(String),
}

/// Ordered key/value store used to persist the pool and reputation state.
///
/// Implementations must make each individual `set` and `delete` atomic.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
pub trait Database: Send + Sync + 'static {
    /// Get the value stored at `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError>;

    /// Store `value` at `key`, replacing any previous value
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), DbError>;

    /// Delete the value at `key`, returns true if a value was present
    fn delete(&self, key: &str) -> Result<bool, DbError>;

    /// All entries whose key starts with `prefix`, ordered by key
    fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, DbError>;

    /// Reclaim space left by deleted and overwritten values.
    ///
    /// Returns the number of reclaimed slots.
    fn run_maintenance(&self) -> Result<u64, DbError>;
}

/// Encode and write a JSON value
pub(crate) fn set_json<D, T>(db: &D, key: &str, value: &T) -> Result<(), DbError>
where
    D: Database + ?Sized,
    T: Serialize,
{
    db.set(key, serde_json::to_vec(value)?)
}

/// In-memory database backed by an ordered map
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    // overwrites and deletes since the last maintenance run
    stale: AtomicU64,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemoryDatabase {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), DbError> {
        if self.entries.write().insert(key.to_string(), value).is_some() {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, DbError> {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn iter_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, DbError> {
        Ok(self
            .entries
            .read()
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn run_maintenance(&self) -> Result<u64, DbError> {
        Ok(self.stale.swap(0, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_delete() {
        let db = MemoryDatabase::new();
        assert_eq!(db.get("a").unwrap(), None);

        db.set("a", vec![1]).unwrap();
        assert_eq!(db.get("a").unwrap(), Some(vec![1]));

        assert!(db.delete("a").unwrap());
        assert!(!db.delete("a").unwrap());
        assert_eq!(db.get("a").unwrap(), None);
    }

    #[test]
    fn test_iter_prefix_is_ordered_and_bounded() {
        let db = MemoryDatabase::new();
        db.set("mempool/b", vec![2]).unwrap();
        db.set("mempool/a", vec![1]).unwrap();
        db.set("mempoolx", vec![3]).unwrap();
        db.set("reputation/a", vec![4]).unwrap();

        let entries = db.iter_prefix(MEMPOOL_PREFIX).unwrap();
        assert_eq!(
            entries,
            vec![
                ("mempool/a".to_string(), vec![1]),
                ("mempool/b".to_string(), vec![2])
            ]
        );
    }

    #[test]
    fn test_maintenance_reclaims_stale_slots() {
        let db = MemoryDatabase::new();
        db.set("a", vec![1]).unwrap();
        db.set("a", vec![2]).unwrap();
        db.set("b", vec![1]).unwrap();
        db.delete("b").unwrap();

        assert_eq!(db.run_maintenance().unwrap(), 2);
        assert_eq!(db.run_maintenance().unwrap(), 0);
    }

    #[test]
    fn test_set_json() {
        let db = MemoryDatabase::new();
        set_json(&db, "k", &vec![1u64, 2, 3]).unwrap();
        assert_eq!(db.get("k").unwrap(), Some(b"[1,2,3]".to_vec()));
    }
}
