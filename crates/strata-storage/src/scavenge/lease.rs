//! Per-chunk scavenge leases

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StorageError;

/// Chunks currently being rewritten
#[derive(Debug, Default)]
pub struct LeaseTable {
    leased: Mutex<BTreeSet<u32>>,
}

impl LeaseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lease on a chunk, failing if another pass holds it
    pub fn try_acquire(self: &Arc<Self>, chunk: u32) -> Result<LeaseGuard, StorageError> {
        if !self.leased.lock().insert(chunk) {
            return Err(StorageError::ScavengeInProgress(chunk));
        }
        Ok(LeaseGuard {
            table: Arc::clone(self),
            chunk,
        })
    }

    pub fn is_leased(&self, chunk: u32) -> bool {
        self.leased.lock().contains(&chunk)
    }
}

/// Releases its chunk when dropped
#[derive(Debug)]
pub struct LeaseGuard {
    table: Arc<LeaseTable>,
    chunk: u32,
}

impl LeaseGuard {
    pub fn chunk(&self) -> u32 {
        self.chunk
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.table.leased.lock().remove(&self.chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive() {
        let table = LeaseTable::new();
        let guard = table.try_acquire(3).unwrap();
        assert_eq!(guard.chunk(), 3);
        assert!(matches!(
            table.try_acquire(3),
            Err(StorageError::ScavengeInProgress(3))
        ));
        // Other chunks are independent.
        let _other = table.try_acquire(4).unwrap();

        drop(guard);
        assert!(!table.is_leased(3));
        table.try_acquire(3).unwrap();
    }
}
