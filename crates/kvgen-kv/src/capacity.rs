//! Capacity policy for a bounded session cache.
//!
//! The manager never touches cache buffers. It only answers "how much room does
//! the next write need, and which entries give it up".

use crate::{KVError, KVResult};

/// A contiguous range of cache entries to drop before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub start: usize,
    pub count: usize,
}

/// Keeps a cache within `capacity` entries.
///
/// With `freeze_first`, slot 0 (the BOS anchor) is never evicted and everything
/// after it is dropped oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityManager {
    capacity: usize,
    freeze_first: bool,
}

impl CapacityManager {
    /// # Errors
    /// `InvalidCapacity` if the cache cannot hold one token next to the anchor.
    pub fn new(capacity: usize, freeze_first: bool) -> KVResult<Self> {
        let required = if freeze_first { 2 } else { 1 };
        if capacity < required {
            return Err(KVError::InvalidCapacity { capacity, required });
        }
        Ok(Self {
            capacity,
            freeze_first,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn freeze_first(&self) -> bool {
        self.freeze_first
    }

    /// Slots that are never evicted.
    pub fn anchor_slots(&self) -> usize {
        usize::from(self.freeze_first)
    }

    /// Largest write that fits after maximal eviction.
    pub fn max_chunk(&self) -> usize {
        self.capacity - self.anchor_slots()
    }

    pub fn check_chunk(&self, chunk_len: usize) -> KVResult<()> {
        if chunk_len > self.max_chunk() {
            return Err(KVError::ChunkTooLarge {
                chunk: chunk_len,
                available: self.max_chunk(),
            });
        }
        Ok(())
    }

    /// Decide what to evict so `incoming` entries fit behind the `filled` ones.
    ///
    /// Returns `None` when the write fits as is.
    pub fn plan(&self, filled: usize, incoming: usize) -> KVResult<Option<Eviction>> {
        self.check_chunk(incoming)?;
        if filled > self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: filled,
                max: self.capacity,
            });
        }

        let needed = filled + incoming;
        if needed <= self.capacity {
            return Ok(None);
        }

        let start = if self.freeze_first && filled > 0 { 1 } else { 0 };
        Ok(Some(Eviction {
            start,
            count: needed - self.capacity,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_rejected() {
        assert_eq!(
            CapacityManager::new(0, false),
            Err(KVError::InvalidCapacity {
                capacity: 0,
                required: 1
            })
        );
    }

    #[test]
    fn anchor_needs_a_second_slot() {
        assert!(CapacityManager::new(1, false).is_ok());
        let err = CapacityManager::new(1, true).unwrap_err();
        assert!(err.is_capacity_error());
    }

    #[test]
    fn fits_without_eviction() {
        let mgr = CapacityManager::new(8, true).unwrap();
        assert_eq!(mgr.plan(0, 7).unwrap(), None);
        assert_eq!(mgr.plan(5, 3).unwrap(), None);
    }

    #[test]
    fn evicts_after_anchor() {
        let mgr = CapacityManager::new(8, true).unwrap();
        assert_eq!(
            mgr.plan(8, 1).unwrap(),
            Some(Eviction { start: 1, count: 1 })
        );
        assert_eq!(
            mgr.plan(6, 4).unwrap(),
            Some(Eviction { start: 1, count: 2 })
        );
    }

    #[test]
    fn evicts_from_front_without_anchor() {
        let mgr = CapacityManager::new(4, false).unwrap();
        assert_eq!(
            mgr.plan(4, 4).unwrap(),
            Some(Eviction { start: 0, count: 4 })
        );
    }

    #[test]
    fn chunk_larger_than_evictable_region() {
        let mgr = CapacityManager::new(4, true).unwrap();
        assert_eq!(mgr.max_chunk(), 3);
        assert_eq!(
            mgr.plan(1, 4),
            Err(KVError::ChunkTooLarge {
                chunk: 4,
                available: 3
            })
        );
    }

    #[test]
    fn eviction_never_exceeds_evictable_entries() {
        for freeze in [false, true] {
            let mgr = CapacityManager::new(6, freeze).unwrap();
            for filled in 0..=6 {
                for incoming in 1..=mgr.max_chunk() {
                    if let Some(ev) = mgr.plan(filled, incoming).unwrap() {
                        assert!(ev.start + ev.count <= filled);
                        assert_eq!(filled - ev.count + incoming, 6);
                    }
                }
            }
        }
    }
}
