//! Generation-tagged memory mappings
//!
//! A node identity may be backed by several physical files over its life.
//! While any mapping of an identity is live, the arbiter pins the physical
//! file it was created from; another mapping is only granted if it maps that
//! same file. Once the last mapping goes away the identity is free to be
//! mapped from whatever the cache holds next.

use std::collections::HashMap;
use std::fs::File;
use std::ops::Deref;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::NodeId;
use crate::error::{LazyFsError, Result};
use crate::store::PhysicalId;

#[derive(Debug, Clone, Copy)]
struct MappingSlot {
    generation: PhysicalId,
    live: usize,
}

/// Tracks which physical file backs the live mappings of each identity
#[derive(Debug, Default)]
pub struct MappingArbiter {
    slots: Mutex<HashMap<NodeId, MappingSlot>>,
}

impl MappingArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a mapping of `id` backed by `generation`.
    ///
    /// Fails with [`LazyFsError::MappingConflict`] if live mappings of `id`
    /// are backed by a different physical file.
    pub fn acquire(
        self: &Arc<Self>,
        id: NodeId,
        vpath: &str,
        generation: PhysicalId,
    ) -> Result<MappingLease> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&id) {
            Some(slot) if slot.generation != generation => {
                warn!(
                    path = vpath,
                    id,
                    live = slot.live,
                    "refusing mapping of replaced content"
                );
                return Err(LazyFsError::MappingConflict {
                    path: vpath.to_string(),
                });
            }
            Some(slot) => slot.live += 1,
            None => {
                slots.insert(id, MappingSlot { generation, live: 1 });
            }
        }
        debug!(path = vpath, id, "mapping granted");
        Ok(MappingLease {
            arbiter: self.clone(),
            id,
        })
    }

    /// Number of live mappings of `id`
    pub fn live(&self, id: NodeId) -> usize {
        self.slots.lock().get(&id).map_or(0, |slot| slot.live)
    }

    fn release(&self, id: NodeId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&id) {
            slot.live -= 1;
            if slot.live == 0 {
                slots.remove(&id);
            }
        }
    }
}

/// Keeps one mapping of an identity registered; released on drop
#[derive(Debug)]
pub struct MappingLease {
    arbiter: Arc<MappingArbiter>,
    id: NodeId,
}

impl Drop for MappingLease {
    fn drop(&mut self) {
        self.arbiter.release(self.id);
    }
}

/// A read-only memory mapping of a cached file body
#[derive(Debug)]
pub struct Mapping {
    map: Mmap,
    generation: PhysicalId,
    _lease: MappingLease,
}

impl Mapping {
    /// Map `file`, which must be the physical file identified by
    /// `generation`, under an already granted lease
    pub(crate) fn new(file: &File, generation: PhysicalId, lease: MappingLease) -> Result<Self> {
        // SAFETY: the cache store only replaces bodies by rename or rewrites
        // them through the helper; a concurrent in-place rewrite can change
        // the bytes we see but never unmaps them.
        let map = unsafe { Mmap::map(file)? };
        Ok(Self {
            map,
            generation,
            _lease: lease,
        })
    }

    /// Physical file this mapping was created from
    pub fn generation(&self) -> PhysicalId {
        self.generation
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

impl AsRef<[u8]> for Mapping {
    fn as_ref(&self) -> &[u8] {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PhysicalId = PhysicalId { dev: 1, ino: 10 };
    const B: PhysicalId = PhysicalId { dev: 1, ino: 11 };

    #[test]
    fn test_same_generation_shares() {
        let arbiter = Arc::new(MappingArbiter::new());
        let first = arbiter.acquire(2, "/hello", A).unwrap();
        let second = arbiter.acquire(2, "/hello", A).unwrap();
        assert_eq!(arbiter.live(2), 2);

        drop(first);
        drop(second);
        assert_eq!(arbiter.live(2), 0);
    }

    #[test]
    fn test_conflict_until_released() {
        let arbiter = Arc::new(MappingArbiter::new());
        let old = arbiter.acquire(2, "/hello", A).unwrap();

        let err = arbiter.acquire(2, "/hello", B).unwrap_err();
        assert!(matches!(err, LazyFsError::MappingConflict { ref path } if path == "/hello"));
        assert_eq!(arbiter.live(2), 1);

        drop(old);
        let _new = arbiter.acquire(2, "/hello", B).unwrap();
        // The slot now pins the new generation
        assert!(arbiter.acquire(2, "/hello", A).is_err());
    }

    #[test]
    fn test_identities_are_independent() {
        let arbiter = Arc::new(MappingArbiter::new());
        let _a = arbiter.acquire(2, "/a", A).unwrap();
        let _b = arbiter.acquire(3, "/b", B).unwrap();
        assert_eq!(arbiter.live(2), 1);
        assert_eq!(arbiter.live(3), 1);
    }

    #[test]
    fn test_mapping_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        std::fs::write(&path, b"Hello").unwrap();
        let file = File::open(&path).unwrap();
        let generation = PhysicalId::of(&file.metadata().unwrap());

        let arbiter = Arc::new(MappingArbiter::new());
        let lease = arbiter.acquire(2, "/body", generation).unwrap();
        let mapping = Mapping::new(&file, generation, lease).unwrap();
        assert_eq!(&mapping[..], b"Hello");
        assert_eq!(mapping.generation(), generation);
        assert_eq!(arbiter.live(2), 1);

        drop(mapping);
        assert_eq!(arbiter.live(2), 0);
    }
}
