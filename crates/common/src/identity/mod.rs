//! Stable node identities and mapping arbitration
//!
//! Every virtual path is assigned a 64-bit identity the first time it is
//! exposed. The identity is kept for the life of the mount, no matter how
//! often the helper replaces the cached content behind it.
//!
//! Because the identity outlives the physical file, two memory mappings of
//! the same identity could end up backed by different physical files. The
//! [`MappingArbiter`] refuses that instead of silently mixing generations.

mod mapping;

pub use mapping::{Mapping, MappingArbiter, MappingLease};

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::path;

/// Externally visible node identity
pub type NodeId = u64;

/// Identity of the root directory (matches the FUSE root inode)
pub const ROOT_ID: NodeId = 1;

#[derive(Debug)]
struct Table {
    /// Path to identity mapping
    path_to_id: HashMap<String, NodeId>,
    /// Identity to path mapping
    id_to_path: HashMap<NodeId, String>,
    /// Next available identity (starts at 2, as 1 is reserved for root)
    next_id: NodeId,
}

/// Bidirectional mapping between identities and virtual paths.
///
/// Identities are never reassigned or removed while the mount lives.
#[derive(Debug)]
pub struct IdentityTable {
    table: RwLock<Table>,
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityTable {
    /// Create a new table with root pre-registered
    pub fn new() -> Self {
        let mut table = Table {
            path_to_id: HashMap::new(),
            id_to_path: HashMap::new(),
            next_id: ROOT_ID + 1,
        };
        table.path_to_id.insert(path::ROOT.to_string(), ROOT_ID);
        table.id_to_path.insert(ROOT_ID, path::ROOT.to_string());

        Self {
            table: RwLock::new(table),
        }
    }

    /// Get or assign the identity of a path
    pub fn get_or_assign(&self, vpath: &str) -> NodeId {
        let normalized = path::normalize(vpath);
        if let Some(&id) = self.table.read().path_to_id.get(&normalized) {
            return id;
        }

        let mut table = self.table.write();
        // Another thread may have assigned it between the two locks
        if let Some(&id) = table.path_to_id.get(&normalized) {
            return id;
        }
        let id = table.next_id;
        table.next_id += 1;
        table.path_to_id.insert(normalized.clone(), id);
        table.id_to_path.insert(id, normalized);
        id
    }

    /// Get the identity of a path if one was assigned
    pub fn get_id(&self, vpath: &str) -> Option<NodeId> {
        self.table
            .read()
            .path_to_id
            .get(&path::normalize(vpath))
            .copied()
    }

    /// Get the path for an identity if it exists
    pub fn get_path(&self, id: NodeId) -> Option<String> {
        self.table.read().id_to_path.get(&id).cloned()
    }

    /// Number of identities assigned so far, root included
    pub fn len(&self) -> usize {
        self.table.read().id_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_root_identity() {
        let table = IdentityTable::new();
        assert_eq!(table.get_id("/"), Some(ROOT_ID));
        assert_eq!(table.get_path(ROOT_ID).as_deref(), Some("/"));
        assert_eq!(table.get_or_assign(""), ROOT_ID);
    }

    #[test]
    fn test_get_or_assign() {
        let table = IdentityTable::new();

        let id1 = table.get_or_assign("/foo");
        let id2 = table.get_or_assign("/foo/");
        let id3 = table.get_or_assign("/bar");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert_ne!(id1, ROOT_ID);
        assert_eq!(table.get_path(id1).as_deref(), Some("/foo"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_unknown() {
        let table = IdentityTable::new();
        assert!(table.get_id("/never").is_none());
        assert!(table.get_path(42).is_none());
    }

    #[test]
    fn test_concurrent_assignment_is_consistent() {
        let table = Arc::new(IdentityTable::new());
        let ids: Vec<NodeId> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || table.get_or_assign("/same"))
            })
            .map(|t| t.join().unwrap())
            .collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.len(), 2);
    }
}
