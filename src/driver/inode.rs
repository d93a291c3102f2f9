//! Inode registry
//!
//! FUSE addresses everything by inode number. The registry owns every live
//! [`Entry`] under its number; directories register their children here as
//! they are populated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::entry::Entry;
use crate::backend::BackendEvent;
use crate::error::{HarnessError, Result};

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Maps inode numbers to entries
pub struct InodeTable {
    entries: DashMap<u64, Arc<dyn Entry>>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Create an empty registry; the root is added by whoever builds it
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Reserve a fresh inode number
    pub fn allocate(&self) -> u64 {
        self.next_inode.fetch_add(1, Ordering::SeqCst)
    }

    /// Register `entry` under its own inode number.
    ///
    /// Fails if that number is already taken.
    pub fn add_entry(&self, entry: Arc<dyn Entry>) -> Result<u64> {
        let ino = entry.inode();
        match self.entries.entry(ino) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HarnessError::AlreadyExists(
                format!("inode {}", ino),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                trace!("Registered inode {}", ino);
                slot.insert(entry);
                Ok(ino)
            }
        }
    }

    /// Register `entry` under its inode, returning whatever it displaced
    pub fn replace(&self, entry: Arc<dyn Entry>) -> Option<Arc<dyn Entry>> {
        self.entries.insert(entry.inode(), entry)
    }

    pub fn get(&self, ino: u64) -> Option<Arc<dyn Entry>> {
        self.entries.get(&ino).map(|e| e.value().clone())
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.entries.contains_key(&ino)
    }

    pub fn remove(&self, ino: u64) -> Option<Arc<dyn Entry>> {
        self.entries.remove(&ino).map(|(_, e)| e)
    }

    /// Deliver a backend event to every entry
    pub fn dispatch(&self, event: &BackendEvent) {
        // Collect first so handlers may add or remove inodes
        let entries: Vec<Arc<dyn Entry>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            entry.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::entry::FileEntry;

    #[test]
    fn test_allocate_skips_root() {
        let table = InodeTable::new();
        let first = table.allocate();
        let second = table.allocate();
        assert!(first > ROOT_INODE);
        assert_ne!(first, second);
    }

    #[test]
    fn test_add_get_remove() {
        let table = InodeTable::new();
        let ino = table.allocate();
        table
            .add_entry(Arc::new(FileEntry::new(ino, ROOT_INODE, "data", None)))
            .unwrap();

        assert!(table.contains(ino));
        assert_eq!(table.get(ino).unwrap().inode(), ino);
        assert_eq!(table.len(), 1);

        assert!(table.remove(ino).is_some());
        assert!(table.get(ino).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_inode_rejected() {
        let table = InodeTable::new();
        table
            .add_entry(Arc::new(FileEntry::new(ROOT_INODE, 0, "a", None)))
            .unwrap();
        let err = table
            .add_entry(Arc::new(FileEntry::new(ROOT_INODE, 0, "b", None)))
            .unwrap_err();
        assert!(matches!(err, HarnessError::AlreadyExists(_)));
    }

    #[test]
    fn test_replace_overwrites_in_place() {
        let table = InodeTable::new();
        let ino = table.allocate();
        assert!(table
            .replace(Arc::new(FileEntry::new(ino, ROOT_INODE, "old", None)))
            .is_none());
        let displaced = table.replace(Arc::new(FileEntry::new(ino, ROOT_INODE, "newer", None)));

        assert_eq!(displaced.unwrap().attr().size, 3);
        assert_eq!(table.get(ino).unwrap().attr().size, 5);
        assert_eq!(table.len(), 1);
    }
}
