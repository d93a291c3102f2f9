//! Entries served by the driver
//!
//! An [`Entry`] is one node of the mounted tree. Directories allocate and
//! register their children in the [`InodeTable`] as they populate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::inode::InodeTable;
use super::RootContext;
use crate::backend::{ApiClient, BackendEvent};
use crate::error::{HarnessError, Result};
use crate::store::BlockStore;

/// Default file mode (rw-r--r--)
pub const DEFAULT_FILE_MODE: u16 = 0o644;
/// Default directory mode (rwxr-xr-x)
pub const DEFAULT_DIR_MODE: u16 = 0o755;

/// Largest size an in-memory file may grow to
pub const MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Attributes reported for an entry
#[derive(Debug, Clone)]
pub struct EntryAttr {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub perm: u16,
}

/// One row of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub kind: EntryKind,
}

/// A node in the mounted tree
pub trait Entry: Send + Sync {
    fn inode(&self) -> u64;

    /// Inode of the containing directory (0 for the root)
    fn parent_inode(&self) -> u64;

    fn attr(&self) -> EntryAttr;

    /// Resolve a child name to its inode
    fn lookup(&self, _name: &str) -> Result<u64> {
        Err(HarnessError::NotADirectory(format!("inode {}", self.inode())))
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        Err(HarnessError::NotADirectory(format!("inode {}", self.inode())))
    }

    fn read(&self, _offset: u64, _size: u32) -> Result<Bytes> {
        Err(HarnessError::IsADirectory(format!("inode {}", self.inode())))
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> Result<u64> {
        Err(HarnessError::ReadOnly)
    }

    fn truncate(&self, _size: u64) -> Result<()> {
        Err(HarnessError::ReadOnly)
    }

    /// Create an empty file, returning its inode
    fn create(&self, _name: &str) -> Result<u64> {
        Err(HarnessError::ReadOnly)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn on_event(&self, _event: &BackendEvent) {}
}

impl fmt::Debug for dyn Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("inode", &self.inode())
            .field("kind", &self.attr().kind)
            .finish()
    }
}

// =============================================================================
// Files
// =============================================================================

/// In-memory file, persisted to the block store on flush when one is bound
pub struct FileEntry {
    inode: u64,
    parent: u64,
    content: RwLock<Vec<u8>>,
    mtime: RwLock<SystemTime>,
    writable: bool,
    dirty: AtomicBool,
    store: Option<BlockStore>,
    locator: Mutex<Option<String>>,
}

impl FileEntry {
    pub fn new(inode: u64, parent: u64, content: impl Into<Bytes>, store: Option<BlockStore>) -> Self {
        Self {
            inode,
            parent,
            content: RwLock::new(content.into().to_vec()),
            mtime: RwLock::new(SystemTime::now()),
            writable: true,
            dirty: AtomicBool::new(false),
            store,
            locator: Mutex::new(None),
        }
    }

    /// A file whose content cannot be changed through the mount
    pub fn read_only(inode: u64, parent: u64, content: impl Into<Bytes>) -> Self {
        Self {
            writable: false,
            ..Self::new(inode, parent, content, None)
        }
    }

    /// Locator of the last flushed content, if any
    pub fn locator(&self) -> Option<String> {
        self.locator.lock().clone()
    }

    pub fn content(&self) -> Bytes {
        Bytes::from(self.content.read().clone())
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(HarnessError::ReadOnly)
        }
    }

    fn touch(&self) {
        *self.mtime.write() = SystemTime::now();
        self.dirty.store(true, Ordering::SeqCst);
    }
}

impl Entry for FileEntry {
    fn inode(&self) -> u64 {
        self.inode
    }

    fn parent_inode(&self) -> u64 {
        self.parent
    }

    fn attr(&self) -> EntryAttr {
        EntryAttr {
            kind: EntryKind::File,
            size: self.content.read().len() as u64,
            mtime: *self.mtime.read(),
            perm: if self.writable { DEFAULT_FILE_MODE } else { 0o444 },
        }
    }

    fn read(&self, offset: u64, size: u32) -> Result<Bytes> {
        let content = self.content.read();
        let start = (offset as usize).min(content.len());
        let end = start.saturating_add(size as usize).min(content.len());
        Ok(Bytes::copy_from_slice(&content[start..end]))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(HarnessError::FileTooLarge(self.inode))?;
        {
            let mut content = self.content.write();
            let (start, end) = (offset as usize, end as usize);
            if content.len() < end {
                content.resize(end, 0);
            }
            content[start..end].copy_from_slice(data);
        }
        self.touch();
        Ok(data.len() as u64)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.check_writable()?;
        if size > MAX_FILE_SIZE {
            return Err(HarnessError::FileTooLarge(self.inode));
        }
        self.content.write().resize(size as usize, 0);
        self.touch();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(store) = &self.store {
            let locator = store.put(&self.content.read())?;
            debug!("Flushed inode {} as {}", self.inode, locator);
            *self.locator.lock() = Some(locator);
        }
        Ok(())
    }
}

// =============================================================================
// Directories
// =============================================================================

fn upgrade(inodes: &Weak<InodeTable>) -> Result<Arc<InodeTable>> {
    inodes
        .upgrade()
        .ok_or_else(|| HarnessError::NotFound("inode table released".to_string()))
}

fn listing_of(inodes: &InodeTable, children: &BTreeMap<String, u64>) -> Vec<DirEntry> {
    children
        .iter()
        .filter_map(|(name, ino)| {
            inodes.get(*ino).map(|entry| DirEntry {
                name: name.clone(),
                inode: *ino,
                kind: entry.attr().kind,
            })
        })
        .collect()
}

/// Directory with a fixed initial set of files; new files may be created
pub struct StaticDirectory {
    inode: u64,
    parent: u64,
    inodes: Weak<InodeTable>,
    store: Option<BlockStore>,
    children: RwLock<BTreeMap<String, u64>>,
    mtime: SystemTime,
}

impl StaticDirectory {
    /// Build the directory and register one file per `(name, content)` pair
    pub fn new<I, N, C>(
        inode: u64,
        parent: u64,
        inodes: &Arc<InodeTable>,
        store: Option<BlockStore>,
        files: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<Bytes>,
    {
        let mut children = BTreeMap::new();
        for (name, content) in files {
            let ino = inodes.allocate();
            inodes.add_entry(Arc::new(FileEntry::new(ino, inode, content, store.clone())))?;
            children.insert(name.into(), ino);
        }

        Ok(Self {
            inode,
            parent,
            inodes: Arc::downgrade(inodes),
            store,
            children: RwLock::new(children),
            mtime: SystemTime::now(),
        })
    }

    /// Root-entry factory form
    pub fn root<I, N, C>(ctx: RootContext, files: I) -> Result<Arc<dyn Entry>>
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<Bytes>,
    {
        let dir = Self::new(ctx.inode, ctx.parent_inode, &ctx.inodes, ctx.store, files)?;
        Ok(Arc::new(dir))
    }
}

impl Entry for StaticDirectory {
    fn inode(&self) -> u64 {
        self.inode
    }

    fn parent_inode(&self) -> u64 {
        self.parent
    }

    fn attr(&self) -> EntryAttr {
        EntryAttr {
            kind: EntryKind::Directory,
            size: 0,
            mtime: self.mtime,
            perm: DEFAULT_DIR_MODE,
        }
    }

    fn lookup(&self, name: &str) -> Result<u64> {
        self.children
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        let inodes = upgrade(&self.inodes)?;
        Ok(listing_of(&inodes, &self.children.read()))
    }

    fn create(&self, name: &str) -> Result<u64> {
        let inodes = upgrade(&self.inodes)?;
        let mut children = self.children.write();
        if children.contains_key(name) {
            return Err(HarnessError::AlreadyExists(name.to_string()));
        }

        let ino = inodes.allocate();
        inodes.add_entry(Arc::new(FileEntry::new(
            ino,
            self.inode,
            Bytes::new(),
            self.store.clone(),
        )))?;
        children.insert(name.to_string(), ino);
        debug!("Created {} as inode {}", name, ino);
        Ok(ino)
    }
}

/// Read-only view of one backend collection.
///
/// The listing is fetched on first use and discarded whenever the backend
/// reports a change to the collection.
pub struct CollectionDirectory {
    inode: u64,
    parent: u64,
    inodes: Weak<InodeTable>,
    api: ApiClient,
    collection: String,
    listing: RwLock<Option<BTreeMap<String, u64>>>,
    /// Inodes handed out by earlier listings, kept until the next load
    known: Mutex<BTreeMap<String, u64>>,
}

impl CollectionDirectory {
    pub fn new(
        inode: u64,
        parent: u64,
        inodes: &Arc<InodeTable>,
        api: ApiClient,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            inode,
            parent,
            inodes: Arc::downgrade(inodes),
            api,
            collection: collection.into(),
            listing: RwLock::new(None),
            known: Mutex::new(BTreeMap::new()),
        }
    }

    /// Root-entry factory form
    pub fn root(ctx: RootContext, collection: impl Into<String>) -> Result<Arc<dyn Entry>> {
        Ok(Arc::new(Self::new(
            ctx.inode,
            ctx.parent_inode,
            &ctx.inodes,
            ctx.api,
            collection,
        )))
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Whether a listing is currently held
    pub fn is_loaded(&self) -> bool {
        self.listing.read().is_some()
    }

    fn with_listing<T>(&self, f: impl FnOnce(&BTreeMap<String, u64>) -> T) -> Result<T> {
        if let Some(listing) = self.listing.read().as_ref() {
            return Ok(f(listing));
        }

        let inodes = upgrade(&self.inodes)?;
        let mut slot = self.listing.write();
        // Another caller may have loaded it while we waited for the lock
        if let Some(listing) = slot.as_ref() {
            return Ok(f(listing));
        }

        let collection = self.api.collection(&self.collection)?;
        let mut known = self.known.lock();
        let mut listing = BTreeMap::new();
        for (name, content) in collection.files {
            let ino = known.remove(&name).unwrap_or_else(|| inodes.allocate());
            inodes.replace(Arc::new(FileEntry::read_only(ino, self.inode, content)));
            listing.insert(name, ino);
        }
        // Names gone from the backend
        for ino in known.values() {
            inodes.remove(*ino);
        }
        *known = listing.clone();
        debug!(
            "Loaded {} file(s) from collection {}",
            listing.len(),
            self.collection
        );

        let result = f(&listing);
        *slot = Some(listing);
        Ok(result)
    }

    /// Drop the listing. Child inodes stay registered since the kernel may
    /// still hold them; the next load reuses or retires them by name.
    fn invalidate(&self) {
        if self.listing.write().take().is_none() {
            return;
        }
        debug!("Invalidated collection {}", self.collection);
    }
}

impl Entry for CollectionDirectory {
    fn inode(&self) -> u64 {
        self.inode
    }

    fn parent_inode(&self) -> u64 {
        self.parent
    }

    fn attr(&self) -> EntryAttr {
        EntryAttr {
            kind: EntryKind::Directory,
            size: 0,
            mtime: SystemTime::now(),
            perm: 0o555,
        }
    }

    fn lookup(&self, name: &str) -> Result<u64> {
        self.with_listing(|listing| listing.get(name).copied())?
            .ok_or_else(|| HarnessError::NotFound(name.to_string()))
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        let inodes = upgrade(&self.inodes)?;
        self.with_listing(|listing| listing_of(&inodes, listing))
    }

    fn on_event(&self, event: &BackendEvent) {
        let affected = match event.collection() {
            Some(name) => name == self.collection,
            None => true,
        };
        if affected {
            self.invalidate();
        }
    }
}
