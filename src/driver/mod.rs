pub mod entry;
pub mod inode;

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::backend::ApiClient;
use crate::error::{HarnessError, Result};
use crate::events::EventChannel;
use crate::store::BlockStore;

pub use self::entry::{
    CollectionDirectory, DirEntry, Entry, EntryAttr, EntryKind, FileEntry, StaticDirectory,
};
pub use self::inode::{InodeTable, ROOT_INODE};

/// Default TTL for attribute caching (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Block size for reporting
const BLOCK_SIZE: u32 = 4096;

/// Arguments handed to a root-entry factory.
///
/// The factory builds the root entry at `inode` (always [`ROOT_INODE`]),
/// registering any children it creates in `inodes`. Extra factory arguments
/// are captured by the factory closure itself.
pub struct RootContext {
    pub inode: u64,
    pub inodes: Arc<InodeTable>,
    pub api: ApiClient,
    pub parent_inode: u64,
    pub store: Option<BlockStore>,
}

/// One-shot signal fired when the kernel has initialized the mount
pub struct ReadyGate {
    rx: oneshot::Receiver<()>,
}

impl ReadyGate {
    /// Block until the driver signals readiness.
    ///
    /// Returns [`HarnessError::ServiceLoop`] if the driver is dropped first,
    /// which happens when the service loop dies before initializing. Must not
    /// be called from inside an async runtime.
    pub fn wait(self) -> Result<()> {
        self.rx.blocking_recv().map_err(|_| HarnessError::ServiceLoop)
    }
}

fn to_fuse_file_type(kind: EntryKind) -> FuseFileType {
    match kind {
        EntryKind::File => FuseFileType::RegularFile,
        EntryKind::Directory => FuseFileType::Directory,
    }
}

/// FUSE driver serving the entries in an [`InodeTable`]
pub struct Operations {
    inodes: Arc<InodeTable>,
    uid: u32,
    gid: u32,
    api: ApiClient,
    enable_write: bool,
    store: Option<BlockStore>,
    ready: Option<oneshot::Sender<()>>,
    gate: Option<ReadyGate>,
    events: Option<Arc<EventChannel>>,
}

impl Operations {
    /// Create a driver reporting `uid`/`gid` as the owner of every entry
    pub fn new(uid: u32, gid: u32, api: ApiClient, enable_write: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inodes: Arc::new(InodeTable::new()),
            uid,
            gid,
            api,
            enable_write,
            store: None,
            ready: Some(tx),
            gate: Some(ReadyGate { rx }),
            events: None,
        }
    }

    /// Bind the block store new files persist to
    pub fn with_store(mut self, store: Option<BlockStore>) -> Self {
        self.store = store;
        self
    }

    pub fn inodes(&self) -> &Arc<InodeTable> {
        &self.inodes
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> Option<&BlockStore> {
        self.store.as_ref()
    }

    pub fn enable_write(&self) -> bool {
        self.enable_write
    }

    /// Arguments for the root-entry factory
    pub fn root_context(&self) -> RootContext {
        RootContext {
            inode: ROOT_INODE,
            inodes: self.inodes.clone(),
            api: self.api.clone(),
            parent_inode: 0,
            store: self.store.clone(),
        }
    }

    /// Take the readiness gate. Only the first call gets it.
    pub fn take_ready_gate(&mut self) -> Option<ReadyGate> {
        self.gate.take()
    }

    /// Fire the readiness gate. Later calls do nothing.
    ///
    /// Called from the kernel's INIT request; mount controls that never talk
    /// to a kernel call it themselves.
    pub fn notify_ready(&mut self) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(());
            info!("Driver initialized");
        }
    }

    /// Subscribe to backend changes and forward them to the entries
    pub fn listen_for_events(&mut self) -> Result<Arc<EventChannel>> {
        if let Some(events) = &self.events {
            return Ok(events.clone());
        }
        let channel = Arc::new(EventChannel::spawn(self.api.subscribe(), self.inodes.clone())?);
        self.events = Some(channel.clone());
        Ok(channel)
    }

    pub fn events(&self) -> Option<Arc<EventChannel>> {
        self.events.clone()
    }

    fn entry(&self, ino: u64) -> std::result::Result<Arc<dyn Entry>, c_int> {
        self.inodes.get(ino).ok_or(libc::ENOENT)
    }

    fn check_write(&self) -> std::result::Result<(), c_int> {
        if self.enable_write {
            Ok(())
        } else {
            Err(libc::EROFS)
        }
    }

    fn file_attr(&self, ino: u64, attr: &EntryAttr) -> FileAttr {
        let nlink = if attr.kind == EntryKind::Directory { 2 } else { 1 };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind: to_fuse_file_type(attr.kind),
            perm: attr.perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

impl Filesystem for Operations {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        if !self.inodes.contains(ROOT_INODE) {
            error!("init: no root entry registered");
            return Err(libc::EIO);
        }
        self.notify_ready();
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("Driver destroyed ({} inodes)", self.inodes.len());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let dir = match self.entry(parent) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let name = name.to_string_lossy();
        trace!("lookup: {} in {}", name, parent);

        match dir.lookup(&name).and_then(|ino| {
            self.inodes
                .get(ino)
                .map(|child| (ino, child))
                .ok_or_else(|| HarnessError::NotFound(name.to_string()))
        }) {
            Ok((ino, child)) => {
                let attr = self.file_attr(ino, &child.attr());
                reply.entry(&ATTR_TTL, &attr, GENERATION);
            }
            Err(HarnessError::NotFound(_)) => reply.error(libc::ENOENT),
            Err(e) => {
                debug!("lookup error for {} in {}: {}", name, parent, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.entry(ino) {
            Ok(entry) => {
                trace!("getattr: {}", ino);
                let attr = self.file_attr(ino, &entry.attr());
                reply.attr(&ATTR_TTL, &attr);
            }
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let entry = match self.entry(ino) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        // Only truncation is supported; other changes report current attributes
        if let Some(new_size) = size {
            if let Err(e) = self.check_write() {
                reply.error(e);
                return;
            }
            trace!("setattr truncate: {} to {} bytes", ino, new_size);
            if let Err(e) = entry.truncate(new_size) {
                error!("truncate error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
                return;
            }
        }

        let attr = self.file_attr(ino, &entry.attr());
        reply.attr(&ATTR_TTL, &attr);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if !self.inodes.contains(ino) {
            reply.error(libc::ENOENT);
            return;
        }
        let wants_write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        if wants_write && !self.enable_write {
            reply.error(libc::EROFS);
            return;
        }
        // Stateless - dummy file handle
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let entry = match self.entry(ino) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("read: {} offset={} size={}", ino, offset, size);
        match entry.read(offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if let Err(e) = self.check_write() {
            reply.error(e);
            return;
        }

        let entry = match self.entry(ino) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("write: {} offset={} size={}", ino, offset, data.len());
        match entry.write(offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("write error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if let Err(e) = self.check_write() {
            reply.error(e);
            return;
        }

        let dir = match self.entry(parent) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let name = name.to_string_lossy();
        debug!("create: {} in {}", name, parent);

        match dir
            .create(&name)
            .and_then(|ino| self.entry(ino).map(|e| (ino, e)).map_err(|_| {
                HarnessError::NotFound(name.to_string())
            })) {
            Ok((ino, entry)) => {
                let attr = self.file_attr(ino, &entry.attr());
                reply.created(&ATTR_TTL, &attr, GENERATION, 0, 0);
            }
            Err(e) => {
                error!("create error for {} in {}: {}", name, parent, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.entry(ino) {
            Ok(entry) => match entry.flush() {
                Ok(()) => reply.ok(),
                Err(e) => {
                    error!("flush error for ino {}: {}", ino, e);
                    reply.error(e.to_errno());
                }
            },
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.entry(ino) {
            Ok(entry) => match entry.flush() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.inodes.contains(ino) {
            reply.opened(0, 0);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.entry(ino) {
            Ok(e) => e,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("readdir: {} offset={}", ino, offset);

        let entries = match dir.readdir() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("readdir error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = match dir.parent_inode() {
            0 => ROOT_INODE,
            p => p,
        };

        let dots = [
            (ino, FuseFileType::Directory, ".".to_string()),
            (parent_ino, FuseFileType::Directory, "..".to_string()),
        ];
        let rows = dots.into_iter().chain(
            entries
                .into_iter()
                .map(|e| (e.inode, to_fuse_file_type(e.kind), e.name)),
        );

        for (idx, (child_ino, kind, name)) in rows.enumerate().skip(offset.max(0) as usize) {
            if reply.add(child_ino, (idx + 1) as i64, kind, &name) {
                // Buffer full
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(
            0,                         // blocks
            0,                         // bfree
            0,                         // bavail
            self.inodes.len() as u64,  // files
            0,                         // ffree
            BLOCK_SIZE,                // bsize
            255,                       // namelen
            BLOCK_SIZE,                // frsize
        );
    }
}
