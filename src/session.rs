//! Mount session lifecycle
//!
//! A [`MountSession`] owns one mount of the driver: it builds the driver,
//! hands it to a [`MountControl`], runs the kernel request loop on a
//! dedicated service thread and blocks until the driver reports that the
//! kernel finished initializing. Tearing the mount down is the job of
//! [`crate::teardown`].

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use fuser::MountOption;
use tracing::{debug, error, info, warn};

use crate::backend::ApiClient;
use crate::driver::{Entry, Operations, RootContext, ROOT_INODE};
use crate::error::{HarnessError, Result};
use crate::events::EventChannel;
use crate::store::BlockStore;

/// Result the service thread hands back when joined
pub type ServiceResult = io::Result<()>;

/// Lifecycle state of a mount session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unmounted,
    Initializing,
    Mounted,
    Unmounting,
    /// Start failed; the session can only be torn down
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unmounted => "unmounted",
            SessionState::Initializing => "initializing",
            SessionState::Mounted => "mounted",
            SessionState::Unmounting => "unmounting",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Kernel-facing side of a mount.
///
/// `init` runs on the caller's thread; `run_service_loop` and `close` run on
/// the service thread.
pub trait MountControl: Send + 'static {
    /// Attach `operations` to `mount_point`
    fn init(&mut self, operations: Operations, mount_point: &Path, options: &[MountOption])
        -> io::Result<()>;

    /// Serve kernel requests until the filesystem is unmounted
    fn run_service_loop(&mut self) -> io::Result<()>;

    /// Release the mount. `unmount` is false when the loop failed, in which
    /// case the kernel side may already be gone.
    fn close(&mut self, unmount: bool);
}

/// [`MountControl`] backed by a real FUSE session
#[derive(Default)]
pub struct FuserControl {
    session: Option<fuser::Session<Operations>>,
}

impl FuserControl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MountControl for FuserControl {
    fn init(
        &mut self,
        operations: Operations,
        mount_point: &Path,
        options: &[MountOption],
    ) -> io::Result<()> {
        let session = fuser::Session::new(operations, mount_point, options)?;
        self.session = Some(session);
        Ok(())
    }

    fn run_service_loop(&mut self) -> io::Result<()> {
        match self.session.as_mut() {
            Some(session) => session.run(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "FUSE session not initialized",
            )),
        }
    }

    fn close(&mut self, unmount: bool) {
        if let Some(mut session) = self.session.take() {
            if unmount {
                session.unmount();
            }
            // Dropping the session releases the channel and the driver
            drop(session);
        }
    }
}

/// Driver settings for a mount
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub enable_write: bool,
    /// Subscribe to backend events and forward them to entries
    pub listen_for_events: bool,
    pub mount_options: Vec<MountOption>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            enable_write: true,
            listen_for_events: false,
            mount_options: Vec::new(),
        }
    }
}

/// One mount of the driver at a fixed mount point
pub struct MountSession {
    mount_point: PathBuf,
    state: SessionState,
    started: bool,
    root: Option<Arc<dyn Entry>>,
    events: Option<Arc<EventChannel>>,
    service_thread: Option<JoinHandle<ServiceResult>>,
}

impl MountSession {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            state: SessionState::Unmounted,
            started: false,
            root: None,
            events: None,
            service_thread: None,
        }
    }

    /// Mount the driver and block until it is ready to serve requests.
    ///
    /// `factory` builds the root entry from the driver's [`RootContext`].
    /// On success the session is `Mounted` and the root entry is returned.
    /// A failure to attach the mount is returned as
    /// [`HarnessError::MountInit`]; a service loop that ends before the
    /// driver is ready is returned as [`HarnessError::ServiceLoop`]. Either
    /// way the session ends up `Stopped`.
    pub fn start<C, F>(
        &mut self,
        mut control: C,
        options: DriverOptions,
        api: ApiClient,
        store: Option<BlockStore>,
        factory: F,
    ) -> Result<Arc<dyn Entry>>
    where
        C: MountControl,
        F: FnOnce(RootContext) -> Result<Arc<dyn Entry>>,
    {
        if self.started || self.state != SessionState::Unmounted {
            return Err(HarnessError::InvalidState(format!(
                "cannot start a session that is {}",
                self.state
            )));
        }
        self.started = true;
        self.state = SessionState::Initializing;
        info!("Mounting driver at {:?}", self.mount_point);

        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let mut operations =
            Operations::new(uid, gid, api, options.enable_write).with_store(store);

        let root = match self.build_root(&mut operations, &options, factory) {
            Ok(root) => root,
            Err(e) => {
                self.fail_start();
                return Err(e);
            }
        };

        let gate = match operations.take_ready_gate() {
            Some(gate) => gate,
            None => {
                self.fail_start();
                return Err(HarnessError::InvalidState(
                    "driver readiness gate already taken".to_string(),
                ));
            }
        };

        if let Err(source) = control.init(operations, &self.mount_point, &options.mount_options) {
            error!("Failed to initialize mount at {:?}: {}", self.mount_point, source);
            self.fail_start();
            return Err(HarnessError::MountInit {
                path: self.mount_point.display().to_string(),
                source,
            });
        }

        let mount_point = self.mount_point.clone();
        let spawned = thread::Builder::new()
            .name("fuse-harness-service".to_string())
            .spawn(move || {
                let result = match panic::catch_unwind(AssertUnwindSafe(|| control.run_service_loop())) {
                    Ok(result) => result,
                    Err(payload) => {
                        error!("Service loop for {:?} panicked", mount_point);
                        control.close(false);
                        panic::resume_unwind(payload);
                    }
                };
                match &result {
                    Ok(()) => {
                        debug!("Service loop for {:?} finished", mount_point);
                        control.close(true);
                    }
                    Err(e) => {
                        warn!("Service loop for {:?} failed: {}", mount_point, e);
                        control.close(false);
                    }
                }
                result
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_start();
                return Err(e.into());
            }
        };
        self.service_thread = Some(handle);

        if let Err(e) = gate.wait() {
            error!("Driver at {:?} stopped before becoming ready", self.mount_point);
            self.state = SessionState::Stopped;
            return Err(e);
        }

        self.state = SessionState::Mounted;
        self.root = Some(root.clone());
        info!("Mounted driver at {:?}", self.mount_point);
        Ok(root)
    }

    fn build_root<F>(
        &mut self,
        operations: &mut Operations,
        options: &DriverOptions,
        factory: F,
    ) -> Result<Arc<dyn Entry>>
    where
        F: FnOnce(RootContext) -> Result<Arc<dyn Entry>>,
    {
        if options.listen_for_events {
            self.events = Some(operations.listen_for_events()?);
        }

        let root = factory(operations.root_context())?;
        if root.inode() != ROOT_INODE {
            return Err(HarnessError::InvalidState(format!(
                "root entry has inode {}, expected {}",
                root.inode(),
                ROOT_INODE
            )));
        }
        operations.inodes().add_entry(root.clone())?;
        Ok(root)
    }

    fn fail_start(&mut self) {
        self.state = SessionState::Stopped;
        // Nothing will tear down a listener for a mount that never existed
        if let Some(events) = self.events.take() {
            if let Err(e) = events.close(std::time::Duration::from_secs(1)) {
                warn!("Failed to close event channel: {}", e);
            }
        }
    }

    /// The driver's root entry. Only available while mounted.
    pub fn root(&self) -> Result<Arc<dyn Entry>> {
        match (&self.state, &self.root) {
            (SessionState::Mounted, Some(root)) => Ok(root.clone()),
            _ => Err(HarnessError::InvalidState(format!(
                "no root while session is {}",
                self.state
            ))),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn events(&self) -> Option<&Arc<EventChannel>> {
        self.events.as_ref()
    }

    pub fn has_service_thread(&self) -> bool {
        self.service_thread.is_some()
    }

    /// Hand the service thread over for joining
    pub fn take_service_thread(&mut self) -> Option<JoinHandle<ServiceResult>> {
        self.service_thread.take()
    }

    /// Mark the session as being unmounted
    pub fn begin_unmount(&mut self) {
        if self.state == SessionState::Mounted {
            self.state = SessionState::Unmounting;
        }
        self.root = None;
    }

    /// Mark the session as fully released
    pub fn finish_unmount(&mut self) {
        if self.state == SessionState::Unmounting {
            self.state = SessionState::Unmounted;
        }
    }
}

impl fmt::Debug for MountSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSession")
            .field("mount_point", &self.mount_point)
            .field("state", &self.state)
            .field("service_thread", &self.service_thread.is_some())
            .finish()
    }
}
