//! Scripted mount control
//!
//! Stands in for the kernel so session and teardown behavior can be driven
//! without a FUSE device: init failures, loops that die early, and loops
//! that never return.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fuser::MountOption;
use parking_lot::Mutex;
use tracing::debug;

use crate::driver::Operations;
use crate::session::MountControl;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the scripted loop does once started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// `init` fails
    FailInit,
    /// Signal readiness, serve for the given time, exit cleanly
    ExitAfter(Duration),
    /// Signal readiness, then block until [`ScriptHandle::release`]
    Block,
    /// Fail without ever signaling readiness
    FailBeforeReady,
    /// Signal readiness, then fail
    FailAfterReady,
    /// Signal readiness, then panic
    PanicAfterReady,
}

#[derive(Default)]
struct Shared {
    ready: AtomicBool,
    released: AtomicBool,
    close_calls: Mutex<Vec<bool>>,
}

/// Observes and steers a [`ScriptedControl`] after it has been moved into a
/// session
#[derive(Clone, Default)]
pub struct ScriptHandle {
    shared: Arc<Shared>,
}

impl ScriptHandle {
    /// Whether the driver has signaled readiness
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Let a [`Script::Block`] loop return
    pub fn release(&self) {
        self.shared.released.store(true, Ordering::SeqCst);
    }

    /// The `unmount` argument of every `close` call, in order
    pub fn close_calls(&self) -> Vec<bool> {
        self.shared.close_calls.lock().clone()
    }
}

/// [`MountControl`] that follows a [`Script`] instead of talking to a kernel
pub struct ScriptedControl {
    script: Script,
    operations: Option<Operations>,
    handle: ScriptHandle,
}

impl ScriptedControl {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            operations: None,
            handle: ScriptHandle::default(),
        }
    }

    pub fn handle(&self) -> ScriptHandle {
        self.handle.clone()
    }

    fn signal_ready(&mut self) {
        if let Some(ops) = self.operations.as_mut() {
            self.handle.shared.ready.store(true, Ordering::SeqCst);
            ops.notify_ready();
        }
    }
}

impl MountControl for ScriptedControl {
    fn init(
        &mut self,
        operations: Operations,
        mount_point: &Path,
        _options: &[MountOption],
    ) -> io::Result<()> {
        if self.script == Script::FailInit {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("scripted init failure at {}", mount_point.display()),
            ));
        }
        self.operations = Some(operations);
        Ok(())
    }

    fn run_service_loop(&mut self) -> io::Result<()> {
        debug!("Scripted loop running: {:?}", self.script);
        match self.script {
            Script::FailInit => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "scripted loop never initialized",
            )),
            Script::ExitAfter(duration) => {
                self.signal_ready();
                thread::sleep(duration);
                Ok(())
            }
            Script::Block => {
                self.signal_ready();
                while !self.handle.shared.released.load(Ordering::SeqCst) {
                    thread::sleep(POLL_INTERVAL);
                }
                Ok(())
            }
            Script::FailBeforeReady => {
                // Dropping the driver drops its readiness sender
                self.operations = None;
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted loop failure"))
            }
            Script::FailAfterReady => {
                self.signal_ready();
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted loop failure"))
            }
            Script::PanicAfterReady => {
                self.signal_ready();
                panic!("scripted loop panic");
            }
        }
    }

    fn close(&mut self, unmount: bool) {
        self.handle.shared.close_calls.lock().push(unmount);
        self.operations = None;
    }
}
