//! Teardown sequencing
//!
//! Brings a mount back to nothing: close the event listener, force-detach
//! the mount point, join the service thread within a deadline, then release
//! the directories, reset the backend and stop the isolation pool. Every
//! step is attempted even when earlier ones fail. The one exception is a
//! service thread that outlives its deadline; that kills the process.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::TestServer;
use crate::config::{TeardownConfig, UnmountConfig};
use crate::pool::IsolationPool;
use crate::session::{MountSession, ServiceResult};
use crate::store::BackingStore;

/// How often the service thread is polled while waiting for it to exit
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Teardown steps, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    CloseEvents,
    Unmount,
    JoinServiceThread,
    RemoveMountPoint,
    RemoveStore,
    ResetServer,
    ShutdownPool,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::CloseEvents => "close events",
            TeardownStep::Unmount => "unmount",
            TeardownStep::JoinServiceThread => "join service thread",
            TeardownStep::RemoveMountPoint => "remove mount point",
            TeardownStep::RemoveStore => "remove backing store",
            TeardownStep::ResetServer => "reset server",
            TeardownStep::ShutdownPool => "shut down pool",
        };
        f.write_str(name)
    }
}

/// A step that failed without stopping the sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownWarning {
    pub step: TeardownStep,
    pub message: String,
}

/// What a teardown run ran into
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub warnings: Vec<TeardownWarning>,
    /// Time spent waiting for the service thread, if there was one
    pub join_wait: Option<Duration>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn warnings_for(&self, step: TeardownStep) -> impl Iterator<Item = &TeardownWarning> {
        self.warnings.iter().filter(move |w| w.step == step)
    }

    fn warn(&mut self, step: TeardownStep, message: impl Into<String>) {
        let message = message.into();
        warn!("Teardown step '{}' failed: {}", step, message);
        self.warnings.push(TeardownWarning { step, message });
    }
}

/// Everything a teardown releases
pub struct TeardownTargets<'a> {
    pub session: Option<&'a mut MountSession>,
    pub mount_point: &'a Path,
    pub store: Option<&'a mut BackingStore>,
    pub server: &'a TestServer,
    pub pool: &'a IsolationPool,
}

/// Runs the teardown steps with configured bounds
#[derive(Debug, Clone, Default)]
pub struct TeardownSequencer {
    teardown: TeardownConfig,
    unmount: UnmountConfig,
}

impl TeardownSequencer {
    pub fn new(teardown: TeardownConfig, unmount: UnmountConfig) -> Self {
        Self { teardown, unmount }
    }

    /// Release `targets`.
    ///
    /// Never returns if the service thread is still alive after the join
    /// timeout.
    pub fn run(&self, targets: TeardownTargets<'_>) -> TeardownReport {
        let TeardownTargets {
            session,
            mount_point,
            store,
            server,
            pool,
        } = targets;
        let mut report = TeardownReport::default();

        if let Some(session) = session {
            self.stop_session(session, &mut report);
        }

        // Mount point and store go only after the service thread is gone
        match fs::remove_dir(mount_point) {
            Ok(()) => debug!("Removed mount point {:?}", mount_point),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => report.warn(
                TeardownStep::RemoveMountPoint,
                format!("{}: {}", mount_point.display(), e),
            ),
        }

        if let Some(store) = store {
            if let Err(e) = store.remove() {
                report.warn(
                    TeardownStep::RemoveStore,
                    format!("{}: {}", store.path().display(), e),
                );
            }
        }

        server.reset();
        pool.shutdown();

        if report.is_clean() {
            debug!("Teardown finished cleanly");
        } else {
            info!("Teardown finished with {} warning(s)", report.warnings.len());
        }
        report
    }

    fn stop_session(&self, session: &mut MountSession, report: &mut TeardownReport) {
        session.begin_unmount();

        if let Some(events) = session.events() {
            if let Err(e) = events.close(self.teardown.events_close_timeout) {
                report.warn(TeardownStep::CloseEvents, e.to_string());
            }
        }

        let Some(handle) = session.take_service_thread() else {
            session.finish_unmount();
            return;
        };

        self.unmount(session.mount_point(), report);

        let started = Instant::now();
        let handle = match wait_for_exit(handle, self.teardown.join_timeout) {
            Ok(handle) => handle,
            Err(_) => escalate_hang(session.mount_point(), started.elapsed()),
        };

        match handle.join() {
            Ok(Ok(())) => debug!("Service thread for {:?} exited", session.mount_point()),
            Ok(Err(e)) => info!(
                "Service thread for {:?} exited with error: {}",
                session.mount_point(),
                e
            ),
            Err(_) => report.warn(TeardownStep::JoinServiceThread, "service thread panicked"),
        }

        let waited = started.elapsed();
        if waited > self.teardown.slow_join_warning {
            warn!(
                "Waited {:?} for service thread of {:?} to end",
                waited,
                session.mount_point()
            );
        }
        report.join_wait = Some(waited);
        session.finish_unmount();
    }

    fn unmount(&self, mount_point: &Path, report: &mut TeardownReport) {
        debug!(
            "Running {} {:?} {:?}",
            self.unmount.command, self.unmount.args, mount_point
        );
        let status = Command::new(&self.unmount.command)
            .args(&self.unmount.args)
            .arg(mount_point)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => report.warn(
                TeardownStep::Unmount,
                format!("{} exited with {}", self.unmount.command, status),
            ),
            Err(e) => report.warn(
                TeardownStep::Unmount,
                format!("failed to run {}: {}", self.unmount.command, e),
            ),
        }
    }
}

/// Poll until `handle` has finished, giving it back for joining.
///
/// Returns the still-running handle as the error once `timeout` has passed.
pub fn wait_for_exit(
    handle: JoinHandle<ServiceResult>,
    timeout: Duration,
) -> std::result::Result<JoinHandle<ServiceResult>, JoinHandle<ServiceResult>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(handle)
}

/// Kill the whole process because a service thread would not exit.
///
/// The thread may still hold kernel-side state that later mounts depend on,
/// so nothing after this point can be trusted.
pub fn escalate_hang(mount_point: &Path, waited: Duration) -> ! {
    error!(
        "Service thread for {:?} still alive {:?} after unmount, exiting with SIGKILL",
        mount_point, waited
    );

    let pid = nix::unistd::Pid::from_raw(std::process::id() as i32);
    if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL) {
        error!("Failed to send SIGKILL to self: {}", e);
    }
    std::process::abort()
}
