//! Backend event channel
//!
//! When the driver listens for events, a dedicated thread forwards every
//! backend change to the inode registry so affected entries can drop stale
//! state. The channel has to be closed before the mount is torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::backend::BackendEvent;
use crate::driver::InodeTable;
use crate::error::{HarnessError, Result};

/// How often the listener checks for a close request
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Closable notification channel owned by the driver
pub struct EventChannel {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    /// Start forwarding events from `events` to `inodes`
    pub fn spawn(events: Receiver<BackendEvent>, inodes: Arc<InodeTable>) -> Result<Self> {
        Self::spawn_with(events, move |event| inodes.dispatch(&event))
    }

    /// Start forwarding events to an arbitrary handler
    pub fn spawn_with<H>(events: Receiver<BackendEvent>, mut handler: H) -> Result<Self>
    where
        H: FnMut(BackendEvent) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("fuse-harness-events".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    match events.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => {
                            trace!("Backend event: {:?}", event);
                            handler(event);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Event listener exiting");
            })?;

        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the listener, waiting at most `timeout` for it to exit.
    ///
    /// Closing an already-closed channel succeeds immediately.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);

        let mut slot = self.handle.lock();
        let Some(handle) = slot.as_ref() else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!(
                    "event channel still open after {:?}",
                    timeout
                )));
            }
            thread::sleep(POLL_INTERVAL.min(timeout));
        }

        if let Some(handle) = slot.take() {
            if handle.join().is_err() {
                warn!("Event listener panicked");
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.lock().is_none()
    }
}
