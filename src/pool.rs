//! Isolation worker pool
//!
//! A single dedicated worker that runs blocking calls issued by test code
//! (attribute queries against the mounted tree, mostly) away from the test's
//! own thread. The pool never grows and runs at most one job at a time.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    jobs: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

/// Fixed-size (one worker) execution pool
pub struct IsolationPool {
    worker: Mutex<Option<Worker>>,
}

impl IsolationPool {
    /// Allocate the worker. No job is started.
    pub fn new() -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name("fuse-harness-isolation".to_string())
            .spawn(move || {
                // Ends when every sender is gone
                for job in queue {
                    job();
                }
                debug!("Isolation worker exiting");
            })?;

        Ok(Self {
            worker: Mutex::new(Some(Worker { jobs, handle })),
        })
    }

    /// Run `f` on the isolated worker and return its result.
    ///
    /// Callers are serialized: the pool lock is held until the job's result
    /// has come back, so no second job can be queued behind a running one.
    pub fn submit<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let worker = self.worker.lock();
        let worker = worker.as_ref().ok_or(HarnessError::PoolClosed)?;

        let (tx, rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(outcome);
        });

        worker.jobs.send(job).map_err(|_| HarnessError::PoolClosed)?;

        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(HarnessError::WorkerPanicked(panic_message(&*payload))),
            Err(_) => Err(HarnessError::PoolClosed),
        }
    }

    /// Stop accepting work, let any in-flight job finish, release the worker.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        let Worker { jobs, handle } = worker;
        drop(jobs);
        if handle.join().is_err() {
            warn!("Isolation worker terminated abnormally");
        }
        debug!("Isolation pool shut down");
    }

    /// Whether `shutdown` has run
    pub fn is_closed(&self) -> bool {
        self.worker.lock().is_none()
    }
}

impl Drop for IsolationPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
