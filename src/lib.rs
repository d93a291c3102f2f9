//! fuse-harness: lifecycle management for testing a FUSE driver
//!
//! This library mounts a user-space filesystem driver inside a test process,
//! waits until the kernel has initialized it, and tears it down again with
//! bounded waits so a wedged driver cannot hang the test run.
//!
//! # Architecture
//!
//! - **Isolation Pool**: A single dedicated worker that runs blocking queries
//!   against the mounted tree away from the test thread.
//! - **Driver**: `fuser::Filesystem` implementation serving an inode table of
//!   entries built by a root factory.
//! - **Mount Session**: Runs the driver's service loop on its own thread and
//!   blocks until the driver reports readiness.
//! - **Teardown Sequencer**: Closes, unmounts, joins and cleans up, killing
//!   the process if the service thread will not exit.
//! - **Test Fixture**: Composes the above per test case.
//!
//! # Example
//!
//! ```no_run
//! use fuse_harness::driver::StaticDirectory;
//! use fuse_harness::fixture::TestFixture;
//!
//! # fn example() -> fuse_harness::Result<()> {
//! let mut fixture = TestFixture::new()?;
//! fixture.make_mount(|ctx| StaticDirectory::root(ctx, [("a.txt", "a"), ("b.txt", "b")]))?;
//! fixture.assert_dir_contents(None, &["a.txt", "b.txt"]);
//! fixture.teardown();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod events;
pub mod fixture;
pub mod pool;
pub mod session;
pub mod store;
pub mod teardown;
pub mod testing;

pub use error::{HarnessError, Result};
