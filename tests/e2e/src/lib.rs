//! E2E test support for fuse-harness
//!
//! These tests mount the driver through a real FUSE device, or re-execute
//! the test binary to observe process-level behavior. Tests that need FUSE
//! call [`fuse_available`] first and skip themselves when it returns false.
//!
//! ```ignore
//! use fuse_harness_e2e::*;
//!
//! #[test]
//! fn my_test() -> anyhow::Result<()> {
//!     if !fuse_available() {
//!         return Ok(());
//!     }
//!     let mut fixture = TestFixture::new()?;
//!     fixture.make_mount(two_file_root)?;
//!     fixture.assert_dir_contents(None, &["a.txt", "b.txt"]);
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

pub use fuse_harness::driver::{Entry, RootContext, StaticDirectory};
pub use fuse_harness::fixture::{assert_dir_contents, init_logging, FixtureOptions, TestFixture};
pub use fuse_harness::config::HarnessConfig;

/// Contents of the fixed two-file root
pub const FILE_A: (&str, &str) = ("a.txt", "alpha");
pub const FILE_B: (&str, &str) = ("b.txt", "bravo");

/// Root factory serving `a.txt` and `b.txt`
pub fn two_file_root(ctx: RootContext) -> fuse_harness::Result<Arc<dyn Entry>> {
    StaticDirectory::root(ctx, [FILE_A, FILE_B])
}

/// Whether this machine can mount FUSE filesystems
pub fn fuse_available() -> bool {
    init_logging("info");

    if !Path::new("/dev/fuse").exists() {
        info!("Skipping: /dev/fuse not present");
        return false;
    }

    let unmount = HarnessConfig::default().unmount.command;
    let found = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).any(|dir| dir.join(&unmount).is_file()))
        .unwrap_or(false);
    if !found {
        info!("Skipping: {} not found", unmount);
    }
    found
}

/// Check if `path` is a mount point by comparing device IDs with its parent
pub fn is_mounted(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(parent) = path.parent() else {
        return false;
    };
    match (std::fs::metadata(path), std::fs::metadata(parent)) {
        (Ok(meta), Ok(parent_meta)) => meta.dev() != parent_meta.dev(),
        (Err(e), _) | (_, Err(e)) => {
            debug!("Failed to stat {:?}: {}", path, e);
            false
        }
    }
}
