//! Mount lifecycle tests against a real FUSE device
//!
//! Covers readiness on return from start, remounting on the same path,
//! writes reaching the backing store, backend events reaching the driver,
//! and teardown of both healthy and failed mounts.

use anyhow::Result;
use fuse_harness::driver::CollectionDirectory;
use fuse_harness::session::{DriverOptions, FuserControl, SessionState};
use fuse_harness::store::BlockStore;
use fuse_harness::HarnessError;
use fuse_harness_e2e::*;
use std::fs;
use std::io;
use std::time::{Duration, Instant};
use test_case::test_case;

// =============================================================================
// Readiness
// =============================================================================

#[test]
fn root_is_ready_when_start_returns() -> Result<()> {
    if !fuse_available() {
        return Ok(());
    }

    let mut fixture = TestFixture::new()?;
    let root = fixture.make_mount(two_file_root)?;

    // No sleep: start only returns once the kernel has initialized the mount
    assert!(is_mounted(fixture.mount_point()));
    assert_eq!(fixture.session().map(|s| s.state()), Some(SessionState::Mounted));
    fixture.assert_dir_contents(None, &["b.txt", "a.txt"]);
    assert_eq!(root.readdir()?.len(), 2);

    assert_eq!(
        fs::read_to_string(fixture.mount_point().join(FILE_A.0))?,
        FILE_A.1
    );

    let report = fixture.teardown();
    assert!(report.is_clean(), "{:?}", report.warnings);
    assert!(!fixture.mount_point().exists());
    Ok(())
}

#[test]
fn attr_query_runs_on_isolation_worker() -> Result<()> {
    if !fuse_available() {
        return Ok(());
    }

    let mut fixture = TestFixture::new()?;
    fixture.make_mount(two_file_root)?;

    let attr = fixture.attr(FILE_B.0)?;
    assert!(attr.is_file());
    assert_eq!(attr.len(), FILE_B.1.len() as u64);
    assert!(fixture.attr("")?.is_dir());

    fixture.teardown();
    Ok(())
}

// =============================================================================
// Remount
// =============================================================================

#[test]
fn remount_on_same_path() -> Result<()> {
    if !fuse_available() {
        return Ok(());
    }

    let scratch = tempfile::tempdir()?;
    let mount_point = scratch.path().join("mnt");

    for _ in 0..2 {
        let mut fixture = TestFixture::setup(FixtureOptions {
            mount_point: Some(mount_point.clone()),
            ..FixtureOptions::default()
        })?;
        fixture.make_mount(two_file_root)?;
        fixture.assert_dir_contents(None, &["a.txt", "b.txt"]);

        let report = fixture.teardown();
        assert!(report.is_clean(), "{:?}", report.warnings);
        assert!(!is_mounted(&mount_point));
    }
    Ok(())
}

// =============================================================================
// Writes
// =============================================================================

#[test]
fn write_reaches_backing_store() -> Result<()> {
    if !fuse_available() {
        return Ok(());
    }

    let mut fixture = TestFixture::new()?;
    fixture.make_mount(two_file_root)?;
    let blocks = BlockStore::new(fixture.store().expect("local store").path());

    // Closing the file flushes it
    fs::write(fixture.mount_point().join("c.txt"), "charlie")?;
    fixture.assert_dir_contents(None, &["a.txt", "b.txt", "c.txt"]);
    assert_eq!(fs::read_to_string(fixture.mount_point().join("c.txt"))?, "charlie");

    let stored: Vec<Vec<u8>> = fs::read_dir(blocks.root())?
        .filter_map(|e| e.ok())
        .filter_map(|e| fs::read(e.path()).ok())
        .collect();
    assert!(
        stored.iter().any(|b| b.as_slice() == b"charlie"),
        "no block holds the written content"
    );

    fixture.teardown();
    Ok(())
}

#[test_case(true ; "writable")]
#[test_case(false ; "read only")]
fn create_respects_enable_write(enable_write: bool) -> Result<()> {
    if !fuse_available() {
        return Ok(());
    }

    let mut fixture = TestFixture::new()?;
    fixture.make_mount_with(
        FuserControl::new(),
        DriverOptions {
            enable_write,
            ..DriverOptions::default()
        },
        two_file_root,
    )?;

    let result = fs::write(fixture.mount_point().join("new.txt"), "data");
    if enable_write {
        result?;
        fixture.assert_dir_contents(None, &["a.txt", "b.txt", "new.txt"]);
    } else {
        let err = result.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EROFS));
        fixture.assert_dir_contents(None, &["a.txt", "b.txt"]);
    }

    fixture.teardown();
    Ok(())
}

// =============================================================================
// Backend events
// =============================================================================

#[test]
fn collection_listing_follows_backend_changes() -> Result<()> {
    if !fuse_available() {
        return Ok(());
    }

    let mut fixture = TestFixture::new()?;
    fixture.make_mount_with(
        FuserControl::new(),
        DriverOptions {
            listen_for_events: true,
            ..DriverOptions::default()
        },
        |ctx| CollectionDirectory::root(ctx, "multi_file"),
    )?;
    fixture.assert_dir_contents(None, &["file1.txt", "file2.txt"]);

    fixture.api().put_file("multi_file", "file3.txt", "three")?;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let names = fixture.list_dir(None)?;
        if names.contains("file3.txt") {
            break;
        }
        assert!(Instant::now() < deadline, "listing never refreshed: {:?}", names);
        std::thread::sleep(Duration::from_millis(50));
    }
    fixture.assert_dir_contents(None, &["file1.txt", "file2.txt", "file3.txt"]);

    let report = fixture.teardown();
    assert!(report.is_clean(), "{:?}", report.warnings);
    assert!(fixture.session().and_then(|s| s.events()).map_or(false, |e| e.is_closed()));

    // The reset restored the fixture collection
    assert!(!fixture.api().collection("multi_file")?.files.contains_key("file3.txt"));
    Ok(())
}

// =============================================================================
// Teardown
// =============================================================================

#[test]
fn teardown_twice_is_clean() -> Result<()> {
    if !fuse_available() {
        return Ok(());
    }

    let mut fixture = TestFixture::new()?;
    fixture.make_mount(two_file_root)?;
    let store = fixture.store().map(|s| s.path().to_path_buf());

    let first = fixture.teardown();
    assert!(first.is_clean(), "{:?}", first.warnings);
    let second = fixture.teardown();
    assert!(second.is_clean(), "{:?}", second.warnings);

    assert!(!is_mounted(fixture.mount_point()));
    assert!(store.map_or(true, |p| !p.exists()));
    Ok(())
}

#[test]
fn missing_mount_point_fails_start() -> Result<()> {
    let mut fixture = TestFixture::new()?;
    fs::remove_dir(fixture.mount_point())?;

    let err = match fixture.make_mount(two_file_root) {
        Ok(_) => panic!("mounting on a missing directory succeeded"),
        Err(e) => e,
    };
    assert!(matches!(err, HarnessError::MountInit { .. }), "{}", err);
    assert!(matches!(fixture.root(), Err(HarnessError::InvalidState(_))));
    assert_eq!(fixture.session().map(|s| s.state()), Some(SessionState::Stopped));
    assert!(matches!(
        fs::metadata(fixture.mount_point()).map_err(|e| e.kind()),
        Err(io::ErrorKind::NotFound)
    ));

    let report = fixture.teardown();
    assert!(report.is_clean(), "{:?}", report.warnings);
    Ok(())
}
