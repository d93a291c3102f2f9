//! Per-test fixture
//!
//! [`TestFixture`] provisions everything one test needs around a mount
//! (isolation pool, backing store, mount point, backend client), mounts the
//! driver on request and tears it all down again, explicitly or on drop.
//!
//! ```ignore
//! let mut fixture = TestFixture::new()?;
//! fixture.make_mount(|ctx| StaticDirectory::root(ctx, [("a.txt", "a"), ("b.txt", "b")]))?;
//! fixture.assert_dir_contents(None, &["a.txt", "b.txt"]);
//! let report = fixture.teardown();
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::MutexGuard;
use scopeguard::ScopeGuard;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::backend::{ApiClient, TestServer};
use crate::config::HarnessConfig;
use crate::driver::{Entry, RootContext};
use crate::error::{HarnessError, Result};
use crate::pool::IsolationPool;
use crate::session::{DriverOptions, FuserControl, MountControl, MountSession};
use crate::store::{BackingStore, BlockStore};
use crate::teardown::{TeardownReport, TeardownSequencer, TeardownTargets};

/// Initialize logging for tests. Repeated calls are harmless.
///
/// `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_test_writer()
        .try_init();
}

/// Names directly under `path`
pub fn list_dir(path: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(path)? {
        names.insert(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Assert that `path` holds exactly the entries in `expected`, in any order
pub fn assert_dir_contents(path: &Path, expected: &[&str]) {
    let actual = match list_dir(path) {
        Ok(names) => names,
        Err(e) => panic!("Failed to read directory {:?}: {}", path, e),
    };
    let actual: Vec<String> = actual.into_iter().collect();
    let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected.sort();

    assert_eq!(
        actual, expected,
        "Directory {:?} contents mismatch.\nExpected: {:?}\nGot: {:?}",
        path, expected, actual
    );
}

/// Setup options for [`TestFixture`]
#[derive(Debug, Clone)]
pub struct FixtureOptions {
    /// Use this client instead of authorizing a fresh admin client
    pub api: Option<ApiClient>,
    /// Create a backing store and bind the environment to it
    pub local_store: bool,
    /// Mount here instead of under a fresh temporary directory
    pub mount_point: Option<PathBuf>,
    /// Use this config instead of [`HarnessConfig::load`]
    pub config: Option<HarnessConfig>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            api: None,
            local_store: true,
            mount_point: None,
            config: None,
        }
    }
}

/// Everything one test needs around a mount.
///
/// Fixtures in one process run one at a time: setup blocks until the
/// previous fixture has been dropped. Do not hold two in the same thread.
pub struct TestFixture {
    config: HarnessConfig,
    pool: IsolationPool,
    store: Option<BackingStore>,
    mount_point: PathBuf,
    server: Arc<TestServer>,
    api: ApiClient,
    session: Option<MountSession>,
    torn_down: bool,
    // Released last
    _lease: MutexGuard<'static, ()>,
}

impl TestFixture {
    /// Set up with default options
    pub fn new() -> Result<Self> {
        Self::setup(FixtureOptions::default())
    }

    /// Provision the pool, store, mount point and backend client.
    ///
    /// If a step fails, whatever was already created is released before the
    /// error is returned.
    pub fn setup(options: FixtureOptions) -> Result<Self> {
        let config = match options.config {
            Some(config) => config,
            None => HarnessConfig::load()?,
        };
        init_logging(&config.logging.level);

        let lease = TestServer::lease();
        let pool = IsolationPool::new()?;

        let store = if options.local_store {
            Some(BackingStore::create(
                &config.store.prefix,
                &config.store.env_var,
            )?)
        } else {
            None
        };
        let store = scopeguard::guard(store, |mut store| {
            if let Some(store) = store.as_mut() {
                if let Err(e) = store.remove() {
                    warn!("Failed to remove backing store after setup error: {}", e);
                }
            }
        });

        let mount_point = options.mount_point.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("fuse-harness-mnt-{}", Uuid::new_v4()))
        });
        fs::create_dir_all(&mount_point)?;
        let mount_point = scopeguard::guard(mount_point, |path| {
            let _ = fs::remove_dir(&path);
        });

        let server = TestServer::run();
        let api = match options.api {
            Some(api) => api,
            None => server.authorize_with("admin")?,
        };

        let mount_point = ScopeGuard::into_inner(mount_point);
        let store = ScopeGuard::into_inner(store);
        info!("Fixture ready, mount point {:?}", mount_point);

        Ok(Self {
            config,
            pool,
            store,
            mount_point,
            server,
            api,
            session: None,
            torn_down: false,
            _lease: lease,
        })
    }

    /// Mount the driver through FUSE with default driver options
    pub fn make_mount<F>(&mut self, factory: F) -> Result<Arc<dyn Entry>>
    where
        F: FnOnce(RootContext) -> Result<Arc<dyn Entry>>,
    {
        self.make_mount_with(FuserControl::new(), DriverOptions::default(), factory)
    }

    /// Mount the driver through `control`
    pub fn make_mount_with<C, F>(
        &mut self,
        control: C,
        options: DriverOptions,
        factory: F,
    ) -> Result<Arc<dyn Entry>>
    where
        C: MountControl,
        F: FnOnce(RootContext) -> Result<Arc<dyn Entry>>,
    {
        if self.session.is_some() {
            return Err(HarnessError::InvalidState(
                "fixture already has a mount".to_string(),
            ));
        }

        let store = BlockStore::from_env(&self.config.store.env_var);
        let session = self.session.insert(MountSession::new(&self.mount_point));
        session.start(control, options, self.api.clone(), store, factory)
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn server(&self) -> &Arc<TestServer> {
        &self.server
    }

    pub fn pool(&self) -> &IsolationPool {
        &self.pool
    }

    pub fn store(&self) -> Option<&BackingStore> {
        self.store.as_ref()
    }

    pub fn session(&self) -> Option<&MountSession> {
        self.session.as_ref()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Root entry of the current mount
    pub fn root(&self) -> Result<Arc<dyn Entry>> {
        match &self.session {
            Some(session) => session.root(),
            None => Err(HarnessError::InvalidState("nothing mounted".to_string())),
        }
    }

    /// Metadata for `path` (relative to the mount point), queried from the
    /// isolation worker
    pub fn attr(&self, path: impl AsRef<Path>) -> Result<fs::Metadata> {
        let full = self.mount_point.join(path);
        let metadata = self.pool.submit(move || fs::metadata(full))??;
        Ok(metadata)
    }

    fn resolve(&self, subdir: Option<&str>) -> PathBuf {
        match subdir {
            Some(subdir) => self.mount_point.join(subdir),
            None => self.mount_point.clone(),
        }
    }

    /// Names under `mount_point[/subdir]`
    pub fn list_dir(&self, subdir: Option<&str>) -> Result<BTreeSet<String>> {
        list_dir(&self.resolve(subdir))
    }

    /// Assert that `mount_point[/subdir]` holds exactly `expected`, in any order
    pub fn assert_dir_contents(&self, subdir: Option<&str>, expected: &[&str]) {
        assert_dir_contents(&self.resolve(subdir), expected);
    }

    /// Tear everything down. Running it again only repeats steps whose
    /// resources still exist.
    pub fn teardown(&mut self) -> TeardownReport {
        self.torn_down = true;
        let sequencer =
            TeardownSequencer::new(self.config.teardown.clone(), self.config.unmount.clone());
        sequencer.run(TeardownTargets {
            session: self.session.as_mut(),
            mount_point: &self.mount_point,
            store: self.store.as_mut(),
            server: &self.server,
            pool: &self.pool,
        })
    }
}

impl Drop for TestFixture {
    fn drop(&mut self) {
        if !self.torn_down {
            debug!("Fixture dropped without teardown, tearing down now");
            let report = self.teardown();
            if !report.is_clean() {
                warn!("Teardown on drop: {} warning(s)", report.warnings.len());
            }
        }
    }
}
