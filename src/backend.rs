//! Shared in-process test backend
//!
//! Stands in for the API server the driver talks to. One server exists per
//! test process; fixtures reset its logical state between tests instead of
//! restarting it, so tests may rely on a clean state but not on a fresh
//! server identity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{HarnessError, Result};

/// Users the server knows about, with their API tokens
const FIXTURE_USERS: &[(&str, &str, bool)] = &[
    ("admin", "admin-token-4wk5l0x1cu3z1zr5", true),
    ("active", "active-token-3kg6k6lzmp9kj5cp", true),
    ("anonymous", "anonymous-token-4z3xt6r9ed7qwbd", false),
];

static SERVER: Lazy<Arc<TestServer>> = Lazy::new(|| Arc::new(TestServer::new()));

/// Held by a fixture for its whole lifetime
static LEASE: Mutex<()> = parking_lot::const_mutex(());

/// A named set of files stored by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub files: BTreeMap<String, Bytes>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}

/// Change notification published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    CollectionCreated { collection: String },
    CollectionUpdated { collection: String },
    /// The whole logical state was reset
    Reset,
}

impl BackendEvent {
    /// Collection the event concerns, if any
    pub fn collection(&self) -> Option<&str> {
        match self {
            BackendEvent::CollectionCreated { collection }
            | BackendEvent::CollectionUpdated { collection } => Some(collection),
            BackendEvent::Reset => None,
        }
    }
}

fn fixture_collections() -> BTreeMap<String, Collection> {
    [
        Collection::new("foo_file").with_file("foo", "foo"),
        Collection::new("bar_file").with_file("bar", "bar"),
        Collection::new("multi_file")
            .with_file("file1.txt", "file one")
            .with_file("file2.txt", "file two"),
    ]
    .into_iter()
    .map(|c| (c.name.clone(), c))
    .collect()
}

/// In-process backend server
pub struct TestServer {
    id: Uuid,
    collections: RwLock<BTreeMap<String, Collection>>,
    subscribers: Mutex<Vec<mpsc::Sender<BackendEvent>>>,
    resets: AtomicU64,
}

impl TestServer {
    fn new() -> Self {
        let id = Uuid::new_v4();
        info!("Starting test backend {}", id);
        Self {
            id,
            collections: RwLock::new(fixture_collections()),
            subscribers: Mutex::new(Vec::new()),
            resets: AtomicU64::new(0),
        }
    }

    /// Start the shared server, or return it if already running
    pub fn run() -> Arc<TestServer> {
        SERVER.clone()
    }

    /// Exclusive use of the shared server (and the process environment)
    /// for one fixture.
    pub fn lease() -> MutexGuard<'static, ()> {
        LEASE.lock()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get an API client authorized as one of the fixture users
    pub fn authorize_with(self: &Arc<Self>, user: &str) -> Result<ApiClient> {
        let (name, token, can_write) = FIXTURE_USERS
            .iter()
            .find(|(name, _, _)| *name == user)
            .ok_or_else(|| HarnessError::Backend(format!("Unknown fixture user: {}", user)))?;

        debug!("Authorized test client as {}", name);
        Ok(ApiClient {
            server: self.clone(),
            user: name.to_string(),
            token: token.to_string(),
            can_write: *can_write,
        })
    }

    /// Restore the fixture state. Server identity and subscribers survive.
    pub fn reset(&self) {
        *self.collections.write() = fixture_collections();
        let count = self.resets.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Test backend reset (#{})", count);
        self.publish(BackendEvent::Reset);
    }

    /// Number of resets since the server started
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::Receiver<BackendEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: BackendEvent) {
        // Drop subscribers whose receiving side is gone
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Authorized handle onto the test backend
#[derive(Clone)]
pub struct ApiClient {
    server: Arc<TestServer>,
    user: String,
    token: String,
    can_write: bool,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("server", &self.server.id)
            .field("user", &self.user)
            .finish()
    }
}

impl ApiClient {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn server(&self) -> &Arc<TestServer> {
        &self.server
    }

    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.server
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::NotFound(format!("collection {}", name)))
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.server.collections.read().keys().cloned().collect()
    }

    pub fn create_collection(&self, collection: Collection) -> Result<()> {
        self.check_write()?;
        let name = collection.name.clone();
        {
            let mut collections = self.server.collections.write();
            if collections.contains_key(&name) {
                return Err(HarnessError::AlreadyExists(format!("collection {}", name)));
            }
            collections.insert(name.clone(), collection);
        }
        self.server
            .publish(BackendEvent::CollectionCreated { collection: name });
        Ok(())
    }

    /// Add or replace one file in an existing collection
    pub fn put_file(&self, collection: &str, file: &str, content: impl Into<Bytes>) -> Result<()> {
        self.check_write()?;
        {
            let mut collections = self.server.collections.write();
            let entry = collections
                .get_mut(collection)
                .ok_or_else(|| HarnessError::NotFound(format!("collection {}", collection)))?;
            entry.files.insert(file.to_string(), content.into());
        }
        self.server.publish(BackendEvent::CollectionUpdated {
            collection: collection.to_string(),
        });
        Ok(())
    }

    /// Receive every change published from now on
    pub fn subscribe(&self) -> mpsc::Receiver<BackendEvent> {
        self.server.subscribe()
    }

    fn check_write(&self) -> Result<()> {
        if self.can_write {
            Ok(())
        } else {
            Err(HarnessError::PermissionDenied)
        }
    }
}
