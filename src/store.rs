//! Backing store for driver content
//!
//! A fixture creates a [`BackingStore`]: a temporary directory plus an
//! environment binding naming it. The driver never sees the fixture; it
//! finds the directory through [`BlockStore::from_env`].

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::env::EnvBinding;
use crate::error::{HarnessError, Result};

/// Temporary directory the driver persists to, plus the variable naming it
pub struct BackingStore {
    dir: Option<TempDir>,
    path: PathBuf,
    binding: EnvBinding,
}

impl BackingStore {
    /// Create the directory and point `env_var` at it
    pub fn create(prefix: &str, env_var: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().to_path_buf();
        let binding = EnvBinding::new(env_var);
        binding.bind(&path);

        info!("Created backing store at {:?}", path);
        Ok(Self {
            dir: Some(dir),
            path,
            binding,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn binding(&self) -> &EnvBinding {
        &self.binding
    }

    /// Delete the tree and unset the binding.
    ///
    /// A tree that is already gone is not an error, and calling this twice
    /// does nothing the second time.
    pub fn remove(&mut self) -> io::Result<()> {
        self.binding.clear();
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        match dir.close() {
            Ok(()) => {
                debug!("Removed backing store {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.dir.is_none()
    }
}

/// Content-keyed block storage in a directory
#[derive(Debug, Clone)]
pub struct BlockStore {
    root: PathBuf,
}

impl BlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate the store through `env_var`, if it is bound
    pub fn from_env(env_var: &str) -> Option<Self> {
        EnvBinding::new(env_var).current().map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `data`, returning its locator (`<hash>+<len>`)
    pub fn put(&self, data: &[u8]) -> Result<String> {
        let locator = locator_for(data);
        let path = self.block_path(&locator);
        if !path.exists() {
            fs::write(&path, data)?;
            debug!("Stored block {} in {:?}", locator, self.root);
        }
        Ok(locator)
    }

    pub fn get(&self, locator: &str) -> Result<Bytes> {
        match fs::read(self.block_path(locator)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(HarnessError::NotFound(format!("block {}", locator)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of blocks stored
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.root)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn block_path(&self, locator: &str) -> PathBuf {
        self.root.join(locator)
    }
}

fn locator_for(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}+{}", hasher.finish(), data.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_store_binds_and_removes() {
        let var = "HARNESS_TEST_STORE_LIFECYCLE";
        let mut store = BackingStore::create("harness-test-", var).unwrap();
        let path = store.path().to_path_buf();

        assert!(path.is_dir());
        assert_eq!(std::env::var_os(var).map(PathBuf::from), Some(path.clone()));

        store.remove().unwrap();
        assert!(!path.exists());
        assert!(std::env::var_os(var).is_none());
        assert!(store.is_removed());

        // Second removal is a no-op
        store.remove().unwrap();
    }

    #[test]
    fn test_remove_tolerates_deleted_tree() {
        let var = "HARNESS_TEST_STORE_DELETED";
        let mut store = BackingStore::create("harness-test-", var).unwrap();
        fs::remove_dir_all(store.path()).unwrap();
        assert!(store.remove().is_ok());
    }

    #[test]
    fn test_block_store_from_env() {
        let var = "HARNESS_TEST_BLOCKS_FROM_ENV";
        assert!(BlockStore::from_env(var).is_none());

        let mut store = BackingStore::create("harness-test-", var).unwrap();
        let blocks = BlockStore::from_env(var).unwrap();
        assert_eq!(blocks.root(), store.path());
        store.remove().unwrap();
    }

    #[test]
    fn test_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = BlockStore::new(dir.path());
        assert!(blocks.is_empty().unwrap());

        let locator = blocks.put(b"hello").unwrap();
        assert!(locator.ends_with("+5"));
        assert_eq!(blocks.get(&locator).unwrap().as_ref(), b"hello");

        // Same content, same block
        assert_eq!(blocks.put(b"hello").unwrap(), locator);
        assert_eq!(blocks.len().unwrap(), 1);
    }

    #[test]
    fn test_get_missing_block() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = BlockStore::new(dir.path());
        assert!(matches!(
            blocks.get("0000000000000000+0"),
            Err(HarnessError::NotFound(_))
        ));
    }

    #[test]
    fn test_len_of_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = BlockStore::new(dir.path().join("gone"));
        assert!(matches!(blocks.len(), Err(HarnessError::Io(_))));
        assert!(blocks.is_empty().is_err());
    }
}
