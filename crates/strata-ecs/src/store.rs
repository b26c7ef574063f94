//! Physical document storage.
//!
//! A [`DocumentStore`] holds one opaque byte document per entity id. The
//! template layer decides what those bytes mean; stores only move them.
//!
//! - [`DirectoryStore`]: one `<id>.json` file per entity under a root
//!   directory, via `tokio::fs`.
//! - [`MemoryStore`]: a map in memory, for tests and registries that never
//!   touch disk.

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::EcsError;

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// Async storage for entity documents, keyed by entity id.
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Ids of every stored document, in no particular order.
    async fn list_ids(&self) -> Result<Vec<String>, EcsError>;

    /// The document for `id`, or `None` if there is none.
    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>, EcsError>;

    /// Store (or replace) the document for `id`.
    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<(), EcsError>;

    /// Remove the document for `id`. Returns `false` if there was none.
    async fn delete(&self, id: &str) -> Result<bool, EcsError>;

    /// Whether a document exists for `id`.
    async fn exists(&self, id: &str) -> Result<bool, EcsError> {
        Ok(self.read(id).await?.is_some())
    }
}

// ---------------------------------------------------------------------------
// DirectoryStore
// ---------------------------------------------------------------------------

const EXTENSION: &str = "json";

/// One JSON file per entity inside a root directory.
///
/// The directory is created on first write. Writes go to a temporary file
/// that is then renamed over the target, so a crash never leaves a
/// half-written document behind.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// A store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, EcsError> {
        validate_id(id)?;
        Ok(self.root.join(format!("{id}.{EXTENSION}")))
    }

    fn io_error(id: &str, source: std::io::Error) -> EcsError {
        EcsError::Io {
            id: id.to_owned(),
            source,
        }
    }
}

/// Ids become file names, so they must not be able to escape the root.
fn validate_id(id: &str) -> Result<(), EcsError> {
    let reason = if id.is_empty() {
        Some("id is empty")
    } else if id.starts_with('.') {
        Some("id starts with '.'")
    } else if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("id may only contain ASCII letters, digits, '-', '_' and '.'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(EcsError::InvalidId {
            id: id.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

#[async_trait]
impl DocumentStore for DirectoryStore {
    async fn list_ids(&self) -> Result<Vec<String>, EcsError> {
        let root = self.root.display().to_string();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&root, e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_id(stem).is_ok() {
                    ids.push(stem.to_owned());
                }
            }
        }
        Ok(ids)
    }

    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>, EcsError> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(id, e)),
        }
    }

    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<(), EcsError> {
        let path = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::io_error(id, e))?;
        let tmp = self.root.join(format!(".{id}.{EXTENSION}.tmp"));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Self::io_error(id, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(id, e))
    }

    async fn delete(&self, id: &str) -> Result<bool, EcsError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(id, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Documents kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<String, Vec<u8>>>,
    writes: Mutex<u64>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read, for inspection in tests.
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.documents.lock().get(id).cloned()
    }

    /// Synchronous write, for seeding a store before it is loaded.
    pub fn insert(&self, id: impl Into<String>, bytes: Vec<u8>) {
        self.documents.lock().insert(id.into(), bytes);
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    /// Total number of writes performed through [`DocumentStore::write`].
    pub fn write_count(&self) -> u64 {
        *self.writes.lock()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_ids(&self) -> Result<Vec<String>, EcsError> {
        Ok(self.documents.lock().keys().cloned().collect())
    }

    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>, EcsError> {
        Ok(self.get(id))
    }

    async fn write(&self, id: &str, bytes: Vec<u8>) -> Result<(), EcsError> {
        self.documents.lock().insert(id.to_owned(), bytes);
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, EcsError> {
        Ok(self.documents.lock().remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert!(validate_id("a1b2-c3_d4.e").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id(".hidden").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a\\b").is_err());
    }

    #[tokio::test]
    async fn directory_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("scene"));

        // Missing root directory lists as empty.
        assert!(store.list_ids().await.unwrap().is_empty());

        store.write("box", b"{}".to_vec()).await.unwrap();
        store.write("lamp", b"[]".to_vec()).await.unwrap();

        let mut ids = store.list_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["box".to_owned(), "lamp".to_owned()]);
        assert_eq!(store.read("box").await.unwrap(), Some(b"{}".to_vec()));
        assert!(store.exists("lamp").await.unwrap());

        assert!(store.delete("box").await.unwrap());
        assert!(!store.delete("box").await.unwrap());
        assert_eq!(store.read("box").await.unwrap(), None);
    }

    #[tokio::test]
    async fn directory_store_rejects_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let err = store.write("../x", Vec::new()).await.unwrap_err();
        assert!(matches!(err, EcsError::InvalidId { .. }));
    }

    #[tokio::test]
    async fn memory_store_counts_writes() {
        let store = MemoryStore::new();
        store.write("a", vec![1]).await.unwrap();
        store.write("a", vec![2]).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a"), Some(vec![2]));
        assert_eq!(store.write_count(), 2);
    }
}
