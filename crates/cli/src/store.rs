//! JSON file persistence for the server health blob.

use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf};

use futures::future::BoxFuture;
use tern_traits::{KeyValueStore, StoreError};
use tokio::sync::Mutex;

/// A [`KeyValueStore`] holding every key in one JSON object on disk.
///
/// Writes go to a sibling temporary file first and are renamed into place.
#[derive(Debug)]
pub(crate) struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Store backed by `path`. The file is created on the first write.
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| StoreError::new(format!("corrupt store {}: {e}", self.path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::new(format!("read {}: {e}", self.path.display()))),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        Box::pin(async move { Ok(self.read_all().await?.remove(key)) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut entries = self.read_all().await?;
            entries.insert(key.to_string(), value);
            let content = serde_json::to_string_pretty(&entries)
                .map_err(|e| StoreError::new(format!("encode store: {e}")))?;

            let tmp = self.path.with_extension("tmp");
            tokio::fs::write(&tmp, content)
                .await
                .map_err(|e| StoreError::new(format!("write {}: {e}", tmp.display())))?;
            tokio::fs::rename(&tmp, &self.path)
                .await
                .map_err(|e| StoreError::new(format!("replace {}: {e}", self.path.display())))?;
            trace!(path = %self.path.display(), key, "store written");
            Ok(())
        })
    }
}
