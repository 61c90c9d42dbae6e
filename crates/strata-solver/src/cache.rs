//! Result caches.
//!
//! A cache maps a vertex's key to the handles it produced. The solver treats
//! every cache failure as a miss on read and as a warning on write, so a
//! broken cache slows a solve down but never fails it.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_op::Digest;
use tokio::fs;

use crate::worker::ResultHandle;

/// Identifies a vertex's results in a cache.
///
/// Without a salt the key is the vertex digest. With one it is the digest
/// of both, so differently salted solvers never share entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn new(digest: &Digest, salt: Option<&str>) -> Self {
    match salt {
      None | Some("") => Self(digest.to_string()),
      Some(salt) => {
        let salted = Digest::from_bytes(format!("{}\n{}", digest, salt).as_bytes());
        Self(salted.to_string())
      }
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The key with characters unsafe in file names replaced.
  fn file_name(&self) -> String {
    format!("{}.json", self.0.replace([':', '/'], "-"))
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("cache io error: {0}")]
  Io(#[from] std::io::Error),

  /// An entry exists but can't be decoded.
  #[error("corrupt cache entry {key}: {message}")]
  Corrupt { key: CacheKey, message: String },

  #[error("cache unavailable: {message}")]
  Unavailable { message: String },
}

#[async_trait]
pub trait ResultCache: Send + Sync {
  /// Look up a key. `Ok(None)` is a miss.
  async fn get(&self, key: &CacheKey) -> Result<Option<Vec<ResultHandle>>, CacheError>;

  /// Record the outputs of a key, replacing any previous entry.
  async fn put(&self, key: &CacheKey, outputs: &[ResultHandle]) -> Result<(), CacheError>;
}

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
  entries: RwLock<HashMap<CacheKey, Vec<ResultHandle>>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.read().map(|entries| entries.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn poisoned(e: impl fmt::Display) -> CacheError {
  CacheError::Unavailable {
    message: format!("memory cache lock poisoned: {}", e),
  }
}

#[async_trait]
impl ResultCache for MemoryCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<Vec<ResultHandle>>, CacheError> {
    let entries = self.entries.read().map_err(poisoned)?;
    Ok(entries.get(key).cloned())
  }

  async fn put(&self, key: &CacheKey, outputs: &[ResultHandle]) -> Result<(), CacheError> {
    let mut entries = self.entries.write().map_err(poisoned)?;
    entries.insert(key.clone(), outputs.to_vec());
    Ok(())
  }
}

/// Filesystem cache.
///
/// Each entry is a JSON file at `{base_path}/{key}.json`. The directory is
/// created on first write.
#[derive(Debug, Clone)]
pub struct FsCache {
  base_path: PathBuf,
}

impl FsCache {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  fn key_to_path(&self, key: &CacheKey) -> PathBuf {
    self.base_path.join(key.file_name())
  }
}

#[async_trait]
impl ResultCache for FsCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<Vec<ResultHandle>>, CacheError> {
    let bytes = match fs::read(self.key_to_path(key)).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(CacheError::Io(e)),
    };
    let outputs = serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt {
      key: key.clone(),
      message: e.to_string(),
    })?;
    Ok(Some(outputs))
  }

  async fn put(&self, key: &CacheKey, outputs: &[ResultHandle]) -> Result<(), CacheError> {
    let path = self.key_to_path(key);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec(outputs).map_err(|e| CacheError::Corrupt {
      key: key.clone(),
      message: e.to_string(),
    })?;
    fs::write(path, bytes).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn digest() -> Digest {
    Digest::from_bytes(b"vertex")
  }

  #[test]
  fn test_key_without_salt_is_digest() {
    let d = digest();
    assert_eq!(CacheKey::new(&d, None).as_str(), d.as_str());
    assert_eq!(CacheKey::new(&d, Some("")).as_str(), d.as_str());
  }

  #[test]
  fn test_salt_changes_key() {
    let d = digest();
    let a = CacheKey::new(&d, Some("a"));
    let b = CacheKey::new(&d, Some("b"));
    assert_ne!(a.as_str(), d.as_str());
    assert_ne!(a, b);
    assert_eq!(a, CacheKey::new(&d, Some("a")));
  }

  #[tokio::test]
  async fn test_memory_cache_round_trip() {
    let cache = MemoryCache::new();
    let key = CacheKey::new(&digest(), None);
    assert!(cache.get(&key).await.unwrap().is_none());

    cache.put(&key, &[ResultHandle::new("r0")]).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(vec![ResultHandle::new("r0")]));
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn test_fs_cache_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let key = CacheKey::new(&digest(), Some("salt"));

    let cache = FsCache::new(dir.path().join("cache"));
    assert!(cache.get(&key).await.unwrap().is_none());
    cache
      .put(&key, &[ResultHandle::new("a"), ResultHandle::new("b")])
      .await
      .unwrap();

    let reopened = FsCache::new(dir.path().join("cache"));
    assert_eq!(
      reopened.get(&key).await.unwrap(),
      Some(vec![ResultHandle::new("a"), ResultHandle::new("b")])
    );
  }

  #[tokio::test]
  async fn test_fs_cache_corrupt_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = FsCache::new(dir.path());
    let key = CacheKey::new(&digest(), None);
    std::fs::write(dir.path().join(key.file_name()), b"not json").unwrap();

    let err = cache.get(&key).await.unwrap_err();
    assert!(matches!(err, CacheError::Corrupt { .. }));
  }
}
