//! Capability negotiation.
//!
//! Producers query a [`CapSet`] before relying on behavior an older solver
//! might not have. Ops record the capabilities they relied on in their
//! metadata so a solver can reject a graph before executing any of it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const EXEC_META_SETS_DEFAULT_PATH: &str = "exec.meta.setsdefaultpath";
pub const EXEC_META_NETWORK: &str = "exec.meta.network";
pub const EXEC_META_SECURITY: &str = "exec.meta.security";
pub const EXEC_META_HOSTNAME: &str = "exec.meta.hostname";
pub const EXEC_MOUNT_BIND: &str = "exec.mount.bind";
pub const EXEC_MOUNT_SELECTOR: &str = "exec.mount.selector";
pub const EXEC_MOUNT_CACHE: &str = "exec.mount.cache";
pub const EXEC_MOUNT_TMPFS: &str = "exec.mount.tmpfs";
pub const EXEC_MOUNT_SECRET: &str = "exec.mount.secret";
pub const EXEC_MOUNT_SSH: &str = "exec.mount.ssh";
pub const EXEC_RESOURCES: &str = "exec.resources";
pub const FILE_BASE: &str = "file.base";
pub const FILE_MERGE: &str = "file.merge";
pub const FILE_DIFF: &str = "file.diff";
pub const BUILD_OP: &str = "build.op";
pub const SOURCE_IMAGE: &str = "source.image";
pub const SOURCE_GIT: &str = "source.git";
pub const SOURCE_GIT_KEEP_DIR: &str = "source.git.keepgitdir";
pub const SOURCE_LOCAL: &str = "source.local";
pub const SOURCE_LOCAL_PATTERNS: &str = "source.local.patterns";
pub const SOURCE_HTTP: &str = "source.http";
pub const SOURCE_HTTP_CHECKSUM: &str = "source.http.checksum";
pub const SOURCE_OCI_LAYOUT: &str = "source.ocilayout";
pub const META_IGNORE_CACHE: &str = "meta.ignorecache";
pub const META_DESCRIPTION: &str = "meta.description";
pub const META_EXPORT_CACHE: &str = "meta.exportcache";
pub const CONSTRAINTS: &str = "constraints";
pub const PLATFORM: &str = "platform";

/// Every capability this version knows about.
pub const KNOWN_CAPS: &[&str] = &[
  EXEC_META_SETS_DEFAULT_PATH,
  EXEC_META_NETWORK,
  EXEC_META_SECURITY,
  EXEC_META_HOSTNAME,
  EXEC_MOUNT_BIND,
  EXEC_MOUNT_SELECTOR,
  EXEC_MOUNT_CACHE,
  EXEC_MOUNT_TMPFS,
  EXEC_MOUNT_SECRET,
  EXEC_MOUNT_SSH,
  EXEC_RESOURCES,
  FILE_BASE,
  FILE_MERGE,
  FILE_DIFF,
  BUILD_OP,
  SOURCE_IMAGE,
  SOURCE_GIT,
  SOURCE_GIT_KEEP_DIR,
  SOURCE_LOCAL,
  SOURCE_LOCAL_PATTERNS,
  SOURCE_HTTP,
  SOURCE_HTTP_CHECKSUM,
  SOURCE_OCI_LAYOUT,
  META_IGNORE_CACHE,
  META_DESCRIPTION,
  META_EXPORT_CACHE,
  CONSTRAINTS,
  PLATFORM,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapError {
  #[error("capability {id} is not supported")]
  Unknown { id: String },

  #[error("capability {id} is disabled: {reason}")]
  Disabled { id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cap {
  pub id: String,
  pub enabled: bool,
  #[serde(default)]
  pub deprecated: bool,
  #[serde(default)]
  pub disabled_reason: Option<String>,
}

/// A negotiated set of capabilities.
///
/// Unknown identifiers deserialize fine and are simply reported unsupported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapSet {
  #[serde(default)]
  caps: BTreeMap<String, Cap>,
}

impl CapSet {
  /// An empty set; nothing is supported.
  pub fn new() -> Self {
    Self::default()
  }

  /// Every known capability, enabled.
  pub fn all() -> Self {
    KNOWN_CAPS
      .iter()
      .fold(Self::new(), |set, id| set.with_enabled(*id))
  }

  pub fn with_enabled(mut self, id: impl Into<String>) -> Self {
    let id = id.into();
    self.caps.insert(
      id.clone(),
      Cap {
        id,
        enabled: true,
        deprecated: false,
        disabled_reason: None,
      },
    );
    self
  }

  pub fn with_disabled(mut self, id: impl Into<String>, reason: impl Into<String>) -> Self {
    let id = id.into();
    self.caps.insert(
      id.clone(),
      Cap {
        id,
        enabled: false,
        deprecated: false,
        disabled_reason: Some(reason.into()),
      },
    );
    self
  }

  pub fn supports(&self, id: &str) -> Result<(), CapError> {
    match self.caps.get(id) {
      None => Err(CapError::Unknown { id: id.to_string() }),
      Some(cap) if !cap.enabled => Err(CapError::Disabled {
        id: id.to_string(),
        reason: cap
          .disabled_reason
          .clone()
          .unwrap_or_else(|| "disabled".to_string()),
      }),
      Some(_) => Ok(()),
    }
  }

  pub fn is_supported(&self, id: &str) -> bool {
    self.supports(id).is_ok()
  }

  /// Fail on the first required capability this set doesn't support.
  pub fn check_all<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> Result<(), CapError> {
    required.into_iter().try_for_each(|id| self.supports(id))
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.caps.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.caps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.caps.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_supports_known_enabled() {
    let caps = CapSet::new().with_enabled(EXEC_META_SETS_DEFAULT_PATH);
    assert!(caps.supports(EXEC_META_SETS_DEFAULT_PATH).is_ok());
  }

  #[test]
  fn test_unknown_cap_is_an_error() {
    let caps = CapSet::all();
    assert_eq!(
      caps.supports("exec.teleport"),
      Err(CapError::Unknown {
        id: "exec.teleport".to_string()
      })
    );
  }

  #[test]
  fn test_disabled_cap_is_an_error() {
    let caps = CapSet::all().with_disabled(FILE_DIFF, "snapshotter lacks diff");
    match caps.supports(FILE_DIFF) {
      Err(CapError::Disabled { id, reason }) => {
        assert_eq!(id, FILE_DIFF);
        assert_eq!(reason, "snapshotter lacks diff");
      }
      other => panic!("expected disabled, got {:?}", other),
    }
  }

  #[test]
  fn test_check_all_reports_first_missing() {
    let caps = CapSet::new().with_enabled(FILE_BASE);
    let err = caps.check_all([FILE_BASE, FILE_MERGE, FILE_DIFF]).unwrap_err();
    assert_eq!(
      err,
      CapError::Unknown {
        id: FILE_MERGE.to_string()
      }
    );
  }

  #[test]
  fn test_unknown_ids_deserialize() {
    let json = r#"{"caps":{"future.cap":{"id":"future.cap","enabled":true}}}"#;
    let caps: CapSet = serde_json::from_str(json).unwrap();
    assert!(caps.is_supported("future.cap"));
    assert!(!caps.is_supported(EXEC_META_SETS_DEFAULT_PATH));
  }

  #[test]
  fn test_all_covers_known() {
    let caps = CapSet::all();
    assert_eq!(caps.len(), KNOWN_CAPS.len());
    assert!(caps.check_all(KNOWN_CAPS.iter().copied()).is_ok());
  }
}
