//! Per-op and marshal-time options.

use std::collections::BTreeMap;

use strata_op::{CUSTOM_NAME_KEY, CapSet, OpMetadata, Platform, SourceLocation, caps};

/// Metadata attached to a single op. None of it affects the digest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpOptions {
  pub custom_name: Option<String>,
  pub ignore_cache: bool,
  pub export_cache: Option<bool>,
  pub description: BTreeMap<String, String>,
  pub location: Option<SourceLocation>,
}

impl OpOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn custom_name(mut self, name: impl Into<String>) -> Self {
    self.custom_name = Some(name.into());
    self
  }

  /// Always execute the op, even when a cached result exists.
  pub fn ignore_cache(mut self) -> Self {
    self.ignore_cache = true;
    self
  }

  pub fn export_cache(mut self, export: bool) -> Self {
    self.export_cache = Some(export);
    self
  }

  pub fn description(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.description.insert(key.into(), value.into());
    self
  }

  /// Record the caller's source location.
  #[track_caller]
  pub fn located_here(mut self) -> Self {
    let caller = std::panic::Location::caller();
    self.location = Some(SourceLocation {
      file: caller.file().to_string(),
      line: caller.line(),
      column: caller.column(),
    });
    self
  }

  /// Metadata entry for these options.
  pub(crate) fn to_metadata(&self) -> OpMetadata {
    let mut meta = OpMetadata {
      ignore_cache: self.ignore_cache,
      description: self.description.clone(),
      export_cache: self.export_cache,
      ..Default::default()
    };
    if let Some(name) = &self.custom_name {
      meta
        .description
        .insert(CUSTOM_NAME_KEY.to_string(), name.clone());
    }
    if let Some(location) = &self.location {
      meta.source_locations.push(location.clone());
    }
    if meta.ignore_cache {
      meta.require_cap(caps::META_IGNORE_CACHE);
    }
    if !meta.description.is_empty() {
      meta.require_cap(caps::META_DESCRIPTION);
    }
    if meta.export_cache.is_some() {
      meta.require_cap(caps::META_EXPORT_CACHE);
    }
    meta
  }
}

/// Settings applied while flattening a pipeline.
#[derive(Debug, Clone, Default)]
pub struct MarshalOptions {
  /// Platform for ops with no explicit platform. Falls back to the host.
  pub platform: Option<Platform>,
  /// Capabilities of the target solver. `None` means unknown, so only
  /// behavior every solver understands is used.
  pub caps: Option<CapSet>,
}

impl MarshalOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn platform(mut self, platform: Platform) -> Self {
    self.platform = Some(platform);
    self
  }

  pub fn caps(mut self, caps: CapSet) -> Self {
    self.caps = Some(caps);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_options_to_metadata() {
    let meta = OpOptions::new()
      .custom_name("compile")
      .ignore_cache()
      .located_here()
      .to_metadata();

    assert_eq!(meta.custom_name(), Some("compile"));
    assert!(meta.ignore_cache);
    assert_eq!(meta.source_locations.len(), 1);
    assert!(meta.source_locations[0].file.ends_with("options.rs"));
    let required: Vec<_> = meta.required_caps().collect();
    assert!(required.contains(&caps::META_IGNORE_CACHE));
    assert!(required.contains(&caps::META_DESCRIPTION));
  }

  #[test]
  fn test_default_options_are_empty() {
    assert!(OpOptions::new().to_metadata().is_empty());
  }
}
