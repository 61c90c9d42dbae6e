//! The serialized build graph.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::digest::{Digest, digest};
use crate::error::OpError;
use crate::op::{Input, Op, OpKind};

/// Description key carrying a human readable name for an op.
pub const CUSTOM_NAME_KEY: &str = "strata.customname";

/// Where in client code an op was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
  pub file: String,
  pub line: u32,
  #[serde(default)]
  pub column: u32,
}

/// Per-op data that does not contribute to the digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMetadata {
  #[serde(default)]
  pub ignore_cache: bool,
  #[serde(default)]
  pub description: BTreeMap<String, String>,
  #[serde(default)]
  pub export_cache: Option<bool>,
  /// Capabilities the op relies on.
  #[serde(default)]
  pub caps: BTreeMap<String, bool>,
  #[serde(default)]
  pub source_locations: Vec<SourceLocation>,
}

impl OpMetadata {
  pub fn custom_name(&self) -> Option<&str> {
    self.description.get(CUSTOM_NAME_KEY).map(String::as_str)
  }

  pub fn require_cap(&mut self, id: &str) {
    self.caps.insert(id.to_string(), true);
  }

  pub fn required_caps(&self) -> impl Iterator<Item = &str> {
    self
      .caps
      .iter()
      .filter(|(_, required)| **required)
      .map(|(id, _)| id.as_str())
  }

  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  /// Fold in metadata of an op that deduplicated onto this one.
  pub fn merge(&mut self, other: &OpMetadata) {
    self.ignore_cache |= other.ignore_cache;
    for (key, value) in &other.description {
      self
        .description
        .entry(key.clone())
        .or_insert_with(|| value.clone());
    }
    if self.export_cache.is_none() {
      self.export_cache = other.export_cache;
    }
    for (id, required) in &other.caps {
      *self.caps.entry(id.clone()).or_insert(false) |= *required;
    }
    for location in &other.source_locations {
      if !self.source_locations.contains(location) {
        self.source_locations.push(location.clone());
      }
    }
  }
}

/// A flattened, digest-addressed graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
  #[serde(default)]
  pub ops: BTreeMap<Digest, Op>,
  #[serde(default)]
  pub metadata: BTreeMap<Digest, OpMetadata>,
  #[serde(default)]
  pub heads: Vec<Input>,
}

impl Definition {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add an op, returning its digest. Identical ops collapse to one entry.
  pub fn insert(&mut self, op: Op) -> Result<Digest, OpError> {
    let digest = digest(&op)?;
    self.ops.entry(digest.clone()).or_insert(op);
    Ok(digest)
  }

  pub fn get(&self, digest: &Digest) -> Option<&Op> {
    self.ops.get(digest)
  }

  pub fn metadata(&self, digest: &Digest) -> Option<&OpMetadata> {
    self.metadata.get(digest)
  }

  pub fn metadata_mut(&mut self, digest: &Digest) -> &mut OpMetadata {
    self.metadata.entry(digest.clone()).or_default()
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  /// Capabilities any op in the graph relies on, nested builds included.
  pub fn required_caps(&self) -> BTreeSet<String> {
    let mut caps: BTreeSet<String> = self
      .metadata
      .values()
      .flat_map(|meta| meta.required_caps().map(str::to_string))
      .collect();
    for op in self.ops.values() {
      if let OpKind::Build(build) = &op.op {
        caps.extend(build.definition.required_caps());
      }
    }
    caps
  }

  /// Check that every op hashes to its key, every input and head resolves,
  /// and internal indices are in range.
  pub fn validate(&self) -> Result<(), OpError> {
    if self.heads.is_empty() {
      return Err(OpError::NoHeads);
    }

    for (expected, op) in &self.ops {
      let actual = digest(op)?;
      if &actual != expected {
        return Err(OpError::DigestMismatch {
          expected: expected.clone(),
          actual,
        });
      }

      for input in &op.inputs {
        let target = self.ops.get(&input.digest).ok_or_else(|| OpError::MissingInput {
          digest: expected.clone(),
          input: input.digest.clone(),
        })?;
        if input.index >= target.num_outputs() {
          return Err(OpError::Malformed {
            digest: expected.clone(),
            message: format!(
              "input {} has output index {} but it only has {} outputs",
              input.digest,
              input.index,
              target.num_outputs()
            ),
          });
        }
      }

      op.check_indices().map_err(|message| OpError::Malformed {
        digest: expected.clone(),
        message,
      })?;

      if let OpKind::Build(build) = &op.op {
        build.definition.validate()?;
      }
    }

    for head in &self.heads {
      if !self.ops.contains_key(&head.digest) {
        return Err(OpError::OpNotFound {
          digest: head.digest.clone(),
        });
      }
    }

    Ok(())
  }

  pub fn to_json(&self) -> Result<Vec<u8>, OpError> {
    Ok(serde_json::to_vec(self)?)
  }

  pub fn to_json_pretty(&self) -> Result<String, OpError> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  pub fn from_json(bytes: &[u8]) -> Result<Self, OpError> {
    Ok(serde_json::from_slice(bytes)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::op::{ExecMeta, ExecOp, Mount, MountType, SourceOp};

  fn chain() -> (Definition, Digest, Digest) {
    let mut def = Definition::new();
    let base = def
      .insert(Op::new(OpKind::Source(SourceOp::new(
        "docker-image://docker.io/library/alpine:latest",
      ))))
      .unwrap();
    let mut exec = ExecOp::new(ExecMeta::new(["make"]));
    exec.mounts.push(Mount {
      input: Some(0),
      selector: None,
      dest: "/".to_string(),
      output: Some(0),
      readonly: false,
      mount_type: MountType::Bind,
    });
    let run = def
      .insert(Op::new(OpKind::Exec(exec)).with_inputs(vec![Input::new(base.clone(), 0)]))
      .unwrap();
    def.heads.push(Input::new(run.clone(), 0));
    (def, base, run)
  }

  #[test]
  fn test_insert_deduplicates() {
    let mut def = Definition::new();
    let a = def
      .insert(Op::new(OpKind::Source(SourceOp::new("local://ctx"))))
      .unwrap();
    let b = def
      .insert(Op::new(OpKind::Source(SourceOp::new("local://ctx"))))
      .unwrap();
    assert_eq!(a, b);
    assert_eq!(def.len(), 1);
  }

  #[test]
  fn test_validate_accepts_well_formed() {
    let (def, _, _) = chain();
    def.validate().unwrap();
  }

  #[test]
  fn test_validate_rejects_tampered_op() {
    let (mut def, base, _) = chain();
    if let Some(Op {
      op: OpKind::Source(source),
      ..
    }) = def.ops.get_mut(&base)
    {
      source.identifier = "docker-image://docker.io/library/busybox:latest".to_string();
    }
    assert!(matches!(
      def.validate(),
      Err(OpError::DigestMismatch { .. })
    ));
  }

  #[test]
  fn test_validate_rejects_dangling_input_and_head() {
    let (mut def, base, _) = chain();
    def.ops.remove(&base);
    assert!(matches!(def.validate(), Err(OpError::MissingInput { .. })));

    let (mut def, _, _) = chain();
    def.heads.push(Input::new(Digest::from_bytes(b"nowhere"), 0));
    assert!(matches!(def.validate(), Err(OpError::OpNotFound { .. })));

    let (mut def, _, _) = chain();
    def.heads.clear();
    assert!(matches!(def.validate(), Err(OpError::NoHeads)));
  }

  #[test]
  fn test_validate_rejects_output_index_out_of_range() {
    let (mut def, _, run) = chain();
    let consumer = Op::new(OpKind::Exec(ExecOp::new(ExecMeta::new(["ls"]))))
      .with_inputs(vec![Input::new(run, 4)]);
    let d = def.insert(consumer).unwrap();
    def.heads = vec![Input::new(d, 0)];
    assert!(matches!(def.validate(), Err(OpError::Malformed { .. })));
  }

  #[test]
  fn test_json_round_trip_preserves_graph() {
    let (mut def, base, _) = chain();
    def.metadata_mut(&base).require_cap("source.image");
    let bytes = def.to_json().unwrap();
    let back = Definition::from_json(&bytes).unwrap();
    assert_eq!(back, def);
    back.validate().unwrap();
    assert!(back.required_caps().contains("source.image"));
  }

  #[test]
  fn test_metadata_merge() {
    let mut a = OpMetadata::default();
    a.description
      .insert(CUSTOM_NAME_KEY.to_string(), "first".to_string());
    let mut b = OpMetadata {
      ignore_cache: true,
      ..Default::default()
    };
    b.description
      .insert(CUSTOM_NAME_KEY.to_string(), "second".to_string());
    b.require_cap("exec.meta.network");

    a.merge(&b);
    assert!(a.ignore_cache);
    assert_eq!(a.custom_name(), Some("first"));
    assert_eq!(a.required_caps().collect::<Vec<_>>(), vec!["exec.meta.network"]);
  }
}
