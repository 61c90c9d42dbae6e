//! Turning a definition into vertices.

use std::collections::HashMap;
use std::sync::Arc;

use strata_op::{CapSet, Definition, Digest, OpKind, Platform, topological_order};
use tracing::{debug, instrument};

use crate::error::LoadError;
use crate::vertex::{Edge, Vertex};

/// Adjustments applied while loading.
#[derive(Debug, Clone, Default)]
pub struct LoadOverrides {
  /// Capabilities the solver supports. `None` supports every known one.
  pub caps: Option<CapSet>,
  /// Ignore cached results for every vertex.
  pub ignore_cache: bool,
  /// Platform for ops that don't name one.
  pub default_platform: Option<Platform>,
}

impl LoadOverrides {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn caps(mut self, caps: CapSet) -> Self {
    self.caps = Some(caps);
    self
  }

  pub fn ignore_cache(mut self, ignore: bool) -> Self {
    self.ignore_cache = ignore;
    self
  }

  pub fn default_platform(mut self, platform: Platform) -> Self {
    self.default_platform = Some(platform);
    self
  }
}

/// Validate `definition` and build one vertex per op, returning an edge per
/// head.
///
/// Fails if the definition is malformed or relies on a capability the
/// overrides don't support.
#[instrument(name = "load", skip_all, fields(ops = definition.len()))]
pub fn load(definition: &Definition, overrides: &LoadOverrides) -> Result<Vec<Edge>, LoadError> {
  definition.validate()?;
  check_caps(definition, overrides)?;

  let order = topological_order(&definition.ops)?;

  let mut vertices: HashMap<Digest, Arc<Vertex>> = HashMap::with_capacity(order.len());
  for digest in order {
    let Some(op) = definition.get(&digest) else {
      continue;
    };
    let metadata = definition.metadata(&digest).cloned().unwrap_or_default();
    let mut inputs = Vec::with_capacity(op.inputs.len());
    for input in &op.inputs {
      let vertex = vertices
        .get(&input.digest)
        .cloned()
        .ok_or_else(|| LoadError::Dangling {
          digest: input.digest.clone(),
        })?;
      inputs.push(Edge::new(vertex, input.index));
    }

    let vertex = Vertex {
      platform: op
        .platform
        .clone()
        .or_else(|| overrides.default_platform.clone()),
      ignore_cache: metadata.ignore_cache || overrides.ignore_cache,
      digest: digest.clone(),
      op: op.clone(),
      metadata,
      inputs,
    };
    vertices.insert(digest, Arc::new(vertex));
  }

  let heads = definition
    .heads
    .iter()
    .map(|head| {
      let vertex = vertices
        .get(&head.digest)
        .cloned()
        .ok_or_else(|| LoadError::Dangling {
          digest: head.digest.clone(),
        })?;
      Ok(Edge::new(vertex, head.index))
    })
    .collect::<Result<Vec<_>, LoadError>>()?;

  debug!(vertices = vertices.len(), heads = heads.len(), "definition_loaded");
  Ok(heads)
}

/// Every op's recorded capabilities must be supported, nested builds
/// included.
fn check_caps(definition: &Definition, overrides: &LoadOverrides) -> Result<(), LoadError> {
  let all;
  let caps = match &overrides.caps {
    Some(caps) => caps,
    None => {
      all = CapSet::all();
      &all
    }
  };
  check_caps_with(definition, caps)
}

fn check_caps_with(definition: &Definition, caps: &CapSet) -> Result<(), LoadError> {
  for (digest, metadata) in &definition.metadata {
    caps
      .check_all(metadata.required_caps())
      .map_err(|source| LoadError::Unsupported {
        digest: digest.clone(),
        source,
      })?;
  }
  for op in definition.ops.values() {
    if let OpKind::Build(build) = &op.op {
      check_caps_with(&build.definition, caps)?;
    }
  }
  Ok(())
}
