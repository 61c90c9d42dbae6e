//! Immutable pipeline states.
//!
//! A [`State`] is a cheap handle on "the pipeline up to here": an optional
//! output of a graph node plus the settings (working directory, environment,
//! platform, ...) that ops created from it inherit. Every combinator returns
//! a new value; nodes are shared by `Arc` and never mutated.

use std::sync::Arc;

use strata_op::{
  BuildOp, Constraints, Definition, ExecMeta, FileAction, Mount, NetMode, OutputIndex, Platform,
  ResourceLimits, SecurityMode, SourceOp,
};

use crate::options::OpOptions;

/// A node of the unmarshaled graph.
#[derive(Debug)]
pub(crate) struct Node {
  pub(crate) kind: NodeKind,
  /// Platform set explicitly on the pipeline when the node was created.
  pub(crate) platform: Option<Platform>,
  pub(crate) constraints: Constraints,
  pub(crate) options: OpOptions,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
  Source(SourceOp),
  Exec(ExecNode),
  File(FileNode),
  Build(BuildOp),
}

/// An exec before its inputs have digests.
#[derive(Debug, Clone)]
pub(crate) struct ExecNode {
  pub(crate) meta: ExecMeta,
  /// Mounts with `input` left unset; `sources` holds what each one mounts.
  pub(crate) mounts: Vec<Mount>,
  pub(crate) sources: Vec<State>,
  pub(crate) network: NetMode,
  pub(crate) security: SecurityMode,
  pub(crate) resources: Option<ResourceLimits>,
}

/// A file op before its inputs have digests.
#[derive(Debug, Clone)]
pub(crate) struct FileNode {
  /// Actions whose `FileInput::Input` indices point into `inputs`.
  pub(crate) actions: Vec<FileAction>,
  pub(crate) inputs: Vec<Output>,
}

/// One output of a node.
#[derive(Debug, Clone)]
pub(crate) struct Output {
  pub(crate) node: Arc<Node>,
  pub(crate) index: OutputIndex,
}

impl Output {
  pub(crate) fn same_as(&self, other: &Output) -> bool {
    Arc::ptr_eq(&self.node, &other.node) && self.index == other.index
  }
}

/// Settings inherited by ops created from a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateMeta {
  pub(crate) dir: String,
  pub(crate) env: Vec<(String, String)>,
  pub(crate) user: String,
  pub(crate) hostname: Option<String>,
  pub(crate) platform: Option<Platform>,
  pub(crate) network: NetMode,
  pub(crate) security: SecurityMode,
}

impl Default for StateMeta {
  fn default() -> Self {
    Self {
      dir: "/".to_string(),
      env: Vec::new(),
      user: String::new(),
      hostname: None,
      platform: None,
      network: NetMode::default(),
      security: SecurityMode::default(),
    }
  }
}

/// The pipeline up to some point.
#[derive(Debug, Clone, Default)]
pub struct State {
  pub(crate) output: Option<Output>,
  pub(crate) meta: StateMeta,
}

impl State {
  pub(crate) fn from_node(node: Node, index: OutputIndex, meta: StateMeta) -> Self {
    Self {
      output: Some(Output {
        node: Arc::new(node),
        index,
      }),
      meta,
    }
  }

  /// Whether this is an empty filesystem with no producing op.
  pub fn is_scratch(&self) -> bool {
    self.output.is_none()
  }

  /// Change the working directory. Relative paths resolve against the
  /// current one.
  pub fn dir(&self, path: &str) -> Self {
    let mut next = self.clone();
    next.meta.dir = resolve(&self.meta.dir, path);
    next
  }

  /// Set an environment variable, replacing an earlier value in place.
  pub fn add_env(&self, key: &str, value: &str) -> Self {
    let mut next = self.clone();
    match next.meta.env.iter_mut().find(|(k, _)| k == key) {
      Some((_, v)) => *v = value.to_string(),
      None => next.meta.env.push((key.to_string(), value.to_string())),
    }
    next
  }

  pub fn user(&self, user: &str) -> Self {
    let mut next = self.clone();
    next.meta.user = user.to_string();
    next
  }

  pub fn hostname(&self, hostname: &str) -> Self {
    let mut next = self.clone();
    next.meta.hostname = Some(hostname.to_string());
    next
  }

  /// Target platform for ops created from here on.
  pub fn platform(&self, platform: Platform) -> Self {
    let mut next = self.clone();
    next.meta.platform = Some(platform);
    next
  }

  pub fn network(&self, network: NetMode) -> Self {
    let mut next = self.clone();
    next.meta.network = network;
    next
  }

  pub fn security(&self, security: SecurityMode) -> Self {
    let mut next = self.clone();
    next.meta.security = security;
    next
  }

  pub fn get_dir(&self) -> &str {
    &self.meta.dir
  }

  pub fn get_env(&self, key: &str) -> Option<&str> {
    self
      .meta
      .env
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn get_platform(&self) -> Option<&Platform> {
    self.meta.platform.as_ref()
  }

  /// Environment as `KEY=VALUE` entries.
  pub(crate) fn env_list(&self) -> Vec<String> {
    self
      .meta
      .env
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect()
  }
}

/// An empty filesystem.
pub fn scratch() -> State {
  State::default()
}

/// Solve `definition` as a nested build.
pub fn build(definition: Definition, options: OpOptions) -> State {
  let node = Node {
    kind: NodeKind::Build(BuildOp {
      definition: Box::new(definition),
      attrs: Default::default(),
    }),
    platform: None,
    constraints: Constraints::default(),
    options,
  };
  State::from_node(node, 0, StateMeta::default())
}

/// Resolve `path` against `base` and normalize it.
///
/// `..` never climbs above the root.
pub(crate) fn resolve(base: &str, path: &str) -> String {
  let joined = if path.starts_with('/') {
    path.to_string()
  } else {
    format!("{}/{}", base, path)
  };

  let mut segments: Vec<&str> = Vec::new();
  for segment in joined.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        segments.pop();
      }
      other => segments.push(other),
    }
  }

  format!("/{}", segments.join("/"))
}
