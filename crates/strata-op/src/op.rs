//! The op model.
//!
//! An [`Op`] is one node of a build graph. Its edges are [`Input`]s naming a
//! dependency by digest and output index, never by pointer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definition::Definition;
use crate::digest::Digest;
use crate::platform::Platform;

/// Position in an op's `inputs` list.
pub type InputIndex = u32;

/// Which output of a multi-output op an edge refers to.
pub type OutputIndex = u32;

/// Edge to a dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Input {
  pub digest: Digest,
  pub index: OutputIndex,
}

impl Input {
  pub fn new(digest: Digest, index: OutputIndex) -> Self {
    Self { digest, index }
  }
}

/// Worker-selection hints. Not interpreted by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
  #[serde(default)]
  pub filter: Vec<String>,
}

/// One unit of graph work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
  #[serde(default)]
  pub inputs: Vec<Input>,
  pub op: OpKind,
  #[serde(default)]
  pub platform: Option<Platform>,
  #[serde(default)]
  pub constraints: Constraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
  Source(SourceOp),
  Exec(ExecOp),
  File(FileOp),
  Build(BuildOp),
}

impl Op {
  pub fn new(op: OpKind) -> Self {
    Self {
      inputs: Vec::new(),
      op,
      platform: None,
      constraints: Constraints::default(),
    }
  }

  pub fn with_inputs(mut self, inputs: Vec<Input>) -> Self {
    self.inputs = inputs;
    self
  }

  pub fn with_platform(mut self, platform: Option<Platform>) -> Self {
    self.platform = platform;
    self
  }

  /// Short name of the variant, for logs and rendering.
  pub fn kind_name(&self) -> &'static str {
    match &self.op {
      OpKind::Source(_) => "source",
      OpKind::Exec(_) => "exec",
      OpKind::File(_) => "file",
      OpKind::Build(_) => "build",
    }
  }

  /// Number of outputs a worker produces for this op.
  pub fn num_outputs(&self) -> u32 {
    match &self.op {
      OpKind::Source(_) | OpKind::Build(_) => 1,
      OpKind::Exec(exec) => exec
        .mounts
        .iter()
        .filter_map(|m| m.output)
        .max()
        .map_or(0, |max| max + 1),
      OpKind::File(file) => file
        .actions
        .iter()
        .filter_map(|a| a.output)
        .max()
        .map_or(0, |max| max + 1),
    }
  }

  /// Check that every index the op refers to internally is in range.
  pub fn check_indices(&self) -> Result<(), String> {
    let inputs = self.inputs.len() as u32;
    match &self.op {
      OpKind::Source(source) => {
        if source.identifier.is_empty() {
          return Err("source identifier is empty".to_string());
        }
        if !self.inputs.is_empty() {
          return Err("source ops take no inputs".to_string());
        }
      }
      OpKind::Exec(exec) => {
        if exec.meta.args.is_empty() {
          return Err("exec has no arguments".to_string());
        }
        for mount in &exec.mounts {
          if let Some(input) = mount.input {
            if input >= inputs {
              return Err(format!(
                "mount {} uses input {} but op has {} inputs",
                mount.dest, input, inputs
              ));
            }
          }
        }
      }
      OpKind::File(file) => {
        if file.actions.is_empty() {
          return Err("file op has no actions".to_string());
        }
        for (position, action) in file.actions.iter().enumerate() {
          for input in action.file_inputs() {
            match input {
              FileInput::Scratch => {}
              FileInput::Input(i) if *i < inputs => {}
              FileInput::Action(a) if (*a as usize) < position => {}
              other => {
                return Err(format!("action {} has invalid input {:?}", position, other));
              }
            }
          }
        }
      }
      OpKind::Build(build) => {
        if build.definition.heads.is_empty() {
          return Err("nested build has no heads".to_string());
        }
      }
    }
    Ok(())
  }
}

/// Source kinds recognised from an identifier's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  Image,
  Git,
  Local,
  Http,
  Oci,
  Other,
}

pub const DOCKER_IMAGE_SCHEME: &str = "docker-image";
pub const GIT_SCHEME: &str = "git";
pub const LOCAL_SCHEME: &str = "local";
pub const HTTP_SCHEME: &str = "http";
pub const HTTPS_SCHEME: &str = "https";
pub const OCI_LAYOUT_SCHEME: &str = "oci-layout";

/// Fetch external content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOp {
  pub identifier: String,
  #[serde(default)]
  pub attrs: BTreeMap<String, String>,
}

impl SourceOp {
  pub fn new(identifier: impl Into<String>) -> Self {
    Self {
      identifier: identifier.into(),
      attrs: BTreeMap::new(),
    }
  }

  pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.attrs.insert(key.into(), value.into());
    self
  }

  pub fn scheme(&self) -> Option<&str> {
    self.identifier.split_once("://").map(|(scheme, _)| scheme)
  }

  /// Identifier with the scheme stripped.
  pub fn reference(&self) -> &str {
    self
      .identifier
      .split_once("://")
      .map_or(self.identifier.as_str(), |(_, rest)| rest)
  }

  pub fn kind(&self) -> SourceKind {
    match self.scheme() {
      Some(DOCKER_IMAGE_SCHEME) => SourceKind::Image,
      Some(GIT_SCHEME) => SourceKind::Git,
      Some(LOCAL_SCHEME) => SourceKind::Local,
      Some(HTTP_SCHEME) | Some(HTTPS_SCHEME) => SourceKind::Http,
      Some(OCI_LAYOUT_SCHEME) => SourceKind::Oci,
      _ => SourceKind::Other,
    }
  }
}

/// Command descriptor of an exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecMeta {
  pub args: Vec<String>,
  /// `KEY=VALUE` entries, in order.
  #[serde(default)]
  pub env: Vec<String>,
  #[serde(default)]
  pub cwd: String,
  #[serde(default)]
  pub user: String,
  #[serde(default)]
  pub hostname: Option<String>,
}

impl ExecMeta {
  pub fn new<I, S>(args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      args: args.into_iter().map(Into::into).collect(),
      env: Vec::new(),
      cwd: "/".to_string(),
      user: String::new(),
      hostname: None,
    }
  }

  pub fn env_value(&self, key: &str) -> Option<&str> {
    self.env.iter().find_map(|entry| {
      let (k, v) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
      (k == key).then_some(v)
    })
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetMode {
  #[default]
  Sandbox,
  Host,
  None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
  #[default]
  Sandbox,
  Insecure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSharing {
  #[default]
  Shared,
  Private,
  Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountType {
  Bind,
  Cache {
    id: String,
    #[serde(default)]
    sharing: CacheSharing,
  },
  Tmpfs {
    #[serde(default)]
    size_bytes: Option<u64>,
  },
  Secret {
    id: String,
    #[serde(default)]
    optional: bool,
  },
  Ssh {
    id: String,
    #[serde(default)]
    optional: bool,
  },
}

/// A filesystem attached to an exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
  /// `None` mounts an empty filesystem.
  pub input: Option<InputIndex>,
  #[serde(default)]
  pub selector: Option<String>,
  pub dest: String,
  /// `None` when the mount's changes are discarded.
  pub output: Option<OutputIndex>,
  #[serde(default)]
  pub readonly: bool,
  pub mount_type: MountType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
  #[serde(default)]
  pub memory_bytes: Option<u64>,
  #[serde(default)]
  pub cpu_shares: Option<u64>,
  #[serde(default)]
  pub pids: Option<u64>,
}

/// Run a command over a set of mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOp {
  pub meta: ExecMeta,
  #[serde(default)]
  pub mounts: Vec<Mount>,
  #[serde(default)]
  pub network: NetMode,
  #[serde(default)]
  pub security: SecurityMode,
  #[serde(default)]
  pub resources: Option<ResourceLimits>,
}

impl ExecOp {
  pub fn new(meta: ExecMeta) -> Self {
    Self {
      meta,
      mounts: Vec::new(),
      network: NetMode::default(),
      security: SecurityMode::default(),
      resources: None,
    }
  }

  /// Mount whose destination is exactly `dest`.
  pub fn mount(&self, dest: &str) -> Option<&Mount> {
    self.mounts.iter().find(|m| m.dest == dest)
  }
}

/// Where a file action reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileInput {
  Scratch,
  /// One of the op's inputs.
  Input(InputIndex),
  /// The result of an earlier action in the same op.
  Action(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileActionKind {
  Copy {
    src: String,
    dest: String,
    #[serde(default)]
    create_dest_path: bool,
    #[serde(default)]
    follow_symlinks: bool,
    #[serde(default)]
    mode: Option<u32>,
  },
  Mkdir {
    path: String,
    mode: u32,
    #[serde(default)]
    make_parents: bool,
  },
  Mkfile {
    path: String,
    mode: u32,
    #[serde(default, with = "base64_bytes")]
    data: Vec<u8>,
  },
  Rm {
    path: String,
    #[serde(default)]
    allow_not_found: bool,
  },
  Merge {
    inputs: Vec<FileInput>,
  },
  Diff {
    lower: FileInput,
    upper: FileInput,
  },
}

/// One step of a file op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAction {
  /// Filesystem the action modifies.
  pub input: FileInput,
  /// Filesystem a copy reads from.
  #[serde(default)]
  pub secondary_input: Option<FileInput>,
  #[serde(default)]
  pub output: Option<OutputIndex>,
  pub action: FileActionKind,
}

impl FileAction {
  /// Every filesystem this action reads.
  pub fn file_inputs(&self) -> Vec<&FileInput> {
    let mut inputs = vec![&self.input];
    inputs.extend(self.secondary_input.as_ref());
    match &self.action {
      FileActionKind::Merge { inputs: merged } => inputs.extend(merged.iter()),
      FileActionKind::Diff { lower, upper } => {
        inputs.push(lower);
        inputs.push(upper);
      }
      _ => {}
    }
    inputs
  }

  /// Path the action writes to, if it targets one.
  pub fn target_path(&self) -> Option<&str> {
    match &self.action {
      FileActionKind::Copy { dest, .. } => Some(dest),
      FileActionKind::Mkdir { path, .. }
      | FileActionKind::Mkfile { path, .. }
      | FileActionKind::Rm { path, .. } => Some(path),
      FileActionKind::Merge { .. } | FileActionKind::Diff { .. } => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
  pub actions: Vec<FileAction>,
}

/// Solve a nested definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOp {
  pub definition: Box<Definition>,
  #[serde(default)]
  pub attrs: BTreeMap<String, String>,
}

/// File contents as standard base64 rather than an array of numbers.
mod base64_bytes {
  use base64::Engine;
  use base64::engine::general_purpose::STANDARD;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
  }
}
