//! Flattening a pipeline into a [`Definition`].

use std::collections::HashMap;
use std::sync::Arc;

use strata_op::{
  Definition, Digest, ExecOp, FileActionKind, FileInput, FileOp, Input, InputIndex, MountType,
  NetMode, Op, OpKind, OpMetadata, Platform, SecurityMode, SourceKind, caps, default_path_env,
};
use tracing::{debug, instrument};

use crate::error::BuildError;
use crate::options::MarshalOptions;
use crate::source::{
  ATTR_HTTP_CHECKSUM, ATTR_KEEP_GIT_DIR, ATTR_LOCAL_EXCLUDE, ATTR_LOCAL_INCLUDE,
};
use crate::state::{ExecNode, FileNode, Node, NodeKind, State};

impl State {
  /// Flatten the pipeline ending here into a definition with one head.
  pub fn marshal(&self, options: &MarshalOptions) -> Result<Definition, BuildError> {
    marshal(std::slice::from_ref(self), options)
  }
}

/// Flatten the pipelines ending at `heads` into one definition.
///
/// Ops shared between heads, or structurally identical, appear once.
#[instrument(name = "marshal", skip_all, fields(heads = heads.len()))]
pub fn marshal(heads: &[State], options: &MarshalOptions) -> Result<Definition, BuildError> {
  let mut marshaler = Marshaler::new(options);

  for head in heads {
    if let Some(output) = &head.output {
      let digest = marshaler.visit(&output.node)?;
      let input = Input::new(digest, output.index);
      if !marshaler.definition.heads.contains(&input) {
        marshaler.definition.heads.push(input);
      }
    }
  }

  if marshaler.definition.heads.is_empty() {
    return Err(BuildError::NoHeads);
  }

  debug!(ops = marshaler.definition.len(), "marshal_completed");
  Ok(marshaler.definition)
}

struct Marshaler<'a> {
  options: &'a MarshalOptions,
  default_platform: Platform,
  definition: Definition,
  /// Digest of every node already visited, by identity.
  visited: HashMap<*const Node, Digest>,
}

impl<'a> Marshaler<'a> {
  fn new(options: &'a MarshalOptions) -> Self {
    Self {
      options,
      default_platform: options.platform.clone().unwrap_or_else(Platform::host),
      definition: Definition::new(),
      visited: HashMap::new(),
    }
  }

  /// Post-order visit: inputs are digested before the node itself.
  fn visit(&mut self, node: &Arc<Node>) -> Result<Digest, BuildError> {
    let key = Arc::as_ptr(node);
    if let Some(digest) = self.visited.get(&key) {
      return Ok(digest.clone());
    }

    let platform = node
      .platform
      .clone()
      .unwrap_or_else(|| self.default_platform.clone());
    let mut meta = node.options.to_metadata();

    let (inputs, kind) = match &node.kind {
      NodeKind::Source(source) => {
        if source.reference().is_empty() {
          return Err(BuildError::EmptyIdentifier {
            identifier: source.identifier.clone(),
          });
        }
        require_source_caps(source, &mut meta);
        (Vec::new(), OpKind::Source(source.clone()))
      }
      NodeKind::Exec(exec) => self.exec_op(exec, &platform, &mut meta)?,
      NodeKind::File(file) => self.file_op(file, &mut meta)?,
      NodeKind::Build(build) => {
        meta.require_cap(caps::BUILD_OP);
        (Vec::new(), OpKind::Build(build.clone()))
      }
    };

    let op = Op {
      inputs,
      op: kind,
      platform: Some(platform),
      constraints: node.constraints.clone(),
    };

    let kind_name = op.kind_name();
    let digest = self.definition.insert(op)?;
    if !meta.is_empty() {
      self.definition.metadata_mut(&digest).merge(&meta);
    }
    debug!(digest = %digest.short(), kind = kind_name, "op_marshaled");

    self.visited.insert(key, digest.clone());
    Ok(digest)
  }

  /// Digest the output `state` refers to and add it to `inputs`, reusing an
  /// identical entry. Scratch has no input.
  fn add_input(
    &mut self,
    inputs: &mut Vec<Input>,
    state_output: Option<(&Arc<Node>, u32)>,
  ) -> Result<Option<InputIndex>, BuildError> {
    let Some((node, index)) = state_output else {
      return Ok(None);
    };
    let input = Input::new(self.visit(node)?, index);
    let position = match inputs.iter().position(|i| *i == input) {
      Some(position) => position,
      None => {
        inputs.push(input);
        inputs.len() - 1
      }
    };
    Ok(Some(position as InputIndex))
  }

  fn exec_op(
    &mut self,
    exec: &ExecNode,
    platform: &Platform,
    meta: &mut OpMetadata,
  ) -> Result<(Vec<Input>, OpKind), BuildError> {
    if exec.meta.args.is_empty() {
      return Err(BuildError::EmptyArgs);
    }

    let mut inputs = Vec::new();
    let mut mounts = Vec::with_capacity(exec.mounts.len());
    for (mount, source) in exec.mounts.iter().zip(&exec.sources) {
      let mut mount = mount.clone();
      let output = source.output.as_ref().map(|o| (&o.node, o.index));
      mount.input = self.add_input(&mut inputs, output)?;

      match &mount.mount_type {
        MountType::Bind => {}
        MountType::Cache { .. } => meta.require_cap(caps::EXEC_MOUNT_CACHE),
        MountType::Tmpfs { .. } => meta.require_cap(caps::EXEC_MOUNT_TMPFS),
        MountType::Secret { .. } => meta.require_cap(caps::EXEC_MOUNT_SECRET),
        MountType::Ssh { .. } => meta.require_cap(caps::EXEC_MOUNT_SSH),
      }
      if mount.selector.is_some() {
        meta.require_cap(caps::EXEC_MOUNT_SELECTOR);
      }
      mounts.push(mount);
    }

    let mut exec_meta = exec.meta.clone();
    if exec_meta.env_value("PATH").is_none() {
      let executor_sets_path = self
        .options
        .caps
        .as_ref()
        .is_some_and(|c| c.supports(caps::EXEC_META_SETS_DEFAULT_PATH).is_ok());
      if executor_sets_path {
        meta.require_cap(caps::EXEC_META_SETS_DEFAULT_PATH);
      } else {
        exec_meta
          .env
          .push(format!("PATH={}", default_path_env(&platform.os)));
      }
    }
    if exec_meta.hostname.is_some() {
      meta.require_cap(caps::EXEC_META_HOSTNAME);
    }
    if exec.network != NetMode::Sandbox {
      meta.require_cap(caps::EXEC_META_NETWORK);
    }
    if exec.security != SecurityMode::Sandbox {
      meta.require_cap(caps::EXEC_META_SECURITY);
    }
    if exec.resources.is_some() {
      meta.require_cap(caps::EXEC_RESOURCES);
    }

    let op = ExecOp {
      meta: exec_meta,
      mounts,
      network: exec.network,
      security: exec.security,
      resources: exec.resources.clone(),
    };
    Ok((inputs, OpKind::Exec(op)))
  }

  fn file_op(
    &mut self,
    file: &FileNode,
    meta: &mut OpMetadata,
  ) -> Result<(Vec<Input>, OpKind), BuildError> {
    meta.require_cap(caps::FILE_BASE);

    // Distinct nodes may still digest the same, so indices are remapped.
    let mut inputs = Vec::new();
    let mut remap = Vec::with_capacity(file.inputs.len());
    for output in &file.inputs {
      let index = self.add_input(&mut inputs, Some((&output.node, output.index)))?;
      remap.push(index.unwrap_or_default());
    }
    let remap_input = |input: &mut FileInput| {
      if let FileInput::Input(i) = input {
        if let Some(mapped) = remap.get(*i as usize) {
          *i = *mapped;
        }
      }
    };

    let mut actions = file.actions.clone();
    for action in &mut actions {
      remap_input(&mut action.input);
      if let Some(secondary) = &mut action.secondary_input {
        remap_input(secondary);
      }
      match &mut action.action {
        FileActionKind::Merge { inputs } => {
          meta.require_cap(caps::FILE_MERGE);
          inputs.iter_mut().for_each(remap_input);
        }
        FileActionKind::Diff { lower, upper } => {
          meta.require_cap(caps::FILE_DIFF);
          remap_input(lower);
          remap_input(upper);
        }
        _ => {}
      }
    }

    Ok((inputs, OpKind::File(FileOp { actions })))
  }
}

fn require_source_caps(source: &strata_op::SourceOp, meta: &mut OpMetadata) {
  let has = |key: &str| source.attrs.contains_key(key);
  match source.kind() {
    SourceKind::Image => meta.require_cap(caps::SOURCE_IMAGE),
    SourceKind::Git => {
      meta.require_cap(caps::SOURCE_GIT);
      if has(ATTR_KEEP_GIT_DIR) {
        meta.require_cap(caps::SOURCE_GIT_KEEP_DIR);
      }
    }
    SourceKind::Local => {
      meta.require_cap(caps::SOURCE_LOCAL);
      if has(ATTR_LOCAL_INCLUDE) || has(ATTR_LOCAL_EXCLUDE) {
        meta.require_cap(caps::SOURCE_LOCAL_PATTERNS);
      }
    }
    SourceKind::Http => {
      meta.require_cap(caps::SOURCE_HTTP);
      if has(ATTR_HTTP_CHECKSUM) {
        meta.require_cap(caps::SOURCE_HTTP_CHECKSUM);
      }
    }
    SourceKind::Oci => meta.require_cap(caps::SOURCE_OCI_LAYOUT),
    SourceKind::Other => {}
  }
}

#[cfg(test)]
mod tests {
  use strata_op::{CapSet, DEFAULT_PATH_ENV_UNIX, DEFAULT_PATH_ENV_WINDOWS};

  use super::*;
  use crate::exec::{MountOptions, RunOptions};
  use crate::source::image;
  use crate::state::scratch;

  fn exec_of(def: &Definition) -> &ExecOp {
    let head = &def.heads[0].digest;
    match &def.ops[head].op {
      OpKind::Exec(exec) => exec,
      other => panic!("expected exec head, got {:?}", other),
    }
  }

  #[test]
  fn test_default_path_without_caps() {
    let st = image("foo").run(RunOptions::new(["ls"])).root();
    let def = st
      .marshal(&MarshalOptions::new().platform(Platform::linux_amd64()))
      .unwrap();
    let exec = exec_of(&def);
    assert_eq!(exec.meta.env_value("PATH"), Some(DEFAULT_PATH_ENV_UNIX));
    let head = &def.heads[0].digest;
    assert!(
      def
        .metadata(head)
        .is_none_or(|m| !m.caps.contains_key(caps::EXEC_META_SETS_DEFAULT_PATH))
    );
  }

  #[test]
  fn test_default_path_windows() {
    let st = image("foo").run(RunOptions::new(["dir"])).root();
    let def = st
      .marshal(&MarshalOptions::new().platform(Platform::windows_amd64()))
      .unwrap();
    assert_eq!(
      exec_of(&def).meta.env_value("PATH"),
      Some(DEFAULT_PATH_ENV_WINDOWS)
    );
  }

  #[test]
  fn test_default_path_with_cap() {
    let st = image("foo").run(RunOptions::new(["ls"])).root();
    let def = st
      .marshal(&MarshalOptions::new().caps(CapSet::all()))
      .unwrap();
    let exec = exec_of(&def);
    assert_eq!(exec.meta.env_value("PATH"), None);
    assert!(!exec.meta.env.iter().any(|e| e.starts_with("PATH")));
    let meta = def.metadata(&def.heads[0].digest).unwrap();
    assert_eq!(meta.caps.get(caps::EXEC_META_SETS_DEFAULT_PATH), Some(&true));
  }

  #[test]
  fn test_user_path_preserved() {
    let st = image("foo")
      .add_env("PATH", "/custom/bin")
      .run(RunOptions::new(["ls"]))
      .root();
    for options in [MarshalOptions::new(), MarshalOptions::new().caps(CapSet::all())] {
      let def = st.marshal(&options).unwrap();
      let exec = exec_of(&def);
      assert_eq!(exec.meta.env, vec!["PATH=/custom/bin"]);
    }
  }

  #[test]
  fn test_minimal_caps_only_choose_encoding() {
    let st = image("foo").run(RunOptions::new(["ls"])).root();
    let minimal = CapSet::new().with_enabled(caps::EXEC_META_SETS_DEFAULT_PATH);
    let def = st.marshal(&MarshalOptions::new().caps(minimal)).unwrap();
    assert_eq!(exec_of(&def).meta.env_value("PATH"), None);
    assert!(def.required_caps().contains(caps::SOURCE_IMAGE));

    let def = st.marshal(&MarshalOptions::new().caps(CapSet::new())).unwrap();
    assert_eq!(
      exec_of(&def).meta.env_value("PATH"),
      Some(DEFAULT_PATH_ENV_UNIX)
    );
  }

  #[test]
  fn test_disabled_cap_is_recorded_not_rejected() {
    let st = image("foo")
      .run(RunOptions::new(["ls"]))
      .add_mount("/cache", &scratch(), MountOptions::new().cache("c", Default::default()))
      .unwrap()
      .root();
    let target = CapSet::all().with_disabled(caps::EXEC_MOUNT_CACHE, "no cache mounts");
    let def = st.marshal(&MarshalOptions::new().caps(target.clone())).unwrap();

    let required = def.required_caps();
    assert!(required.contains(caps::EXEC_MOUNT_CACHE));
    assert!(target.check_all(required.iter().map(String::as_str)).is_err());
  }

  #[test]
  fn test_scratch_only_is_an_error() {
    assert!(matches!(
      scratch().marshal(&MarshalOptions::new()),
      Err(BuildError::NoHeads)
    ));
  }

  #[test]
  fn test_empty_image_reference_rejected() {
    assert!(matches!(
      image("").marshal(&MarshalOptions::new()),
      Err(BuildError::EmptyIdentifier { .. })
    ));
  }

  #[test]
  fn test_empty_args_rejected() {
    let st = image("foo").run(RunOptions::new(Vec::<String>::new())).root();
    assert!(matches!(
      st.marshal(&MarshalOptions::new()),
      Err(BuildError::EmptyArgs)
    ));
  }
}
