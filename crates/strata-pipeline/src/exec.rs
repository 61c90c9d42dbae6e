//! Exec states.

use std::sync::Arc;

use strata_op::{
  CacheSharing, Constraints, ExecMeta, Mount, MountType, NetMode, OutputIndex, ResourceLimits,
  SecurityMode,
};

use crate::error::BuildError;
use crate::options::OpOptions;
use crate::state::{ExecNode, Node, NodeKind, Output, State, resolve};

const ROOT: &str = "/";

/// How to run a command.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  pub args: Vec<String>,
  pub network: Option<NetMode>,
  pub security: Option<SecurityMode>,
  pub resources: Option<ResourceLimits>,
  pub options: OpOptions,
}

impl RunOptions {
  pub fn new<I, S>(args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      args: args.into_iter().map(Into::into).collect(),
      ..Default::default()
    }
  }

  /// Run `script` with `/bin/sh -c`.
  pub fn shell(script: &str) -> Self {
    Self::new(["/bin/sh", "-c", script])
  }

  pub fn network(mut self, network: NetMode) -> Self {
    self.network = Some(network);
    self
  }

  pub fn security(mut self, security: SecurityMode) -> Self {
    self.security = Some(security);
    self
  }

  pub fn resources(mut self, resources: ResourceLimits) -> Self {
    self.resources = Some(resources);
    self
  }

  pub fn options(mut self, options: OpOptions) -> Self {
    self.options = options;
    self
  }
}

/// How to attach a filesystem to an exec.
#[derive(Debug, Clone)]
pub struct MountOptions {
  pub readonly: bool,
  pub selector: Option<String>,
  pub mount_type: MountType,
}

impl Default for MountOptions {
  fn default() -> Self {
    Self {
      readonly: false,
      selector: None,
      mount_type: MountType::Bind,
    }
  }
}

impl MountOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn readonly(mut self) -> Self {
    self.readonly = true;
    self
  }

  /// Mount only this path of the source.
  pub fn selector(mut self, path: &str) -> Self {
    self.selector = Some(path.to_string());
    self
  }

  pub fn cache(mut self, id: &str, sharing: CacheSharing) -> Self {
    self.mount_type = MountType::Cache {
      id: id.to_string(),
      sharing,
    };
    self
  }

  pub fn tmpfs(mut self, size_bytes: Option<u64>) -> Self {
    self.mount_type = MountType::Tmpfs { size_bytes };
    self
  }

  pub fn secret(mut self, id: &str, optional: bool) -> Self {
    self.mount_type = MountType::Secret {
      id: id.to_string(),
      optional,
    };
    self
  }

  pub fn ssh(mut self, id: &str, optional: bool) -> Self {
    self.mount_type = MountType::Ssh {
      id: id.to_string(),
      optional,
    };
    self
  }

  /// Only writable bind mounts produce an output.
  fn has_output(&self) -> bool {
    !self.readonly && matches!(self.mount_type, MountType::Bind)
  }
}

/// An exec and its mounts.
///
/// Adding a mount returns a new `ExecState`; states taken from an earlier
/// value still refer to the exec without that mount.
#[derive(Debug, Clone)]
pub struct ExecState {
  exec: ExecNode,
  node: Arc<Node>,
  base: State,
}

impl State {
  /// Run a command with this state mounted at `/`.
  pub fn run(&self, run: RunOptions) -> ExecState {
    let mut meta = ExecMeta::new(run.args);
    meta.env = self.env_list();
    meta.cwd = self.meta.dir.clone();
    meta.user = self.meta.user.clone();
    meta.hostname = self.meta.hostname.clone();

    let root = Mount {
      input: None,
      selector: None,
      dest: ROOT.to_string(),
      output: Some(0),
      readonly: false,
      mount_type: MountType::Bind,
    };

    let exec = ExecNode {
      meta,
      mounts: vec![root],
      sources: vec![self.clone()],
      network: run.network.unwrap_or(self.meta.network),
      security: run.security.unwrap_or(self.meta.security),
      resources: run.resources,
    };

    let node = Node {
      kind: NodeKind::Exec(exec.clone()),
      platform: self.meta.platform.clone(),
      constraints: Constraints::default(),
      options: run.options,
    };
    ExecState {
      exec,
      node: Arc::new(node),
      base: self.clone(),
    }
  }
}

impl ExecState {
  fn exec(&self) -> &ExecNode {
    &self.exec
  }

  /// Attach `source` at `dest`. Relative destinations resolve against the
  /// exec's working directory.
  pub fn add_mount(
    &self,
    dest: &str,
    source: &State,
    options: MountOptions,
  ) -> Result<ExecState, BuildError> {
    if dest.is_empty() {
      return Err(BuildError::InvalidPath {
        path: dest.to_string(),
        message: "mount destination is empty".to_string(),
      });
    }

    let exec = self.exec();
    let dest = resolve(&exec.meta.cwd, dest);
    if exec.mounts.iter().any(|m| m.dest == dest) {
      return Err(BuildError::MountCollision { dest });
    }

    let output = if options.has_output() {
      let next = exec
        .mounts
        .iter()
        .filter_map(|m| m.output)
        .max()
        .map_or(0, |max| max + 1);
      Some(next)
    } else {
      None
    };

    let mut next = exec.clone();
    next.mounts.push(Mount {
      input: None,
      selector: options.selector,
      dest,
      output,
      readonly: options.readonly,
      mount_type: options.mount_type,
    });
    next.sources.push(source.clone());

    let node = Node {
      kind: NodeKind::Exec(next.clone()),
      platform: self.node.platform.clone(),
      constraints: self.node.constraints.clone(),
      options: self.node.options.clone(),
    };
    Ok(ExecState {
      exec: next,
      node: Arc::new(node),
      base: self.base.clone(),
    })
  }

  /// The root filesystem after the command ran.
  pub fn root(&self) -> State {
    self.output_state(0, &self.base)
  }

  /// The filesystem mounted at `dest` after the command ran.
  pub fn mount(&self, dest: &str) -> Result<State, BuildError> {
    let exec = self.exec();
    let dest = resolve(&exec.meta.cwd, dest);
    let position = exec
      .mounts
      .iter()
      .position(|m| m.dest == dest)
      .ok_or_else(|| BuildError::MountNotFound { dest: dest.clone() })?;
    let index = exec.mounts[position]
      .output
      .ok_or(BuildError::MountHasNoOutput { dest })?;
    Ok(self.output_state(index, &exec.sources[position]))
  }

  fn output_state(&self, index: OutputIndex, inherit: &State) -> State {
    State {
      output: Some(Output {
        node: self.node.clone(),
        index,
      }),
      meta: inherit.meta.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::image;
  use crate::state::scratch;

  #[test]
  fn test_run_captures_state_settings() {
    let exec = image("alpine")
      .dir("/work")
      .add_env("A", "1")
      .user("build")
      .run(RunOptions::shell("make"));
    let node = exec.exec();
    assert_eq!(node.meta.args, vec!["/bin/sh", "-c", "make"]);
    assert_eq!(node.meta.cwd, "/work");
    assert_eq!(node.meta.env, vec!["A=1"]);
    assert_eq!(node.meta.user, "build");
    assert_eq!(node.mounts.len(), 1);
  }

  #[test]
  fn test_mount_collision() {
    let exec = image("alpine").run(RunOptions::new(["true"]));
    let exec = exec
      .add_mount("/src", &image("busybox"), MountOptions::new())
      .unwrap();
    let err = exec
      .add_mount("/src/", &scratch(), MountOptions::new())
      .unwrap_err();
    assert!(matches!(err, BuildError::MountCollision { dest } if dest == "/src"));

    let err = exec.add_mount("/", &scratch(), MountOptions::new()).unwrap_err();
    assert!(matches!(err, BuildError::MountCollision { .. }));
  }

  #[test]
  fn test_output_indices() {
    let exec = image("alpine")
      .run(RunOptions::new(["true"]))
      .add_mount("/ro", &image("busybox"), MountOptions::new().readonly())
      .unwrap()
      .add_mount("/cache", &scratch(), MountOptions::new().cache("c", CacheSharing::Shared))
      .unwrap()
      .add_mount("/out", &scratch(), MountOptions::new())
      .unwrap();

    let outputs: Vec<_> = exec.exec().mounts.iter().map(|m| m.output).collect();
    assert_eq!(outputs, vec![Some(0), None, None, Some(1)]);

    assert_eq!(exec.mount("/out").unwrap().output.unwrap().index, 1);
    assert!(matches!(
      exec.mount("/ro"),
      Err(BuildError::MountHasNoOutput { .. })
    ));
    assert!(matches!(
      exec.mount("/missing"),
      Err(BuildError::MountNotFound { .. })
    ));
  }

  #[test]
  fn test_add_mount_leaves_original_exec() {
    let first = image("alpine").run(RunOptions::new(["true"]));
    let second = first
      .add_mount("/out", &scratch(), MountOptions::new())
      .unwrap();
    assert_eq!(first.exec().mounts.len(), 1);
    assert_eq!(second.exec().mounts.len(), 2);
    assert!(first.mount("/out").is_err());
  }
}
