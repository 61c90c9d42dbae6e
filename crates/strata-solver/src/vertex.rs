//! The in-memory graph a solve runs over.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use strata_op::{
  Digest, FileAction, FileActionKind, FileInput, Op, OpKind, OpMetadata, OutputIndex, Platform,
  SourceKind,
};

use crate::error::LoadError;

/// One op of a loaded definition.
///
/// Vertices are shared: every edge that refers to the same digest points at
/// the same `Arc<Vertex>`.
#[derive(Debug)]
pub struct Vertex {
  pub(crate) digest: Digest,
  pub(crate) op: Op,
  pub(crate) metadata: OpMetadata,
  pub(crate) inputs: Vec<Edge>,
  pub(crate) platform: Option<Platform>,
  pub(crate) ignore_cache: bool,
}

/// A specific output of a vertex.
#[derive(Debug, Clone)]
pub struct Edge {
  pub vertex: Arc<Vertex>,
  pub index: OutputIndex,
}

impl Edge {
  pub fn new(vertex: Arc<Vertex>, index: OutputIndex) -> Self {
    Self { vertex, index }
  }
}

impl Vertex {
  pub fn digest(&self) -> &Digest {
    &self.digest
  }

  pub fn op(&self) -> &Op {
    &self.op
  }

  pub fn metadata(&self) -> &OpMetadata {
    &self.metadata
  }

  pub fn inputs(&self) -> &[Edge] {
    &self.inputs
  }

  /// The op's platform, or the default the definition was loaded with.
  pub fn platform(&self) -> Option<&Platform> {
    self.platform.as_ref()
  }

  /// Whether cached results must not satisfy this vertex.
  pub fn ignore_cache(&self) -> bool {
    self.ignore_cache
  }

  /// The custom name if one was set, otherwise a name derived from the op.
  pub fn name(&self) -> String {
    if let Some(name) = self.metadata.custom_name() {
      return name.to_string();
    }
    match &self.op.op {
      OpKind::Source(source) => source.identifier.clone(),
      OpKind::Exec(exec) => exec.meta.args.join(" "),
      OpKind::File(file) => match file.actions.as_slice() {
        [action] => format!("file {}", action_name(action)),
        actions => format!("file ({} actions)", actions.len()),
      },
      OpKind::Build(_) => format!("build {}", self.digest.short()),
    }
  }

  /// The kind of source, if this vertex is a source op.
  pub fn source_kind(&self) -> Option<SourceKind> {
    match &self.op.op {
      OpKind::Source(source) => Some(source.kind()),
      _ => None,
    }
  }

  /// The output that reflects the filesystem at `dest` after this vertex
  /// ran.
  ///
  /// For an exec this is the output of the mount at `dest`. For a file op it
  /// is the output of the action that targets `dest`.
  pub fn mount_output(self: &Arc<Self>, dest: &str) -> Result<Edge, LoadError> {
    let output = match &self.op.op {
      OpKind::Exec(exec) => {
        let mount = exec.mount(dest).ok_or_else(|| self.mount_not_found(dest))?;
        mount.output
      }
      OpKind::File(file) => {
        let action = file
          .actions
          .iter()
          .rev()
          .find(|a| a.target_path() == Some(dest))
          .ok_or_else(|| self.mount_not_found(dest))?;
        action.output
      }
      _ => return Err(self.mount_not_found(dest)),
    };
    let index = output.ok_or_else(|| self.mount_unresolved(dest, "output"))?;
    Ok(Edge::new(self.clone(), index))
  }

  /// The input edge that provides the filesystem at `dest` before this
  /// vertex ran.
  pub fn mount_base(&self, dest: &str) -> Result<Edge, LoadError> {
    let input = match &self.op.op {
      OpKind::Exec(exec) => {
        let mount = exec.mount(dest).ok_or_else(|| self.mount_not_found(dest))?;
        mount.input
      }
      OpKind::File(file) => {
        let action = file
          .actions
          .iter()
          .find(|a| a.target_path() == Some(dest))
          .ok_or_else(|| self.mount_not_found(dest))?;
        self.file_base(&file.actions, action.input)
      }
      _ => return Err(self.mount_not_found(dest)),
    };
    let index = input.ok_or_else(|| self.mount_unresolved(dest, "input"))?;
    self
      .inputs
      .get(index as usize)
      .cloned()
      .ok_or_else(|| self.mount_unresolved(dest, "input"))
  }

  /// Follow an action chain back to the op input it started from.
  fn file_base(&self, actions: &[FileAction], mut input: FileInput) -> Option<u32> {
    // Action inputs only point backwards, so this terminates.
    loop {
      match input {
        FileInput::Input(index) => return Some(index),
        FileInput::Scratch => return None,
        FileInput::Action(k) => input = actions.get(k as usize)?.input,
      }
    }
  }

  fn mount_not_found(&self, dest: &str) -> LoadError {
    LoadError::MountNotFound {
      digest: self.digest.clone(),
      dest: dest.to_string(),
    }
  }

  fn mount_unresolved(&self, dest: &str, side: &'static str) -> LoadError {
    LoadError::MountUnresolved {
      digest: self.digest.clone(),
      dest: dest.to_string(),
      side,
    }
  }
}

fn action_name(action: &FileAction) -> String {
  match (&action.action, action.target_path()) {
    (_, Some(path)) => path.to_string(),
    (FileActionKind::Merge { inputs }, None) => format!("merge ({} inputs)", inputs.len()),
    (FileActionKind::Diff { .. }, None) => "diff".to_string(),
    _ => "action".to_string(),
  }
}

/// Visit every vertex reachable from `heads` once, inputs before the
/// vertices that consume them.
pub fn walk<E>(
  heads: &[Edge],
  mut visit: impl FnMut(&Arc<Vertex>) -> Result<(), E>,
) -> Result<(), E> {
  let mut seen = HashSet::new();
  for head in heads {
    walk_vertex(&head.vertex, &mut seen, &mut visit)?;
  }
  Ok(())
}

fn walk_vertex<E>(
  vertex: &Arc<Vertex>,
  seen: &mut HashSet<Digest>,
  visit: &mut impl FnMut(&Arc<Vertex>) -> Result<(), E>,
) -> Result<(), E> {
  if !seen.insert(vertex.digest.clone()) {
    return Ok(());
  }
  for input in &vertex.inputs {
    walk_vertex(&input.vertex, seen, visit)?;
  }
  visit(vertex)
}

/// Render the graph under `heads` as an indented tree. A vertex reached a
/// second time is printed once more without its inputs.
pub fn render(heads: &[Edge]) -> String {
  let mut out = String::new();
  let mut seen = HashSet::new();
  for head in heads {
    render_edge(head, 0, &mut seen, &mut out);
  }
  out
}

fn render_edge(edge: &Edge, depth: usize, seen: &mut HashSet<Digest>, out: &mut String) {
  let vertex = &edge.vertex;
  let first = seen.insert(vertex.digest.clone());
  let _ = writeln!(
    out,
    "{:indent$}{} [{}:{}] {}{}",
    "",
    vertex.digest.short(),
    vertex.op.kind_name(),
    edge.index,
    vertex.name(),
    if first { "" } else { " (seen)" },
    indent = depth * 2
  );
  if first {
    for input in &vertex.inputs {
      render_edge(input, depth + 1, seen, out);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::loader::{LoadOverrides, load};
  use strata_op::Platform;
  use strata_pipeline::{MarshalOptions, MountOptions, RunOptions, State, image, merge, mkdir, scratch};

  fn load_state(state: &State) -> Edge {
    let def = state
      .marshal(&MarshalOptions::new().platform(Platform::linux_amd64()))
      .unwrap();
    load(&def, &LoadOverrides::default()).unwrap().remove(0)
  }

  #[test]
  fn test_exec_mount_lookup() {
    let exec = image("golang")
      .run(RunOptions::shell("go build -o /out/app"))
      .add_mount("/ro", &image("busybox"), MountOptions::new().readonly())
      .unwrap()
      .add_mount("/out", &scratch(), MountOptions::new())
      .unwrap();
    let head = load_state(&exec.mount("/out").unwrap());
    let vertex = &head.vertex;
    assert_eq!(head.index, 1);

    assert_eq!(vertex.mount_output("/").unwrap().index, 0);
    assert_eq!(vertex.mount_output("/out").unwrap().index, 1);

    let base = vertex.mount_base("/").unwrap();
    assert_eq!(base.vertex.name(), "docker-image://docker.io/library/golang:latest");
    let ro = vertex.mount_base("/ro").unwrap();
    assert_eq!(ro.vertex.source_kind(), Some(SourceKind::Image));

    assert!(matches!(
      vertex.mount_output("/ro"),
      Err(LoadError::MountUnresolved { side: "output", .. })
    ));
    assert!(matches!(
      vertex.mount_base("/out"),
      Err(LoadError::MountUnresolved { side: "input", .. })
    ));
    assert!(matches!(
      vertex.mount_output("/missing"),
      Err(LoadError::MountNotFound { .. })
    ));
  }

  #[test]
  fn test_file_mount_lookup() {
    let st = image("foo")
      .file(mkdir("/a", 0o755, false).mkfile("/a/b", 0o644, "data"))
      .unwrap();
    let head = load_state(&st);
    let vertex = &head.vertex;

    assert_eq!(vertex.mount_output("/a/b").unwrap().index, 0);
    assert!(matches!(
      vertex.mount_output("/a"),
      Err(LoadError::MountUnresolved { .. })
    ));

    let base = vertex.mount_base("/a/b").unwrap();
    assert_eq!(base.vertex.source_kind(), Some(SourceKind::Image));
    assert!(vertex.mount_base("/c").is_err());
  }

  #[test]
  fn test_source_has_no_mounts() {
    let head = load_state(&image("foo"));
    assert!(matches!(
      head.vertex.mount_output("/"),
      Err(LoadError::MountNotFound { .. })
    ));
  }

  #[test]
  fn test_walk_visits_each_vertex_once_inputs_first() {
    let base = image("alpine");
    let left = base.run(RunOptions::new(["echo", "left"])).root();
    let right = base.run(RunOptions::new(["echo", "right"])).root();
    let head = load_state(&merge(&[left, right], Default::default()));

    let mut order = Vec::new();
    walk(std::slice::from_ref(&head), |vertex| {
      order.push(vertex.clone());
      Ok::<_, ()>(())
    })
    .unwrap();

    assert_eq!(order.len(), 4);
    assert_eq!(order[0].source_kind(), Some(SourceKind::Image));
    assert_eq!(order[3].digest(), head.vertex.digest());
    for (position, vertex) in order.iter().enumerate() {
      for input in vertex.inputs() {
        let input_position = order
          .iter()
          .position(|v| v.digest() == input.vertex.digest())
          .unwrap();
        assert!(input_position < position);
      }
    }
  }

  #[test]
  fn test_walk_stops_on_error() {
    let head = load_state(&image("alpine").run(RunOptions::new(["true"])).root());
    let mut visited = 0;
    let result = walk(std::slice::from_ref(&head), |_| {
      visited += 1;
      Err("stop")
    });
    assert_eq!(result, Err("stop"));
    assert_eq!(visited, 1);
  }

  #[test]
  fn test_render_marks_repeated_vertices() {
    let base = image("alpine");
    let left = base.run(RunOptions::new(["echo", "left"])).root();
    let right = base.run(RunOptions::new(["echo", "right"])).root();
    let head = load_state(&merge(&[left, right], Default::default()));

    let rendered = render(std::slice::from_ref(&head));
    let lines: Vec<_> = rendered.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].contains("[file:0]"));
    assert!(lines[1].starts_with("  ") && lines[1].contains("echo left"));
    assert!(lines[2].starts_with("    ") && lines[2].contains("docker-image://"));
    assert!(lines[4].ends_with("(seen)"));
  }
}
