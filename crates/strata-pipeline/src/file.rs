//! File actions, merge and diff.
//!
//! A [`FileChain`] is applied to a state with [`State::file`] and becomes a
//! single file op. Each action works on the result of the previous one and
//! only the last action produces the op's output.

use strata_op::{Constraints, FileAction, FileActionKind, FileInput, InputIndex};

use crate::error::BuildError;
use crate::options::OpOptions;
use crate::state::{FileNode, Node, NodeKind, Output, State, resolve};

#[derive(Debug, Clone)]
enum ChainAction {
  Mkdir {
    path: String,
    mode: u32,
    make_parents: bool,
  },
  Mkfile {
    path: String,
    mode: u32,
    data: Vec<u8>,
  },
  Rm {
    path: String,
    allow_not_found: bool,
  },
  Copy {
    from: State,
    src: String,
    dest: String,
    options: CopyOptions,
  },
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
  pub create_dest_path: bool,
  pub follow_symlinks: bool,
  pub mode: Option<u32>,
}

/// An ordered list of file actions.
#[derive(Debug, Clone, Default)]
pub struct FileChain {
  actions: Vec<ChainAction>,
}

impl FileChain {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn mkdir(mut self, path: &str, mode: u32, make_parents: bool) -> Self {
    self.actions.push(ChainAction::Mkdir {
      path: path.to_string(),
      mode,
      make_parents,
    });
    self
  }

  pub fn mkfile(mut self, path: &str, mode: u32, data: impl Into<Vec<u8>>) -> Self {
    self.actions.push(ChainAction::Mkfile {
      path: path.to_string(),
      mode,
      data: data.into(),
    });
    self
  }

  pub fn rm(mut self, path: &str, allow_not_found: bool) -> Self {
    self.actions.push(ChainAction::Rm {
      path: path.to_string(),
      allow_not_found,
    });
    self
  }

  /// Copy `src` from `from` to `dest`. `src` resolves against the working
  /// directory of `from`.
  pub fn copy(mut self, from: &State, src: &str, dest: &str, options: CopyOptions) -> Self {
    self.actions.push(ChainAction::Copy {
      from: from.clone(),
      src: src.to_string(),
      dest: dest.to_string(),
      options,
    });
    self
  }

  pub fn len(&self) -> usize {
    self.actions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.actions.is_empty()
  }
}

pub fn mkdir(path: &str, mode: u32, make_parents: bool) -> FileChain {
  FileChain::new().mkdir(path, mode, make_parents)
}

pub fn mkfile(path: &str, mode: u32, data: impl Into<Vec<u8>>) -> FileChain {
  FileChain::new().mkfile(path, mode, data)
}

pub fn rm(path: &str, allow_not_found: bool) -> FileChain {
  FileChain::new().rm(path, allow_not_found)
}

pub fn copy(from: &State, src: &str, dest: &str, options: CopyOptions) -> FileChain {
  FileChain::new().copy(from, src, dest, options)
}

/// Inputs of a file op under construction. Identical outputs share an index.
#[derive(Default)]
struct InputSet {
  outputs: Vec<Output>,
}

impl InputSet {
  fn add(&mut self, state: &State) -> FileInput {
    match &state.output {
      None => FileInput::Scratch,
      Some(output) => {
        let index = match self.outputs.iter().position(|o| o.same_as(output)) {
          Some(index) => index,
          None => {
            self.outputs.push(output.clone());
            self.outputs.len() - 1
          }
        };
        FileInput::Input(index as InputIndex)
      }
    }
  }
}

fn check_path(path: &str) -> Result<(), BuildError> {
  let message = if path.is_empty() {
    "path is empty"
  } else if path.contains('\0') {
    "path contains a NUL byte"
  } else {
    return Ok(());
  };
  Err(BuildError::InvalidPath {
    path: path.to_string(),
    message: message.to_string(),
  })
}

impl State {
  /// Apply `chain` as one file op.
  pub fn file(&self, chain: FileChain) -> Result<State, BuildError> {
    self.file_with(chain, OpOptions::default())
  }

  pub fn file_with(&self, chain: FileChain, options: OpOptions) -> Result<State, BuildError> {
    if chain.is_empty() {
      return Ok(self.clone());
    }

    let mut inputs = InputSet::default();
    let base = inputs.add(self);
    let dir = &self.meta.dir;
    let last = chain.len() - 1;
    let mut actions = Vec::with_capacity(chain.len());

    for (position, action) in chain.actions.into_iter().enumerate() {
      let input = if position == 0 {
        base
      } else {
        FileInput::Action(position as u32 - 1)
      };
      let mut secondary_input = None;

      let kind = match action {
        ChainAction::Mkdir {
          path,
          mode,
          make_parents,
        } => {
          check_path(&path)?;
          FileActionKind::Mkdir {
            path: resolve(dir, &path),
            mode,
            make_parents,
          }
        }
        ChainAction::Mkfile { path, mode, data } => {
          check_path(&path)?;
          FileActionKind::Mkfile {
            path: resolve(dir, &path),
            mode,
            data,
          }
        }
        ChainAction::Rm {
          path,
          allow_not_found,
        } => {
          check_path(&path)?;
          FileActionKind::Rm {
            path: resolve(dir, &path),
            allow_not_found,
          }
        }
        ChainAction::Copy {
          from,
          src,
          dest,
          options,
        } => {
          check_path(&src)?;
          check_path(&dest)?;
          secondary_input = Some(inputs.add(&from));
          let mut resolved_dest = resolve(dir, &dest);
          if dest.ends_with('/') && resolved_dest != "/" {
            resolved_dest.push('/');
          }
          FileActionKind::Copy {
            src: resolve(&from.meta.dir, &src),
            dest: resolved_dest,
            create_dest_path: options.create_dest_path,
            follow_symlinks: options.follow_symlinks,
            mode: options.mode,
          }
        }
      };

      actions.push(FileAction {
        input,
        secondary_input,
        output: (position == last).then_some(0),
        action: kind,
      });
    }

    Ok(self.file_node(actions, inputs, options))
  }

  fn file_node(&self, actions: Vec<FileAction>, inputs: InputSet, options: OpOptions) -> State {
    let node = Node {
      kind: NodeKind::File(FileNode {
        actions,
        inputs: inputs.outputs,
      }),
      platform: self.meta.platform.clone(),
      constraints: Constraints::default(),
      options,
    };
    State::from_node(node, 0, self.meta.clone())
  }
}

/// Layer `states` on top of each other, later states winning.
///
/// Merging nothing is scratch and merging one state is that state.
pub fn merge(states: &[State], options: OpOptions) -> State {
  match states {
    [] => State::default(),
    [single] => single.clone(),
    [first, ..] => {
      let mut inputs = InputSet::default();
      let merged = states.iter().map(|s| inputs.add(s)).collect();
      let action = FileAction {
        input: FileInput::Scratch,
        secondary_input: None,
        output: Some(0),
        action: FileActionKind::Merge { inputs: merged },
      };
      first.file_node(vec![action], inputs, options)
    }
  }
}

/// The changes that turn `lower` into `upper`.
pub fn diff(lower: &State, upper: &State, options: OpOptions) -> State {
  let mut inputs = InputSet::default();
  let lower_input = inputs.add(lower);
  let upper_input = inputs.add(upper);
  let action = FileAction {
    input: FileInput::Scratch,
    secondary_input: None,
    output: Some(0),
    action: FileActionKind::Diff {
      lower: lower_input,
      upper: upper_input,
    },
  };
  upper.file_node(vec![action], inputs, options)
}
