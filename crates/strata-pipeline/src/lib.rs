//! Strata pipeline builder
//!
//! Describe a build as a chain of immutable [`State`] values and flatten it
//! into a digest-addressed [`strata_op::Definition`] with [`State::marshal`].
//!
//! ```ignore
//! use strata_pipeline::{MarshalOptions, RunOptions, image, mkdir};
//!
//! let built = image("rust:1")
//!   .dir("/src")
//!   .run(RunOptions::shell("cargo build --release"))
//!   .root();
//! let out = built.file(mkdir("/dist", 0o755, true))?;
//! let definition = out.marshal(&MarshalOptions::new())?;
//! ```

mod error;
mod exec;
mod file;
mod marshal;
mod options;
mod source;
mod state;

pub use error::BuildError;
pub use exec::{ExecState, MountOptions, RunOptions};
pub use file::{CopyOptions, FileChain, copy, diff, merge, mkdir, mkfile, rm};
pub use marshal::marshal;
pub use options::{MarshalOptions, OpOptions};
pub use source::{
  ATTR_GIT_FULL_URL, ATTR_HTTP_CHECKSUM, ATTR_HTTP_FILENAME, ATTR_KEEP_GIT_DIR, ATTR_LOCAL_EXCLUDE,
  ATTR_LOCAL_INCLUDE, Source, git, http, image, local, normalize_image_reference, oci_layout,
};
pub use state::{State, build, scratch};
