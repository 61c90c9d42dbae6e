//! Strata op model
//!
//! The data model of a content-addressed build graph:
//! - [`Op`]: one unit of work (source fetch, exec, file actions, nested build)
//! - [`Digest`]: the canonical content hash that identifies an op
//! - [`Definition`]: a flattened graph of ops keyed by digest, plus metadata
//! - [`CapSet`]: capabilities a graph producer and a solver negotiate over
//! - [`recompute`]: digest rewriting after an op changes post hoc

pub mod caps;
mod definition;
mod digest;
mod error;
mod op;
mod platform;
mod rewrite;

pub use caps::{Cap, CapError, CapSet};
pub use definition::{CUSTOM_NAME_KEY, Definition, OpMetadata, SourceLocation};
pub use digest::{Digest, digest, encode};
pub use error::OpError;
pub use op::{
  BuildOp, CacheSharing, Constraints, DOCKER_IMAGE_SCHEME, ExecMeta, ExecOp, FileAction,
  FileActionKind, FileInput, FileOp, GIT_SCHEME, HTTP_SCHEME, HTTPS_SCHEME, Input, InputIndex,
  LOCAL_SCHEME, Mount, MountType, NetMode, OCI_LAYOUT_SCHEME, Op, OpKind, OutputIndex,
  ResourceLimits, SecurityMode, SourceKind, SourceOp,
};
pub use platform::{
  DEFAULT_PATH_ENV_UNIX, DEFAULT_PATH_ENV_WINDOWS, ParsePlatformError, Platform, default_path_env,
};
pub use rewrite::{RewriteError, RewriteTable, propagate, recompute, replace, topological_order};
