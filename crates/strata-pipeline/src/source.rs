//! Source states: images, git repositories, local contexts, HTTP files and
//! OCI layouts.

use strata_op::{
  Constraints, DOCKER_IMAGE_SCHEME, GIT_SCHEME, LOCAL_SCHEME, OCI_LAYOUT_SCHEME, Platform, SourceOp,
};

use crate::options::OpOptions;
use crate::state::{Node, NodeKind, State, StateMeta};

pub const ATTR_KEEP_GIT_DIR: &str = "git.keepgitdir";
pub const ATTR_GIT_FULL_URL: &str = "git.fullurl";
pub const ATTR_LOCAL_INCLUDE: &str = "local.includepattern";
pub const ATTR_LOCAL_EXCLUDE: &str = "local.excludepatterns";
pub const ATTR_HTTP_FILENAME: &str = "http.filename";
pub const ATTR_HTTP_CHECKSUM: &str = "http.checksum";

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A source op being configured.
#[derive(Debug, Clone)]
pub struct Source {
  op: SourceOp,
  platform: Option<Platform>,
  options: OpOptions,
}

impl Source {
  fn new(identifier: String) -> Self {
    Self {
      op: SourceOp::new(identifier),
      platform: None,
      options: OpOptions::default(),
    }
  }

  /// A container image. Short references are expanded, so `alpine` becomes
  /// `docker.io/library/alpine:latest`.
  pub fn image(reference: &str) -> Self {
    Self::new(format!(
      "{}://{}",
      DOCKER_IMAGE_SCHEME,
      normalize_image_reference(reference)
    ))
  }

  /// A git repository at `reference` (branch, tag or commit).
  pub fn git(remote: &str, reference: &str) -> Self {
    let (stripped, had_scheme) = match remote.split_once("://") {
      Some((_, rest)) => (rest, true),
      None => (remote, false),
    };
    let mut identifier = format!("{}://{}", GIT_SCHEME, stripped);
    if !reference.is_empty() {
      identifier.push('#');
      identifier.push_str(reference);
    }
    let source = Self::new(identifier);
    if had_scheme {
      source.attr(ATTR_GIT_FULL_URL, remote)
    } else {
      source
    }
  }

  /// A named local context supplied by the client.
  pub fn local(name: &str) -> Self {
    Self::new(format!("{}://{}", LOCAL_SCHEME, name))
  }

  /// A file fetched over HTTP(S). The URL is the identifier.
  pub fn http(url: &str) -> Self {
    Self::new(url.to_string())
  }

  /// An image in an OCI layout store, addressed by manifest digest.
  pub fn oci_layout(store: &str, manifest: &str) -> Self {
    Self::new(format!("{}://{}@{}", OCI_LAYOUT_SCHEME, store, manifest))
  }

  pub fn attr(mut self, key: &str, value: &str) -> Self {
    self.op.attrs.insert(key.to_string(), value.to_string());
    self
  }

  pub fn keep_git_dir(self) -> Self {
    self.attr(ATTR_KEEP_GIT_DIR, "true")
  }

  pub fn include_patterns(self, patterns: &[&str]) -> Self {
    let encoded = serde_json::to_string(patterns).unwrap_or_default();
    self.attr(ATTR_LOCAL_INCLUDE, &encoded)
  }

  pub fn exclude_patterns(self, patterns: &[&str]) -> Self {
    let encoded = serde_json::to_string(patterns).unwrap_or_default();
    self.attr(ATTR_LOCAL_EXCLUDE, &encoded)
  }

  pub fn filename(self, name: &str) -> Self {
    self.attr(ATTR_HTTP_FILENAME, name)
  }

  pub fn checksum(self, digest: &str) -> Self {
    self.attr(ATTR_HTTP_CHECKSUM, digest)
  }

  /// Fetch for a specific platform. Ops built on this source inherit it.
  pub fn platform(mut self, platform: Platform) -> Self {
    self.platform = Some(platform);
    self
  }

  pub fn options(mut self, options: OpOptions) -> Self {
    self.options = options;
    self
  }

  pub fn state(self) -> State {
    let meta = StateMeta {
      platform: self.platform.clone(),
      ..StateMeta::default()
    };
    let node = Node {
      kind: NodeKind::Source(self.op),
      platform: self.platform,
      constraints: Constraints::default(),
      options: self.options,
    };
    State::from_node(node, 0, meta)
  }
}

impl From<Source> for State {
  fn from(source: Source) -> Self {
    source.state()
  }
}

pub fn image(reference: &str) -> State {
  Source::image(reference).state()
}

pub fn git(remote: &str, reference: &str) -> State {
  Source::git(remote, reference).state()
}

pub fn local(name: &str) -> State {
  Source::local(name).state()
}

pub fn http(url: &str) -> State {
  Source::http(url).state()
}

pub fn oci_layout(store: &str, manifest: &str) -> State {
  Source::oci_layout(store, manifest).state()
}

/// Expand an image reference to `registry/repository[:tag][@digest]`.
///
/// An empty reference stays empty and is rejected at marshal.
pub fn normalize_image_reference(reference: &str) -> String {
  if reference.is_empty() {
    return String::new();
  }

  let (name, digest) = match reference.split_once('@') {
    Some((name, digest)) => (name, Some(digest)),
    None => (reference, None),
  };

  let (domain, path) = match name.split_once('/') {
    Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
      (first, rest.to_string())
    }
    _ => (DEFAULT_REGISTRY, name.to_string()),
  };

  let path = if domain == DEFAULT_REGISTRY && !path.contains('/') {
    format!("library/{}", path)
  } else {
    path
  };

  let last_segment = path.rsplit('/').next().unwrap_or(&path);
  let has_tag = last_segment.contains(':');

  let mut normalized = format!("{}/{}", domain, path);
  if !has_tag && digest.is_none() {
    normalized.push(':');
    normalized.push_str(DEFAULT_TAG);
  }
  if let Some(digest) = digest {
    normalized.push('@');
    normalized.push_str(digest);
  }
  normalized
}
