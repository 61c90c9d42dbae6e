use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default `PATH` for non-Windows platforms.
pub const DEFAULT_PATH_ENV_UNIX: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default `PATH` for Windows platforms.
pub const DEFAULT_PATH_ENV_WINDOWS: &str = "c:\\Windows\\System32;c:\\Windows";

/// Target platform of an op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
  pub os: String,
  pub architecture: String,
  #[serde(default)]
  pub variant: Option<String>,
  #[serde(default)]
  pub os_version: Option<String>,
  #[serde(default)]
  pub os_features: Vec<String>,
}

impl Platform {
  pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
    Self {
      os: os.into(),
      architecture: architecture.into(),
      variant: None,
      os_version: None,
      os_features: Vec::new(),
    }
  }

  pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
    self.variant = Some(variant.into());
    self
  }

  pub fn with_os_version(mut self, version: impl Into<String>) -> Self {
    self.os_version = Some(version.into());
    self
  }

  pub fn linux_amd64() -> Self {
    Self::new("linux", "amd64")
  }

  pub fn linux_arm64() -> Self {
    Self::new("linux", "arm64")
  }

  pub fn linux_armhf() -> Self {
    Self::new("linux", "arm").with_variant("v7")
  }

  pub fn windows_amd64() -> Self {
    Self::new("windows", "amd64")
  }

  /// The platform this process runs on, in OCI naming.
  pub fn host() -> Self {
    let os = match std::env::consts::OS {
      "macos" => "darwin",
      other => other,
    };
    let architecture = arch_name(std::env::consts::ARCH, cfg!(target_endian = "little"));
    Self::new(os, architecture)
  }

  pub fn is_windows(&self) -> bool {
    self.os.eq_ignore_ascii_case("windows")
  }

  /// `PATH` an executor would use when the op doesn't set one.
  pub fn default_path_env(&self) -> &'static str {
    default_path_env(&self.os)
  }
}

/// Default `PATH` for an OS name.
pub fn default_path_env(os: &str) -> &'static str {
  if os.eq_ignore_ascii_case("windows") {
    DEFAULT_PATH_ENV_WINDOWS
  } else {
    DEFAULT_PATH_ENV_UNIX
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.os, self.architecture)?;
    if let Some(variant) = &self.variant {
      write!(f, "/{}", variant)?;
    }
    Ok(())
  }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid platform {0:?}, expected os/arch[/variant]")]
pub struct ParsePlatformError(String);

impl FromStr for Platform {
  type Err = ParsePlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
      [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
      [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
        Ok(Self::new(*os, *arch).with_variant(*variant))
      }
      _ => Err(ParsePlatformError(s.to_string())),
    }
  }
}

/// Map a Rust target architecture onto its OCI name.
fn arch_name(arch: &str, little_endian: bool) -> &str {
  match arch {
    "x86_64" => "amd64",
    "aarch64" => "arm64",
    "x86" => "386",
    "powerpc64" if little_endian => "ppc64le",
    "powerpc64" => "ppc64",
    "mips64" if little_endian => "mips64le",
    other => other,
  }
}
