//! Canonical encoding and content digests.
//!
//! An op is encoded as compact JSON. Struct fields are emitted in declaration
//! order and every map in the op model is a `BTreeMap`, so the byte stream is a
//! pure function of the op's contents. The digest is the SHA-256 of that
//! stream, rendered as `sha256:<hex>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::OpError;
use crate::op::Op;

const ALGORITHM: &str = "sha256";
const HEX_LEN: usize = 64;

/// Content identifier of an op.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
  /// Hash raw bytes.
  pub fn from_bytes(bytes: &[u8]) -> Self {
    Self(format!("{}:{:x}", ALGORITHM, Sha256::digest(bytes)))
  }

  /// Parse an `algorithm:hex` string.
  pub fn parse(value: &str) -> Result<Self, OpError> {
    let invalid = |message: &str| OpError::InvalidDigest {
      value: value.to_string(),
      message: message.to_string(),
    };

    let (algorithm, hex) = value
      .split_once(':')
      .ok_or_else(|| invalid("missing algorithm prefix"))?;
    if algorithm != ALGORITHM {
      return Err(invalid("unsupported algorithm"));
    }
    if hex.len() != HEX_LEN {
      return Err(invalid("wrong length"));
    }
    if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
      return Err(invalid("not lowercase hex"));
    }
    Ok(Self(value.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The hex part without the algorithm prefix.
  pub fn hex(&self) -> &str {
    self
      .0
      .split_once(':')
      .map(|(_, hex)| hex)
      .unwrap_or(&self.0)
  }

  /// First 12 hex characters, for logs.
  pub fn short(&self) -> &str {
    let hex = self.hex();
    &hex[..hex.len().min(12)]
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for Digest {
  type Err = OpError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl TryFrom<String> for Digest {
  type Error = OpError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<Digest> for String {
  fn from(digest: Digest) -> Self {
    digest.0
  }
}

/// Encode an op into its canonical byte form.
pub fn encode(op: &Op) -> Result<Vec<u8>, OpError> {
  Ok(serde_json::to_vec(op)?)
}

/// Compute the content digest of an op.
pub fn digest(op: &Op) -> Result<Digest, OpError> {
  let bytes = encode(op)?;
  Ok(Digest::from_bytes(&bytes))
}
