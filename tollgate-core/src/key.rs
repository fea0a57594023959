//! Scoped storage keys.
//!
//! Every key written to the store goes through [`KeyBuilder`], which hashes
//! the operation identity, the scope and the raw key into a fixed-length
//! digest under a namespace prefix. Raw client input never reaches the store
//! verbatim, and two callers presenting the same literal key under
//! [`Scope::PerCaller`] land on different storage keys.

use crate::constants::{ANONYMOUS_CALLER, MAX_KEY_PREFIX_LEN, SCOPED_DIGEST_HEX_LEN};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Suffix appended to a scoped key to form its in-flight lock key.
const LOCK_SUFFIX: &str = ":lock";

/// Whether a key is shared by everyone or partitioned per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Keys are partitioned by caller identity.
    #[default]
    PerCaller,
    /// Keys are shared across all callers.
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::PerCaller => "per_caller",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per_caller" | "per-caller" | "user" => Ok(Scope::PerCaller),
            "global" => Ok(Scope::Global),
            other => Err(ConfigError::InvalidValue {
                field: "scope".to_string(),
                value: other.to_string(),
                reason: "expected 'per_caller' or 'global'".to_string(),
            }),
        }
    }
}

/// A namespaced, bounded-length storage key produced by [`KeyBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedKey(String);

impl ScopedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The companion key marking an in-flight execution.
    pub fn lock_key(&self) -> String {
        format!("{}{}", self.0, LOCK_SUFFIX)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScopedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic scoped-key construction under a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// Create a builder for `prefix`. The prefix must be non-empty, at most
    /// 64 characters, and free of whitespace.
    pub fn new(prefix: impl Into<String>) -> Result<Self, ConfigError> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build the storage key for `raw_key` under `operation` and `scope`.
    ///
    /// `caller` is only consulted for [`Scope::PerCaller`]; an absent caller
    /// is treated as the anonymous identity.
    pub fn build(
        &self,
        operation: &str,
        scope: Scope,
        caller: Option<&str>,
        raw_key: &str,
    ) -> ScopedKey {
        let mut hasher = Sha256::new();
        hash_segment(&mut hasher, operation.as_bytes());
        match scope {
            Scope::Global => hash_segment(&mut hasher, b"global"),
            Scope::PerCaller => {
                let caller = caller.filter(|c| !c.is_empty()).unwrap_or(ANONYMOUS_CALLER);
                hash_segment(&mut hasher, b"caller");
                hash_segment(&mut hasher, caller.as_bytes());
            }
        }
        hash_segment(&mut hasher, raw_key.as_bytes());

        let digest = hex::encode(hasher.finalize());
        ScopedKey(format!(
            "{}:{}",
            self.prefix,
            &digest[..SCOPED_DIGEST_HEX_LEN]
        ))
    }
}

/// Length-prefix each segment so boundaries between segments cannot be shifted.
fn hash_segment(hasher: &mut Sha256, segment: &[u8]) {
    hasher.update((segment.len() as u64).to_be_bytes());
    hasher.update(segment);
}

pub(crate) fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        field: "key prefix".to_string(),
        value: prefix.to_string(),
        reason: reason.to_string(),
    };

    if prefix.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if prefix.len() > MAX_KEY_PREFIX_LEN {
        return Err(invalid("must be at most 64 characters"));
    }
    if prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("must not contain whitespace"));
    }
    Ok(())
}
