use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{PolicyError, PolicyResult};

// ---------------------------------------------------------------------------
// Operation: the capability being asked about
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decision: outcome of one evaluation
// ---------------------------------------------------------------------------

/// Outcome of evaluating one entry's sidecar policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The decision field was `true`.
    Permit,
    /// The decision field was `false`.
    Deny,
    /// No sidecar document could be opened for the entry.
    NoPolicy,
    /// Evaluation did not produce a usable answer. Treated as deny.
    Undecided(String),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Permit => write!(f, "PERMIT"),
            Decision::Deny => write!(f, "DENY"),
            Decision::NoPolicy => write!(f, "NO_POLICY"),
            Decision::Undecided(reason) => write!(f, "UNDECIDED: {}", reason),
        }
    }
}

/// Visibility of entries that have no sidecar policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPolicy {
    #[default]
    Show,
    Hide,
}

// ---------------------------------------------------------------------------
// PolicyConfig: the `[policy]` section
// ---------------------------------------------------------------------------

/// Adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Name prefix that turns an entry name into its sidecar name.
    #[serde(default = "default_sidecar_prefix")]
    pub sidecar_prefix: String,

    #[serde(default)]
    pub missing_policy: MissingPolicy,

    /// Upper bound on one engine call; past it the entry is undecided.
    #[serde(default = "default_evaluation_timeout_ms")]
    pub evaluation_timeout_ms: u64,

    /// Boolean field of the decision document granting read.
    #[serde(default = "default_read_field")]
    pub read_field: String,

    /// Boolean field of the decision document granting write.
    #[serde(default = "default_write_field")]
    pub write_field: String,
}

fn default_sidecar_prefix() -> String {
    ".policy-".to_string()
}

fn default_evaluation_timeout_ms() -> u64 {
    2000
}

fn default_read_field() -> String {
    "R".to_string()
}

fn default_write_field() -> String {
    "W".to_string()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            sidecar_prefix: default_sidecar_prefix(),
            missing_policy: MissingPolicy::default(),
            evaluation_timeout_ms: default_evaluation_timeout_ms(),
            read_field: default_read_field(),
            write_field: default_write_field(),
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> PolicyResult<()> {
        if self.sidecar_prefix.is_empty() {
            return Err(PolicyError::ValidationError(
                "sidecar_prefix must not be empty".into(),
            ));
        }
        if self.sidecar_prefix.contains('/') {
            return Err(PolicyError::ValidationError(
                "sidecar_prefix must not contain '/'".into(),
            ));
        }
        if self.evaluation_timeout_ms == 0 {
            return Err(PolicyError::ValidationError(
                "evaluation_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.read_field.is_empty() || self.write_field.is_empty() {
            return Err(PolicyError::ValidationError(
                "decision field names must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }

    /// Decision document field consulted for `op`.
    pub fn field_for(&self, op: Operation) -> &str {
        match op {
            Operation::Read => &self.read_field,
            Operation::Write => &self.write_field,
        }
    }
}
