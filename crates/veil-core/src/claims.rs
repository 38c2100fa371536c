use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, CoreResult};

/// Operating-system process id.
pub type Pid = u32;

/// Current time in whole seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// IdentityClaims: the authenticated principal carried in a signed token
// ---------------------------------------------------------------------------

/// Claims describing an authenticated principal.
///
/// Immutable once signed: a changed identity needs a freshly signed token.
/// Absent optional fields are omitted from the JSON form so that policy
/// documents only ever see what the issuer actually asserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Expiration instant, in seconds (not nanoseconds) since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Principal identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Name of the issuer key that signed these claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// Process the identity should be bound to by the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,

    /// Arbitrary attributes consulted by policy documents.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, BTreeSet<String>>,
}

impl IdentityClaims {
    /// Parse claims from a JSON document.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidClaims(e.to_string()))
    }

    /// Re-interpret a generic claim set as typed claims.
    pub fn from_value(value: serde_json::Value) -> CoreResult<Self> {
        serde_json::from_value(value).map_err(|e| CoreError::InvalidClaims(e.to_string()))
    }

    /// Generic JSON claim set for signing or for a policy input document.
    pub fn to_value(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    pub fn issuer(&self) -> Option<&str> {
        self.iss.as_deref()
    }

    /// True when `now` is past the expiration instant. Claims without an
    /// expiration never expire here.
    pub fn is_expired_at(&self, now: i64) -> bool {
        matches!(self.exp, Some(exp) if now > exp)
    }

    /// Whether attribute `name` holds `value`.
    pub fn has_value(&self, name: &str, value: &str) -> bool {
        self.values
            .get(name)
            .map(|set| set.contains(value))
            .unwrap_or(false)
    }
}
