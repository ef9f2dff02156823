//! Type-safe telescope identifier.
//!
//! [`TelescopeId`] is a newtype around the operator-assigned name of a
//! telescope. The same id addresses a mount whether it is owned by this
//! gateway or by a federated peer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for a telescope mount.
///
/// Used as the key of the local client registry, the routing key for
/// control commands, the federation endpoint path segment, and the key of
/// every per-connection subscription table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelescopeId(String);

impl TelescopeId {
    /// Creates a `TelescopeId` from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TelescopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TelescopeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TelescopeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for TelescopeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_plain_string() {
        let id = TelescopeId::new("seestar-north");
        let Ok(json) = serde_json::to_string(&id) else {
            panic!("serialization failed");
        };
        assert_eq!(json, "\"seestar-north\"");
    }

    #[test]
    fn display_matches_inner() {
        let id = TelescopeId::from("T1");
        assert_eq!(format!("{id}"), "T1");
        assert_eq!(id.as_str(), "T1");
    }

    #[test]
    fn optional_id_deserializes_from_null() {
        let Ok(id) = serde_json::from_str::<Option<TelescopeId>>("null") else {
            panic!("deserialization failed");
        };
        assert!(id.is_none());
    }
}
