//! Document identifiers
//!
//! Ids are opaque strings. Fresh ids are random UUIDs, but any string a
//! backend hands us (or that appears in a `subdocs` map) is accepted as is.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a root document or sub-document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Create a new random document ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DocId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for DocId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for DocId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for DocId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique() {
        assert_ne!(DocId::new(), DocId::new());
    }

    #[test]
    fn test_string_conversions() {
        let id = DocId::from("workspace-root");
        assert_eq!(id.as_str(), "workspace-root");
        assert_eq!(id.to_string(), "workspace-root");
        assert_eq!(id, "workspace-root");
        assert_eq!(DocId::from(String::from("a")), DocId::from("a"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = DocId::from("page-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"page-1\"");
    }
}
