//! Collection namespaces
//!
//! A namespace names one collection as `<db>.<collection>`. Validation rules
//! are enforced at every API boundary: both parts non-empty, no NUL bytes,
//! `$` only in reserved system collections.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Prefix of reserved system collections within a database.
pub const SYSTEM_PREFIX: &str = "system.";

/// A fully qualified collection name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamespaceString {
    /// Database part.
    pub db: String,
    /// Collection part.
    pub coll: String,
}

impl NamespaceString {
    /// Create a namespace after validating both parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self, NamespaceError> {
        let ns = Self {
            db: db.into(),
            coll: coll.into(),
        };
        ns.validate()?;
        Ok(ns)
    }

    /// Parse a `db.coll` string. The first dot splits; further dots belong to
    /// the collection part.
    pub fn parse(s: &str) -> Result<Self, NamespaceError> {
        match s.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Err(NamespaceError::MissingDot(s.to_string())),
        }
    }

    /// True for reserved `system.*` collections.
    pub fn is_system(&self) -> bool {
        self.coll.starts_with(SYSTEM_PREFIX)
    }

    fn validate(&self) -> Result<(), NamespaceError> {
        if self.db.is_empty() || self.coll.is_empty() {
            return Err(NamespaceError::EmptyPart(self.to_string()));
        }
        if self.db.contains('\x00') || self.coll.contains('\x00') {
            return Err(NamespaceError::ContainsNul);
        }
        if self.db.contains('.') || self.db.contains('$') {
            return Err(NamespaceError::InvalidDbName(self.db.clone()));
        }
        if self.coll.contains('$') && !self.is_system() {
            return Err(NamespaceError::InvalidCollectionName(self.coll.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for NamespaceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Namespace validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NamespaceError {
    /// No dot separator present.
    #[error("namespace missing '.' separator: {0}")]
    MissingDot(String),
    /// Database or collection part empty.
    #[error("namespace has empty part: {0}")]
    EmptyPart(String),
    /// NUL byte in a part.
    #[error("namespace contains NUL byte")]
    ContainsNul,
    /// Bad database name.
    #[error("invalid database name: {0}")]
    InvalidDbName(String),
    /// Bad collection name.
    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),
}
