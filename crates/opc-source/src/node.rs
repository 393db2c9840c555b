//! Node Identifiers
//!
//! Parses the standard textual node id notation, e.g. `ns=1;s=index`,
//! `i=2258` or `ns=2;g=09087e75-8e5e-499b-954f-f2a9603db28a`.

use crate::error::NodeIdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier part of a node id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    /// `i=` numeric identifier
    Numeric(u32),
    /// `s=` string identifier
    String(String),
    /// `g=` GUID identifier
    Guid(Uuid),
    /// `b=` opaque identifier, kept in its base64 text form
    Opaque(String),
}

/// Address of a node in the server's address space
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index (0 is the standard namespace)
    pub namespace: u16,
    /// Identifier within the namespace
    pub identifier: Identifier,
}

impl NodeId {
    /// Create a numeric node id
    pub fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// Create a string node id
    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(value.into()),
        }
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NodeIdError::Empty);
        }

        let (namespace, rest) = match s.strip_prefix("ns=") {
            Some(tail) => {
                let (ns, rest) = tail
                    .split_once(';')
                    .ok_or_else(|| NodeIdError::MissingValue(s.to_string()))?;
                let ns = ns
                    .parse::<u16>()
                    .map_err(|_| NodeIdError::InvalidNamespace(ns.to_string()))?;
                (ns, rest)
            }
            None => (0, s),
        };

        let (kind, value) = rest
            .split_once('=')
            .ok_or_else(|| NodeIdError::UnknownIdentifierType(s.to_string()))?;
        if value.is_empty() {
            return Err(NodeIdError::MissingValue(s.to_string()));
        }

        let identifier = match kind {
            "i" => Identifier::Numeric(
                value
                    .parse()
                    .map_err(|_| NodeIdError::InvalidNumeric(value.to_string()))?,
            ),
            "s" => Identifier::String(value.to_string()),
            "g" => Identifier::Guid(
                Uuid::parse_str(value).map_err(|_| NodeIdError::InvalidGuid(value.to_string()))?,
            ),
            "b" => Identifier::Opaque(value.to_string()),
            _ => return Err(NodeIdError::UnknownIdentifierType(s.to_string())),
        };

        Ok(Self {
            namespace,
            identifier,
        })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "i={}", v),
            Identifier::String(v) => write!(f, "s={}", v),
            Identifier::Guid(v) => write!(f, "g={}", v),
            Identifier::Opaque(v) => write!(f, "b={}", v),
        }
    }
}
