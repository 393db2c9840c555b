//! Subscription Source Error Types

use crate::status::StatusCode;
use thiserror::Error;

/// Errors raised by a subscription source
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Endpoint URL is not usable
    #[error("Invalid endpoint {0:?}: expected an opc.tcp:// URL")]
    InvalidEndpoint(String),

    /// Session could not be established
    #[error("Connection to {endpoint} refused: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    /// Operation attempted on a closed session
    #[error("Session is closed")]
    SessionClosed,

    /// Server rejected the subscription
    #[error("Subscription could not be created: {0}")]
    SubscriptionFailed(String),

    /// A service request completed with a bad status
    #[error("{service} request failed with {status}")]
    BadStatus {
        service: &'static str,
        status: StatusCode,
    },

    /// Delivery-level error carried by a publish notification
    #[error("Publish error: {0}")]
    Publish(String),

    /// Socket failure or the server dropped the connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer sent something that is not valid UA TCP / binary encoding
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors while parsing a textual node id
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeIdError {
    /// Input was empty
    #[error("Node id is empty")]
    Empty,

    /// Namespace index is not a u16
    #[error("Invalid namespace index {0:?}")]
    InvalidNamespace(String),

    /// Identifier type prefix is not one of i, s, g, b
    #[error("Unknown identifier type in {0:?}")]
    UnknownIdentifierType(String),

    /// Numeric identifier does not fit a u32
    #[error("Invalid numeric identifier {0:?}")]
    InvalidNumeric(String),

    /// GUID identifier is malformed
    #[error("Invalid GUID identifier {0:?}")]
    InvalidGuid(String),

    /// Identifier value is missing
    #[error("Missing identifier value in {0:?}")]
    MissingValue(String),
}
