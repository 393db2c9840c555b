//! Delivery Error Types

use thiserror::Error;

/// Errors from a delivery sink
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// No credential was supplied
    #[error("Delivery credential is missing")]
    MissingCredential,

    /// Credential was rejected
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    /// Platform answered with an error
    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    /// Request could not be completed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Broker refused or dropped a publish
    #[error("Publish failed: {0}")]
    Publish(String),
}
