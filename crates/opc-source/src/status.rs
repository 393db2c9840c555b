//! OPC UA Status Codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-bit OPC UA status code. The two high bits encode severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const BAD_DECODING_ERROR: StatusCode = StatusCode(0x8007_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SERVICE_UNSUPPORTED: StatusCode = StatusCode(0x800B_0000);
    pub const BAD_NOTHING_TO_DO: StatusCode = StatusCode(0x800F_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_SUBSCRIPTION_ID_INVALID: StatusCode = StatusCode(0x8028_0000);
    pub const BAD_NODE_ID_INVALID: StatusCode = StatusCode(0x8033_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_ATTRIBUTE_ID_INVALID: StatusCode = StatusCode(0x8035_0000);
    pub const BAD_TOO_MANY_PUBLISH_REQUESTS: StatusCode = StatusCode(0x8078_0000);
    pub const BAD_NO_SUBSCRIPTION: StatusCode = StatusCode(0x8079_0000);
    pub const BAD_IDENTITY_TOKEN_INVALID: StatusCode = StatusCode(0x8020_0000);
    pub const BAD_TCP_ENDPOINT_URL_INVALID: StatusCode = StatusCode(0x8083_0000);

    const SEVERITY_MASK: u32 = 0xC000_0000;

    /// Check if the severity is Good
    pub fn is_good(&self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0
    }

    /// Check if the severity is Bad
    pub fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Symbolic name for well-known codes
    pub fn name(&self) -> Option<&'static str> {
        match *self {
            Self::GOOD => Some("Good"),
            Self::BAD_DECODING_ERROR => Some("BadDecodingError"),
            Self::BAD_TIMEOUT => Some("BadTimeout"),
            Self::BAD_SERVICE_UNSUPPORTED => Some("BadServiceUnsupported"),
            Self::BAD_NOTHING_TO_DO => Some("BadNothingToDo"),
            Self::BAD_SESSION_CLOSED => Some("BadSessionClosed"),
            Self::BAD_SUBSCRIPTION_ID_INVALID => Some("BadSubscriptionIdInvalid"),
            Self::BAD_NODE_ID_INVALID => Some("BadNodeIdInvalid"),
            Self::BAD_NODE_ID_UNKNOWN => Some("BadNodeIdUnknown"),
            Self::BAD_ATTRIBUTE_ID_INVALID => Some("BadAttributeIdInvalid"),
            Self::BAD_TOO_MANY_PUBLISH_REQUESTS => Some("BadTooManyPublishRequests"),
            Self::BAD_NO_SUBSCRIPTION => Some("BadNoSubscription"),
            Self::BAD_IDENTITY_TOKEN_INVALID => Some("BadIdentityTokenInvalid"),
            Self::BAD_TCP_ENDPOINT_URL_INVALID => Some("BadTcpEndpointUrlInvalid"),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08X})", name, self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(!StatusCode::GOOD.is_bad());
        assert!(StatusCode::BAD_NODE_ID_UNKNOWN.is_bad());
        assert!(!StatusCode::BAD_NODE_ID_UNKNOWN.is_good());
        // Uncertain severity is neither good nor bad
        let uncertain = StatusCode(0x4000_0000);
        assert!(!uncertain.is_good());
        assert!(!uncertain.is_bad());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StatusCode::BAD_NODE_ID_UNKNOWN.to_string(),
            "BadNodeIdUnknown (0x80340000)"
        );
        assert_eq!(StatusCode(0x8001_0000).to_string(), "0x80010000");
    }
}
