//! Delivery Sink Trait

use crate::error::DeliveryError;
use async_trait::async_trait;
use std::fmt;

/// Public broadcast destination, addressed as `@name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    name: String,
}

impl Destination {
    /// Destination for a channel name; a leading `@` is ignored
    pub fn channel(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = name.trim().trim_start_matches('@').to_string();
        Self { name }
    }

    /// Channel name without the address marker
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address with the `@` marker
    pub fn address(&self) -> String {
        format!("@{}", self.name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name)
    }
}

/// Messaging platform that alerts are sent through
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Send one text message. No retries.
    async fn send(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<T: DeliverySink + ?Sized> DeliverySink for Box<T> {
    async fn send(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError> {
        (**self).send(destination, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_address() {
        let dest = Destination::channel("plant_alerts");
        assert_eq!(dest.name(), "plant_alerts");
        assert_eq!(dest.address(), "@plant_alerts");
        assert_eq!(dest.to_string(), "@plant_alerts");
    }

    #[test]
    fn test_marker_not_doubled() {
        assert_eq!(Destination::channel("@plant_alerts").address(), "@plant_alerts");
    }
}
