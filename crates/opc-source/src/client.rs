//! Session and Subscription Traits
//!
//! The monitoring pipeline only talks to a data source through these
//! traits, so the wire transport can be swapped without touching it.

use crate::error::SourceError;
use crate::node::NodeId;
use crate::notification::PublishNotification;
use crate::status::StatusCode;
use crate::{AttributeId, TimestampsToReturn};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default publishing interval for new subscriptions
pub const DEFAULT_SUBSCRIPTION_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters for creating a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionParameters {
    /// Publishing interval
    pub interval: Duration,
    /// Publish cycles without a client request before the server drops the subscription
    pub lifetime_count: u32,
    /// Empty publish cycles before a keep-alive is sent
    pub max_keep_alive_count: u32,
    /// Upper bound on notifications per publish response
    pub max_notifications_per_publish: u32,
    /// Relative priority among the session's subscriptions
    pub priority: u8,
}

impl Default for SubscriptionParameters {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SUBSCRIPTION_INTERVAL,
            lifetime_count: 10_000,
            max_keep_alive_count: 3_000,
            max_notifications_per_publish: 10_000,
            priority: 0,
        }
    }
}

/// Request to monitor one attribute of one node
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateRequest {
    pub node_id: NodeId,
    pub attribute_id: AttributeId,
    /// Handle echoed back in every notification for this item
    pub client_handle: u32,
    /// Sampling interval in milliseconds (0 = as fast as possible)
    pub sampling_interval: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl MonitoredItemCreateRequest {
    /// Request with the usual defaults: fastest sampling, queue of one
    pub fn with_defaults(node_id: NodeId, attribute_id: AttributeId, client_handle: u32) -> Self {
        Self {
            node_id,
            attribute_id,
            client_handle,
            sampling_interval: 0.0,
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

/// Server acknowledgement for one monitored item request
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateResult {
    pub status: StatusCode,
    pub monitored_item_id: u32,
    /// Sampling interval the server actually uses (ms)
    pub revised_sampling_interval: f64,
}

/// Entry point of a data source
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    type Session: Session;

    /// Establish a session with the endpoint
    async fn connect(&self, endpoint: &str) -> Result<Self::Session, SourceError>;
}

/// An open session with a data source
#[async_trait]
pub trait Session: Send + Sync {
    type Subscription: Subscription;

    /// Create a subscription delivering its notifications to `notify`
    async fn subscribe(
        &mut self,
        params: SubscriptionParameters,
        notify: mpsc::Sender<PublishNotification>,
    ) -> Result<Self::Subscription, SourceError>;

    /// Close the session
    async fn close(&mut self) -> Result<(), SourceError>;
}

/// A live subscription
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Server-assigned subscription id
    fn id(&self) -> u32;

    /// Register monitored items; one result per request, in order
    async fn monitor(
        &mut self,
        timestamps: TimestampsToReturn,
        requests: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemCreateResult>, SourceError>;

    /// Start the background loop that feeds the notification channel
    fn start(&mut self) -> Result<(), SourceError>;

    /// Stop the notification loop and delete the subscription
    async fn cancel(&mut self) -> Result<(), SourceError>;
}
