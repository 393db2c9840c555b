//! OPC UA Subscription Source
//!
//! This crate models the client side of an OPC UA data-change
//! subscription: node identifiers, runtime variants, publish notifications
//! and the session/subscription lifecycle. [`UaTcpSource`] talks to real
//! servers over `opc.tcp://`; the in-process simulated endpoint publishes a
//! random process variable for local runs and tests.

mod channel;
mod client;
mod codec;
mod error;
mod node;
mod notification;
mod remote;
mod services;
mod sim;
mod status;
mod variant;

pub use client::{
    MonitoredItemCreateRequest, MonitoredItemCreateResult, Session, Subscription,
    SubscriptionParameters, SubscriptionSource, DEFAULT_SUBSCRIPTION_INTERVAL,
};
pub use error::{NodeIdError, SourceError};
pub use node::{Identifier, NodeId};
pub use remote::{UaTcpSession, UaTcpSource, UaTcpSubscription, DEFAULT_CONNECT_TIMEOUT};
pub use notification::{
    DataChangeNotification, DataValue, MonitoredItemNotification, NotificationPayload,
    PublishNotification,
};
pub use sim::{
    SimulatedFailure, SimulatedSession, SimulatedSource, SimulatedSubscription, INDEX_NODE,
};
pub use status::StatusCode;
pub use variant::{ConversionError, Variant};

/// Node attribute identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AttributeId {
    /// Node id attribute
    NodeId = 1,
    /// Browse name attribute
    BrowseName = 3,
    /// Display name attribute
    DisplayName = 4,
    /// Value attribute of a variable node
    Value = 13,
}

/// Which timestamps the server attaches to each data value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampsToReturn {
    /// Source timestamp only
    Source,
    /// Server timestamp only
    Server,
    /// Both source and server timestamps
    #[default]
    Both,
    /// No timestamps
    Neither,
}
