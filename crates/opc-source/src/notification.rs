//! Publish Notifications
//!
//! A subscription delivers one [`PublishNotification`] per publish cycle.
//! The payload is a tagged variant so consumers dispatch on its shape.

use crate::error::SourceError;
use crate::status::StatusCode;
use crate::variant::Variant;
use chrono::{DateTime, Utc};

/// A value sample with its quality and timestamps
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Good-quality sample stamped with the current time on both clocks
    pub fn now(value: impl Into<Variant>) -> Self {
        let now = Utc::now();
        Self {
            value: value.into(),
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }
}

/// A changed value for one monitored item
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemNotification {
    /// Handle chosen by the client when the item was created
    pub client_handle: u32,
    pub value: DataValue,
}

/// Batch of item changes delivered in one publish cycle
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataChangeNotification {
    pub monitored_items: Vec<MonitoredItemNotification>,
}

impl DataChangeNotification {
    /// Build a batch of good-quality samples for one client handle
    pub fn from_values(client_handle: u32, values: impl IntoIterator<Item = Variant>) -> Self {
        Self {
            monitored_items: values
                .into_iter()
                .map(|value| MonitoredItemNotification {
                    client_handle,
                    value: DataValue::now(value),
                })
                .collect(),
        }
    }
}

/// Shape of a publish notification body
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPayload {
    /// Data changes for monitored items
    DataChange(DataChangeNotification),
    /// Anything else (events, status changes, keep-alives)
    Unrecognized { type_name: String },
}

/// One delivery from the subscription's notification feed
#[derive(Debug, Clone)]
pub struct PublishNotification {
    pub subscription_id: u32,
    /// Delivery-level error; when set the payload carries no usable data
    pub error: Option<SourceError>,
    pub payload: NotificationPayload,
}

impl PublishNotification {
    /// Data-change notification
    pub fn data_change(subscription_id: u32, batch: DataChangeNotification) -> Self {
        Self {
            subscription_id,
            error: None,
            payload: NotificationPayload::DataChange(batch),
        }
    }

    /// Notification carrying a delivery error
    pub fn failed(subscription_id: u32, error: SourceError) -> Self {
        Self {
            subscription_id,
            error: Some(error),
            payload: NotificationPayload::DataChange(DataChangeNotification::default()),
        }
    }

    /// Notification whose payload shape is not a data change
    pub fn unrecognized(subscription_id: u32, type_name: impl Into<String>) -> Self {
        Self {
            subscription_id,
            error: None,
            payload: NotificationPayload::Unrecognized {
                type_name: type_name.into(),
            },
        }
    }
}
