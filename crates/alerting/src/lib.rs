//! Alerting System
//!
//! Formats out-of-range readings into human-readable alerts and delivers
//! them through a [`DeliverySink`] (Telegram channel or MQTT topic).

mod dispatcher;
mod error;
mod message;
mod mqtt;
mod sink;
mod telegram;

pub use dispatcher::{AlertDispatcher, DispatchReport};
pub use error::DeliveryError;
pub use message::format_alert;
pub use mqtt::{MqttSettings, MqttSink};
pub use sink::{DeliverySink, Destination};
pub use telegram::{TelegramSink, DEFAULT_API_URL};
