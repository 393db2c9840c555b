//! Service Messages
//!
//! Request bodies and response decoding for the services a monitoring
//! client uses: secure channel, session, subscription, monitored items and
//! publish. Every body starts with the encoding id of its structure.

use crate::client::{MonitoredItemCreateRequest, MonitoredItemCreateResult, SubscriptionParameters};
use crate::codec::{Decoder, Encoder};
use crate::error::SourceError;
use crate::node::NodeId;
use crate::notification::{DataChangeNotification, MonitoredItemNotification};
use crate::status::StatusCode;
use crate::TimestampsToReturn;
use chrono::Utc;
use std::time::Duration;

/// Binary encoding ids of the standard structures (namespace 0)
pub(crate) mod encoding {
    pub const ANONYMOUS_IDENTITY_TOKEN: u32 = 321;
    pub const SERVICE_FAULT: u32 = 397;
    pub const OPEN_SECURE_CHANNEL_REQUEST: u32 = 446;
    pub const OPEN_SECURE_CHANNEL_RESPONSE: u32 = 449;
    pub const CLOSE_SECURE_CHANNEL_REQUEST: u32 = 452;
    pub const CREATE_SESSION_REQUEST: u32 = 461;
    pub const CREATE_SESSION_RESPONSE: u32 = 464;
    pub const ACTIVATE_SESSION_REQUEST: u32 = 467;
    pub const ACTIVATE_SESSION_RESPONSE: u32 = 470;
    pub const CLOSE_SESSION_REQUEST: u32 = 473;
    pub const CLOSE_SESSION_RESPONSE: u32 = 476;
    pub const CREATE_MONITORED_ITEMS_REQUEST: u32 = 751;
    pub const CREATE_MONITORED_ITEMS_RESPONSE: u32 = 754;
    pub const CREATE_SUBSCRIPTION_REQUEST: u32 = 787;
    pub const CREATE_SUBSCRIPTION_RESPONSE: u32 = 790;
    pub const DATA_CHANGE_NOTIFICATION: u32 = 811;
    pub const STATUS_CHANGE_NOTIFICATION: u32 = 820;
    pub const PUBLISH_REQUEST: u32 = 826;
    pub const PUBLISH_RESPONSE: u32 = 829;
    pub const DELETE_SUBSCRIPTIONS_REQUEST: u32 = 847;
    pub const DELETE_SUBSCRIPTIONS_RESPONSE: u32 = 850;
    pub const EVENT_NOTIFICATION_LIST: u32 = 916;
}

use encoding::*;

const APPLICATION_URI: &str = "urn:threshold-alert:client";
const PRODUCT_URI: &str = "urn:threshold-alert";
const APPLICATION_NAME: &str = "threshold-alert";

/// ApplicationType Client
const APPLICATION_TYPE_CLIENT: u32 = 1;

/// MessageSecurityMode None
const SECURITY_MODE_NONE: u32 = 1;

/// MonitoringMode Reporting
const MONITORING_MODE_REPORTING: u32 = 2;

/// UserTokenType Anonymous
const USER_TOKEN_ANONYMOUS: u32 = 0;

fn null_node_id() -> NodeId {
    NodeId::numeric(0, 0)
}

fn millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn request_header(
    enc: &mut Encoder,
    auth_token: &NodeId,
    handle: u32,
    timeout: Duration,
) -> Result<(), SourceError> {
    enc.node_id(auth_token)?
        .date_time(Utc::now())
        .u32(handle)
        .u32(0)
        .string(None)
        .u32(millis(timeout))
        .null_extension_object();
    Ok(())
}

/// Fields of a response header the client acts on
#[derive(Debug)]
struct ResponseHeader {
    service_result: StatusCode,
}

impl ResponseHeader {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, SourceError> {
        let _timestamp = dec.date_time()?;
        let _handle = dec.u32()?;
        let service_result = dec.status_code()?;
        dec.skip_diagnostic_info()?;
        dec.sequence(|d| d.string())?;
        dec.extension_object()?;
        Ok(Self { service_result })
    }
}

/// Check the encoding id and service result; the decoder is left at the
/// first field after the response header
fn response<'a>(
    body: &'a [u8],
    expected: u32,
    service: &'static str,
) -> Result<Decoder<'a>, SourceError> {
    let mut dec = Decoder::new(body);
    let type_id = dec.node_id()?;
    let header = ResponseHeader::decode(&mut dec)?;

    if type_id == NodeId::numeric(0, SERVICE_FAULT) {
        return Err(SourceError::BadStatus {
            service,
            status: header.service_result,
        });
    }
    if type_id != NodeId::numeric(0, expected) {
        return Err(SourceError::Protocol(format!(
            "{} answered with structure {}",
            service, type_id
        )));
    }
    if header.service_result.is_bad() {
        return Err(SourceError::BadStatus {
            service,
            status: header.service_result,
        });
    }
    Ok(dec)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenRequestType {
    Issue = 0,
    Renew = 1,
}

/// Security token granted by OpenSecureChannel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IssuedToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub revised_lifetime: u32,
}

pub(crate) fn open_channel_request(handle: u32, kind: OpenRequestType, lifetime_ms: u32) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encoding_id(OPEN_SECURE_CHANNEL_REQUEST);
    // The null node id always encodes
    let _ = request_header(&mut enc, &null_node_id(), handle, Duration::from_secs(10));
    enc.u32(0)
        .u32(kind as u32)
        .u32(SECURITY_MODE_NONE)
        .byte_string(None)
        .u32(lifetime_ms);
    enc.into_bytes()
}

pub(crate) fn decode_open_channel_response(body: &[u8]) -> Result<IssuedToken, SourceError> {
    let mut dec = response(body, OPEN_SECURE_CHANNEL_RESPONSE, "OpenSecureChannel")?;
    let _server_protocol = dec.u32()?;
    let channel_id = dec.u32()?;
    let token_id = dec.u32()?;
    let _created_at = dec.date_time()?;
    let revised_lifetime = dec.u32()?;
    Ok(IssuedToken {
        channel_id,
        token_id,
        revised_lifetime,
    })
}

pub(crate) fn close_channel_request(handle: u32) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.encoding_id(CLOSE_SECURE_CHANNEL_REQUEST);
    let _ = request_header(&mut enc, &null_node_id(), handle, Duration::from_secs(10));
    enc.into_bytes()
}

/// Result of CreateSession
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CreatedSession {
    pub session_id: NodeId,
    pub auth_token: NodeId,
    pub revised_timeout_ms: f64,
    /// Policy id of the server's anonymous user token, if it offers one
    pub anonymous_policy: Option<String>,
}

pub(crate) fn create_session_request(
    handle: u32,
    endpoint_url: &str,
    session_name: &str,
    session_timeout: Duration,
) -> Result<Vec<u8>, SourceError> {
    let mut enc = Encoder::new();
    enc.encoding_id(CREATE_SESSION_REQUEST);
    request_header(&mut enc, &null_node_id(), handle, Duration::from_secs(10))?;
    // ApplicationDescription
    enc.string(Some(APPLICATION_URI))
        .string(Some(PRODUCT_URI))
        .u8(0x02)
        .string(Some(APPLICATION_NAME))
        .u32(APPLICATION_TYPE_CLIENT)
        .string(None)
        .string(None)
        .i32(-1);
    enc.string(None)
        .string(Some(endpoint_url))
        .string(Some(session_name))
        .byte_string(None)
        .byte_string(None)
        .f64(session_timeout.as_millis() as f64)
        .u32(0);
    Ok(enc.into_bytes())
}

/// Security mode, security policy and user token policies of one endpoint
struct EndpointTokens {
    security_mode: u32,
    security_policy: Option<String>,
    tokens: Vec<(Option<String>, u32)>,
}

fn endpoint_description(dec: &mut Decoder<'_>) -> Result<EndpointTokens, SourceError> {
    dec.string()?;
    // ApplicationDescription
    dec.string()?;
    dec.string()?;
    dec.localized_text()?;
    dec.u32()?;
    dec.string()?;
    dec.string()?;
    dec.sequence(|d| d.string())?;

    dec.byte_string()?;
    let security_mode = dec.u32()?;
    let security_policy = dec.string()?;
    let tokens = dec.sequence(|d| {
        let policy_id = d.string()?;
        let token_type = d.u32()?;
        d.string()?;
        d.string()?;
        d.string()?;
        Ok((policy_id, token_type))
    })?;
    dec.string()?;
    dec.u8()?;
    Ok(EndpointTokens {
        security_mode,
        security_policy,
        tokens,
    })
}

pub(crate) fn decode_create_session_response(body: &[u8]) -> Result<CreatedSession, SourceError> {
    let mut dec = response(body, CREATE_SESSION_RESPONSE, "CreateSession")?;
    let session_id = dec.node_id()?;
    let auth_token = dec.node_id()?;
    let revised_timeout_ms = dec.f64()?;
    dec.byte_string()?;
    dec.byte_string()?;
    let endpoints = dec.sequence(endpoint_description)?;

    // Prefer the unsecured endpoint's policy, any anonymous policy will do
    let unsecured = |e: &&EndpointTokens| {
        e.security_mode == SECURITY_MODE_NONE
            && e.security_policy.as_deref() == Some(crate::channel::SECURITY_POLICY_NONE)
    };
    let anonymous = |e: &EndpointTokens| {
        e.tokens
            .iter()
            .find(|(_, token_type)| *token_type == USER_TOKEN_ANONYMOUS)
            .map(|(policy_id, _)| policy_id.clone().unwrap_or_default())
    };
    let anonymous_policy = endpoints
        .iter()
        .filter(unsecured)
        .find_map(anonymous)
        .or_else(|| endpoints.iter().find_map(anonymous));

    Ok(CreatedSession {
        session_id,
        auth_token,
        revised_timeout_ms,
        anonymous_policy,
    })
}

pub(crate) fn activate_session_request(
    auth_token: &NodeId,
    handle: u32,
    policy_id: &str,
) -> Result<Vec<u8>, SourceError> {
    let mut enc = Encoder::new();
    enc.encoding_id(ACTIVATE_SESSION_REQUEST);
    request_header(&mut enc, auth_token, handle, Duration::from_secs(10))?;
    // client signature, software certificates, locale ids
    enc.string(None).byte_string(None).i32(-1).i32(-1);

    let mut token = Encoder::new();
    token.string(Some(policy_id));
    enc.extension_object(ANONYMOUS_IDENTITY_TOKEN, &token.into_bytes());

    // user token signature
    enc.string(None).byte_string(None);
    Ok(enc.into_bytes())
}

pub(crate) fn decode_activate_session_response(body: &[u8]) -> Result<(), SourceError> {
    response(body, ACTIVATE_SESSION_RESPONSE, "ActivateSession").map(|_| ())
}

pub(crate) fn close_session_request(
    auth_token: &NodeId,
    handle: u32,
    delete_subscriptions: bool,
) -> Result<Vec<u8>, SourceError> {
    let mut enc = Encoder::new();
    enc.encoding_id(CLOSE_SESSION_REQUEST);
    request_header(&mut enc, auth_token, handle, Duration::from_secs(10))?;
    enc.bool(delete_subscriptions);
    Ok(enc.into_bytes())
}

pub(crate) fn decode_close_session_response(body: &[u8]) -> Result<(), SourceError> {
    response(body, CLOSE_SESSION_RESPONSE, "CloseSession").map(|_| ())
}

/// Result of CreateSubscription
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CreatedSubscription {
    pub subscription_id: u32,
    pub revised_interval_ms: f64,
    pub revised_lifetime_count: u32,
    pub revised_keep_alive_count: u32,
}

impl CreatedSubscription {
    /// Longest the server may hold a publish request before a keep-alive
    pub fn keep_alive_period(&self) -> Duration {
        let ms = self.revised_interval_ms.max(1.0) * f64::from(self.revised_keep_alive_count.max(1));
        Duration::from_secs_f64(ms / 1000.0)
    }
}

pub(crate) fn create_subscription_request(
    auth_token: &NodeId,
    handle: u32,
    params: &SubscriptionParameters,
) -> Result<Vec<u8>, SourceError> {
    let mut enc = Encoder::new();
    enc.encoding_id(CREATE_SUBSCRIPTION_REQUEST);
    request_header(&mut enc, auth_token, handle, Duration::from_secs(10))?;
    enc.f64(params.interval.as_secs_f64() * 1000.0)
        .u32(params.lifetime_count)
        .u32(params.max_keep_alive_count)
        .u32(params.max_notifications_per_publish)
        .bool(true)
        .u8(params.priority);
    Ok(enc.into_bytes())
}

pub(crate) fn decode_create_subscription_response(body: &[u8]) -> Result<CreatedSubscription, SourceError> {
    let mut dec = response(body, CREATE_SUBSCRIPTION_RESPONSE, "CreateSubscription")?;
    Ok(CreatedSubscription {
        subscription_id: dec.u32()?,
        revised_interval_ms: dec.f64()?,
        revised_lifetime_count: dec.u32()?,
        revised_keep_alive_count: dec.u32()?,
    })
}

fn timestamps_code(timestamps: TimestampsToReturn) -> u32 {
    match timestamps {
        TimestampsToReturn::Source => 0,
        TimestampsToReturn::Server => 1,
        TimestampsToReturn::Both => 2,
        TimestampsToReturn::Neither => 3,
    }
}

pub(crate) fn create_monitored_items_request(
    auth_token: &NodeId,
    handle: u32,
    subscription_id: u32,
    timestamps: TimestampsToReturn,
    items: &[MonitoredItemCreateRequest],
) -> Result<Vec<u8>, SourceError> {
    let mut enc = Encoder::new();
    enc.encoding_id(CREATE_MONITORED_ITEMS_REQUEST);
    request_header(&mut enc, auth_token, handle, Duration::from_secs(10))?;
    enc.u32(subscription_id)
        .u32(timestamps_code(timestamps))
        .array_len(items.len());
    for item in items {
        // ReadValueId
        enc.node_id(&item.node_id)?
            .u32(item.attribute_id as u32)
            .string(None)
            .u16(0)
            .string(None);
        enc.u32(MONITORING_MODE_REPORTING);
        // MonitoringParameters
        enc.u32(item.client_handle)
            .f64(item.sampling_interval)
            .null_extension_object()
            .u32(item.queue_size)
            .bool(item.discard_oldest);
    }
    Ok(enc.into_bytes())
}

pub(crate) fn decode_create_monitored_items_response(
    body: &[u8],
) -> Result<Vec<MonitoredItemCreateResult>, SourceError> {
    let mut dec = response(body, CREATE_MONITORED_ITEMS_RESPONSE, "CreateMonitoredItems")?;
    dec.sequence(|d| {
        let status = d.status_code()?;
        let monitored_item_id = d.u32()?;
        let revised_sampling_interval = d.f64()?;
        let _revised_queue_size = d.u32()?;
        d.extension_object()?;
        Ok(MonitoredItemCreateResult {
            status,
            monitored_item_id,
            revised_sampling_interval,
        })
    })
}

/// One notification data entry of a publish response
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PublishedData {
    DataChange(DataChangeNotification),
    /// The subscription changed state, e.g. it timed out on the server
    StatusChange(StatusCode),
    /// Anything else, by structure name
    Other(String),
}

/// Decoded publish response
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PublishResult {
    pub subscription_id: u32,
    pub sequence_number: u32,
    /// Empty for a keep-alive
    pub data: Vec<PublishedData>,
}

pub(crate) fn publish_request(
    auth_token: &NodeId,
    handle: u32,
    timeout: Duration,
    acknowledgements: &[(u32, u32)],
) -> Result<Vec<u8>, SourceError> {
    let mut enc = Encoder::new();
    enc.encoding_id(PUBLISH_REQUEST);
    request_header(&mut enc, auth_token, handle, timeout)?;
    enc.array_len(acknowledgements.len());
    for (subscription_id, sequence_number) in acknowledgements {
        enc.u32(*subscription_id).u32(*sequence_number);
    }
    Ok(enc.into_bytes())
}

fn published_data(type_id: NodeId, body: Option<&[u8]>) -> Result<PublishedData, SourceError> {
    let Some(body) = body else {
        return Ok(PublishedData::Other(type_id.to_string()));
    };

    if type_id == NodeId::numeric(0, DATA_CHANGE_NOTIFICATION) {
        let mut dec = Decoder::new(body);
        let monitored_items = dec.sequence(|d| {
            Ok(MonitoredItemNotification {
                client_handle: d.u32()?,
                value: d.data_value()?,
            })
        })?;
        return Ok(PublishedData::DataChange(DataChangeNotification { monitored_items }));
    }
    if type_id == NodeId::numeric(0, STATUS_CHANGE_NOTIFICATION) {
        return Ok(PublishedData::StatusChange(Decoder::new(body).status_code()?));
    }
    if type_id == NodeId::numeric(0, EVENT_NOTIFICATION_LIST) {
        return Ok(PublishedData::Other("EventNotificationList".to_string()));
    }
    Ok(PublishedData::Other(type_id.to_string()))
}

pub(crate) fn decode_publish_response(body: &[u8]) -> Result<PublishResult, SourceError> {
    let mut dec = response(body, PUBLISH_RESPONSE, "Publish")?;
    let subscription_id = dec.u32()?;
    let _available = dec.sequence(|d| d.u32())?;
    let _more_notifications = dec.bool()?;
    // NotificationMessage
    let sequence_number = dec.u32()?;
    let _publish_time = dec.date_time()?;
    let data = dec.sequence(|d| {
        let (type_id, body) = d.extension_object()?;
        published_data(type_id, body)
    })?;
    Ok(PublishResult {
        subscription_id,
        sequence_number,
        data,
    })
}

pub(crate) fn delete_subscriptions_request(
    auth_token: &NodeId,
    handle: u32,
    subscription_ids: &[u32],
) -> Result<Vec<u8>, SourceError> {
    let mut enc = Encoder::new();
    enc.encoding_id(DELETE_SUBSCRIPTIONS_REQUEST);
    request_header(&mut enc, auth_token, handle, Duration::from_secs(10))?;
    enc.array_len(subscription_ids.len());
    for id in subscription_ids {
        enc.u32(*id);
    }
    Ok(enc.into_bytes())
}

pub(crate) fn decode_delete_subscriptions_response(body: &[u8]) -> Result<Vec<StatusCode>, SourceError> {
    let mut dec = response(body, DELETE_SUBSCRIPTIONS_RESPONSE, "DeleteSubscriptions")?;
    dec.sequence(|d| d.status_code())
}
