//! OPC UA Binary Client
//!
//! [`SubscriptionSource`] over UA TCP with security policy None and an
//! anonymous user. A session owns one secure channel; each started
//! subscription runs a publish loop that keeps one Publish request
//! outstanding and forwards every notification to the subscriber.

use crate::channel::{EndpointUrl, SecureChannel};
use crate::client::{
    MonitoredItemCreateRequest, MonitoredItemCreateResult, Session, Subscription,
    SubscriptionParameters, SubscriptionSource,
};
use crate::error::SourceError;
use crate::node::NodeId;
use crate::notification::PublishNotification;
use crate::services::{self, CreatedSubscription, PublishedData};
use crate::status::StatusCode;
use crate::TimestampsToReturn;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Time allowed for the TCP connect and the channel handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1_200);
const DEFAULT_SESSION_NAME: &str = "threshold-alert";

/// Pause before the next Publish after a transient failure
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Client for `opc.tcp://` endpoints
#[derive(Debug, Clone)]
pub struct UaTcpSource {
    connect_timeout: Duration,
    request_timeout: Duration,
    session_timeout: Duration,
    session_name: String,
}

impl Default for UaTcpSource {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            session_name: DEFAULT_SESSION_NAME.to_string(),
        }
    }
}

impl UaTcpSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the TCP connect and handshake timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Change the timeout of session and subscription service calls
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn establish(&self, channel: &Arc<SecureChannel>) -> Result<UaTcpSession, SourceError> {
        let body = services::create_session_request(
            channel.next_handle(),
            channel.endpoint(),
            &self.session_name,
            self.session_timeout,
        )?;
        let response = channel.request("CreateSession", body, self.request_timeout).await?;
        let created = services::decode_create_session_response(&response)?;

        let policy = created
            .anonymous_policy
            .ok_or_else(|| SourceError::ConnectionRefused {
                endpoint: channel.endpoint().to_string(),
                reason: "server offers no anonymous user token".to_string(),
            })?;

        let body = services::activate_session_request(&created.auth_token, channel.next_handle(), &policy)?;
        let response = channel.request("ActivateSession", body, self.request_timeout).await?;
        services::decode_activate_session_response(&response)?;

        info!(
            session_id = %created.session_id,
            timeout_ms = created.revised_timeout_ms,
            "Session activated"
        );
        Ok(UaTcpSession {
            channel: Arc::clone(channel),
            auth_token: created.auth_token,
            request_timeout: self.request_timeout,
            closed: false,
        })
    }
}

#[async_trait]
impl SubscriptionSource for UaTcpSource {
    type Session = UaTcpSession;

    async fn connect(&self, endpoint: &str) -> Result<UaTcpSession, SourceError> {
        let url = EndpointUrl::parse(endpoint)?;
        let channel = Arc::new(SecureChannel::open(&url, self.connect_timeout).await?);

        match self.establish(&channel).await {
            Ok(session) => Ok(session),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }
}

/// Activated session on a secure channel
pub struct UaTcpSession {
    channel: Arc<SecureChannel>,
    auth_token: NodeId,
    request_timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for UaTcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaTcpSession")
            .field("endpoint", &self.channel.endpoint())
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl Session for UaTcpSession {
    type Subscription = UaTcpSubscription;

    async fn subscribe(
        &mut self,
        params: SubscriptionParameters,
        notify: mpsc::Sender<PublishNotification>,
    ) -> Result<UaTcpSubscription, SourceError> {
        if self.closed {
            return Err(SourceError::SessionClosed);
        }

        let body = services::create_subscription_request(&self.auth_token, self.channel.next_handle(), &params)?;
        let response = self
            .channel
            .request("CreateSubscription", body, self.request_timeout)
            .await?;
        let created = services::decode_create_subscription_response(&response)?;
        debug!(
            subscription_id = created.subscription_id,
            interval_ms = created.revised_interval_ms,
            keep_alive = created.revised_keep_alive_count,
            lifetime = created.revised_lifetime_count,
            "Subscription created"
        );

        Ok(UaTcpSubscription {
            channel: Arc::clone(&self.channel),
            auth_token: self.auth_token.clone(),
            request_timeout: self.request_timeout,
            created,
            notify: Some(notify),
            stop: CancellationToken::new(),
            task: None,
            deleted: false,
        })
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = match services::close_session_request(&self.auth_token, self.channel.next_handle(), true) {
            Ok(body) => self
                .channel
                .request("CloseSession", body, self.request_timeout)
                .await
                .and_then(|response| services::decode_close_session_response(&response)),
            Err(e) => Err(e),
        };
        self.channel.close().await;
        result
    }
}

/// Subscription on a remote server
pub struct UaTcpSubscription {
    channel: Arc<SecureChannel>,
    auth_token: NodeId,
    request_timeout: Duration,
    created: CreatedSubscription,
    notify: Option<mpsc::Sender<PublishNotification>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    deleted: bool,
}

impl std::fmt::Debug for UaTcpSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaTcpSubscription")
            .field("id", &self.created.subscription_id)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl UaTcpSubscription {
    /// A held Publish may wait a full keep-alive period before it returns
    fn publish_timeout(&self) -> Duration {
        self.created.keep_alive_period() * 2 + self.request_timeout
    }
}

#[async_trait]
impl Subscription for UaTcpSubscription {
    fn id(&self) -> u32 {
        self.created.subscription_id
    }

    async fn monitor(
        &mut self,
        timestamps: TimestampsToReturn,
        requests: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemCreateResult>, SourceError> {
        let body = services::create_monitored_items_request(
            &self.auth_token,
            self.channel.next_handle(),
            self.created.subscription_id,
            timestamps,
            &requests,
        )?;
        let response = self
            .channel
            .request("CreateMonitoredItems", body, self.request_timeout)
            .await?;
        services::decode_create_monitored_items_response(&response)
    }

    fn start(&mut self) -> Result<(), SourceError> {
        let notify = self.notify.take().ok_or_else(|| {
            SourceError::SubscriptionFailed(format!(
                "subscription {} already started",
                self.created.subscription_id
            ))
        })?;

        let publish = PublishLoop {
            channel: Arc::clone(&self.channel),
            auth_token: self.auth_token.clone(),
            subscription_id: self.created.subscription_id,
            timeout: self.publish_timeout(),
            notify,
            stop: self.stop.clone(),
        };
        self.task = Some(tokio::spawn(publish.run()));
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), SourceError> {
        self.stop.cancel();
        self.notify = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Publish loop ended abnormally: {}", e);
            }
        }
        if self.deleted {
            return Ok(());
        }
        self.deleted = true;

        let id = self.created.subscription_id;
        let body = services::delete_subscriptions_request(&self.auth_token, self.channel.next_handle(), &[id])?;
        let response = self
            .channel
            .request("DeleteSubscriptions", body, self.request_timeout)
            .await?;
        let results = services::decode_delete_subscriptions_response(&response)?;
        match results.first() {
            Some(status) if status.is_bad() => Err(SourceError::BadStatus {
                service: "DeleteSubscriptions",
                status: *status,
            }),
            _ => {
                debug!("Subscription {} deleted", id);
                Ok(())
            }
        }
    }
}

struct PublishLoop {
    channel: Arc<SecureChannel>,
    auth_token: NodeId,
    subscription_id: u32,
    timeout: Duration,
    notify: mpsc::Sender<PublishNotification>,
    stop: CancellationToken,
}

impl PublishLoop {
    async fn run(self) {
        let mut acknowledgements: Vec<(u32, u32)> = Vec::new();

        loop {
            let body = match services::publish_request(
                &self.auth_token,
                self.channel.next_handle(),
                self.timeout,
                &acknowledgements,
            ) {
                Ok(body) => body,
                Err(e) => {
                    self.forward(PublishNotification::failed(self.subscription_id, e)).await;
                    break;
                }
            };

            let response = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                response = self.channel.request("Publish", body, self.timeout) => response,
            };

            match response.and_then(|body| services::decode_publish_response(&body)) {
                Ok(result) => {
                    acknowledgements.clear();
                    if result.data.is_empty() {
                        trace!(sequence = result.sequence_number, "Keep-alive");
                        continue;
                    }
                    acknowledgements.push((result.subscription_id, result.sequence_number));

                    let mut subscription_lost = false;
                    for data in result.data {
                        let notification = match data {
                            PublishedData::DataChange(batch) => {
                                PublishNotification::data_change(self.subscription_id, batch)
                            }
                            PublishedData::StatusChange(status) => {
                                subscription_lost = true;
                                PublishNotification::failed(
                                    self.subscription_id,
                                    SourceError::BadStatus {
                                        service: "Subscription",
                                        status,
                                    },
                                )
                            }
                            PublishedData::Other(name) => {
                                PublishNotification::unrecognized(self.subscription_id, name)
                            }
                        };
                        if !self.forward(notification).await {
                            return;
                        }
                    }
                    if subscription_lost {
                        break;
                    }
                }
                Err(e) => {
                    let transient = matches!(
                        e,
                        SourceError::BadStatus {
                            status: StatusCode::BAD_TIMEOUT | StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS,
                            ..
                        }
                    );
                    if !self.forward(PublishNotification::failed(self.subscription_id, e)).await {
                        return;
                    }
                    if !transient {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(PUBLISH_RETRY_DELAY) => {}
                    }
                }
            }
        }
        debug!("Publish loop of subscription {} stopped", self.subscription_id);
    }

    /// Deliver one notification; false once stopped or nobody listens
    async fn forward(&self, notification: PublishNotification) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            sent = self.notify.send(notification) => sent.is_ok(),
        }
    }
}
