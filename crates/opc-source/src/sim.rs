//! Simulated Endpoint
//!
//! In-process stand-in for a PLC endpoint. In random mode it exposes a single
//! Double variable `ns=1;s=index` that takes a new pseudo-random value in
//! `[0, 4096)` once per sampling period. In scripted mode it replays a fixed
//! list of notifications, which makes pipeline behavior reproducible in tests.

use crate::client::{
    MonitoredItemCreateRequest, MonitoredItemCreateResult, Session, Subscription,
    SubscriptionParameters, SubscriptionSource,
};
use crate::error::SourceError;
use crate::node::NodeId;
use crate::notification::{DataChangeNotification, DataValue, MonitoredItemNotification, PublishNotification};
use crate::status::StatusCode;
use crate::{AttributeId, TimestampsToReturn};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Node id of the simulated process variable
pub const INDEX_NODE: &str = "ns=1;s=index";

/// Sampling period of the simulated variable
const DEFAULT_SAMPLING_PERIOD: Duration = Duration::from_millis(1000);

/// Upper bound (exclusive) of generated values
const VALUE_SPAN: f64 = 4096.0;

/// Failure to inject into a simulated source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedFailure {
    /// Refuse the session
    Connect,
    /// Refuse subscription creation
    Subscribe,
    /// Acknowledge every monitored item with this status
    Monitor(StatusCode),
}

#[derive(Debug, Clone)]
enum Feed {
    Random {
        node: NodeId,
        period: Duration,
    },
    Scripted {
        notifications: Vec<PublishNotification>,
        end_stream: bool,
    },
}

/// Simulated subscription source
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    feed: Feed,
    failure: Option<SimulatedFailure>,
}

impl SimulatedSource {
    /// Random process variable at `ns=1;s=index`, sampled once per second
    pub fn random() -> Self {
        info!("Creating simulated endpoint publishing {}", INDEX_NODE);
        Self {
            feed: Feed::Random {
                node: NodeId::string(1, "index"),
                period: DEFAULT_SAMPLING_PERIOD,
            },
            failure: None,
        }
    }

    /// Replay the given notifications in order, then keep the feed open
    pub fn scripted(notifications: Vec<PublishNotification>) -> Self {
        Self {
            feed: Feed::Scripted {
                notifications,
                end_stream: false,
            },
            failure: None,
        }
    }

    /// Change the sampling period of a random feed
    pub fn with_period(mut self, period: Duration) -> Self {
        if let Feed::Random { period: p, .. } = &mut self.feed {
            *p = period;
        }
        self
    }

    /// End the notification stream once a scripted feed is exhausted
    pub fn end_stream_after_script(mut self) -> Self {
        if let Feed::Scripted { end_stream, .. } = &mut self.feed {
            *end_stream = true;
        }
        self
    }

    /// Inject a failure
    pub fn with_failure(mut self, failure: SimulatedFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

#[async_trait]
impl SubscriptionSource for SimulatedSource {
    type Session = SimulatedSession;

    async fn connect(&self, endpoint: &str) -> Result<SimulatedSession, SourceError> {
        let host = endpoint
            .strip_prefix("opc.tcp://")
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| SourceError::InvalidEndpoint(endpoint.to_string()))?;

        if self.failure == Some(SimulatedFailure::Connect) {
            return Err(SourceError::ConnectionRefused {
                endpoint: endpoint.to_string(),
                reason: "simulated refusal".to_string(),
            });
        }

        debug!("Simulated session opened for host {}", host);
        Ok(SimulatedSession {
            feed: self.feed.clone(),
            failure: self.failure,
            closed: false,
            next_subscription_id: 1,
        })
    }
}

/// Session with a simulated endpoint
#[derive(Debug)]
pub struct SimulatedSession {
    feed: Feed,
    failure: Option<SimulatedFailure>,
    closed: bool,
    next_subscription_id: u32,
}

impl SimulatedSession {
    /// Check if the session was closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl Session for SimulatedSession {
    type Subscription = SimulatedSubscription;

    async fn subscribe(
        &mut self,
        params: SubscriptionParameters,
        notify: mpsc::Sender<PublishNotification>,
    ) -> Result<SimulatedSubscription, SourceError> {
        if self.closed {
            return Err(SourceError::SessionClosed);
        }
        if self.failure == Some(SimulatedFailure::Subscribe) {
            return Err(SourceError::SubscriptionFailed(
                "simulated refusal".to_string(),
            ));
        }

        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        debug!("Simulated subscription {} with interval {:?}", id, params.interval);

        Ok(SimulatedSubscription {
            id,
            feed: self.feed.clone(),
            failure: self.failure,
            notify: Some(notify),
            handles: Vec::new(),
            stop: CancellationToken::new(),
            task: None,
        })
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if !self.closed {
            debug!("Closing simulated session");
            self.closed = true;
        }
        Ok(())
    }
}

/// Subscription on a simulated endpoint
#[derive(Debug)]
pub struct SimulatedSubscription {
    id: u32,
    feed: Feed,
    failure: Option<SimulatedFailure>,
    notify: Option<mpsc::Sender<PublishNotification>>,
    /// Client handles of accepted monitored items
    handles: Vec<u32>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SimulatedSubscription {
    /// Check if the notification loop is running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn acknowledge(&self, request: &MonitoredItemCreateRequest) -> StatusCode {
        if let Some(SimulatedFailure::Monitor(status)) = self.failure {
            return status;
        }
        match &self.feed {
            Feed::Random { node, .. } if &request.node_id != node => StatusCode::BAD_NODE_ID_UNKNOWN,
            _ if request.attribute_id != AttributeId::Value => StatusCode::BAD_ATTRIBUTE_ID_INVALID,
            _ => StatusCode::GOOD,
        }
    }
}

#[async_trait]
impl Subscription for SimulatedSubscription {
    fn id(&self) -> u32 {
        self.id
    }

    async fn monitor(
        &mut self,
        _timestamps: TimestampsToReturn,
        requests: Vec<MonitoredItemCreateRequest>,
    ) -> Result<Vec<MonitoredItemCreateResult>, SourceError> {
        let revised_sampling_interval = match &self.feed {
            Feed::Random { period, .. } => period.as_secs_f64() * 1000.0,
            Feed::Scripted { .. } => 0.0,
        };

        let mut results = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let status = self.acknowledge(request);
            if status.is_good() {
                self.handles.push(request.client_handle);
            }
            results.push(MonitoredItemCreateResult {
                status,
                monitored_item_id: index as u32 + 1,
                revised_sampling_interval,
            });
        }
        Ok(results)
    }

    fn start(&mut self) -> Result<(), SourceError> {
        let notify = self.notify.take().ok_or_else(|| {
            SourceError::SubscriptionFailed(format!("subscription {} already started", self.id))
        })?;

        let id = self.id;
        let stop = self.stop.clone();
        let task = match self.feed.clone() {
            Feed::Random { period, .. } => {
                tokio::spawn(run_random(id, period, self.handles.clone(), notify, stop))
            }
            Feed::Scripted {
                notifications,
                end_stream,
            } => tokio::spawn(run_scripted(id, notifications, end_stream, notify, stop)),
        };
        self.task = Some(task);
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), SourceError> {
        self.stop.cancel();
        self.notify = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Simulated notification loop ended abnormally: {}", e);
            }
        }
        debug!("Subscription {} cancelled", self.id);
        Ok(())
    }
}

/// Pseudo-random sample in `[0, VALUE_SPAN)`, derived from the clock and
/// the sample sequence number
fn random_index(sequence: u64) -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = DefaultHasher::new();
    nanos.hash(&mut hasher);
    sequence.hash(&mut hasher);
    let hash = hasher.finish();

    (hash % 4_096_000) as f64 / 4_096_000.0 * VALUE_SPAN
}

async fn run_random(
    id: u32,
    period: Duration,
    handles: Vec<u32>,
    notify: mpsc::Sender<PublishNotification>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if handles.is_empty() {
            continue;
        }

        sequence += 1;
        let sample = DataValue::now(random_index(sequence));
        let batch = DataChangeNotification {
            monitored_items: handles
                .iter()
                .map(|&client_handle| MonitoredItemNotification {
                    client_handle,
                    value: sample.clone(),
                })
                .collect(),
        };

        // Non-blocking: a slow consumer loses samples instead of stalling the feed
        match notify.try_send(PublishNotification::data_change(id, batch)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Notification channel full, dropping sample {}", sequence);
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

async fn run_scripted(
    id: u32,
    notifications: Vec<PublishNotification>,
    end_stream: bool,
    notify: mpsc::Sender<PublishNotification>,
    stop: CancellationToken,
) {
    for mut notification in notifications {
        notification.subscription_id = id;
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            sent = notify.send(notification) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }

    if !end_stream {
        stop.cancelled().await;
    }
}
