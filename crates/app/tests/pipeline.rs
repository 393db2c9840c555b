//! End-to-end pipeline tests against the scripted endpoint, plus service
//! runs against local Bot API and OPC UA stand-ins

use alerting::{
    AlertDispatcher, DeliveryError, DeliverySink, Destination, DispatchReport, MqttSettings,
};
use app::{run, run_pipeline, AppConfig, PipelineError, SinkKind, SourceKind};
use async_trait::async_trait;
use opc_source::{
    DataChangeNotification, PublishNotification, SimulatedFailure, SimulatedSource, SourceError,
    Variant,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use threshold_monitor::{BoundPair, MonitorError, SourceMonitor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const ENDPOINT: &str = "opc.tcp://localhost:4840";
const NODE: &str = "ns=1;s=index";

/// Sink double: records texts, can fail chosen attempts and can hold every
/// send until a permit is released
#[derive(Clone)]
struct TestSink {
    messages: Arc<Mutex<Vec<String>>>,
    attempts: Arc<Mutex<usize>>,
    fail_on: Vec<usize>,
    gate: Option<Arc<Semaphore>>,
}

impl TestSink {
    fn new() -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(Mutex::new(0)),
            fail_on: Vec::new(),
            gate: None,
        }
    }

    fn failing_on(mut self, attempts: &[usize]) -> Self {
        self.fail_on = attempts.to_vec();
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl DeliverySink for TestSink {
    async fn send(&self, _destination: &Destination, text: &str) -> Result<(), DeliveryError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            *attempts - 1
        };
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string()))?
                .forget();
        }
        if self.fail_on.contains(&attempt) {
            return Err(DeliveryError::Transport("connection reset".to_string()));
        }
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

fn readings(values: &[f64]) -> PublishNotification {
    PublishNotification::data_change(
        0,
        DataChangeNotification::from_values(1, values.iter().map(|&v| Variant::Double(v))),
    )
}

fn pipeline(sink: TestSink, bounds: BoundPair) -> (SourceMonitor, AlertDispatcher<TestSink>) {
    (
        SourceMonitor::new(ENDPOINT, NODE, bounds),
        AlertDispatcher::new(sink, Destination::channel("plant_alerts"), bounds),
    )
}

#[tokio::test]
async fn test_out_of_range_readings_become_messages() {
    let sink = TestSink::new();
    let (monitor, dispatcher) = pipeline(sink.clone(), BoundPair::new(0.0, 100.0));
    let source = SimulatedSource::scripted(vec![
        readings(&[50.0]),
        readings(&[157.345]),
        PublishNotification::failed(0, SourceError::Publish("BadTimeout".into())),
        readings(&[-12.5, 99.9]),
    ])
    .end_stream_after_script();

    let report = run_pipeline(monitor, source, dispatcher, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.monitor.notifications, 4);
    assert_eq!(report.monitor.notification_errors, 1);
    assert_eq!(report.monitor.alerts, 2);
    assert_eq!(report.dispatch, DispatchReport { sent: 2, failed: 0 });
    assert_eq!(
        sink.messages(),
        vec![
            "Range between 0 and 100 expected.\nValue of 157.35 detected.".to_string(),
            "Range between 0 and 100 expected.\nValue of -12.50 detected.".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_failed_delivery_does_not_block_next_alert() {
    let sink = TestSink::new().failing_on(&[0]);
    let (monitor, dispatcher) = pipeline(sink.clone(), BoundPair::new(0.0, 100.0));
    let source = SimulatedSource::scripted(vec![readings(&[150.0]), readings(&[250.0])])
        .end_stream_after_script();

    let report = run_pipeline(monitor, source, dispatcher, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.dispatch, DispatchReport { sent: 1, failed: 1 });
    assert_eq!(sink.attempts(), 2);
    assert!(sink.messages()[0].contains("250.00"));
}

#[tokio::test]
async fn test_cancellation_with_empty_queue_stops_both_stages() {
    let sink = TestSink::new();
    let (monitor, dispatcher) = pipeline(sink.clone(), BoundPair::default());
    let cancel = CancellationToken::new();

    let running = tokio::spawn(run_pipeline(
        monitor,
        SimulatedSource::scripted(Vec::new()),
        dispatcher,
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!running.is_finished());
    cancel.cancel();

    let report = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("pipeline deadlocked on shutdown")
        .unwrap()
        .unwrap();
    assert_eq!(report.monitor.alerts, 0);
    assert_eq!(report.dispatch, DispatchReport::default());
    assert_eq!(sink.attempts(), 0);
}

#[tokio::test]
async fn test_slow_delivery_backpressures_monitor() {
    let gate = Arc::new(Semaphore::new(0));
    let sink = TestSink::new().gated(gate.clone());
    let (monitor, dispatcher) = pipeline(sink.clone(), BoundPair::new(0.0, 100.0));
    let cancel = CancellationToken::new();
    let source = SimulatedSource::scripted(vec![
        readings(&[101.0]),
        readings(&[102.0]),
        readings(&[103.0]),
    ]);

    let running = tokio::spawn(run_pipeline(monitor, source, dispatcher, cancel.clone()));

    // First alert is stuck in the sink; the monitor cannot hand off the second
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.attempts(), 1);
    cancel.cancel();
    gate.add_permits(10);

    let report = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("pipeline did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(report.monitor.alerts, 1);
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(sink.messages().len(), 1);
    assert!(sink.messages()[0].contains("101.00"));
}

#[tokio::test]
async fn test_fatal_source_error_ends_pipeline() {
    let sink = TestSink::new();
    let (monitor, dispatcher) = pipeline(sink.clone(), BoundPair::default());
    let source = SimulatedSource::scripted(Vec::new()).with_failure(SimulatedFailure::Connect);

    let result = run_pipeline(monitor, source, dispatcher, CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(PipelineError::Monitor(MonitorError::Connect { .. }))
    ));
    assert_eq!(sink.attempts(), 0);
}

const GET_ME_OK: &str = r#"{"ok":true,"result":{"id":42,"is_bot":true,"first_name":"Plant","username":"plant_bot"}}"#;
const UNAUTHORIZED: &str = r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#;

/// Bot API stand-in answering every request with `status`/`body`; records
/// the request paths
async fn bot_api(status: u16, body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let paths = Arc::new(Mutex::new(Vec::new()));
    let seen = paths.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let head = loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                        continue;
                    };
                    let head = String::from_utf8_lossy(&buf[..end]).to_string();
                    let length = head
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break head;
                    }
                };
                let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                seen.lock().unwrap().push(path);

                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (url, paths)
}

fn service_config(endpoint: String, api_url: String) -> AppConfig {
    AppConfig {
        endpoint,
        node_id: "ns=2;s=Boiler.Temperature".to_string(),
        token: "123456:ABC-DEF".to_string(),
        channel: "plant_alerts".to_string(),
        bounds: BoundPair::new(0.0, 100.0),
        source: SourceKind::OpcUa,
        sink: SinkKind::Telegram,
        telegram_api_url: api_url,
        mqtt: MqttSettings::default(),
    }
}

#[tokio::test]
async fn test_rejected_bot_token_stops_service_before_monitoring() {
    let (api, paths) = bot_api(401, UNAUTHORIZED).await;
    let config = service_config("opc.tcp://127.0.0.1:1".to_string(), api);

    let result = run(config, CancellationToken::new()).await;

    match result {
        Err(PipelineError::Authentication(DeliveryError::Unauthorized(description))) => {
            assert_eq!(description, "Unauthorized")
        }
        other => panic!("expected an authentication failure, got {:?}", other.map(|r| r.dispatch)),
    }
    assert_eq!(paths.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_fatal_and_sends_nothing() {
    let (api, paths) = bot_api(200, GET_ME_OK).await;
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("opc.tcp://{}", closed.local_addr().unwrap());
    drop(closed);

    let result = tokio::time::timeout(
        Duration::from_secs(15),
        run(service_config(endpoint, api), CancellationToken::new()),
    )
    .await
    .expect("service kept running without a reachable endpoint");

    assert!(matches!(
        result,
        Err(PipelineError::Monitor(MonitorError::Connect { .. }))
    ));
    let paths = paths.lock().unwrap();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with("/getMe"));
}
