//! Telegram Bot API Sink

use crate::error::DeliveryError;
use crate::sink::{DeliverySink, Destination};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Public Bot API root
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Envelope of every Bot API response
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, DeliveryError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(DeliveryError::Api {
                code: self.error_code.unwrap_or_default(),
                description: self
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }
}

/// `getMe` result
#[derive(Debug, Clone, Deserialize)]
struct BotUser {
    id: i64,
    username: Option<String>,
}

/// `sendMessage` result, only the id is kept
#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Sends alerts to a Telegram channel through a bot account
pub struct TelegramSink {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl TelegramSink {
    /// Check the bot token with `getMe` against the Bot API at `api_url`
    pub async fn authenticate(api_url: &str, token: &str) -> Result<Self, DeliveryError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(DeliveryError::MissingCredential);
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let sink = Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        };

        let bot: BotUser = sink
            .call("getMe", &serde_json::json!({}))
            .await
            .map_err(|e| match e {
                DeliveryError::Api { code: 401, description } => DeliveryError::Unauthorized(description),
                other => other,
            })?;

        let username = bot.username.unwrap_or_else(|| bot.id.to_string());
        info!("Authorized on Telegram as: {}", username);
        Ok(sink)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    async fn call<B, T>(&self, method: &str, body: &B) -> Result<T, DeliveryError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let envelope: ApiResponse<T> = response.json().await.map_err(|e| self.transport_error(e))?;
        envelope.into_result()
    }

    /// reqwest errors embed the request URL, which contains the token
    fn transport_error(&self, err: reqwest::Error) -> DeliveryError {
        DeliveryError::Transport(redact(&err.to_string(), &self.token))
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    async fn send(&self, destination: &Destination, text: &str) -> Result<(), DeliveryError> {
        let chat_id = destination.address();
        let sent: SentMessage = self
            .call(
                "sendMessage",
                &SendMessage {
                    chat_id: &chat_id,
                    text,
                },
            )
            .await?;
        debug!(message_id = sent.message_id, destination = %destination, "Message delivered");
        Ok(())
    }
}

fn redact(message: &str, secret: &str) -> String {
    if secret.is_empty() {
        message.to_string()
    } else {
        message.replace(secret, "<redacted>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{AlertDispatcher, DispatchReport};
    use threshold_monitor::{alert_queue, AlertEvent, BoundPair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const TOKEN: &str = "123456:ABC-DEF";
    const GET_ME_OK: &str = r#"{"ok":true,"result":{"id":42,"is_bot":true,"first_name":"Plant","username":"plant_bot"}}"#;
    const UNAUTHORIZED: &str = r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#;
    const CHAT_NOT_FOUND: &str = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
    const SENT: &str = r#"{"ok":true,"result":{"message_id":7,"date":0,"chat":{"id":-100,"type":"channel"}}}"#;

    /// Read one request through the end of its body; returns the head
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let length = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return head;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Bot API stand-in answering by the method at the end of the path
    async fn stub_api(routes: Vec<(&'static str, u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let head = read_request(&mut stream).await;
                    let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                    let (status, body) = routes
                        .iter()
                        .find(|(method, _, _)| path.ends_with(&format!("/{}", method)))
                        .map(|(_, status, body)| (*status, *body))
                        .unwrap_or((404, r#"{"ok":false,"error_code":404,"description":"Not Found"}"#));
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
        url
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected() {
        let result = TelegramSink::authenticate(DEFAULT_API_URL, "  ").await;
        assert!(matches!(result, Err(DeliveryError::MissingCredential)));
    }

    #[tokio::test]
    async fn test_rejected_token_is_unauthorized() {
        let api = stub_api(vec![("getMe", 401, UNAUTHORIZED)]).await;
        match TelegramSink::authenticate(&api, TOKEN).await {
            Err(DeliveryError::Unauthorized(description)) => assert_eq!(description, "Unauthorized"),
            Err(e) => panic!("expected Unauthorized, got {:?}", e),
            Ok(_) => panic!("expected Unauthorized, got a sink"),
        }
    }

    #[tokio::test]
    async fn test_send_message_delivered() {
        let api = stub_api(vec![("getMe", 200, GET_ME_OK), ("sendMessage", 200, SENT)]).await;
        let sink = TelegramSink::authenticate(&api, TOKEN).await.unwrap();
        sink.send(&Destination::channel("plant_alerts"), "Value of 150.00 detected.")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_message_error_surfaces_api_code() {
        let api = stub_api(vec![("getMe", 200, GET_ME_OK), ("sendMessage", 400, CHAT_NOT_FOUND)]).await;
        let sink = TelegramSink::authenticate(&api, TOKEN).await.unwrap();
        let err = sink
            .send(&Destination::channel("missing"), "Value of 150.00 detected.")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Api { code: 400, .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_dispatcher_counts_rejected_send_as_failure() {
        let api = stub_api(vec![("getMe", 200, GET_ME_OK), ("sendMessage", 400, CHAT_NOT_FOUND)]).await;
        let sink = TelegramSink::authenticate(&api, TOKEN).await.unwrap();
        let dispatcher = AlertDispatcher::new(sink, Destination::channel("missing"), BoundPair::new(0.0, 100.0));
        let (tx, rx) = alert_queue();

        let producer = tokio::spawn(async move {
            tx.send(AlertEvent::new(150.0)).await.unwrap();
        });
        let report = dispatcher.run(rx).await;
        producer.await.unwrap();

        assert_eq!(report, DispatchReport { sent: 0, failed: 1 });
    }

    #[test]
    fn test_ok_response() {
        let body = r#"{"ok":true,"result":{"id":42,"is_bot":true,"first_name":"Plant","username":"plant_bot"}}"#;
        let envelope: ApiResponse<BotUser> = serde_json::from_str(body).unwrap();
        let bot = envelope.into_result().unwrap();
        assert_eq!(bot.id, 42);
        assert_eq!(bot.username.as_deref(), Some("plant_bot"));
    }

    #[test]
    fn test_error_response() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        let envelope: ApiResponse<SentMessage> = serde_json::from_str(body).unwrap();
        match envelope.into_result() {
            Err(DeliveryError::Api { code, description }) => {
                assert_eq!(code, 400);
                assert_eq!(description, "Bad Request: chat not found");
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.message_id)),
        }
    }

    #[test]
    fn test_send_message_body() {
        let body = serde_json::to_value(SendMessage {
            chat_id: "@plant_alerts",
            text: "Range between 0 and 100 expected.\nValue of 57.35 detected.",
        })
        .unwrap();
        assert_eq!(body["chat_id"], "@plant_alerts");
        assert!(body["text"].as_str().unwrap().starts_with("Range between"));
    }

    #[test]
    fn test_token_is_redacted() {
        let token = "123456:ABC-DEF";
        let message = format!("error sending request for url (https://api.telegram.org/bot{}/getMe)", token);
        let redacted = redact(&message, token);
        assert!(!redacted.contains(token));
        assert!(redacted.contains("bot<redacted>/getMe"));
    }

    #[test]
    fn test_method_url() {
        let sink = TelegramSink {
            http: reqwest::Client::new(),
            api_url: "http://127.0.0.1:8081".to_string(),
            token: "123:abc".to_string(),
        };
        assert_eq!(sink.method_url("sendMessage"), "http://127.0.0.1:8081/bot123:abc/sendMessage");
    }
}
