//! UA TCP Secure Channel
//!
//! One TCP connection to an `opc.tcp://` endpoint with security policy None:
//! the Hello/Acknowledge handshake, opening and renewing the secure channel,
//! message framing and chunk reassembly. Requests are correlated with their
//! responses by request id; a reader task routes every incoming message to
//! the caller waiting for it.

use crate::codec::{Decoder, Encoder};
use crate::error::SourceError;
use crate::services;
use crate::status::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub(crate) const SECURITY_POLICY_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";

/// Default port of the opc.tcp scheme
const DEFAULT_PORT: u16 = 4840;

/// Buffer sizes and limits announced in Hello
const RECEIVE_BUFFER_SIZE: u32 = 65_536;
const SEND_BUFFER_SIZE: u32 = 65_536;
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Requested secure channel token lifetime
const CHANNEL_LIFETIME_MS: u32 = 3_600_000;

/// Request timeout for handshake and channel services
const CHANNEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Message header: three-byte type, chunk type, u32 size
const HEADER_LEN: usize = 8;

/// A parsed `opc.tcp://host[:port][/path]` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EndpointUrl {
    pub url: String,
    pub host: String,
    pub port: u16,
}

impl EndpointUrl {
    pub fn parse(url: &str) -> Result<Self, SourceError> {
        let invalid = || SourceError::InvalidEndpoint(url.to_string());
        let url = url.trim();
        let rest = url.strip_prefix("opc.tcp://").ok_or_else(invalid)?;
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // IPv6 literal
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
                None => (authority, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            url: url.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

type Reply = Result<Vec<u8>, SourceError>;

/// Callers waiting for a response, keyed by request id
#[derive(Default)]
struct Waiters {
    pending: HashMap<u32, oneshot::Sender<Reply>>,
    /// Set once the reader has stopped; new requests fail with it
    closed: Option<SourceError>,
}

impl Waiters {
    fn fail_all(&mut self, reason: SourceError) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(reason.clone()));
        }
        self.closed = Some(reason);
    }
}

type SharedWaiters = Arc<Mutex<Waiters>>;

fn lock(waiters: &SharedWaiters) -> std::sync::MutexGuard<'_, Waiters> {
    // Poisoning is ignored, the map is never left half-updated
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the waiter if the request future is dropped before its reply
struct PendingGuard<'a> {
    waiters: &'a SharedWaiters,
    request_id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.waiters).pending.remove(&self.request_id);
    }
}

/// Security token currently in use
#[derive(Debug, Clone, Copy)]
struct Token {
    channel_id: u32,
    token_id: u32,
    renew_at: Instant,
}

impl Token {
    fn new(channel_id: u32, token_id: u32, lifetime_ms: u32) -> Self {
        // Renew once three quarters of the lifetime have passed
        let lifetime = Duration::from_millis(u64::from(lifetime_ms.max(1_000)));
        Self {
            channel_id,
            token_id,
            renew_at: Instant::now() + lifetime.mul_f64(0.75),
        }
    }
}

struct Writer {
    stream: OwnedWriteHalf,
    token: Token,
    sequence: u32,
    /// Largest chunk the server accepts
    send_limit: usize,
}

impl Writer {
    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1).max(1);
        self.sequence
    }

    async fn write_message(
        &mut self,
        kind: &[u8; 3],
        request_id: u32,
        body: &[u8],
    ) -> Result<(), SourceError> {
        let sequence = self.next_sequence();
        let mut frame = Encoder::new();
        frame.bytes(kind).u8(b'F').u32(0);
        frame
            .u32(self.token.channel_id)
            .u32(self.token.token_id)
            .u32(sequence)
            .u32(request_id)
            .bytes(body);
        let frame = seal(frame.into_bytes());
        if frame.len() > self.send_limit {
            return Err(SourceError::Protocol(format!(
                "request of {} bytes exceeds the server's {} byte buffer",
                frame.len(),
                self.send_limit
            )));
        }
        self.stream.write_all(&frame).await.map_err(transport)
    }
}

/// Patch the total size into a frame's header
fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let size = (frame.len() as u32).to_le_bytes();
    frame[4..HEADER_LEN].copy_from_slice(&size);
    frame
}

fn transport(err: std::io::Error) -> SourceError {
    SourceError::Transport(err.to_string())
}

/// An open secure channel
pub(crate) struct SecureChannel {
    endpoint: String,
    writer: tokio::sync::Mutex<Writer>,
    waiters: SharedWaiters,
    next_request_id: AtomicU32,
    next_handle: AtomicU32,
    reader: JoinHandle<()>,
}

impl SecureChannel {
    /// Connect, exchange Hello/Acknowledge and open the secure channel
    pub async fn open(endpoint: &EndpointUrl, connect_timeout: Duration) -> Result<Self, SourceError> {
        let refused = |reason: String| SourceError::ConnectionRefused {
            endpoint: endpoint.url.clone(),
            reason,
        };

        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| refused(format!("no answer within {:?}", connect_timeout)))?
        .map_err(|e| refused(e.to_string()))?;
        stream.set_nodelay(true).map_err(transport)?;
        debug!("TCP connection to {}:{} established", endpoint.host, endpoint.port);

        let (mut read_half, mut write_half) = stream.into_split();

        let send_limit = handshake(&mut read_half, &mut write_half, &endpoint.url)
            .await
            .map_err(|e| match e {
                SourceError::BadStatus { status, .. } => refused(status.to_string()),
                other => other,
            })?;

        // Open the channel before the reader task owns the read half
        let request_id = 1;
        let body = services::open_channel_request(1, services::OpenRequestType::Issue, CHANNEL_LIFETIME_MS);
        let frame = open_frame(0, 1, request_id, &body);
        write_half.write_all(&frame).await.map_err(transport)?;

        let (kind, chunk, payload) = tokio::time::timeout(CHANNEL_REQUEST_TIMEOUT, read_frame(&mut read_half))
            .await
            .map_err(|_| refused("no OpenSecureChannel response".to_string()))??;
        let payload = match (&kind, chunk) {
            (b"OPN", b'F') => strip_open_headers(&payload)?.1,
            (b"ERR", _) => return Err(refused(decode_error(&payload)?.to_string())),
            _ => return Err(unexpected(&kind)),
        };
        let issued = services::decode_open_channel_response(&payload)?;
        info!(
            channel_id = issued.channel_id,
            lifetime_ms = issued.revised_lifetime,
            "Secure channel opened"
        );

        let waiters = SharedWaiters::default();
        let reader = tokio::spawn(read_loop(read_half, waiters.clone()));

        Ok(Self {
            endpoint: endpoint.url.clone(),
            writer: tokio::sync::Mutex::new(Writer {
                stream: write_half,
                token: Token::new(issued.channel_id, issued.token_id, issued.revised_lifetime),
                sequence: 1,
                send_limit,
            }),
            waiters,
            next_request_id: AtomicU32::new(request_id + 1),
            next_handle: AtomicU32::new(2),
            reader,
        })
    }

    /// Endpoint URL this channel is connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fresh request handle for a request header
    pub fn next_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, request_id: u32) -> Result<oneshot::Receiver<Reply>, SourceError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = lock(&self.waiters);
        if let Some(reason) = &waiters.closed {
            return Err(reason.clone());
        }
        waiters.pending.insert(request_id, tx);
        Ok(rx)
    }

    /// Send a service request and wait for the response body.
    ///
    /// The returned bytes start at the response's encoding id.
    pub async fn request(
        &self,
        service: &'static str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, SourceError> {
        let request_id = self.next_request_id();
        let reply = self.register(request_id)?;
        let _guard = PendingGuard {
            waiters: &self.waiters,
            request_id,
        };

        {
            let mut writer = self.writer.lock().await;
            if Instant::now() >= writer.token.renew_at {
                self.renew(&mut writer).await?;
            }
            writer.write_message(b"MSG", request_id, &body).await?;
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SourceError::Transport("connection closed".to_string())),
            Err(_) => Err(SourceError::BadStatus {
                service,
                status: StatusCode::BAD_TIMEOUT,
            }),
        }
    }

    /// Renew the security token; the caller holds the writer
    async fn renew(&self, writer: &mut Writer) -> Result<(), SourceError> {
        let request_id = self.next_request_id();
        let reply = self.register(request_id)?;
        let _guard = PendingGuard {
            waiters: &self.waiters,
            request_id,
        };

        let body = services::open_channel_request(
            self.next_handle(),
            services::OpenRequestType::Renew,
            CHANNEL_LIFETIME_MS,
        );
        let sequence = writer.next_sequence();
        let frame = open_frame(writer.token.channel_id, sequence, request_id, &body);
        writer.stream.write_all(&frame).await.map_err(transport)?;

        let payload = match tokio::time::timeout(CHANNEL_REQUEST_TIMEOUT, reply).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => return Err(SourceError::Transport("connection closed".to_string())),
            Err(_) => {
                return Err(SourceError::BadStatus {
                    service: "OpenSecureChannel",
                    status: StatusCode::BAD_TIMEOUT,
                })
            }
        };
        let renewed = services::decode_open_channel_response(&payload)?;
        writer.token = Token::new(renewed.channel_id, renewed.token_id, renewed.revised_lifetime);
        debug!(token_id = renewed.token_id, "Security token renewed");
        Ok(())
    }

    /// Send CloseSecureChannel and shut the connection down
    pub async fn close(&self) {
        let request_id = self.next_request_id();
        let body = services::close_channel_request(self.next_handle());
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_message(b"CLO", request_id, &body).await {
            debug!("CloseSecureChannel not sent: {}", e);
        }
        if let Err(e) = writer.stream.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
        lock(&self.waiters).fail_all(SourceError::SessionClosed);
        self.reader.abort();
        debug!("Secure channel to {} closed", self.endpoint);
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Hello/Acknowledge; returns the largest chunk the server will receive
async fn handshake(
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    url: &str,
) -> Result<usize, SourceError> {
    let mut hello = Encoder::new();
    hello
        .bytes(b"HELF")
        .u32(0)
        .u32(0)
        .u32(RECEIVE_BUFFER_SIZE)
        .u32(SEND_BUFFER_SIZE)
        .u32(MAX_MESSAGE_SIZE as u32)
        .u32(0)
        .string(Some(url));
    write_half
        .write_all(&seal(hello.into_bytes()))
        .await
        .map_err(transport)?;

    let (kind, _, payload) = tokio::time::timeout(CHANNEL_REQUEST_TIMEOUT, read_frame(read_half))
        .await
        .map_err(|_| SourceError::Transport("no Acknowledge from server".to_string()))??;
    match &kind {
        b"ACK" => {
            let mut dec = Decoder::new(&payload);
            let _version = dec.u32()?;
            let server_receive = dec.u32()?;
            debug!("Acknowledge received, server receive buffer {}", server_receive);
            Ok(server_receive as usize)
        }
        b"ERR" => Err(SourceError::BadStatus {
            service: "Hello",
            status: decode_error(&payload)?,
        }),
        _ => Err(unexpected(&kind)),
    }
}

fn open_frame(channel_id: u32, sequence: u32, request_id: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = Encoder::new();
    frame
        .bytes(b"OPNF")
        .u32(0)
        .u32(channel_id)
        .string(Some(SECURITY_POLICY_NONE))
        .byte_string(None)
        .byte_string(None)
        .u32(sequence)
        .u32(request_id)
        .bytes(body);
    seal(frame.into_bytes())
}

/// Skip the asymmetric security and sequence headers of an OPN message;
/// returns the request id and the body
fn strip_open_headers(payload: &[u8]) -> Result<(u32, Vec<u8>), SourceError> {
    let mut dec = Decoder::new(payload);
    let _channel_id = dec.u32()?;
    let policy = dec.string()?;
    if policy.as_deref() != Some(SECURITY_POLICY_NONE) {
        return Err(SourceError::Protocol(format!(
            "server answered with security policy {:?}",
            policy
        )));
    }
    dec.byte_string()?;
    dec.byte_string()?;
    let _sequence = dec.u32()?;
    let request_id = dec.u32()?;
    let body = dec.take(dec.remaining())?.to_vec();
    Ok((request_id, body))
}

/// Skip the symmetric security and sequence headers of a MSG chunk
fn strip_message_headers(payload: &[u8]) -> Result<(u32, &[u8]), SourceError> {
    let mut dec = Decoder::new(payload);
    let _channel_id = dec.u32()?;
    let _token_id = dec.u32()?;
    let _sequence = dec.u32()?;
    let request_id = dec.u32()?;
    Ok((request_id, dec.take(dec.remaining())?))
}

fn decode_error(payload: &[u8]) -> Result<StatusCode, SourceError> {
    let mut dec = Decoder::new(payload);
    let status = dec.status_code()?;
    let reason = dec.string()?.unwrap_or_default();
    warn!(status = %status, reason = %reason, "Server reported a transport error");
    Ok(status)
}

fn unexpected(kind: &[u8; 3]) -> SourceError {
    SourceError::Protocol(format!(
        "unexpected message type {:?}",
        String::from_utf8_lossy(kind)
    ))
}

/// Read one frame: message type, chunk type and the bytes after the header
async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<([u8; 3], u8, Vec<u8>), SourceError> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.map_err(transport)?;

    let kind = [header[0], header[1], header[2]];
    let chunk = header[3];
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if !(HEADER_LEN..=MAX_MESSAGE_SIZE).contains(&size) {
        return Err(SourceError::Protocol(format!("invalid message size {}", size)));
    }

    let mut payload = vec![0u8; size - HEADER_LEN];
    stream.read_exact(&mut payload).await.map_err(transport)?;
    Ok((kind, chunk, payload))
}

/// Route responses to their waiters until the connection ends
async fn read_loop(mut stream: OwnedReadHalf, waiters: SharedWaiters) {
    let mut partial: HashMap<u32, Vec<u8>> = HashMap::new();

    let reason = loop {
        let (kind, chunk, payload) = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) => break e,
        };

        let routed = match &kind {
            b"MSG" => strip_message_headers(&payload).map(|(id, body)| (id, body.to_vec())),
            b"OPN" => strip_open_headers(&payload),
            b"ERR" => {
                let status = decode_error(&payload).unwrap_or(StatusCode::BAD_DECODING_ERROR);
                break SourceError::Transport(format!("server closed the channel: {}", status));
            }
            _ => break unexpected(&kind),
        };
        let (request_id, body) = match routed {
            Ok(routed) => routed,
            Err(e) => break e,
        };

        let reply = match chunk {
            b'C' => {
                let buffered = partial.entry(request_id).or_default();
                buffered.extend_from_slice(&body);
                if buffered.len() > MAX_MESSAGE_SIZE {
                    break SourceError::Protocol("response exceeds maximum message size".to_string());
                }
                continue;
            }
            b'F' => {
                let mut message = partial.remove(&request_id).unwrap_or_default();
                message.extend_from_slice(&body);
                Ok(message)
            }
            b'A' => {
                partial.remove(&request_id);
                let status = Decoder::new(&body)
                    .status_code()
                    .unwrap_or(StatusCode::BAD_DECODING_ERROR);
                Err(SourceError::BadStatus {
                    service: "Response",
                    status,
                })
            }
            other => {
                break SourceError::Protocol(format!("unknown chunk type {:?}", char::from(other)))
            }
        };

        let waiter = lock(&waiters).pending.remove(&request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(request_id, "Response for a request nobody waits for"),
        }
    };

    warn!("Secure channel reader stopped: {}", reason);
    lock(&waiters).fail_all(reason);
}
