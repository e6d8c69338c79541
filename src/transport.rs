//! Duplex transport seam.
//!
//! The session client operates on a [`Transport`] handle produced by a
//! [`Connector`]; the production implementation speaks WebSocket via
//! `tokio-tungstenite`. Inbound traffic is delivered through a channel so the
//! client processes frames strictly in arrival order. Transport readiness
//! ([`Transport::is_open`]) is the authoritative gate for realtime sends: it
//! can lag or lead the client's enumerated status by one scheduling turn
//! during open/teardown.

use crate::error::{LiveError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;

/// Inbound traffic from the transport, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One complete text frame.
    Message(String),
    /// Transport-level error. A close is expected to follow.
    Error(String),
    /// The transport closed, locally or remotely.
    Closed { code: u16, reason: String },
}

/// An established duplex connection handle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the transport itself reports it is open for sending.
    fn is_open(&self) -> bool;

    /// Send one text frame.
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the transport. Errors are reported through the event channel,
    /// never to the caller.
    async fn close(&self);
}

/// Opens transports. The seam exists so lifecycle logic can be exercised
/// against in-memory transports in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport, returning the handle and its inbound channel.
    async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)>;
}

/// Capacity of the inbound frame channel.
const INBOUND_CAPACITY: usize = 128;

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// WebSocket connector for the live service.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create a connector authenticating with the given API key.
    pub fn new(api_key: impl AsRef<str>) -> Self {
        Self { url: format!("{}?key={}", LIVE_ENDPOINT, api_key.as_ref()) }
    }

    /// Create a connector for an explicit endpoint URL (test servers, proxies).
    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        let request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| LiveError::connection(format!("invalid endpoint: {e}")))?;

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| LiveError::connection(format!("WebSocket connect error: {e}")))?;

        let (sink, mut source) = stream.split();
        let open = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if tx.send(TransportEvent::Message(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if tx.send(TransportEvent::Message(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("dropping non-UTF-8 binary frame: {e}");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        reader_open.store(false, Ordering::SeqCst);
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1000, String::new()));
                        let _ = tx.send(TransportEvent::Closed { code, reason }).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reader_open.store(false, Ordering::SeqCst);
                        let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                    }
                }
            }
            // Stream ended without a close frame.
            reader_open.store(false, Ordering::SeqCst);
            let _ = tx.send(TransportEvent::Closed { code: 1006, reason: String::new() }).await;
        });

        let transport = Arc::new(WsTransport { sink: Mutex::new(sink), open });
        Ok((transport, rx))
    }
}

struct WsTransport {
    sink: Mutex<WsSink>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame))
            .await
            .map_err(|e| LiveError::connection(format!("send error: {e}")))
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            tracing::debug!("close frame send failed (already closed?): {e}");
        }
    }
}
