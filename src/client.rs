//! Session client.
//!
//! Owns the duplex connection for one logical session: translates outbound
//! application intents into protocol frames and demultiplexes inbound frames
//! into typed [`LiveEvent`]s. Connection status is an explicit enumerated
//! state owned here and read through an accessor; the transport's own
//! readiness flag is the authoritative gate for realtime sends (status can
//! lag the transport by one task-scheduling turn).

use crate::error::{LiveError, Result};
use crate::events::{EventBus, GroundingReference, LiveEvent};
use crate::protocol::{ClientMessage, FunctionResponse, MediaChunk, Part, ServerMessage};
use crate::transport::{Connector, Transport, TransportEvent, WsConnector};
use crate::SessionConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};

/// Connection status of the session client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Client for one live bidirectional streaming session.
///
/// Lifecycle: created once, then driven through repeated
/// `connect`/`disconnect` cycles by the coordinator. All operations on a
/// missing handle are immediate no-ops or error events, never implicit
/// reconnects.
pub struct LiveClient {
    connector: Arc<dyn Connector>,
    status: Mutex<ConnectionStatus>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    session_id: Mutex<Option<String>>,
    /// Bumped on every accepted connect attempt; an attempt may only install
    /// its transport while the epoch is still its own.
    epoch: AtomicU64,
    bus: EventBus,
}

impl LiveClient {
    /// Create a client over an arbitrary connector.
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            status: Mutex::new(ConnectionStatus::Disconnected),
            transport: Mutex::new(None),
            session_id: Mutex::new(None),
            epoch: AtomicU64::new(0),
            bus: EventBus::new(),
        })
    }

    /// Create a client for the hosted live service.
    pub fn gemini(api_key: impl AsRef<str>) -> Arc<Self> {
        Self::new(Arc::new(WsConnector::new(api_key)))
    }

    /// Current enumerated connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Whether the status is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Session id of the current connection, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Subscribe to the event fabric.
    pub fn events(&self) -> broadcast::Receiver<LiveEvent> {
        self.bus.subscribe()
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Open the duplex connection and send the setup frame.
    ///
    /// Fails immediately if a connection is already active or being
    /// established; connect attempts are never queued or retried. On a
    /// transport failure during the open attempt the status reverts to
    /// disconnected and the failure is returned — no event is published for
    /// this path. A `disconnect` issued while the open is in flight wins:
    /// the freshly opened transport is closed again and the attempt fails.
    pub async fn connect(self: &Arc<Self>, config: &SessionConfig) -> Result<()> {
        let attempt = {
            let mut status = self.status.lock();
            if *status != ConnectionStatus::Disconnected {
                tracing::debug!(status = ?*status, "connect rejected: already active");
                return Err(LiveError::AlreadyConnected);
            }
            *status = ConnectionStatus::Connecting;
            self.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        let (transport, inbound) = match self.connector.connect().await {
            Ok(pair) => pair,
            Err(e) => {
                self.abort_attempt(attempt);
                return Err(e);
            }
        };

        let setup = match serde_json::to_string(&ClientMessage::setup(config)) {
            Ok(frame) => frame,
            Err(e) => {
                self.abort_attempt(attempt);
                return Err(e.into());
            }
        };
        if let Err(e) = transport.send(setup).await {
            self.abort_attempt(attempt);
            return Err(e);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let installed = {
            let mut status = self.status.lock();
            // Still our attempt? A disconnect (or a disconnect plus a newer
            // connect) may have raced the open.
            if *status == ConnectionStatus::Connecting
                && self.epoch.load(Ordering::SeqCst) == attempt
            {
                *self.transport.lock() = Some(transport.clone());
                *self.session_id.lock() = Some(session_id.clone());
                *status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        };
        if !installed {
            transport.close().await;
            self.bus.log("client.close", "connect superseded by disconnect");
            return Err(LiveError::connection("connect aborted by disconnect"));
        }

        tracing::info!(model = %config.model, %session_id, "live session connected");
        self.bus.publish(LiveEvent::Open);

        let client = self.clone();
        tokio::spawn(async move { client.read_loop(attempt, inbound).await });
        Ok(())
    }

    /// Tear down the current connection.
    ///
    /// Idempotent: always clears the handle and sets the status to
    /// disconnected, regardless of whether the underlying close succeeds;
    /// never raises to the caller. Returns whether a transport close was
    /// actually initiated, so callers know whether a close event will follow.
    pub async fn disconnect(&self) -> bool {
        let transport = {
            *self.status.lock() = ConnectionStatus::Disconnected;
            self.session_id.lock().take();
            self.transport.lock().take()
        };
        match transport {
            Some(transport) => {
                transport.close().await;
                self.bus.log("client.close", "disconnect: close frame sent");
                true
            }
            None => {
                self.bus.log("client.close", "disconnect: no active connection");
                false
            }
        }
    }

    /// Revert a failed connect attempt, unless a newer attempt owns the
    /// status by now.
    fn abort_attempt(&self, attempt: u64) {
        let mut status = self.status.lock();
        if *status == ConnectionStatus::Connecting
            && self.epoch.load(Ordering::SeqCst) == attempt
        {
            *status = ConnectionStatus::Disconnected;
        }
    }

    /// Send content parts as a single conversational turn.
    ///
    /// Valid only when connected; otherwise publishes an `error` event and is
    /// a no-op.
    pub async fn send(&self, parts: Vec<Part>, turn_complete: bool) {
        if !self.is_connected() {
            self.bus.publish(LiveEvent::Error(LiveError::NotConnected.to_string()));
            return;
        }
        let Some(transport) = self.current_transport() else {
            self.bus.publish(LiveEvent::Error("send with no connection handle".to_string()));
            return;
        };
        match serde_json::to_string(&ClientMessage::client_content(parts, turn_complete)) {
            Ok(frame) => {
                if let Err(e) = transport.send(frame).await {
                    self.report_send_failure("client content", &e);
                }
            }
            Err(e) => self.bus.publish(LiveEvent::Error(format!("serialize error: {e}"))),
        }
    }

    /// Transmit captured media frames in order.
    ///
    /// Frames sent before the transport reports ready are silently dropped
    /// (never queued) with no error event. A send failure for one frame never
    /// aborts the remaining frames in the batch.
    pub async fn send_realtime_input(&self, chunks: Vec<MediaChunk>) {
        if !self.is_connected() {
            self.bus.log("client.realtime", "dropping media: not connected");
            return;
        }
        let Some(transport) = self.current_transport() else {
            self.bus.log("client.realtime", "dropping media: no connection handle");
            return;
        };
        if !transport.is_open() {
            self.bus.log("client.realtime", "dropping media: transport not ready");
            return;
        }

        for chunk in chunks {
            let frame = match serde_json::to_string(&ClientMessage::realtime_input(chunk)) {
                Ok(frame) => frame,
                Err(e) => {
                    self.bus.log("client.realtime", format!("serialize error: {e}"));
                    continue;
                }
            };
            if let Err(e) = transport.send(frame).await {
                // Expected race during teardown; other failures are logged
                // but never surfaced as error events for realtime media.
                if is_closing_error(&e) {
                    tracing::debug!("media send raced teardown: {e}");
                } else {
                    self.bus.log("client.realtime", format!("media send failed: {e}"));
                }
            }
        }
    }

    /// Send tool-call results back to the model.
    ///
    /// Valid only when connected. An empty result list is logged and never
    /// put on the wire.
    pub async fn send_tool_response(&self, responses: Vec<FunctionResponse>) {
        if !self.is_connected() {
            self.bus.publish(LiveEvent::Error(LiveError::NotConnected.to_string()));
            return;
        }
        if responses.is_empty() {
            self.bus.log("client.tool", "skipping empty tool response");
            return;
        }
        let Some(transport) = self.current_transport() else {
            self.bus
                .publish(LiveEvent::Error("tool response with no connection handle".to_string()));
            return;
        };
        match serde_json::to_string(&ClientMessage::tool_response(responses)) {
            Ok(frame) => {
                if let Err(e) = transport.send(frame).await {
                    self.report_send_failure("tool response", &e);
                }
            }
            Err(e) => self.bus.publish(LiveEvent::Error(format!("serialize error: {e}"))),
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    fn reset_to_disconnected(&self) {
        *self.status.lock() = ConnectionStatus::Disconnected;
        self.session_id.lock().take();
        self.transport.lock().take();
    }

    fn report_send_failure(&self, what: &str, err: &LiveError) {
        if is_closing_error(err) {
            tracing::debug!("{what} send raced teardown: {err}");
        } else {
            self.bus.publish(LiveEvent::Error(format!("{what} send failed: {err}")));
        }
    }

    async fn read_loop(self: Arc<Self>, attempt: u64, mut inbound: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            // A newer connect may own the status by now; a stale session's
            // events must not touch it.
            let current = self.epoch.load(Ordering::SeqCst) == attempt;
            match event {
                TransportEvent::Message(text) => self.dispatch_frame(&text),
                TransportEvent::Error(e) => {
                    // The handle stays in place; a close event follows per
                    // transport semantics.
                    if current {
                        *self.status.lock() = ConnectionStatus::Disconnected;
                    }
                    self.bus.publish(LiveEvent::Error(e));
                }
                TransportEvent::Closed { code, reason } => {
                    if current {
                        self.reset_to_disconnected();
                    }
                    let detail = extract_close_detail(&reason);
                    tracing::info!(code, %reason, "live session closed");
                    self.bus.publish(LiveEvent::Close { code, reason, detail });
                    return;
                }
            }
        }
    }

    /// Demultiplex one inbound frame into events, highest priority first.
    /// Events derived from this frame are published before the caller hands
    /// over the next frame.
    fn dispatch_frame(&self, raw: &str) {
        let message: ServerMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                self.bus.log("client.recv", format!("unparseable frame: {e}"));
                return;
            }
        };

        if message.setup_complete.is_some() {
            self.bus.publish(LiveEvent::SetupComplete);
            return;
        }
        if let Some(tool_call) = message.tool_call {
            self.bus.publish(LiveEvent::ToolCall(tool_call.function_calls));
            return;
        }
        if let Some(cancellation) = message.tool_call_cancellation {
            self.bus.publish(LiveEvent::ToolCallCancellation(cancellation.ids));
            return;
        }

        let Some(content) = message.server_content else {
            self.bus.log_with_payload(
                "client.recv",
                "unmatched message",
                serde_json::from_str(raw).ok(),
            );
            return;
        };

        let mut matched = false;

        // Grounding can co-occur with any other server content in one frame.
        if let Some(meta) = &content.grounding_metadata {
            if !meta.grounding_chunks.is_empty() {
                let refs: Vec<GroundingReference> = meta
                    .grounding_chunks
                    .iter()
                    .filter_map(|chunk| chunk.web.as_ref())
                    .map(|web| GroundingReference { uri: web.uri.clone(), title: web.title.clone() })
                    .collect();
                self.bus.publish(LiveEvent::Grounding(refs));
                matched = true;
            }
        }

        // Interrupted short-circuits before the turn-complete check.
        if content.interrupted {
            self.bus.publish(LiveEvent::Interrupted);
            return;
        }
        if content.turn_complete {
            // A turn-complete frame may still carry trailing model output,
            // so processing continues.
            self.bus.publish(LiveEvent::TurnComplete);
            matched = true;
        }

        if let Some(turn) = content.model_turn {
            let (audio_parts, other_parts): (Vec<Part>, Vec<Part>) =
                turn.parts.into_iter().partition(Part::is_audio);

            for part in &audio_parts {
                let Some(data) = part.inline_data.as_ref() else { continue };
                match BASE64.decode(&data.data) {
                    Ok(bytes) => self.bus.publish(LiveEvent::Audio(bytes)),
                    Err(e) => {
                        // Only this part is dropped; siblings still publish.
                        self.bus.log("client.audio", format!("base64 decode failed: {e}"));
                    }
                }
            }
            matched |= !audio_parts.is_empty();

            if !other_parts.is_empty() {
                self.bus.publish(LiveEvent::Content(other_parts));
                matched = true;
            }
        }

        if !matched {
            self.bus.log_with_payload(
                "client.recv",
                "unmatched message",
                serde_json::from_str(raw).ok(),
            );
        }
    }
}

fn is_closing_error(err: &LiveError) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("closing") || text.contains("closed")
}

/// Extract the user-facing reason from a close-reason string.
///
/// A reason that case-insensitively contains "error" yields a detail; when a
/// bracketed `ERROR]` marker is present, only the text following it is kept.
fn extract_close_detail(reason: &str) -> Option<String> {
    if !reason.to_lowercase().contains("error") {
        return None;
    }
    const MARKER: &str = "ERROR]";
    match reason.find(MARKER) {
        Some(index) => Some(reason[index + MARKER.len()..].trim().to_string()),
        None => Some(reason.to_string()),
    }
}
