//! Typed event fabric.
//!
//! Every component publishes domain events onto an [`EventBus`]; any number of
//! subscribers consume them without the publisher knowing who is listening.
//! Events derived from one inbound frame are published before the next frame
//! is processed, and subscribers observe that order.

use crate::protocol::{FunctionCall, Part};
use serde_json::Value;
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Default buffered capacity per subscriber.
const BUS_CAPACITY: usize = 256;

/// A citation supplied by the remote service in support of generated content.
///
/// References accumulate in arrival order for the lifetime of one session;
/// uniqueness by URI is a presentation-boundary concern, not enforced here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingReference {
    pub uri: String,
    pub title: String,
}

/// A diagnostic log entry. Append-only; never affects control flow.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub category: String,
    pub message: String,
    /// Number of consecutive identical entries this one stands for.
    pub count: u32,
    pub payload: Option<Value>,
}

/// Events published on the fabric, one closed variant per category.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// The duplex connection opened and the setup frame was accepted for send.
    Open,
    /// The connection closed (locally or remotely).
    Close {
        code: u16,
        reason: String,
        /// User-facing reason extracted from a bracketed `ERROR]` marker, if any.
        detail: Option<String>,
    },
    /// A non-recoverable or actionable condition, surfaced exactly once.
    Error(String),
    /// One decoded inbound audio buffer (raw PCM bytes).
    Audio(Vec<u8>),
    /// Non-audio model output parts from one frame.
    Content(Vec<Part>),
    /// The model's current turn was interrupted.
    Interrupted,
    /// The model marked its turn complete.
    TurnComplete,
    /// The service acknowledged the setup frame.
    SetupComplete,
    /// The model requested tool invocations.
    ToolCall(Vec<FunctionCall>),
    /// The model cancelled previously requested tool invocations.
    ToolCallCancellation(Vec<String>),
    /// Grounding references that arrived in one frame, in order.
    Grounding(Vec<GroundingReference>),
    /// Diagnostic log entry.
    Log(LogEntry),
}

/// Multi-consumer typed publish/subscribe bus.
///
/// Publishing never blocks and never fails; if no subscriber is attached the
/// event is dropped. Consecutive identical log entries are coalesced into one
/// entry with an incremented repeat count.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LiveEvent>,
    last_log: std::sync::Arc<parking_lot::Mutex<Option<(String, String, u32)>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender, last_log: Default::default() }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: LiveEvent) {
        if !matches!(event, LiveEvent::Log(_)) {
            // Any non-log event breaks a log coalescing run.
            *self.last_log.lock() = None;
        }
        let _ = self.sender.send(event);
    }

    /// Publish a diagnostic log entry, coalescing consecutive repeats.
    pub fn log(&self, category: impl Into<String>, message: impl Into<String>) {
        self.log_with_payload(category, message, None)
    }

    /// Publish a diagnostic log entry carrying a structured payload.
    pub fn log_with_payload(
        &self,
        category: impl Into<String>,
        message: impl Into<String>,
        payload: Option<Value>,
    ) {
        let category = category.into();
        let message = message.into();

        let count = {
            let mut last = self.last_log.lock();
            match last.as_mut() {
                Some((cat, msg, n)) if *cat == category && *msg == message => {
                    *n += 1;
                    *n
                }
                _ => {
                    *last = Some((category.clone(), message.clone(), 1));
                    1
                }
            }
        };

        tracing::debug!(category = %category, count, "{message}");
        let _ = self.sender.send(LiveEvent::Log(LogEntry {
            timestamp: SystemTime::now(),
            category,
            message,
            count,
            payload,
        }));
    }
}
