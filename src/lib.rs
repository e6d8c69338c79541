//! Realtime bidirectional voice streaming client.
//!
//! Maintains a single logical session with a conversational service over a
//! persistent WebSocket, while capturing microphone audio for outbound
//! transmission and scheduling decoded model audio for gapless playback.
//!
//! # Architecture
//!
//! - [`LiveClient`] owns the duplex connection: outbound intents become
//!   protocol frames, inbound frames are demultiplexed into typed
//!   [`LiveEvent`]s on a publish/subscribe bus.
//! - [`Coordinator`] sits above the client: it owns the session
//!   configuration, applies the reconnect-on-config-change policy, serializes
//!   connect/disconnect, and bridges events to the audio pipelines.
//! - [`AudioCapture`] and [`AudioPlayback`] run the devices on dedicated
//!   threads and exchange data with the control flow only through channels.
//!
//! # Example
//!
//! ```no_run
//! use live_voice::{Coordinator, LiveEvent, SessionConfig};
//!
//! # async fn run() -> live_voice::Result<()> {
//! let coordinator = Coordinator::gemini(std::env::var("GEMINI_API_KEY").unwrap_or_default());
//! coordinator.set_config(
//!     SessionConfig::builder()
//!         .voice("Aoede")
//!         .instruction("You are a friendly voice assistant.")
//!         .web_grounding(true)
//!         .build(),
//! );
//!
//! let mut events = coordinator.events();
//! coordinator.connect(None).await?;
//! while let Ok(event) = events.recv().await {
//!     if let LiveEvent::Close { .. } = event {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod transport;

pub use capture::{AudioCapture, CaptureEvent, FRAME_SAMPLES, TARGET_SAMPLE_RATE};
pub use client::{ConnectionStatus, LiveClient};
pub use config::{SessionConfig, SessionConfigBuilder, ToolDefinition, DEFAULT_MODEL};
pub use coordinator::{Coordinator, DISCONNECT_TIMEOUT};
pub use error::{LiveError, Result};
pub use events::{EventBus, GroundingReference, LiveEvent, LogEntry};
pub use playback::{AudioPlayback, PLAYBACK_SAMPLE_RATE};
pub use protocol::{FunctionCall, FunctionResponse, MediaChunk, Part};
pub use transport::{Connector, Transport, TransportEvent, WsConnector};
