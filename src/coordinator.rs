//! Connection coordinator.
//!
//! The single entry point for the presentation layer: owns the desired
//! session configuration, serializes connect/disconnect requests, applies the
//! reconnect-on-config-change policy, and bridges the event fabric to the
//! audio pipelines. External collaborators never touch the session client
//! directly.

use crate::capture::{AudioCapture, CaptureEvent};
use crate::client::{ConnectionStatus, LiveClient};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::events::{GroundingReference, LiveEvent};
use crate::playback::AudioPlayback;
use crate::protocol::MediaChunk;
use crate::transport::Connector;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Bound on how long a disconnect caller can wait for the close event.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestration layer above [`LiveClient`].
///
/// All lifecycle triggers from the UI map onto methods here; reconnection
/// complexity stays hidden behind them.
pub struct Coordinator {
    client: Arc<LiveClient>,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    config: Mutex<SessionConfig>,
    applied: Mutex<Option<SessionConfig>>,
    grounding: Mutex<Vec<GroundingReference>>,
    disconnect_flight: tokio::sync::Mutex<Option<watch::Receiver<bool>>>,
    reconnecting: AtomicBool,
    muted: AtomicBool,
}

impl Coordinator {
    /// Build a coordinator over an arbitrary connector.
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::with_client(LiveClient::new(connector))
    }

    /// Build a coordinator for the hosted live service.
    pub fn gemini(api_key: impl AsRef<str>) -> Arc<Self> {
        Self::with_client(LiveClient::gemini(api_key))
    }

    fn with_client(client: Arc<LiveClient>) -> Arc<Self> {
        let (capture, capture_events) = AudioCapture::new();
        let coordinator = Arc::new(Self {
            client,
            capture,
            playback: AudioPlayback::new(),
            config: Mutex::new(SessionConfig::default()),
            applied: Mutex::new(None),
            grounding: Mutex::new(Vec::new()),
            disconnect_flight: tokio::sync::Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            muted: AtomicBool::new(false),
        });
        tokio::spawn(Self::pump_events(coordinator.clone(), coordinator.client.events()));
        tokio::spawn(Self::pump_capture(coordinator.clone(), capture_events));
        coordinator
    }

    /// Replace the desired configuration. Takes no connection action; see
    /// [`Coordinator::update_config`] for the reconnecting variant.
    pub fn set_config(&self, config: SessionConfig) {
        *self.config.lock() = config;
    }

    /// Replace the desired configuration and, when connected with a
    /// structurally different one, reconnect with it.
    ///
    /// The reconnect runs as one guarded operation so rapid successive edits
    /// never race two teardowns. A reconnect failure surfaces as an `error`
    /// event since no caller awaits this as a result.
    pub async fn update_config(self: &Arc<Self>, config: SessionConfig) {
        self.set_config(config);
        self.reconcile().await;
    }

    async fn reconcile(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            // The in-flight reconnect re-checks the desired configuration
            // after it lands, so this edit is not lost.
            tracing::debug!("reconnect already in progress");
            return;
        }
        loop {
            if !self.client.is_connected() {
                break;
            }
            {
                let desired = self.config.lock().clone();
                if self.applied.lock().as_ref() == Some(&desired) {
                    break;
                }
            }
            tracing::info!("configuration changed, reconnecting");
            self.disconnect().await;
            match self.connect(None).await {
                // Loop again: an edit may have landed while reconnecting.
                Ok(()) => continue,
                Err(e) => {
                    self.client.bus().publish(LiveEvent::Error(format!("reconnect failed: {e}")));
                    break;
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);

        // An edit that lost the guard race between the final check above and
        // the release still has to be applied.
        let desired = self.config.lock().clone();
        if self.client.is_connected() && self.applied.lock().as_ref() != Some(&desired) {
            Box::pin(self.reconcile()).await;
        }
    }

    /// Establish the session using the override configuration if supplied,
    /// else the held one. No-op when already connected.
    pub async fn connect(&self, override_config: Option<SessionConfig>) -> Result<()> {
        if self.client.is_connected() {
            return Ok(());
        }
        let config = override_config.unwrap_or_else(|| self.config.lock().clone());
        self.grounding.lock().clear();
        self.client.connect(&config).await?;
        *self.applied.lock() = Some(config.clone());
        *self.config.lock() = config;
        Ok(())
    }

    /// Tear down the session. Idempotent and safe to call concurrently:
    /// overlapping callers share the outcome of a single teardown, and every
    /// caller resolves within [`DISCONNECT_TIMEOUT`] even if the close event
    /// never arrives.
    pub async fn disconnect(self: &Arc<Self>) {
        let mut waiter = {
            let mut flight = self.disconnect_flight.lock().await;
            match &*flight {
                Some(existing) => existing.clone(),
                None => {
                    if self.client.status() == ConnectionStatus::Disconnected {
                        return;
                    }
                    let (tx, rx) = watch::channel(false);
                    *flight = Some(rx.clone());
                    tokio::spawn(self.clone().run_teardown(tx));
                    rx
                }
            }
        };

        let wait = async {
            loop {
                if *waiter.borrow_and_update() {
                    return;
                }
                if waiter.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, wait).await.is_err() {
            tracing::warn!("disconnect wait timed out");
        }
    }

    async fn run_teardown(self: Arc<Self>, done: watch::Sender<bool>) {
        // Subscribed before the close is initiated so the close event cannot
        // be missed.
        let mut events = self.client.events();
        self.capture.stop();
        self.playback.stop();
        let closing = self.client.disconnect().await;

        // No transport means no close event will follow: either the session
        // was already down, or a connect was still in flight and will now
        // abort itself against the flipped status.
        if closing {
            let wait = async {
                loop {
                    match events.recv().await {
                        Ok(LiveEvent::Close { .. }) => return,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_TIMEOUT, wait).await.is_err() {
                tracing::warn!("close event never arrived, forcing disconnect resolution");
            }
        }
        *self.disconnect_flight.lock().await = None;
        let _ = done.send(true);
    }

    /// Open the microphone and begin streaming captured frames.
    pub async fn start_capture(&self) -> Result<()> {
        self.capture.start().await
    }

    /// Stop streaming captured frames and release the microphone.
    pub fn stop_capture(&self) {
        self.capture.stop();
    }

    /// Open the output device for model audio.
    pub async fn start_playback(&self) -> Result<()> {
        self.playback.start().await
    }

    /// Suppress outbound media frames without releasing the microphone.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Current desired configuration.
    pub fn config(&self) -> SessionConfig {
        self.config.lock().clone()
    }

    /// Subscribe to the event fabric.
    pub fn events(&self) -> broadcast::Receiver<LiveEvent> {
        self.client.events()
    }

    /// Handle for sending conversational turns and tool responses.
    pub fn client(&self) -> &Arc<LiveClient> {
        &self.client
    }

    /// Grounding references accumulated in arrival order since the last
    /// successful open. Uniqueness by URI is left to the presentation layer.
    pub fn grounding(&self) -> Vec<GroundingReference> {
        self.grounding.lock().clone()
    }

    /// Smoothed microphone input level.
    pub fn input_volume(&self) -> f32 {
        self.capture.volume()
    }

    /// Smoothed model audio output level.
    pub fn output_volume(&self) -> f32 {
        self.playback.volume()
    }

    async fn pump_events(self: Arc<Self>, mut events: broadcast::Receiver<LiveEvent>) {
        loop {
            match events.recv().await {
                Ok(LiveEvent::Open) => self.grounding.lock().clear(),
                Ok(LiveEvent::Grounding(refs)) => self.grounding.lock().extend(refs),
                Ok(LiveEvent::Audio(bytes)) => self.playback.play(&bytes),
                Ok(LiveEvent::Interrupted) => self.playback.stop(),
                Ok(LiveEvent::Close { .. }) => {
                    self.capture.stop();
                    self.playback.stop();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn pump_capture(self: Arc<Self>, mut frames: mpsc::UnboundedReceiver<CaptureEvent>) {
        while let Some(event) = frames.recv().await {
            match event {
                CaptureEvent::Data(payload) => {
                    if self.muted.load(Ordering::Relaxed) {
                        continue;
                    }
                    self.client
                        .send_realtime_input(vec![MediaChunk::audio_pcm(
                            payload,
                            crate::capture::TARGET_SAMPLE_RATE,
                        )])
                        .await;
                }
                CaptureEvent::Volume(_) => {}
            }
        }
    }
}
