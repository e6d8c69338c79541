//! In-memory transport for exercising the client and coordinator without a
//! network.

#![allow(dead_code)]

use async_trait::async_trait;
use live_voice::{Connector, LiveError, Result, Transport, TransportEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};

/// Install the log subscriber once per test binary; `RUST_LOG` controls
/// verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct MockTransport {
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    inbound: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    /// Inject a server frame as if it arrived on the wire.
    pub async fn push_frame(&self, frame: &str) {
        self.inbound
            .send(TransportEvent::Message(frame.to_string()))
            .await
            .unwrap();
    }

    /// Inject a transport error event.
    pub async fn push_error(&self, message: &str) {
        self.inbound
            .send(TransportEvent::Error(message.to_string()))
            .await
            .unwrap();
    }

    /// Inject a remote close, as if the server ended the session.
    pub async fn push_closed(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        self.inbound
            .send(TransportEvent::Closed { code, reason: reason.to_string() })
            .await
            .unwrap();
    }

    /// Flip the readiness flag without closing.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Frames written by the client, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(LiveError::connection("WebSocket is closed"));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        let _ = self
            .inbound
            .send(TransportEvent::Closed { code: 1000, reason: "client disconnect".to_string() })
            .await;
    }
}

#[derive(Default)]
pub struct MockConnector {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    connects: AtomicUsize,
    fail_next: AtomicBool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    /// Hold the next connect open until the returned sender fires (or is
    /// dropped).
    pub fn hold_next_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    /// The transport handed out by the most recent connect.
    pub fn latest(&self) -> Arc<MockTransport> {
        self.transports.lock().last().cloned().unwrap()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock()[index].clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LiveError::connection("simulated connect failure"));
        }
        let (tx, rx) = mpsc::channel(64);
        let transport = Arc::new(MockTransport {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            inbound: tx,
        });
        self.transports.lock().push(transport.clone());
        Ok((transport, rx))
    }
}
