use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::UserId,
    protocol::{Message, TypingNotice},
};
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use url::Url;

use crate::{
    connection::{ChannelConnector, DuplexChannel, EventHandler, Scheduler},
    dispatcher::{UploadEndpoint, UploadPayload},
    error::{ConnectionError, UploadError},
};

pub(crate) fn message(sender: i64, content: &str) -> Message {
    Message {
        sender_id: UserId(sender),
        content: content.to_string(),
        attachment: None,
        timestamp: "2024-01-01T15:07:00Z".parse().expect("timestamp"),
        sender_name: None,
    }
}

pub(crate) fn chat_frame(message: &Message) -> String {
    serde_json::json!({ "type": "chat_message", "message": message }).to_string()
}

/// Server side of one in-memory channel. Dropping `inbound` closes the
/// channel from the server's end.
pub(crate) struct PeerEnd {
    pub inbound: mpsc::UnboundedSender<String>,
    pub outbound: mpsc::UnboundedReceiver<String>,
}

pub(crate) struct MemoryConnector {
    peers: mpsc::UnboundedSender<PeerEnd>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
    open_now: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    addresses: Mutex<Vec<Url>>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEnd>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            failures_remaining: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            open_now: Arc::new(AtomicUsize::new(0)),
            max_open: Arc::new(AtomicUsize::new(0)),
            addresses: Mutex::new(Vec::new()),
        });
        (connector, peers_rx)
    }

    pub fn fail_next(&self, attempts: usize) {
        self.failures_remaining.store(attempts, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub async fn addresses(&self) -> Vec<Url> {
        self.addresses.lock().await.clone()
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn open(&self, address: &Url) -> Result<Box<dyn DuplexChannel>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().await.push(address.clone());
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectionError::Closed);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);
        let _ = self.peers.send(PeerEnd {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });
        Ok(Box::new(MemoryChannel {
            inbound: inbound_rx,
            outbound: outbound_tx,
            open_now: Arc::clone(&self.open_now),
        }))
    }
}

struct MemoryChannel {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    open_now: Arc<AtomicUsize>,
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DuplexChannel for MemoryChannel {
    async fn recv(&mut self) -> Option<Result<String, ConnectionError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, frame: String) -> Result<(), ConnectionError> {
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::Closed)
    }
}

/// Records every requested delay and holds it until the test releases it.
pub(crate) struct ManualScheduler {
    delays: Mutex<Vec<Duration>>,
    permits: Semaphore,
    requested: watch::Sender<usize>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        let (requested, _) = watch::channel(0);
        Arc::new(Self {
            delays: Mutex::new(Vec::new()),
            permits: Semaphore::new(0),
            requested,
        })
    }

    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }

    pub async fn wait_for_requests(&self, count: usize) {
        let mut requested = self.requested.subscribe();
        requested
            .wait_for(|n| *n >= count)
            .await
            .expect("scheduler alive");
    }

    pub async fn delays(&self) -> Vec<Duration> {
        self.delays.lock().await.clone()
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn delay(&self, duration: Duration) {
        self.delays.lock().await.push(duration);
        self.requested.send_modify(|n| *n += 1);
        self.permits
            .acquire()
            .await
            .expect("scheduler semaphore")
            .forget();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    Chat(Message),
    Typing(TypingNotice),
    Disconnected,
}

pub(crate) struct RecordingHandler {
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (deliveries, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { deliveries }), rx)
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_chat_message(&self, message: Message) {
        let _ = self.deliveries.send(Delivery::Chat(message));
    }

    async fn on_typing(&self, notice: TypingNotice) {
        let _ = self.deliveries.send(Delivery::Typing(notice));
    }

    async fn on_disconnect(&self) {
        let _ = self.deliveries.send(Delivery::Disconnected);
    }
}

/// Upload endpoint double. Optionally waits on `gate` before answering so
/// tests can interleave channel traffic with an in-flight upload.
pub(crate) struct StubUploader {
    response: Result<Message, u16>,
    gate: Option<Arc<Notify>>,
    pub payloads: Mutex<Vec<UploadPayload>>,
}

impl StubUploader {
    pub fn accepting(message: Message) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(message),
            gate: None,
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn rejecting(status: u16) -> Arc<Self> {
        Arc::new(Self {
            response: Err(status),
            gate: None,
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn gated(message: Message, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(message),
            gate: Some(gate),
            payloads: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl UploadEndpoint for StubUploader {
    async fn upload(&self, _action: &Url, payload: UploadPayload) -> Result<Message, UploadError> {
        self.payloads.lock().await.push(payload);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.response {
            Ok(message) => Ok(message.clone()),
            Err(status) => Err(UploadError::Rejected { status: *status }),
        }
    }
}
