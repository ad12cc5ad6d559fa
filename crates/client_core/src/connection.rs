use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use shared::protocol::{ChannelEvent, Message, TypingNotice};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ConnectionError, SendError};

/// Fixed pause between a closure and the next connection attempt. There is
/// no backoff and no attempt cap.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// An established duplex channel carrying text frames.
#[async_trait]
pub trait DuplexChannel: Send {
    /// Next inbound text frame, `None` once the channel is closed.
    /// Must be cancel-safe: the receive loop races it against outbound frames.
    async fn recv(&mut self) -> Option<Result<String, ConnectionError>>;
    async fn send(&mut self, frame: String) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, address: &Url) -> Result<Box<dyn DuplexChannel>, ConnectionError>;
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn delay(&self, duration: Duration);
}

pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn delay(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Receives decoded channel events in transport-arrival order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_chat_message(&self, message: Message);
    async fn on_typing(&self, notice: TypingNotice);
    /// Called once per closure, before the reconnect delay starts.
    async fn on_disconnect(&self) {}
}

/// An outbound frame and the slot that learns whether it was transmitted.
type Outbound = (String, oneshot::Sender<Result<(), SendError>>);

struct LiveChannel {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

pub struct ConnectionManager {
    address: Url,
    connector: Arc<dyn ChannelConnector>,
    scheduler: Arc<dyn Scheduler>,
    handler: Arc<dyn EventHandler>,
    state: watch::Sender<ConnectionState>,
    live: Mutex<Option<LiveChannel>>,
}

impl ConnectionManager {
    pub fn new(
        address: Url,
        connector: Arc<dyn ChannelConnector>,
        scheduler: Arc<dyn Scheduler>,
        handler: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Arc::new(Self {
            address,
            connector,
            scheduler,
            handler,
            state,
            live: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts the connect/receive/reconnect loop. It runs until the returned
    /// task is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.supervise().await })
    }

    async fn supervise(&self) {
        let mut generation = 0_u64;
        loop {
            generation += 1;
            self.state.send_replace(ConnectionState::Connecting);
            debug!(address = %self.address, generation, "chat channel: connecting");

            match self.connector.open(&self.address).await {
                Ok(channel) => {
                    info!(address = %self.address, generation, "chat channel: open");
                    self.run_channel(generation, channel).await;
                }
                Err(err) => {
                    warn!(
                        address = %self.address,
                        generation,
                        error = %err,
                        "chat channel: connection attempt failed"
                    );
                }
            }

            self.on_close(generation).await;
        }
    }

    async fn run_channel(&self, generation: u64, mut channel: Box<dyn DuplexChannel>) {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        *self.live.lock().await = Some(LiveChannel {
            generation,
            outbound,
        });
        self.state.send_replace(ConnectionState::Open);

        loop {
            tokio::select! {
                // queued frames go out before a closure is acted on
                biased;
                Some((frame, sent)) = outbound_rx.recv() => {
                    match channel.send(frame).await {
                        Ok(()) => {
                            let _ = sent.send(Ok(()));
                        }
                        Err(err) => {
                            warn!(generation, error = %err, "chat channel: send failed");
                            let _ = sent.send(Err(SendError::Interrupted));
                            break;
                        }
                    }
                }
                inbound = channel.recv() => match inbound {
                    Some(Ok(frame)) => self.on_event(&frame).await,
                    Some(Err(err)) => {
                        warn!(generation, error = %err, "chat channel: receive failed");
                        break;
                    }
                    None => {
                        info!(generation, "chat channel: closed by peer");
                        break;
                    }
                },
            }
        }

        self.retire(generation).await;
        outbound_rx.close();
        let mut unsent = 0_usize;
        while let Ok((_, sent)) = outbound_rx.try_recv() {
            let _ = sent.send(Err(SendError::Interrupted));
            unsent += 1;
        }
        if unsent > 0 {
            warn!(
                generation,
                unsent, "chat channel: closed before queued frames were transmitted"
            );
        }
    }

    async fn retire(&self, generation: u64) {
        let mut live = self.live.lock().await;
        if live
            .as_ref()
            .is_some_and(|channel| channel.generation == generation)
        {
            *live = None;
        }
    }

    /// Marks the channel closed and waits out the reconnect delay. Called
    /// exactly once per closure; the supervisor then makes one new attempt.
    async fn on_close(&self, generation: u64) {
        self.retire(generation).await;
        self.state.send_replace(ConnectionState::Closed);
        self.handler.on_disconnect().await;
        info!(
            address = %self.address,
            generation,
            delay_secs = RECONNECT_DELAY.as_secs(),
            "chat channel: scheduling reconnect"
        );
        self.scheduler.delay(RECONNECT_DELAY).await;
    }

    /// Decodes one inbound frame and routes it. Anything that does not decode
    /// is dropped here and never reaches the handler.
    pub async fn on_event(&self, frame: &str) {
        match ChannelEvent::decode(frame) {
            Ok(ChannelEvent::ChatMessage { message }) => {
                self.handler.on_chat_message(message).await;
            }
            Ok(ChannelEvent::Typing(notice)) => {
                self.handler.on_typing(notice).await;
            }
            Ok(ChannelEvent::Unknown) => {
                debug!(address = %self.address, "chat channel: ignoring unrecognized event type");
            }
            Err(err) => {
                warn!(
                    address = %self.address,
                    error = %err,
                    "chat channel: dropping malformed event"
                );
            }
        }
    }

    /// Serializes `payload` and resolves once the live channel has
    /// transmitted it. A frame the channel closes on is reported as
    /// `SendError::Interrupted`, never as sent.
    pub async fn send<T>(&self, payload: &T) -> Result<(), SendError>
    where
        T: Serialize + ?Sized,
    {
        let frame = serde_json::to_string(payload)?;
        let (sent_tx, sent_rx) = oneshot::channel();
        {
            let live = self.live.lock().await;
            let Some(channel) = live.as_ref() else {
                return Err(SendError::NotOpen {
                    state: ConnectionState::Closed,
                });
            };
            let state = self.state();
            if state != ConnectionState::Open {
                return Err(SendError::NotOpen { state });
            }
            channel
                .outbound
                .send((frame, sent_tx))
                .map_err(|_| SendError::Interrupted)?;
        }
        sent_rx.await.unwrap_or(Err(SendError::Interrupted))
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
