use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{SessionId, UserId},
    protocol::{Message, TypingNotice},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};
use url::Url;

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod location;
pub mod renderer;
pub mod transport;
pub mod typing;

use config::ClientSettings;
use connection::{ChannelConnector, ConnectionManager, ConnectionState, EventHandler, Scheduler};
use dispatcher::{ComposeForm, HttpUploader, MessageDispatcher, SubmitOutcome, UploadEndpoint};
use error::{SendError, UploadError};
use location::PageLocation;
use renderer::{MessageRenderer, RenderedMessage, TranscriptEntry, Viewport};
use transport::WebSocketConnector;
use typing::TypingIndicator;

const CSRF_FIELD: &str = "csrfmiddlewaretoken";
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    MessageRendered(RenderedMessage),
    NoticeRendered(String),
    TypingChanged(Vec<UserId>),
    Error(String),
}

/// Delivery path from the channel into the transcript and typing indicator.
struct DeliveryRouter {
    renderer: MessageRenderer,
    typing: TypingIndicator,
    events: broadcast::Sender<ClientEvent>,
}

impl DeliveryRouter {
    fn typing_changed(&self, typing: Option<Vec<UserId>>) {
        if let Some(typing) = typing {
            let _ = self.events.send(ClientEvent::TypingChanged(typing));
        }
    }

    async fn sweep_typing(&self) {
        let mut ticks = tokio::time::interval(TYPING_SWEEP_INTERVAL);
        loop {
            ticks.tick().await;
            self.typing_changed(self.typing.expire(Instant::now()).await);
        }
    }
}

#[async_trait]
impl EventHandler for DeliveryRouter {
    async fn on_chat_message(&self, message: Message) {
        self.typing_changed(self.typing.message_from(message.sender_id).await);
        let rendered = self.renderer.append(message).await;
        let _ = self.events.send(ClientEvent::MessageRendered(rendered));
    }

    async fn on_typing(&self, notice: TypingNotice) {
        self.typing_changed(self.typing.apply(notice).await);
    }

    async fn on_disconnect(&self) {
        self.typing_changed(self.typing.clear().await);
    }
}

/// Owns and wires one connection manager, dispatcher and renderer for a
/// single chat page. Background tasks stop when the client is dropped.
pub struct ChatClient {
    location: PageLocation,
    upload_action: Url,
    csrf_token: Option<String>,
    connection: Arc<ConnectionManager>,
    dispatcher: MessageDispatcher,
    router: Arc<DeliveryRouter>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        Self::new_with_dependencies(
            settings,
            Arc::new(WebSocketConnector::new(settings.session_cookie.clone())),
            Arc::new(connection::TokioScheduler),
            Arc::new(HttpUploader::new(settings.session_cookie.clone())),
        )
    }

    pub fn new_with_dependencies(
        settings: &ClientSettings,
        connector: Arc<dyn ChannelConnector>,
        scheduler: Arc<dyn Scheduler>,
        uploader: Arc<dyn UploadEndpoint>,
    ) -> Result<Self> {
        let location = PageLocation::parse(&settings.page_url)?;
        let address = location.channel_address()?;
        if location.session_id().is_empty() {
            warn!(
                page_url = %settings.page_url,
                %address,
                "page path carries no session id; the channel address will be refused"
            );
        }
        let upload_action = match &settings.upload_url {
            Some(raw) => location
                .url()
                .join(raw)
                .with_context(|| format!("invalid upload url '{raw}'"))?,
            None => location.url().clone(),
        };

        let (events, _) = broadcast::channel(1024);
        let router = Arc::new(DeliveryRouter {
            renderer: MessageRenderer::new(settings.current_user_id, settings.label_zone()?),
            typing: TypingIndicator::new(settings.current_user_id),
            events: events.clone(),
        });
        let connection = ConnectionManager::new(address, connector, scheduler, router.clone());
        let dispatcher = MessageDispatcher::new(uploader, Arc::clone(&connection));

        Ok(Self {
            location,
            upload_action,
            csrf_token: settings.csrf_token.clone(),
            connection,
            dispatcher,
            router,
            events,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the channel supervisor. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let mut state_rx = self.connection.subscribe_state();
        let events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                let _ = events.send(ClientEvent::ConnectionStateChanged(state));
            }
        }));
        let router = Arc::clone(&self.router);
        tasks.push(tokio::spawn(async move { router.sweep_typing().await }));
        tasks.push(self.connection.spawn());

        info!(
            session_id = %self.location.session_id(),
            address = %self.connection.address(),
            "chat client started"
        );
    }

    pub fn session_id(&self) -> SessionId {
        self.location.session_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// An empty compose form addressed at the upload endpoint.
    pub fn compose_form(&self) -> ComposeForm {
        let form = ComposeForm::new(self.upload_action.clone());
        match &self.csrf_token {
            Some(token) => form.with_hidden_field(CSRF_FIELD, token.clone()),
            None => form,
        }
    }

    /// Submits the form. Upload failures are also surfaced as a transcript
    /// notice and an `Error` event; the form keeps its content for a retry.
    pub async fn submit(&self, form: &mut ComposeForm) -> Result<SubmitOutcome, UploadError> {
        let outcome = self.dispatcher.submit(form).await;
        match &outcome {
            Ok(SubmitOutcome::Published(_)) => {}
            Ok(SubmitOutcome::PersistedOnly { error, .. }) => {
                let _ = self.events.send(ClientEvent::Error(format!(
                    "message saved but not delivered live: {error}"
                )));
            }
            Err(err) => {
                let text = format!("Message could not be sent: {err}");
                self.router.renderer.notice(&text).await;
                let _ = self.events.send(ClientEvent::NoticeRendered(text));
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
            }
        }
        outcome
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<(), SendError> {
        self.dispatcher.notify_typing(is_typing).await
    }

    pub async fn transcript(&self) -> Vec<TranscriptEntry> {
        self.router.renderer.entries().await
    }

    pub async fn viewport(&self) -> Viewport {
        self.router.renderer.viewport().await
    }

    pub async fn typing_users(&self) -> Vec<UserId> {
        self.router.typing.typing_users().await
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
