use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use reqwest::{
    header::COOKIE,
    multipart::{Form, Part},
    Client,
};
use shared::protocol::{ChannelEvent, ClientFrame, Message, UploadResponse};
use tracing::{error, info};
use url::Url;

use crate::{
    connection::ConnectionManager,
    error::{SendError, UploadError},
};

const CONTENT_FIELD: &str = "content";
const ATTACHMENT_FIELD: &str = "attachment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    pub file_name: String,
}

impl Attachment {
    fn from_path(path: PathBuf) -> Self {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, file_name }
    }
}

/// The compose form: message text, at most one attachment, and whatever
/// hidden fields the page embeds (CSRF token and similar).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeForm {
    action: Url,
    content: String,
    attachment: Option<Attachment>,
    file_name_display: String,
    hidden_fields: Vec<(String, String)>,
}

impl ComposeForm {
    pub fn new(action: Url) -> Self {
        Self {
            action,
            content: String::new(),
            attachment: None,
            file_name_display: String::new(),
            hidden_fields: Vec::new(),
        }
    }

    pub fn with_hidden_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.hidden_fields.push((name.into(), value.into()));
        self
    }

    pub fn action(&self) -> &Url {
        &self.action
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Replaces any previously selected file.
    pub fn select_file(&mut self, path: impl AsRef<Path>) {
        let attachment = Attachment::from_path(path.as_ref().to_path_buf());
        self.file_name_display = attachment.file_name.clone();
        self.attachment = Some(attachment);
    }

    pub fn clear_file(&mut self) {
        self.attachment = None;
        self.file_name_display.clear();
    }

    pub fn file_name_display(&self) -> &str {
        &self.file_name_display
    }

    /// Clears user input. Hidden fields and the file-name display are left
    /// alone, as a page form reset would.
    pub fn reset(&mut self) {
        self.content.clear();
        self.attachment = None;
    }

    pub fn clear_file_name_display(&mut self) {
        self.file_name_display.clear();
    }

    pub fn upload_payload(&self) -> UploadPayload {
        let mut fields = self.hidden_fields.clone();
        fields.push((CONTENT_FIELD.to_string(), self.content.clone()));
        UploadPayload {
            fields,
            attachment: self.attachment.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPayload {
    pub fields: Vec<(String, String)>,
    pub attachment: Option<Attachment>,
}

/// Persists a submission and returns the server's canonical message.
#[async_trait]
pub trait UploadEndpoint: Send + Sync {
    async fn upload(&self, action: &Url, payload: UploadPayload) -> Result<Message, UploadError>;
}

pub struct HttpUploader {
    http: Client,
    session_cookie: Option<String>,
}

impl HttpUploader {
    pub fn new(session_cookie: Option<String>) -> Self {
        Self {
            http: Client::new(),
            session_cookie,
        }
    }
}

#[async_trait]
impl UploadEndpoint for HttpUploader {
    async fn upload(&self, action: &Url, payload: UploadPayload) -> Result<Message, UploadError> {
        let mut form = Form::new();
        for (name, value) in payload.fields {
            form = form.text(name, value);
        }
        if let Some(attachment) = payload.attachment {
            let bytes = tokio::fs::read(&attachment.path)
                .await
                .map_err(|source| UploadError::Attachment {
                    path: attachment.path.display().to_string(),
                    source,
                })?;
            form = form.part(
                ATTACHMENT_FIELD,
                Part::bytes(bytes).file_name(attachment.file_name),
            );
        }

        let mut request = self
            .http
            .post(action.clone())
            .header("X-Requested-With", "XMLHttpRequest")
            .multipart(form);
        if let Some(cookie) = &self.session_cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
            });
        }
        let body: UploadResponse = response.json().await?;
        if !body.is_success() {
            return Err(UploadError::Refused(body.status));
        }
        Ok(body.message)
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Persisted and rebroadcast to every participant.
    Published(Message),
    /// Persisted, but the channel refused the rebroadcast. Other participants
    /// only see it after a reload.
    PersistedOnly { message: Message, error: SendError },
}

pub struct MessageDispatcher {
    uploader: Arc<dyn UploadEndpoint>,
    connection: Arc<ConnectionManager>,
}

impl MessageDispatcher {
    pub fn new(uploader: Arc<dyn UploadEndpoint>, connection: Arc<ConnectionManager>) -> Self {
        Self {
            uploader,
            connection,
        }
    }

    /// Uploads the form, then rebroadcasts the canonical message. The sender's
    /// own copy is rendered only when the rebroadcast comes back over the
    /// channel. On upload failure the form is left untouched.
    pub async fn submit(&self, form: &mut ComposeForm) -> Result<SubmitOutcome, UploadError> {
        let message = match self
            .uploader
            .upload(form.action(), form.upload_payload())
            .await
        {
            Ok(message) => message,
            Err(err) => {
                error!(action = %form.action(), error = %err, "dispatcher: upload failed");
                return Err(err);
            }
        };

        form.reset();
        form.clear_file_name_display();

        let event = ChannelEvent::ChatMessage {
            message: message.clone(),
        };
        match self.connection.send(&event).await {
            Ok(()) => {
                info!(sender_id = %message.sender_id, "dispatcher: message published");
                Ok(SubmitOutcome::Published(message))
            }
            Err(err) => {
                error!(
                    sender_id = %message.sender_id,
                    error = %err,
                    "dispatcher: message persisted but rebroadcast failed; participants will miss it until reload"
                );
                Ok(SubmitOutcome::PersistedOnly {
                    message,
                    error: err,
                })
            }
        }
    }

    pub async fn notify_typing(&self, is_typing: bool) -> Result<(), SendError> {
        self.connection
            .send(&ClientFrame::Typing { is_typing })
            .await
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
