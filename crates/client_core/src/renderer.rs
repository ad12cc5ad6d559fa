use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local, Utc};
use shared::{domain::UserId, protocol::Message};
use tokio::sync::Mutex;
use tracing::warn;
use url::Url;

/// Escapes `& < > " '` so untrusted text is inserted as data, never markup.
/// Single pass, so each character is escaped exactly once.
pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn safe_attachment_href(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(escape_html(raw)),
        Ok(url) => {
            warn!(scheme = url.scheme(), "renderer: refusing attachment link");
            None
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => Some(escape_html(raw)),
        Err(err) => {
            warn!(error = %err, "renderer: unparseable attachment link");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Own,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub origin: Origin,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    /// Unescaped text, for surfaces that do not interpret markup.
    pub content: String,
    pub attachment_href: Option<String>,
    pub time_label: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    Message(RenderedMessage),
    Notice { text: String, html: String },
}

impl TranscriptEntry {
    fn height(&self) -> usize {
        match self {
            TranscriptEntry::Message(message) => {
                let body = message.content.lines().count().max(1);
                let attachment = usize::from(message.attachment_href.is_some());
                body + attachment + 1
            }
            TranscriptEntry::Notice { .. } => 1,
        }
    }

    pub fn html(&self) -> &str {
        match self {
            TranscriptEntry::Message(message) => &message.html,
            TranscriptEntry::Notice { html, .. } => html,
        }
    }
}

/// Scroll geometry of the transcript, in rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub scroll_top: usize,
    pub scroll_height: usize,
}

impl Viewport {
    pub fn is_pinned_to_bottom(&self) -> bool {
        self.scroll_top == self.scroll_height
    }
}

/// Zone for time-of-day labels. `Local` is resolved per message so labels
/// follow daylight-saving changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelZone {
    Fixed(FixedOffset),
    Local,
}

impl LabelZone {
    pub fn time_label(&self, timestamp: &DateTime<Utc>) -> String {
        match self {
            LabelZone::Fixed(offset) => timestamp.with_timezone(offset).format("%-I:%M %p"),
            LabelZone::Local => timestamp.with_timezone(&Local).format("%-I:%M %p"),
        }
        .to_string()
    }
}

impl From<FixedOffset> for LabelZone {
    fn from(offset: FixedOffset) -> Self {
        LabelZone::Fixed(offset)
    }
}

type GrowthObserver = Box<dyn Fn(&mut Viewport) + Send + Sync>;

/// Append-only list of rendered entries. Every insertion, whatever inserted
/// it, notifies the growth observers after the content has grown.
#[derive(Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    viewport: Viewport,
    observers: Vec<GrowthObserver>,
}

impl Transcript {
    pub fn observe_growth(&mut self, observer: impl Fn(&mut Viewport) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn insert(&mut self, entry: TranscriptEntry) {
        self.viewport.scroll_height += entry.height();
        self.entries.push(entry);
        for observer in &self.observers {
            observer(&mut self.viewport);
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn scroll_to(&mut self, scroll_top: usize) {
        self.viewport.scroll_top = scroll_top.min(self.viewport.scroll_height);
    }
}

#[derive(Clone)]
pub struct MessageRenderer {
    transcript: Arc<Mutex<Transcript>>,
    current_user: Option<UserId>,
    zone: LabelZone,
}

impl MessageRenderer {
    pub fn new(current_user: Option<UserId>, zone: impl Into<LabelZone>) -> Self {
        let mut transcript = Transcript::default();
        transcript.observe_growth(Self::on_growth);
        Self {
            transcript: Arc::new(Mutex::new(transcript)),
            current_user,
            zone: zone.into(),
        }
    }

    fn on_growth(viewport: &mut Viewport) {
        viewport.scroll_top = viewport.scroll_height;
    }

    pub fn render(&self, message: &Message) -> RenderedMessage {
        let origin = if self.current_user == Some(message.sender_id) {
            Origin::Own
        } else {
            Origin::Other
        };
        let attachment_href = message.attachment.as_deref().and_then(safe_attachment_href);
        let time_label = self.zone.time_label(&message.timestamp);

        let class = match origin {
            Origin::Own => "message own",
            Origin::Other => "message other",
        };
        let attachment_html = attachment_href
            .as_deref()
            .map(|href| {
                format!(
                    r#"<div class="message-attachment"><a href="{href}" target="_blank" rel="noopener">View Attachment</a></div>"#
                )
            })
            .unwrap_or_default();
        let html = format!(
            r#"<div class="{class}"><div class="message-body">{content}{attachment_html}</div><div class="message-time">{time_label}</div></div>"#,
            content = escape_html(&message.content),
        );

        RenderedMessage {
            origin,
            sender_id: message.sender_id,
            sender_name: message.sender_name.clone(),
            content: message.content.clone(),
            attachment_href,
            time_label,
            html,
        }
    }

    pub async fn append(&self, message: Message) -> RenderedMessage {
        let rendered = self.render(&message);
        self.transcript
            .lock()
            .await
            .insert(TranscriptEntry::Message(rendered.clone()));
        rendered
    }

    pub async fn notice(&self, text: &str) -> TranscriptEntry {
        let entry = TranscriptEntry::Notice {
            text: text.to_string(),
            html: format!(r#"<div class="message notice">{}</div>"#, escape_html(text)),
        };
        self.transcript.lock().await.insert(entry.clone());
        entry
    }

    pub async fn entries(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().await.entries().to_vec()
    }

    pub async fn viewport(&self) -> Viewport {
        self.transcript.lock().await.viewport()
    }

    pub async fn scroll_to(&self, scroll_top: usize) {
        self.transcript.lock().await.scroll_to(scroll_top);
    }
}
