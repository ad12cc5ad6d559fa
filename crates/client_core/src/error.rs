use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, http::header::InvalidHeaderValue};

use crate::connection::ConnectionState;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("invalid page url '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("page url '{0}' has no host")]
    MissingHost(String),
    #[error("failed to build channel address: {0}")]
    Address(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("invalid session cookie header: {0}")]
    InvalidCookie(#[from] InvalidHeaderValue),
    #[error("channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("chat channel is not open (state: {state:?})")]
    NotOpen { state: ConnectionState },
    #[error("chat channel closed before the frame was transmitted")]
    Interrupted,
    #[error("failed to encode channel payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload rejected with status {status}")]
    Rejected { status: u16 },
    #[error("upload endpoint reported status '{0}'")]
    Refused(String),
    #[error("upload transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to read attachment '{path}': {source}")]
    Attachment {
        path: String,
        source: std::io::Error,
    },
}
