use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
    connection::{ChannelConnector, DuplexChannel},
    error::ConnectionError,
};

/// Opens chat channels over WebSocket, forwarding the session cookie so the
/// server can authenticate the participant.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    session_cookie: Option<String>,
}

impl WebSocketConnector {
    pub fn new(session_cookie: Option<String>) -> Self {
        Self { session_cookie }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn open(&self, address: &Url) -> Result<Box<dyn DuplexChannel>, ConnectionError> {
        let mut request = address.as_str().into_client_request()?;
        if let Some(cookie) = &self.session_cookie {
            request
                .headers_mut()
                .insert(COOKIE, HeaderValue::from_str(cookie)?);
        }
        let (stream, _) = connect_async(request).await?;
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl DuplexChannel for WebSocketChannel {
    async fn recv(&mut self) -> Option<Result<String, ConnectionError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(_))) | None => return None,
                // ping/pong are answered by tungstenite itself; binary is not part of the protocol
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    return match classify(err) {
                        ConnectionError::Closed => None,
                        fault => Some(Err(fault)),
                    };
                }
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), ConnectionError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(classify)
    }
}

/// Folds tungstenite's "already closed" conditions into `Closed` so callers
/// can tell an orderly end from a transport fault.
fn classify(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Closed
        }
        other => ConnectionError::WebSocket(other),
    }
}
