use shared::domain::SessionId;
use url::Url;

use crate::error::LocationError;

/// The page the chat is hosted on. Supplies the session id and the origin
/// the chat channel address is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLocation {
    url: Url,
}

impl PageLocation {
    pub fn parse(raw: &str) -> Result<Self, LocationError> {
        let url = Url::parse(raw).map_err(|source| LocationError::InvalidUrl {
            url: raw.to_string(),
            source,
        })?;
        if url.host_str().is_none() {
            return Err(LocationError::MissingHost(raw.to_string()));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// `host[:port]`, as the page itself was addressed.
    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Second-to-last `/`-separated path segment. For the canonical
    /// `/chats/42/` shape the trailing empty segment is last, so this is `42`.
    pub fn session_id(&self) -> SessionId {
        let segments: Vec<&str> = self.url.path().split('/').collect();
        let raw = segments
            .len()
            .checked_sub(2)
            .and_then(|index| segments.get(index))
            .copied()
            .unwrap_or_default();
        SessionId::new(raw)
    }

    pub fn channel_address(&self) -> Result<Url, LocationError> {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        let address = format!(
            "{scheme}://{}/ws/chat/{}/",
            self.host(),
            self.session_id()
        );
        Ok(Url::parse(&address)?)
    }
}
