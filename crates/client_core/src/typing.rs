use std::{collections::BTreeMap, time::Duration};

use shared::{domain::UserId, protocol::TypingNotice};
use tokio::{sync::Mutex, time::Instant};

/// How long a typing notice stays in effect without a fresh one. Servers
/// only announce that someone started typing, never that they stopped.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(5);

/// Other participants currently typing, fed by inbound `typing` events.
/// Every method returns the new set only when it changed.
pub struct TypingIndicator {
    current_user: Option<UserId>,
    timeout: Duration,
    typing: Mutex<BTreeMap<UserId, Instant>>,
}

impl TypingIndicator {
    pub fn new(current_user: Option<UserId>) -> Self {
        Self {
            current_user,
            timeout: TYPING_TIMEOUT,
            typing: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn apply(&self, notice: TypingNotice) -> Option<Vec<UserId>> {
        self.apply_at(notice, Instant::now()).await
    }

    async fn apply_at(&self, notice: TypingNotice, at: Instant) -> Option<Vec<UserId>> {
        if self.current_user == Some(notice.user_id) {
            return None;
        }
        let mut typing = self.typing.lock().await;
        let changed = if notice.is_typing {
            typing.insert(notice.user_id, at).is_none()
        } else {
            typing.remove(&notice.user_id).is_some()
        };
        changed.then(|| typing.keys().copied().collect())
    }

    /// A delivered message ends its sender's typing.
    pub async fn message_from(&self, user_id: UserId) -> Option<Vec<UserId>> {
        let mut typing = self.typing.lock().await;
        typing
            .remove(&user_id)
            .map(|_| typing.keys().copied().collect())
    }

    /// Drops everyone whose last notice is older than the timeout.
    pub async fn expire(&self, now: Instant) -> Option<Vec<UserId>> {
        let mut typing = self.typing.lock().await;
        let before = typing.len();
        typing.retain(|_, seen| now.saturating_duration_since(*seen) < self.timeout);
        (typing.len() != before).then(|| typing.keys().copied().collect())
    }

    /// Forgets everyone; used when the channel drops.
    pub async fn clear(&self) -> Option<Vec<UserId>> {
        let mut typing = self.typing.lock().await;
        if typing.is_empty() {
            return None;
        }
        typing.clear();
        Some(Vec::new())
    }

    pub async fn typing_users(&self) -> Vec<UserId> {
        self.typing.lock().await.keys().copied().collect()
    }
}
