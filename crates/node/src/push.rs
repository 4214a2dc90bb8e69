// Offline push gate.
//
// When a recipient is offline, the message is handed to the push service
// over the broker. A per-user suppression key throttles this to one push
// per window: a user who already got a notification recently will see the
// backlog when they open the app, so repeat pushes only annoy.

use std::time::Duration;

use tracing::{debug, warn};

use pulse_common::protocol::envelope::{ChatMessageKind, Envelope, PushNotification};

use crate::kv::{KvError, KvStore};
use crate::router::{InterNodeRouter, RouterError};

const SUPPRESSION_KEY_PREFIX: &str = "chat:push:suppression:";

const PUSH_TITLE: &str = "You received a new message!";

/// Preview length for text content, in characters.
const PREVIEW_LIMIT: usize = 50;

fn suppression_key(user_id: &str) -> String {
    format!("{SUPPRESSION_KEY_PREFIX}{user_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Router(#[from] RouterError),
}

pub type PushResult<T> = Result<T, PushError>;

#[derive(Clone)]
pub struct OfflinePushGate {
    kv: KvStore,
    router: InterNodeRouter,
    suppression: Duration,
}

impl OfflinePushGate {
    pub fn new(kv: KvStore, router: InterNodeRouter, suppression: Duration) -> Self {
        Self { kv, router, suppression }
    }

    /// Publish a push notification for an offline recipient unless one was
    /// already sent inside the suppression window. Returns whether a push
    /// went out.
    pub async fn notify_offline(&self, frame: &Envelope) -> PushResult<bool> {
        let Some(receiver_id) = frame.receiver_id.as_deref() else {
            warn!("push requested for frame without receiver, dropping");
            return Ok(false);
        };
        if self.kv.exists(&suppression_key(receiver_id)).await? {
            debug!(receiver_id, "push suppressed inside window");
            return Ok(false);
        }

        let kind = frame.chat_message_type.unwrap_or_default();
        let mut metadata = serde_json::Map::new();
        if let Some(message_id) = &frame.message_id {
            metadata.insert("messageId".into(), message_id.clone().into());
        }
        if let Some(chat_id) = &frame.chat_id {
            metadata.insert("chatId".into(), chat_id.clone().into());
        }
        let notification = PushNotification {
            receiver_id: receiver_id.to_string(),
            sender_id: frame.sender_id.clone(),
            kind: "chat".to_string(),
            title: PUSH_TITLE.to_string(),
            content: preview(kind, frame.content.as_deref()),
            metadata: (!metadata.is_empty()).then_some(metadata),
        };
        self.router.publish_push(&notification).await?;

        // The suppression window opens only after a push actually went out.
        self.kv
            .set_with_ttl(&suppression_key(receiver_id), "1", self.suppression)
            .await?;
        debug!(receiver_id, "offline push published");
        Ok(true)
    }

    pub async fn is_suppressed(&self, user_id: &str) -> PushResult<bool> {
        Ok(self.kv.exists(&suppression_key(user_id)).await?)
    }

    /// Remaining seconds on the suppression window, if active.
    pub async fn suppression_remaining(&self, user_id: &str) -> PushResult<Option<u64>> {
        Ok(self.kv.remaining_ttl(&suppression_key(user_id)).await?)
    }

    /// Drop the suppression window, re-arming pushes for the user. Exposed
    /// on the operational API.
    pub async fn clear_suppression(&self, user_id: &str) -> PushResult<()> {
        self.kv.delete(&suppression_key(user_id)).await?;
        Ok(())
    }
}

/// Notification body: media kinds show a placeholder, text is truncated to
/// a short preview.
fn preview(kind: ChatMessageKind, content: Option<&str>) -> String {
    match kind {
        ChatMessageKind::Image => "[Image]".to_string(),
        ChatMessageKind::Voice => "[Voice]".to_string(),
        ChatMessageKind::Video => "[Video]".to_string(),
        ChatMessageKind::File => "[File]".to_string(),
        ChatMessageKind::Emoji => "[Emoji]".to_string(),
        ChatMessageKind::Text | ChatMessageKind::System => {
            let content = content.unwrap_or_default();
            let mut chars = content.chars();
            let head: String = chars.by_ref().take(PREVIEW_LIMIT).collect();
            if chars.next().is_some() {
                format!("{head}...")
            } else {
                head
            }
        }
    }
}
