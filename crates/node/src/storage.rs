// Client for the external message-storage service.
//
// Chat history lives in a separate service; this node only calls it to
// persist a message before acknowledging delivery, and to mark messages
// read. The `Memory` variant stores in-process and can be told to fail, so
// tests can exercise the durability gate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pulse_common::protocol::envelope::Envelope;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("message service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("message service rejected request with status {0}")]
    Status(reqwest::StatusCode),
    #[error("message store unavailable")]
    Unavailable,
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Clone)]
pub enum MessageStore {
    Http {
        client: reqwest::Client,
        base_url: String,
    },
    Memory(MemoryMessageStore),
}

impl MessageStore {
    pub fn http(base_url: impl Into<String>) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::Http { client, base_url: base_url.into() })
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryMessageStore::default())
    }

    /// Persist a message. Must succeed before the sender is acked or the
    /// recipient sees the frame.
    pub async fn save_message(&self, frame: &Envelope) -> StorageResult<()> {
        match self {
            Self::Http { client, base_url } => {
                let response = client
                    .post(format!("{base_url}/api/messages"))
                    .json(frame)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(StorageError::Status(response.status()));
                }
                Ok(())
            }
            Self::Memory(store) => store.save(frame),
        }
    }

    /// Record that `reader_id` has read a message. Best effort from the
    /// caller's point of view; receipts still propagate when this fails.
    pub async fn mark_read(&self, message_id: &str, reader_id: &str) -> StorageResult<()> {
        match self {
            Self::Http { client, base_url } => {
                let response = client
                    .post(format!("{base_url}/api/messages/{message_id}/read"))
                    .json(&serde_json::json!({ "readerId": reader_id }))
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(StorageError::Status(response.status()));
                }
                Ok(())
            }
            Self::Memory(store) => store.mark_read(message_id, reader_id),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryMessageStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    messages: Vec<Envelope>,
    reads: HashSet<(String, String)>,
    failing: bool,
}

impl MemoryMessageStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make subsequent saves fail until cleared. Test hook for the
    /// durability gate.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    fn save(&self, frame: &Envelope) -> StorageResult<()> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(StorageError::Unavailable);
        }
        inner.messages.push(frame.clone());
        Ok(())
    }

    fn mark_read(&self, message_id: &str, reader_id: &str) -> StorageResult<()> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(StorageError::Unavailable);
        }
        inner.reads.insert((message_id.to_string(), reader_id.to_string()));
        Ok(())
    }

    pub fn saved_message_ids(&self) -> Vec<String> {
        self.lock()
            .messages
            .iter()
            .filter_map(|frame| frame.message_id.clone())
            .collect()
    }

    pub fn saved_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_read(&self, message_id: &str, reader_id: &str) -> bool {
        self.lock()
            .reads
            .contains(&(message_id.to_string(), reader_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::protocol::envelope::FrameType;

    fn chat_frame(message_id: &str) -> Envelope {
        let mut frame = Envelope::new(FrameType::ChatMessage);
        frame.sender_id = Some("u1".to_string());
        frame.receiver_id = Some("u2".to_string());
        frame.message_id = Some(message_id.to_string());
        frame.content = Some("hi".to_string());
        frame
    }

    #[tokio::test]
    async fn memory_store_saves_and_marks_read() {
        let store = MessageStore::memory();
        store
            .save_message(&chat_frame("m1"))
            .await
            .expect("save should succeed");
        store.mark_read("m1", "u2").await.expect("mark_read should succeed");

        let MessageStore::Memory(inner) = &store else { unreachable!() };
        assert_eq!(inner.saved_message_ids(), vec!["m1".to_string()]);
        assert!(inner.is_read("m1", "u2"));
        assert!(!inner.is_read("m1", "u3"));
    }

    #[tokio::test]
    async fn failing_store_rejects_saves() {
        let store = MessageStore::memory();
        let MessageStore::Memory(inner) = &store else { unreachable!() };
        inner.set_failing(true);

        let err = store
            .save_message(&chat_frame("m1"))
            .await
            .expect_err("save should fail");
        assert!(matches!(err, StorageError::Unavailable));
        assert_eq!(inner.saved_count(), 0);

        inner.set_failing(false);
        store
            .save_message(&chat_frame("m2"))
            .await
            .expect("save should succeed after recovery");
        assert_eq!(inner.saved_count(), 1);
    }
}
