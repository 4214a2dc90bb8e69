// Local session registry.
//
// Maps each user id to at most one live WebSocket session on this node.
// Registering a user who already has a session replaces it: the old
// connection receives a CONNECTION_REPLACED frame and its outbound channel
// is dropped, which ends its socket task.
//
// Also owns the failed-delivery cache: when a frame cannot be written to a
// local socket the failure is remembered for a short window so the next
// heartbeat can tell the client it may have missed messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use pulse_common::protocol::envelope::{DisconnectNotice, Envelope, FrameType};

/// How long a delivery failure stays eligible for a "you may have missed
/// messages" notice.
pub const FAILED_DELIVERY_WINDOW: Duration = Duration::from_secs(40);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered during the connect handshake; not yet announced to the
    /// client.
    Establishing,
    /// Handshake complete, frames flow.
    Established,
}

struct LocalSession {
    session_id: Uuid,
    outbound: mpsc::UnboundedSender<Envelope>,
    state: SessionState,
}

/// Result of attempting a local delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// No session registered for the user on this node.
    NoSession,
    /// The session's channel was closed; the entry has been evicted and the
    /// caller should clear cluster presence it may still hold.
    Evicted,
}

struct FailedDelivery {
    first_failed_at: Instant,
    notified: bool,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, LocalSession>>>,
    failed: Arc<RwLock<HashMap<String, FailedDelivery>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for the user, replacing any existing one.
    ///
    /// The displaced session is told why before its channel drops, so the
    /// client can distinguish a takeover from a network fault and skip
    /// auto-reconnect.
    pub async fn register(
        &self,
        user_id: &str,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.remove(user_id) {
            debug!(user_id, "replacing existing local session");
            let notice = Envelope::system(FrameType::ConnectionReplaced, user_id)
                .with_content("Your account signed in from another device.");
            // Best effort; the old socket may already be gone.
            let _ = previous.outbound.send(notice);
        }
        sessions.insert(
            user_id.to_string(),
            LocalSession { session_id, outbound, state: SessionState::Establishing },
        );
        session_id
    }

    /// Promote a session once the connect handshake has finished.
    pub async fn mark_established(&self, user_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(user_id) {
            Some(session) if session.session_id == session_id => {
                session.state = SessionState::Established;
                true
            }
            _ => false,
        }
    }

    /// Remove the user's session only if it is still the given one.
    ///
    /// Socket close handlers use this so a connection replaced mid-flight
    /// does not tear down its successor's entry.
    pub async fn remove_if_current(&self, user_id: &str, session_id: Uuid) -> Option<SessionState> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(user_id) {
            Some(session) if session.session_id == session_id => {
                let state = session.state;
                sessions.remove(user_id);
                Some(state)
            }
            _ => None,
        }
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.sessions.read().await.contains_key(user_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Queue a frame to the user's local socket.
    pub async fn send_to_user(&self, user_id: &str, frame: Envelope) -> SendOutcome {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(user_id) {
                None => return SendOutcome::NoSession,
                Some(session) => {
                    if session.outbound.send(frame).is_ok() {
                        return SendOutcome::Delivered;
                    }
                }
            }
        }
        // Channel closed under us: drop the dead entry.
        warn!(user_id, "evicting session with closed outbound channel");
        self.sessions.write().await.remove(user_id);
        SendOutcome::Evicted
    }

    /// Disconnect a local session at another node's request, without
    /// touching cluster presence. The requesting node already owns the
    /// user's presence record, so clearing it here would erase the new
    /// connection's registration.
    pub async fn evict_with_notice(&self, notice: &DisconnectNotice) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(&notice.user_id) {
            Some(previous) => {
                let mut frame = Envelope::system(FrameType::ConnectionReplaced, &notice.user_id);
                frame.content = notice.reason.clone();
                let _ = previous.outbound.send(frame);
                debug!(
                    user_id = %notice.user_id,
                    source = %notice.source_node_id,
                    "evicted local session on remote request"
                );
                true
            }
            None => false,
        }
    }

    /// Remember that a frame could not be written to the user's socket.
    /// The first failure timestamp is kept so the notice window is measured
    /// from when trouble started.
    pub async fn record_failed_delivery(&self, user_id: &str) {
        self.failed
            .write()
            .await
            .entry(user_id.to_string())
            .or_insert_with(|| FailedDelivery { first_failed_at: Instant::now(), notified: false });
    }

    /// Take the pending "missed messages" notice for a user, if one exists
    /// inside the window and has not been sent yet. Marks it notified.
    pub async fn take_failure_notice(&self, user_id: &str) -> bool {
        let mut failed = self.failed.write().await;
        match failed.get_mut(user_id) {
            Some(entry)
                if !entry.notified
                    && entry.first_failed_at.elapsed() < FAILED_DELIVERY_WINDOW =>
            {
                entry.notified = true;
                true
            }
            _ => false,
        }
    }

    /// Forget recorded failures after a confirmed successful delivery.
    pub async fn clear_failed_deliveries(&self, user_id: &str) {
        self.failed.write().await.remove(user_id);
    }

    /// Drop failure records older than the notice window. Run periodically.
    pub async fn expire_failed_deliveries(&self) -> usize {
        let mut failed = self.failed.write().await;
        let before = failed.len();
        failed.retain(|_, entry| entry.first_failed_at.elapsed() < FAILED_DELIVERY_WINDOW);
        before - failed.len()
    }
}
