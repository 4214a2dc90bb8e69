// Frame dispatch.
//
// Everything a connected client sends, and everything that arrives for
// this node over the broker, funnels through here. The chat path enforces
// the durability gate: a message is persisted before the recipient sees it
// or the sender is acked, so a crash after the ack can never lose it.

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use pulse_common::protocol::envelope::{
    now_millis, DisconnectNotice, Envelope, FrameType,
};

use crate::kv::KvError;
use crate::lock::ConnectLock;
use crate::presence::PresenceRegistry;
use crate::push::OfflinePushGate;
use crate::router::{InboundKind, InterNodeRouter, RouterError};
use crate::sessions::{SendOutcome, SessionRegistry, SessionState};
use crate::storage::MessageStore;

const MISSED_MESSAGES_NOTICE: &str =
    "Some messages could not be delivered to this device. Pull to refresh.";

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("another connection attempt for this user is in flight")]
    Contended,
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Router(#[from] RouterError),
}

#[derive(Clone)]
pub struct Dispatcher {
    presence: PresenceRegistry,
    sessions: SessionRegistry,
    router: InterNodeRouter,
    lock: ConnectLock,
    store: MessageStore,
    push: OfflinePushGate,
}

impl Dispatcher {
    pub fn new(
        presence: PresenceRegistry,
        sessions: SessionRegistry,
        router: InterNodeRouter,
        lock: ConnectLock,
        store: MessageStore,
        push: OfflinePushGate,
    ) -> Self {
        Self { presence, sessions, router, lock, store, push }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn push(&self) -> &OfflinePushGate {
        &self.push
    }

    pub fn node_id(&self) -> &str {
        self.presence.node_id()
    }

    /// Register a new connection for `user_id`, displacing any previous one
    /// anywhere in the cluster. Runs under the per-user connect lock so two
    /// simultaneous connects cannot interleave their takeover steps.
    pub async fn connect_user(
        &self,
        user_id: &str,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Result<Uuid, ConnectError> {
        let Some(guard) = self.lock.acquire(user_id).await? else {
            return Err(ConnectError::Contended);
        };

        let result = self.connect_locked(user_id, outbound).await;

        // Lock release is best effort; an expired lock self-heals.
        if let Err(err) = self.lock.release(guard).await {
            warn!(user_id, error = %err, "failed to release connect lock");
        }
        result
    }

    async fn connect_locked(
        &self,
        user_id: &str,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Result<Uuid, ConnectError> {
        // A previous connection on another node gets a disconnect directive.
        // Local replacement is handled by the session registry itself.
        if let Some(owner) = self.presence.owner(user_id).await? {
            if owner != self.node_id() {
                let notice = DisconnectNotice {
                    user_id: user_id.to_string(),
                    target_node_id: owner.clone(),
                    source_node_id: self.node_id().to_string(),
                    reason: Some("Your account signed in from another device.".to_string()),
                    timestamp: now_millis(),
                };
                self.router.request_disconnect(&owner, &notice).await?;
                debug!(user_id, previous_owner = %owner, "requested remote disconnect");
            }
        }

        let session_id = self.sessions.register(user_id, outbound).await;
        if let Err(err) = self.presence.mark_online(user_id).await {
            // Half-open session; drop it so the user is not stuck routable
            // to a connection that was never announced.
            self.sessions.remove_if_current(user_id, session_id).await;
            return Err(err.into());
        }
        self.sessions.mark_established(user_id, session_id).await;

        let hello = Envelope::system(FrameType::Connected, user_id);
        let _ = self.sessions.send_to_user(user_id, hello).await;

        // Frames that failed delivery while the previous connection was
        // dying are gone; tell the fresh session to refetch history.
        if self.sessions.take_failure_notice(user_id).await {
            let notice = Envelope::system(FrameType::SystemNotification, user_id)
                .with_content(MISSED_MESSAGES_NOTICE);
            let _ = self.sessions.send_to_user(user_id, notice).await;
        }
        Ok(session_id)
    }

    /// Tear down after a socket closes. Only the session's own close may
    /// clear presence, and only while this node still owns the record.
    pub async fn disconnect_user(&self, user_id: &str, session_id: Uuid) {
        match self.sessions.remove_if_current(user_id, session_id).await {
            // Already replaced; the successor owns the presence record.
            None => {}
            // Never announced, so nothing routed to it; the handshake that
            // displaced it owns the record.
            Some(SessionState::Establishing) => {}
            Some(SessionState::Established) => {
                if let Err(err) = self.presence.mark_offline_if_owner(user_id).await {
                    warn!(user_id, error = %err, "presence cleanup failed on disconnect");
                }
            }
        }
    }

    /// Entry point for every decoded client frame.
    pub async fn handle_client_frame(&self, user_id: &str, frame: Envelope) {
        match frame.frame_type {
            FrameType::ChatMessage => self.handle_chat_message(user_id, frame).await,
            FrameType::ReadReceipt => self.handle_read_receipt(user_id, frame).await,
            FrameType::Typing => self.handle_typing(user_id, frame).await,
            FrameType::Heartbeat => self.handle_heartbeat(user_id).await,
            // Server-originated tags have no meaning coming from a client.
            FrameType::Connected
            | FrameType::Disconnected
            | FrameType::ConnectionReplaced
            | FrameType::MessageAck
            | FrameType::HeartbeatAck
            | FrameType::OnlineStatus
            | FrameType::SystemNotification
            | FrameType::Error => {
                debug!(user_id, frame_type = ?frame.frame_type, "ignoring server-only frame from client");
            }
        }
    }

    async fn handle_chat_message(&self, user_id: &str, mut frame: Envelope) {
        let Some(receiver_id) = frame.receiver_id.clone() else {
            self.send_error(user_id, "chat message missing receiverId", frame.temp_message_id)
                .await;
            return;
        };

        // The socket authenticated this user; never trust the payload's
        // senderId.
        frame.sender_id = Some(user_id.to_string());

        // Message traffic counts as liveness.
        if let Err(err) = self.presence.renew(user_id).await {
            warn!(user_id, error = %err, "lease renewal failed on message");
        }

        // Server-assigned identity and timestamp.
        let message_id = Uuid::new_v4().simple().to_string();
        frame.message_id = Some(message_id.clone());
        frame.timestamp = Some(now_millis());

        // Durability gate: no delivery, no ack, until the store confirms.
        if let Err(err) = self.store.save_message(&frame).await {
            warn!(user_id, message_id, error = %err, "message save failed, rejecting");
            self.send_error(user_id, "message could not be saved, please retry", frame.temp_message_id)
                .await;
            return;
        }

        self.deliver_chat(&receiver_id, frame.clone()).await;

        let mut ack = Envelope::system(FrameType::MessageAck, user_id);
        ack.message_id = Some(message_id);
        ack.temp_message_id = frame.temp_message_id.clone();
        // The ack carries the message's server timestamp, not its own.
        ack.timestamp = frame.timestamp;
        let _ = self.sessions.send_to_user(user_id, ack).await;
    }

    /// Route a saved chat frame to its recipient: local socket, owning
    /// node, or the offline push gate.
    async fn deliver_chat(&self, receiver_id: &str, frame: Envelope) {
        match self.sessions.send_to_user(receiver_id, frame.clone()).await {
            SendOutcome::Delivered => {
                self.sessions.clear_failed_deliveries(receiver_id).await;
                return;
            }
            SendOutcome::Evicted => {
                self.on_local_delivery_failure(receiver_id).await;
                self.push_offline(&frame).await;
                return;
            }
            SendOutcome::NoSession => {}
        }

        match self.presence.owner(receiver_id).await {
            Ok(Some(owner)) if owner == self.node_id() => {
                // Presence points here but no session exists. Stale record;
                // clear it and degrade to push.
                warn!(receiver_id, "presence owner is this node but no session, repairing");
                if let Err(err) = self.presence.mark_offline_if_owner(receiver_id).await {
                    warn!(receiver_id, error = %err, "presence repair failed");
                }
                self.push_offline(&frame).await;
            }
            Ok(Some(owner)) => {
                if let Err(err) = self.router.forward_chat(&owner, &frame).await {
                    warn!(receiver_id, owner = %owner, error = %err, "chat forward failed, degrading to push");
                    self.push_offline(&frame).await;
                }
            }
            Ok(None) => self.push_offline(&frame).await,
            Err(err) => {
                warn!(receiver_id, error = %err, "presence lookup failed, degrading to push");
                self.push_offline(&frame).await;
            }
        }
    }

    async fn handle_read_receipt(&self, user_id: &str, frame: Envelope) {
        let Some(message_id) = frame.referenced_message_id().map(ToOwned::to_owned) else {
            debug!(user_id, "read receipt without message id, ignoring");
            return;
        };
        let Some(original_sender) = frame.receiver_id.clone() else {
            debug!(user_id, "read receipt without receiverId, ignoring");
            return;
        };

        // Best effort: the sender still learns the message was read even if
        // the store write fails.
        if let Err(err) = self.store.mark_read(&message_id, user_id).await {
            warn!(user_id, message_id, error = %err, "mark-read failed, still notifying sender");
        }

        let mut receipt = Envelope::system(FrameType::ReadReceipt, &original_sender);
        receipt.sender_id = Some(user_id.to_string());
        receipt.message_id = Some(message_id);
        receipt.chat_id = frame.chat_id.clone();

        if self.sessions.send_to_user(&original_sender, receipt.clone()).await
            == SendOutcome::Delivered
        {
            return;
        }
        match self.presence.owner(&original_sender).await {
            Ok(Some(owner)) if owner != self.node_id() => {
                if let Err(err) = self.router.forward_receipt(&owner, &receipt).await {
                    warn!(original_sender, error = %err, "receipt forward failed");
                }
            }
            // Receipts are not worth a push; the read state is in the store.
            Ok(_) => debug!(original_sender, "receipt target offline, dropping"),
            Err(err) => warn!(original_sender, error = %err, "presence lookup failed for receipt"),
        }
    }

    /// Typing indicators are ephemeral: delivered only while the receiver
    /// is online, never stored, never pushed.
    async fn handle_typing(&self, user_id: &str, mut frame: Envelope) {
        let Some(receiver_id) = frame.receiver_id.clone() else {
            return;
        };
        frame.sender_id = Some(user_id.to_string());

        if self.sessions.send_to_user(&receiver_id, frame.clone()).await
            == SendOutcome::Delivered
        {
            return;
        }
        match self.presence.owner(&receiver_id).await {
            Ok(Some(owner)) if owner != self.node_id() => {
                if let Err(err) = self.router.forward_chat(&owner, &frame).await {
                    debug!(receiver_id, error = %err, "typing forward failed, dropping");
                }
            }
            Ok(_) => {}
            Err(err) => debug!(receiver_id, error = %err, "presence lookup failed for typing"),
        }
    }

    async fn handle_heartbeat(&self, user_id: &str) {
        if let Err(err) = self.presence.renew(user_id).await {
            warn!(user_id, error = %err, "lease renewal failed on heartbeat");
        }
        let ack = Envelope::system(FrameType::HeartbeatAck, user_id);
        let _ = self.sessions.send_to_user(user_id, ack).await;

        // Tell the client about recent undeliverable frames, once per
        // failure window.
        if self.sessions.take_failure_notice(user_id).await {
            let notice = Envelope::system(FrameType::SystemNotification, user_id)
                .with_content(MISSED_MESSAGES_NOTICE);
            let _ = self.sessions.send_to_user(user_id, notice).await;
        }
    }

    /// Entry point for traffic on this node's broker channels.
    ///
    /// Ownership is re-verified on arrival: presence may have moved while
    /// the message was in flight, and a frame for a user this node does not
    /// own is dropped rather than rebroadcast, or forwarding loops would
    /// follow.
    pub async fn handle_broker_message(&self, kind: InboundKind, payload: &str) {
        match kind {
            InboundKind::Chat => {
                let frame: Envelope = match serde_json::from_str(payload) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "undecodable chat payload from broker, dropping");
                        return;
                    }
                };
                let Some(receiver_id) = frame.receiver_id.clone() else {
                    warn!("broker chat frame without receiverId, dropping");
                    return;
                };
                // The chat channel also carries ephemeral frames (typing).
                // Those vanish when the session is gone; only real chat
                // messages earn failure bookkeeping and an offline push. A
                // dead session found this way still repairs stale presence
                // so later messages route to the push gate.
                if frame.frame_type != FrameType::ChatMessage {
                    match self.sessions.send_to_user(&receiver_id, frame).await {
                        SendOutcome::Delivered => {}
                        SendOutcome::Evicted => {
                            if let Err(err) = self.presence.mark_offline_if_owner(&receiver_id).await
                            {
                                warn!(receiver_id, error = %err, "presence repair failed");
                            }
                        }
                        SendOutcome::NoSession => {
                            debug!(receiver_id, "ephemeral broker frame undeliverable, dropping");
                        }
                    }
                    return;
                }
                match self.sessions.send_to_user(&receiver_id, frame.clone()).await {
                    SendOutcome::Delivered => {
                        self.sessions.clear_failed_deliveries(&receiver_id).await;
                    }
                    SendOutcome::Evicted => {
                        self.on_local_delivery_failure(&receiver_id).await;
                        self.push_offline(&frame).await;
                    }
                    SendOutcome::NoSession => {
                        debug!(receiver_id, "broker frame for user not connected here, dropping");
                    }
                }
            }
            InboundKind::Receipt => {
                let receipt: Envelope = match serde_json::from_str(payload) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "undecodable receipt payload from broker, dropping");
                        return;
                    }
                };
                let Some(receiver_id) = receipt.receiver_id.clone() else {
                    return;
                };
                if self.sessions.send_to_user(&receiver_id, receipt).await != SendOutcome::Delivered
                {
                    debug!(receiver_id, "receipt target not connected here, dropping");
                }
            }
            InboundKind::Disconnect => {
                let notice: DisconnectNotice = match serde_json::from_str(payload) {
                    Ok(notice) => notice,
                    Err(err) => {
                        warn!(error = %err, "undecodable disconnect payload from broker, dropping");
                        return;
                    }
                };
                // Presence stays untouched: the requesting node owns the
                // user's record now.
                self.sessions.evict_with_notice(&notice).await;
            }
        }
    }

    async fn on_local_delivery_failure(&self, receiver_id: &str) {
        self.sessions.record_failed_delivery(receiver_id).await;
        if let Err(err) = self.presence.mark_offline_if_owner(receiver_id).await {
            warn!(receiver_id, error = %err, "presence cleanup after dead session failed");
        }
    }

    async fn push_offline(&self, frame: &Envelope) {
        if let Err(err) = self.push.notify_offline(frame).await {
            warn!(error = %err, "offline push failed");
        }
    }

    async fn send_error(&self, user_id: &str, message: &str, temp_message_id: Option<String>) {
        let error = Envelope::system(FrameType::Error, user_id)
            .with_content(message)
            .with_temp_message_id(temp_message_id);
        let _ = self.sessions.send_to_user(user_id, error).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::kv::KvStore;
    use crate::router::Broker;
    use crate::storage::MemoryMessageStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        dispatcher: Dispatcher,
        store: MemoryMessageStore,
    }

    fn harness_on(kv: KvStore, broker: Broker, node_id: &str) -> Harness {
        let presence = PresenceRegistry::new(kv.clone(), node_id, Duration::from_secs(80));
        let sessions = SessionRegistry::new();
        let router = InterNodeRouter::new(broker, node_id);
        let lock = ConnectLock::new(kv.clone());
        let store = MessageStore::memory();
        let MessageStore::Memory(memory_store) = store.clone() else { unreachable!() };
        let push = OfflinePushGate::new(kv, router.clone(), Duration::from_secs(3600));
        Harness {
            dispatcher: Dispatcher::new(presence, sessions, router, lock, store, push),
            store: memory_store,
        }
    }

    fn harness() -> Harness {
        harness_on(KvStore::memory(), Broker::memory(), "node-a")
    }

    async fn connect(harness: &Harness, user_id: &str) -> (Uuid, UnboundedReceiver<Envelope>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session_id = harness
            .dispatcher
            .connect_user(user_id, tx)
            .await
            .expect("connect should succeed");
        let hello = rx.recv().await.expect("connected frame expected");
        assert_eq!(hello.frame_type, FrameType::Connected);
        (session_id, rx)
    }

    fn chat(receiver: &str, content: &str) -> Envelope {
        let mut frame = Envelope::new(FrameType::ChatMessage);
        frame.receiver_id = Some(receiver.to_string());
        frame.content = Some(content.to_string());
        frame.temp_message_id = Some("tmp-1".to_string());
        frame
    }

    #[tokio::test]
    async fn chat_message_is_saved_delivered_and_acked() {
        let h = harness();
        let (_, mut sender_rx) = connect(&h, "alice").await;
        let (_, mut receiver_rx) = connect(&h, "bob").await;

        h.dispatcher.handle_client_frame("alice", chat("bob", "hi bob")).await;

        let delivered = receiver_rx.recv().await.expect("bob should receive the message");
        assert_eq!(delivered.frame_type, FrameType::ChatMessage);
        assert_eq!(delivered.sender_id.as_deref(), Some("alice"));
        let message_id = delivered.message_id.clone().expect("server id should be assigned");
        assert!(!message_id.contains('-'));

        let ack = sender_rx.recv().await.expect("alice should receive an ack");
        assert_eq!(ack.frame_type, FrameType::MessageAck);
        assert_eq!(ack.message_id.as_deref(), Some(message_id.as_str()));
        assert_eq!(ack.temp_message_id.as_deref(), Some("tmp-1"));

        assert_eq!(h.store.saved_message_ids(), vec![message_id]);
    }

    #[tokio::test]
    async fn failed_save_means_no_delivery_and_no_ack() {
        let h = harness();
        let (_, mut sender_rx) = connect(&h, "alice").await;
        let (_, mut receiver_rx) = connect(&h, "bob").await;
        h.store.set_failing(true);

        h.dispatcher.handle_client_frame("alice", chat("bob", "lost?")).await;

        let error = sender_rx.recv().await.expect("alice should receive an error");
        assert_eq!(error.frame_type, FrameType::Error);
        assert_eq!(error.temp_message_id.as_deref(), Some("tmp-1"));
        assert!(receiver_rx.try_recv().is_err());
        assert_eq!(h.store.saved_count(), 0);
    }

    #[tokio::test]
    async fn message_to_offline_user_goes_to_push() {
        let broker = Broker::memory();
        let mut push_sub = broker
            .subscribe(&[crate::router::PUSH_CHANNEL.to_string()])
            .await
            .expect("subscribe should succeed");
        let h = harness_on(KvStore::memory(), broker, "node-a");
        let (_, mut sender_rx) = connect(&h, "alice").await;

        h.dispatcher.handle_client_frame("alice", chat("bob", "see you")).await;

        // Saved and acked even though bob is offline.
        let ack = sender_rx.recv().await.expect("ack expected");
        assert_eq!(ack.frame_type, FrameType::MessageAck);
        assert_eq!(h.store.saved_count(), 1);

        let (channel, _) = push_sub.next_message().await.expect("push expected");
        assert_eq!(channel, crate::router::PUSH_CHANNEL);
    }

    #[tokio::test]
    async fn chat_message_without_receiver_is_rejected() {
        let h = harness();
        let (_, mut rx) = connect(&h, "alice").await;

        let mut frame = Envelope::new(FrameType::ChatMessage);
        frame.temp_message_id = Some("tmp-9".to_string());
        h.dispatcher.handle_client_frame("alice", frame).await;

        let error = rx.recv().await.expect("error frame expected");
        assert_eq!(error.frame_type, FrameType::Error);
        assert_eq!(error.temp_message_id.as_deref(), Some("tmp-9"));
        assert_eq!(h.store.saved_count(), 0);
    }

    #[tokio::test]
    async fn sender_id_cannot_be_spoofed() {
        let h = harness();
        let (_, _alice_rx) = connect(&h, "alice").await;
        let (_, mut bob_rx) = connect(&h, "bob").await;

        let mut frame = chat("bob", "hi");
        frame.sender_id = Some("mallory".to_string());
        h.dispatcher.handle_client_frame("alice", frame).await;

        let delivered = bob_rx.recv().await.expect("message expected");
        assert_eq!(delivered.sender_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn heartbeat_acks_and_reports_missed_messages_once() {
        let h = harness();
        let (_, mut rx) = connect(&h, "alice").await;
        h.dispatcher.sessions().record_failed_delivery("alice").await;

        h.dispatcher.handle_client_frame("alice", Envelope::new(FrameType::Heartbeat)).await;
        let ack = rx.recv().await.expect("heartbeat ack expected");
        assert_eq!(ack.frame_type, FrameType::HeartbeatAck);
        let notice = rx.recv().await.expect("missed-messages notice expected");
        assert_eq!(notice.frame_type, FrameType::SystemNotification);

        h.dispatcher.handle_client_frame("alice", Envelope::new(FrameType::Heartbeat)).await;
        let ack = rx.recv().await.expect("second heartbeat ack expected");
        assert_eq!(ack.frame_type, FrameType::HeartbeatAck);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_surfaces_pending_failure_notice() {
        let h = harness();
        h.dispatcher.sessions().record_failed_delivery("alice").await;

        let (_, mut rx) = connect(&h, "alice").await;
        let notice = rx.recv().await.expect("missed-messages notice expected");
        assert_eq!(notice.frame_type, FrameType::SystemNotification);

        // One-shot: a following heartbeat carries only the ack.
        h.dispatcher.handle_client_frame("alice", Envelope::new(FrameType::Heartbeat)).await;
        let ack = rx.recv().await.expect("heartbeat ack expected");
        assert_eq!(ack.frame_type, FrameType::HeartbeatAck);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_receipt_notifies_sender_even_when_store_fails() {
        let h = harness();
        let (_, mut alice_rx) = connect(&h, "alice").await;
        let (_, _bob_rx) = connect(&h, "bob").await;
        h.store.set_failing(true);

        let mut receipt = Envelope::new(FrameType::ReadReceipt);
        receipt.receiver_id = Some("alice".to_string());
        receipt.message_id = Some("m42".to_string());
        h.dispatcher.handle_client_frame("bob", receipt).await;

        let frame = alice_rx.recv().await.expect("receipt should reach alice");
        assert_eq!(frame.frame_type, FrameType::ReadReceipt);
        assert_eq!(frame.sender_id.as_deref(), Some("bob"));
        assert_eq!(frame.message_id.as_deref(), Some("m42"));
    }

    #[tokio::test]
    async fn typing_reaches_online_receiver_and_vanishes_for_offline() {
        let h = harness();
        let (_, _alice_rx) = connect(&h, "alice").await;
        let (_, mut bob_rx) = connect(&h, "bob").await;

        let mut typing = Envelope::new(FrameType::Typing);
        typing.receiver_id = Some("bob".to_string());
        h.dispatcher.handle_client_frame("alice", typing.clone()).await;
        let frame = bob_rx.recv().await.expect("typing should reach bob");
        assert_eq!(frame.frame_type, FrameType::Typing);

        typing.receiver_id = Some("nobody".to_string());
        h.dispatcher.handle_client_frame("alice", typing).await;
        assert_eq!(h.store.saved_count(), 0);
    }

    #[tokio::test]
    async fn server_only_frames_from_clients_are_ignored() {
        let h = harness();
        let (_, mut rx) = connect(&h, "alice").await;

        h.dispatcher
            .handle_client_frame("alice", Envelope::new(FrameType::MessageAck))
            .await;
        h.dispatcher
            .handle_client_frame("alice", Envelope::new(FrameType::Connected))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broker_frame_for_unowned_user_is_dropped() {
        let h = harness();
        let frame = chat("stranger", "hello?");
        let payload = serde_json::to_string(&frame).expect("frame should encode");

        h.dispatcher.handle_broker_message(InboundKind::Chat, &payload).await;
        // Not connected here and not pushed: the sending node only forwards
        // after seeing an owner, so an unowned arrival means the record
        // moved mid-flight and the new owner will be consulted on retry.
        assert_eq!(h.dispatcher.sessions().session_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_directive_evicts_without_touching_presence() {
        let kv = KvStore::memory();
        let broker = Broker::memory();
        let node_a = harness_on(kv.clone(), broker.clone(), "node-a");
        let node_b = harness_on(kv, broker, "node-b");

        let (_, mut old_rx) = connect(&node_a, "alice").await;
        // alice reconnects through node B, which takes the record over.
        node_b.dispatcher.presence().mark_online("alice").await.expect("mark_online");

        let notice = DisconnectNotice {
            user_id: "alice".to_string(),
            target_node_id: "node-a".to_string(),
            source_node_id: "node-b".to_string(),
            reason: None,
            timestamp: now_millis(),
        };
        let payload = serde_json::to_string(&notice).expect("notice should encode");
        node_a
            .dispatcher
            .handle_broker_message(InboundKind::Disconnect, &payload)
            .await;

        let frame = old_rx.recv().await.expect("replaced frame expected");
        assert_eq!(frame.frame_type, FrameType::ConnectionReplaced);
        // Node B's ownership survives the eviction.
        assert_eq!(
            node_a
                .dispatcher
                .presence()
                .owner("alice")
                .await
                .expect("owner lookup")
                .as_deref(),
            Some("node-b")
        );
    }

    #[tokio::test]
    async fn closing_a_replaced_session_keeps_the_new_registration() {
        let h = harness();
        let (old_id, _old_rx) = connect(&h, "alice").await;
        let (_new_id, _new_rx) = connect(&h, "alice").await;

        h.dispatcher.disconnect_user("alice", old_id).await;
        assert!(h.dispatcher.sessions().contains("alice").await);
        assert!(h
            .dispatcher
            .presence()
            .is_online("alice")
            .await
            .expect("is_online should succeed"));
    }

    #[tokio::test]
    async fn clean_disconnect_clears_presence() {
        let h = harness();
        let (session_id, _rx) = connect(&h, "alice").await;

        h.dispatcher.disconnect_user("alice", session_id).await;
        assert!(!h.dispatcher.sessions().contains("alice").await);
        assert!(!h
            .dispatcher
            .presence()
            .is_online("alice")
            .await
            .expect("is_online should succeed"));
    }
}
