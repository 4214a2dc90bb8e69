// Cluster-wide presence registry.
//
// Tracks which users are online and which node owns each connection.
// Ownership is lease-based: both per-user keys carry a TTL and expire on
// their own if the owning node dies without cleaning up. The roster set has
// no TTL, so readers repair it lazily and a periodic sweep removes entries
// whose lease keys are gone.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::kv::{KvResult, KvStore};

const ONLINE_USERS_SET: &str = "chat:online:users";
const STATUS_KEY_PREFIX: &str = "chat:user:status:";
const SERVER_KEY_PREFIX: &str = "chat:user:server:";
const STATUS_ONLINE: &str = "ONLINE";

fn status_key(user_id: &str) -> String {
    format!("{STATUS_KEY_PREFIX}{user_id}")
}

fn server_key(user_id: &str) -> String {
    format!("{SERVER_KEY_PREFIX}{user_id}")
}

/// Presence registry bound to one node's identity.
///
/// Clone is cheap; all state lives in the shared [`KvStore`].
#[derive(Clone)]
pub struct PresenceRegistry {
    kv: KvStore,
    node_id: String,
    lease_ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(kv: KvStore, node_id: impl Into<String>, lease_ttl: Duration) -> Self {
        Self { kv, node_id: node_id.into(), lease_ttl }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Record this node as the owner of the user's connection and start the
    /// lease clock.
    pub async fn mark_online(&self, user_id: &str) -> KvResult<()> {
        self.kv
            .set_with_ttl(&status_key(user_id), STATUS_ONLINE, self.lease_ttl)
            .await?;
        self.kv
            .set_with_ttl(&server_key(user_id), &self.node_id, self.lease_ttl)
            .await?;
        self.kv.set_add(ONLINE_USERS_SET, user_id).await?;
        debug!(user_id, node_id = %self.node_id, "presence marked online");
        Ok(())
    }

    /// Unconditionally clear the user's presence. Used on clean disconnect
    /// after ownership has been verified by the caller.
    pub async fn mark_offline(&self, user_id: &str) -> KvResult<()> {
        self.kv.delete(&status_key(user_id)).await?;
        self.kv.delete(&server_key(user_id)).await?;
        self.kv.set_remove(ONLINE_USERS_SET, user_id).await?;
        debug!(user_id, "presence marked offline");
        Ok(())
    }

    /// Clear presence only when this node still owns the record.
    ///
    /// A stale disconnect must never tear down a newer connection that
    /// already re-registered on another node, so the server key is removed
    /// with an atomic compare-and-delete on our node id.
    pub async fn mark_offline_if_owner(&self, user_id: &str) -> KvResult<bool> {
        let removed = self
            .kv
            .delete_if_equals(&server_key(user_id), &self.node_id)
            .await?;
        if removed {
            self.kv.delete(&status_key(user_id)).await?;
            self.kv.set_remove(ONLINE_USERS_SET, user_id).await?;
            debug!(user_id, node_id = %self.node_id, "presence cleared by owner");
        } else {
            debug!(
                user_id,
                node_id = %self.node_id,
                "skipped presence cleanup, record owned elsewhere"
            );
        }
        Ok(removed)
    }

    /// Whether the user currently holds a live lease anywhere in the
    /// cluster. Repairs the roster set when it disagrees with the lease.
    pub async fn is_online(&self, user_id: &str) -> KvResult<bool> {
        if self.kv.exists(&status_key(user_id)).await? {
            return Ok(true);
        }
        // Lease expired but the roster still lists the user: lazy repair.
        if self.kv.set_contains(ONLINE_USERS_SET, user_id).await? {
            self.kv.set_remove(ONLINE_USERS_SET, user_id).await?;
            debug!(user_id, "removed stale roster entry for expired lease");
        }
        Ok(false)
    }

    /// The node id that owns the user's connection, if any.
    pub async fn owner(&self, user_id: &str) -> KvResult<Option<String>> {
        self.kv.get(&server_key(user_id)).await
    }

    /// Extend the lease on a heartbeat or message activity.
    ///
    /// If either key already expired (a late heartbeat after a long stall),
    /// the record is restored in full rather than left half-alive.
    pub async fn renew(&self, user_id: &str) -> KvResult<()> {
        let status_alive = self
            .kv
            .refresh_ttl(&status_key(user_id), self.lease_ttl)
            .await?;
        let server_alive = self
            .kv
            .refresh_ttl(&server_key(user_id), self.lease_ttl)
            .await?;
        if !status_alive || !server_alive {
            warn!(user_id, "lease expired before renewal, restoring presence record");
            self.mark_online(user_id).await?;
        }
        Ok(())
    }

    pub async fn online_users(&self) -> KvResult<Vec<String>> {
        self.kv.set_members(ONLINE_USERS_SET).await
    }

    pub async fn online_count(&self) -> KvResult<usize> {
        self.kv.set_len(ONLINE_USERS_SET).await
    }

    /// Remove roster entries whose lease keys have both expired.
    ///
    /// An entry with either key still live is left alone; it belongs to a
    /// connection that is merely between renewals.
    pub async fn sweep(&self) -> KvResult<usize> {
        let mut removed = 0;
        for user_id in self.kv.set_members(ONLINE_USERS_SET).await? {
            let status_alive = self.kv.exists(&status_key(&user_id)).await?;
            let server_alive = self.kv.exists(&server_key(&user_id)).await?;
            if !status_alive && !server_alive {
                self.kv.set_remove(ONLINE_USERS_SET, &user_id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "presence sweep removed stale roster entries");
        }
        Ok(removed)
    }
}
