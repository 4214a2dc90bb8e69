// Per-user connect lock.
//
// Serializes concurrent connection attempts for the same user across the
// cluster so replace-and-register runs as a critical section. The lock is
// advisory with a short TTL, so a crashed holder frees it on its own.

use std::time::Duration;

use tracing::{debug, warn};

use crate::kv::{KvResult, KvStore};

const LOCK_KEY_PREFIX: &str = "lock:user:connect:";

/// Lock TTL. Long enough to cover a full replace-and-register handshake,
/// short enough that a crashed holder does not block reconnects for long.
pub const LOCK_TTL: Duration = Duration::from_secs(10);

const ACQUIRE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

fn lock_key(user_id: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{user_id}")
}

/// A held connect lock. Releasing compares the stored token so an expired
/// lock re-acquired by another connection is never deleted by the old
/// holder.
#[derive(Debug)]
pub struct ConnectGuard {
    user_id: String,
    token: String,
}

impl ConnectGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct ConnectLock {
    kv: KvStore,
}

impl ConnectLock {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Try to acquire the user's connect lock, retrying a fixed number of
    /// times with a short backoff. Returns `None` when every attempt finds
    /// the lock held; the caller rejects the connection as contended.
    pub async fn acquire(&self, user_id: &str) -> KvResult<Option<ConnectGuard>> {
        let token = uuid::Uuid::new_v4().to_string();
        let key = lock_key(user_id);
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            if self.kv.set_if_absent_with_ttl(&key, &token, LOCK_TTL).await? {
                debug!(user_id, attempt, "connect lock acquired");
                return Ok(Some(ConnectGuard { user_id: user_id.to_string(), token }));
            }
            if attempt < ACQUIRE_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
        warn!(user_id, attempts = ACQUIRE_ATTEMPTS, "connect lock contended, giving up");
        Ok(None)
    }

    /// Release a held lock. A false return means the lock had already
    /// expired and possibly been re-acquired; that is logged, not an error.
    pub async fn release(&self, guard: ConnectGuard) -> KvResult<bool> {
        let released = self
            .kv
            .delete_if_equals(&lock_key(&guard.user_id), &guard.token)
            .await?;
        if !released {
            warn!(
                user_id = %guard.user_id,
                "connect lock expired before release, leaving current holder intact"
            );
        }
        Ok(released)
    }
}
