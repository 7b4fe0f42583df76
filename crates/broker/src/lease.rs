//! Time-bounded leases for single-writer coordination.
//!
//! A lease names an owner and carries a fencing token that changes every
//! time ownership changes hands. Holders renew before the TTL runs out;
//! an expired lease can be taken by anyone.

use async_trait::async_trait;
use engine_core::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    /// Fencing token, strictly increasing per key.
    pub token: u64,
    pub expires_at: Instant,
}

/// Lease coordination backend.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire `key` for `owner`, or renew it if `owner` already holds it.
    ///
    /// Returns `None` while another owner holds an unexpired lease.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Whether `lease` is still the current, unexpired grant.
    async fn is_held(&self, lease: &Lease) -> Result<bool>;

    /// Give the lease up early. No-op if it already changed hands.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Current unexpired holder of `key`.
    async fn holder(&self, key: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct Grant {
    owner: String,
    token: u64,
    expires_at: Instant,
}

/// In-process [`LeaseStore`].
#[derive(Default)]
pub struct MemoryLeaseStore {
    grants: Mutex<HashMap<String, Grant>>,
    next_token: Mutex<u64>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>> {
        let now = Instant::now();
        let mut grants = self.grants.lock();

        let token = match grants.get(key) {
            Some(g) if g.expires_at > now && g.owner != owner => {
                debug!(key, owner, holder = %g.owner, "Lease held elsewhere");
                return Ok(None);
            }
            Some(g) if g.expires_at > now => g.token,
            _ => {
                let mut next = self.next_token.lock();
                *next += 1;
                *next
            }
        };

        let grant = Grant {
            owner: owner.to_string(),
            token,
            expires_at: now + ttl,
        };
        grants.insert(key.to_string(), grant.clone());

        Ok(Some(Lease {
            key: key.to_string(),
            owner: grant.owner,
            token,
            expires_at: grant.expires_at,
        }))
    }

    async fn is_held(&self, lease: &Lease) -> Result<bool> {
        let now = Instant::now();
        let grants = self.grants.lock();
        Ok(grants
            .get(&lease.key)
            .is_some_and(|g| g.token == lease.token && g.owner == lease.owner && g.expires_at > now))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut grants = self.grants.lock();
        if grants
            .get(&lease.key)
            .is_some_and(|g| g.token == lease.token && g.owner == lease.owner)
        {
            grants.remove(&lease.key);
        }
        Ok(())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let grants = self.grants.lock();
        Ok(grants
            .get(key)
            .filter(|g| g.expires_at > now)
            .map(|g| g.owner.clone()))
    }
}
