//! Named lock seam with an in-process implementation.
//!
//! The engine only depends on the [`Locker`] trait, so a distributed
//! lock provider can be plugged in without touching the orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Error;
use async_trait::async_trait;

/// Held lock, released on drop.
pub trait LockGuard: Send + Sync {}

/// Provider of named, TTL-bounded exclusive locks.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Tries to take the named lock; `None` means it is currently held
    /// by another owner.
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, Error>;
}

#[derive(Default)]
/// In-process lock provider with TTL expiry.
pub struct LocalLocker {
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
}

struct LockEntry {
    owner: String,
    generation: u64,
    expires_at: Instant,
}

impl LocalLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Locker for LocalLocker {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Box<dyn LockGuard>>, Error> {
        let mut locks = self.locks.lock().unwrap();

        if let Some(entry) = locks.get(name) {
            if entry.expires_at > Instant::now() {
                log::debug!("lock '{}' is held by '{}'", name, entry.owner);
                return Ok(None);
            }
            log::warn!("lock '{}' of '{}' expired, taking it over", name, entry.owner);
        }

        let generation = locks
            .get(name)
            .map(|entry| entry.generation + 1)
            .unwrap_or(0);

        locks.insert(
            name.to_string(),
            LockEntry {
                owner: owner.to_string(),
                generation,
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(Some(Box::new(LocalLockGuard {
            locks: Arc::clone(&self.locks),
            name: name.to_string(),
            generation,
        })))
    }
}

struct LocalLockGuard {
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
    name: String,
    generation: u64,
}

impl LockGuard for LocalLockGuard {}

impl Drop for LocalLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap();
        // do not release the lock if it expired and was taken over
        if let Some(entry) = locks.get(&self.name) {
            if entry.generation == self.generation {
                locks.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_acquire() -> Result<(), Error> {
        let locker = LocalLocker::new();
        let ttl = Duration::from_secs(60);

        let guard = locker.acquire("TapeDrive-1", "owner-a", ttl).await?;
        assert!(guard.is_some());
        assert!(locker.acquire("TapeDrive-1", "owner-b", ttl).await?.is_none());
        // a different name is unaffected
        assert!(locker.acquire("TapeDrive-2", "owner-b", ttl).await?.is_some());

        drop(guard);
        assert!(locker.acquire("TapeDrive-1", "owner-b", ttl).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_ttl_takeover() -> Result<(), Error> {
        let locker = LocalLocker::new();

        let stale = locker
            .acquire("TapeChanger", "owner-a", Duration::from_millis(0))
            .await?;
        let guard = locker
            .acquire("TapeChanger", "owner-b", Duration::from_secs(60))
            .await?;
        assert!(guard.is_some());

        // dropping the stale guard must not release the new owner's lock
        drop(stale);
        assert!(locker
            .acquire("TapeChanger", "owner-c", Duration::from_secs(60))
            .await?
            .is_none());
        Ok(())
    }
}
