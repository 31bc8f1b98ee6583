//! Read-vs-write discipline on top of the store. Background workers hold a
//! read guard while they process a unit of work; an interactive caller can
//! request priority access, which parks behind the in-flight units and
//! blocks new ones from starting until the guard is dropped. The underlying
//! `tokio::sync::RwLock` is write-preferring, which is exactly the
//! starvation behaviour we want here.

use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Clone)]
pub struct PriorityAccess {
    lock: Arc<RwLock<()>>,
}

impl Default for PriorityAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityAccess {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Background context; many may run concurrently. Held for the duration
    /// of one task, never across a pause.
    pub async fn read(&self) -> OwnedRwLockReadGuard<()> {
        self.lock.clone().read_owned().await
    }

    /// Exclusive priority context. Queued writers make subsequent `read()`
    /// calls wait, so background workers drain out.
    pub async fn acquire_priority(&self) -> OwnedRwLockWriteGuard<()> {
        self.lock.clone().write_owned().await
    }
}
