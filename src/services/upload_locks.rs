//! Per-uploadId mutual exclusion for the chunk receiver.
//!
//! Chunks of different uploads never contend. The map entry for an upload is
//! dropped once the last guard for it goes away.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
pub struct UploadLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Held while one request records a chunk and checks completion.
pub struct UploadLockGuard {
    upload_id: String,
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl UploadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, upload_id: &str) -> UploadLockGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(upload_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        UploadLockGuard {
            upload_id: upload_id.to_string(),
            locks: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of uploads with a live lock entry.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for UploadLockGuard {
    fn drop(&mut self) {
        // Release the tokio mutex first so the strong count below only
        // reflects the map's copy plus waiters.
        self.guard.take();
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = map
            .get(&self.upload_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if idle {
            map.remove(&self.upload_id);
        }
    }
}
