//! Cooperative cancellation carrying an explicit reason.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why an upload was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortReason {
    /// Stop now, keep confirmed progress, resume later.
    Paused,
    /// Stop now and give the file up.
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Paused => f.write_str("upload paused"),
            AbortReason::Cancelled => f.write_str("upload cancelled"),
        }
    }
}

/// Owned by one file's upload run. Cloning shares the same signal.
///
/// The first `abort` wins; later calls neither change the reason nor
/// re-trigger waiters.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal `reason`. Returns `false` if the handle was already aborted.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn pause(&self) -> bool {
        self.abort(AbortReason::Paused)
    }

    pub fn cancel(&self) -> bool {
        self.abort(AbortReason::Cancelled)
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once the handle is aborted, with the reason.
    pub async fn aborted(&self) -> AbortReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(AbortReason::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_reason_wins() {
        let handle = CancelHandle::new();
        assert_eq!(handle.reason(), None);
        assert!(handle.pause());
        assert!(!handle.cancel());
        assert_eq!(handle.reason(), Some(AbortReason::Paused));
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn clones_observe_the_same_signal() {
        let handle = CancelHandle::new();
        let watcher = handle.clone();
        let waiter = tokio::spawn(async move { watcher.aborted().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        assert_eq!(waiter.await.unwrap(), AbortReason::Cancelled);
    }
}
