// # Memory State Store
//
// In-memory implementation of StateStore.
//
// Nothing survives a restart. Clones share the same state, so a test can
// keep one handle and hand another to the watcher.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::state_store::{DetectedState, StateStore};

/// In-memory state store implementation
///
/// # Example
///
/// ```rust,no_run
/// use maildns_core::state::MemoryStateStore;
/// use maildns_core::traits::{DetectedState, StateStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStateStore::new();
///
///     store.save(&DetectedState::new("1.2.3.4".parse()?, None, Vec::new())).await?;
///     assert!(store.load().await?.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<Option<DetectedState>>,
    saves: AtomicUsize,
    restarts: AtomicUsize,
}

impl MemoryStateStore {
    /// Create a new empty memory state store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding `state`
    pub fn with_state(state: DetectedState) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(Some(state)),
                ..Default::default()
            }),
        }
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }

    /// Number of restart requests
    pub fn restart_requests(&self) -> usize {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Drop the stored state
    pub async fn clear(&self) {
        *self.inner.state.write().await = None;
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<DetectedState>, Error> {
        Ok(self.inner.state.read().await.clone())
    }

    async fn save(&self, state: &DetectedState) -> Result<(), Error> {
        *self.inner.state.write().await = Some(state.clone());
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_restart(&self) -> Result<(), Error> {
        self.inner.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStateStore::new();
        let handle = store.clone();

        let state = DetectedState::new("1.2.3.4".parse().unwrap(), None, Vec::new());
        handle.save(&state).await.unwrap();
        handle.request_restart().await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(state));
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.restart_requests(), 1);

        store.clear().await;
        assert_eq!(handle.load().await.unwrap(), None);
    }
}
