use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Id-scoped locks serializing the load → mutate → save cycle of a session.
///
/// Frames for different sessions never contend. An entry lives only while a
/// request holds or awaits it.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive access to one session id; released on drop.
pub struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &str) -> SessionGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(id.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        SessionGuard {
            locks: self,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of ids currently held or awaited.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if map
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let locks = Arc::new(SessionLocks::new());
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let first = locks.acquire("s1").await;
        let task = {
            let locks = locks.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("s1").await;
                order.lock().await.push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        order.lock().await.push("first");
        drop(first);
        task.await.unwrap();

        assert_eq!(*order.lock().await, vec!["first", "second"]);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = SessionLocks::new();
        {
            let _guard = locks.acquire("x").await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }
}
