//! Globally unique, monotonic id allocation backed by the MetaStore.
//!
//! Ids are handed out from a window persisted ahead of use: the stored value
//! is always an upper bound on every id ever granted, so a restart can never
//! re-issue one.

use std::sync::Arc;

use meridian_meta::MetaStore;
use tokio::sync::Mutex;

use crate::error::Result;

const ALLOC_STEP: u64 = 1000;

struct Window {
    next: u64,
    end: u64,
}

pub struct IdAllocator {
    store: Arc<dyn MetaStore>,
    key: String,
    window: Mutex<Window>,
}

impl IdAllocator {
    pub fn new(store: Arc<dyn MetaStore>, key: String) -> Self {
        Self {
            store,
            key,
            window: Mutex::new(Window { next: 0, end: 0 }),
        }
    }

    pub async fn alloc(&self) -> Result<u64> {
        let mut window = self.window.lock().await;
        if window.next >= window.end {
            self.grow(&mut window).await?;
        }
        let id = window.next;
        window.next += 1;
        Ok(id)
    }

    pub async fn alloc_batch(&self, count: usize) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(count);
        let mut window = self.window.lock().await;
        for _ in 0..count {
            if window.next >= window.end {
                self.grow(&mut window).await?;
            }
            out.push(window.next);
            window.next += 1;
        }
        Ok(out)
    }

    /// Ensure every future id is at least `floor`. Used at bootstrap so ids
    /// named by the caller can never be re-granted.
    pub async fn advance_to(&self, floor: u64) -> Result<()> {
        loop {
            let current = self.store.get(&self.key).await?;
            let base = current
                .as_deref()
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if base >= floor {
                break;
            }
            if self
                .store
                .cas(&self.key, current.as_deref(), floor.to_string().into_bytes())
                .await?
            {
                break;
            }
        }
        let mut window = self.window.lock().await;
        if window.end < floor {
            window.next = floor;
            window.end = floor;
        }
        Ok(())
    }

    async fn grow(&self, window: &mut Window) -> Result<()> {
        loop {
            let current = self.store.get(&self.key).await?;
            let base = current
                .as_deref()
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let end = base + ALLOC_STEP;
            let swapped = self
                .store
                .cas(&self.key, current.as_deref(), end.to_string().into_bytes())
                .await?;
            if swapped {
                // Start at 1 on a fresh cluster; 0 stays reserved.
                window.next = base.max(1);
                window.end = end;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_meta::MemStore;

    #[tokio::test]
    async fn ids_are_unique_and_monotonic() {
        let store = Arc::new(MemStore::new());
        let alloc = IdAllocator::new(store.clone(), "/1/alloc_id".into());
        let mut last = 0;
        for _ in 0..ALLOC_STEP * 2 + 5 {
            let id = alloc.alloc().await.unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn restart_never_reissues() {
        let store = Arc::new(MemStore::new());
        let alloc = IdAllocator::new(store.clone(), "/1/alloc_id".into());
        let first = alloc.alloc().await.unwrap();
        // A new allocator over the same backing store jumps past the window.
        let alloc2 = IdAllocator::new(store.clone(), "/1/alloc_id".into());
        let second = alloc2.alloc().await.unwrap();
        assert!(second > first);
        assert!(second >= ALLOC_STEP);
    }

    #[tokio::test]
    async fn batch_allocation_is_distinct() {
        let store = Arc::new(MemStore::new());
        let alloc = IdAllocator::new(store, "/1/alloc_id".into());
        let ids = alloc.alloc_batch(2500).await.unwrap();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }
}
