//! Linearizable metadata store contract and the in-process implementation.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{MetaError, Result};

/// A single comparison guarding a transaction.
#[derive(Debug, Clone)]
pub struct TxnCompare {
    pub key: String,
    /// Expected current value; `None` means the key must be absent.
    pub expect: Option<Vec<u8>>,
}

/// A write operation inside a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Change event delivered to watchers.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Contract for the external linearizable KV the driver persists through.
///
/// Values are opaque bytes; callers serialize with serde_json. All methods
/// must be linearizable. `cas` and `txn` are the only conditional writes the
/// driver relies on.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Compare-and-swap: writes `value` iff the current value equals
    /// `expect` (`None` = key absent). Returns whether the swap happened.
    async fn cas(&self, key: &str, expect: Option<&[u8]>, value: Vec<u8>) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Ordered scan of `[start, end)`; an empty `end` means "no upper bound".
    /// `limit == 0` means unlimited.
    async fn range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>>;

    /// All-or-nothing batch guarded by `compares`. Returns whether the guards
    /// held and the ops were applied.
    async fn txn(&self, compares: Vec<TxnCompare>, ops: Vec<TxnOp>) -> Result<bool>;

    /// Subscribe to changes under `prefix`. Slow subscribers may observe
    /// lagged streams; the driver treats watch as advisory and reloads on
    /// restart.
    fn watch(&self, prefix: &str) -> broadcast::Receiver<WatchEvent>;
}

/// In-process [`MetaStore`] backed by a `BTreeMap`.
///
/// Linearizability comes from the single process-wide lock; critical
/// sections are memory-only and never held across await points.
pub struct MemStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            data: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write().insert(key.to_string(), value.clone());
        self.notify(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn cas(&self, key: &str, expect: Option<&[u8]>, value: Vec<u8>) -> Result<bool> {
        let mut data = self.write();
        let current = data.get(key).map(|v| v.as_slice());
        if current != expect {
            return Ok(false);
        }
        data.insert(key.to_string(), value.clone());
        drop(data);
        self.notify(WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write().remove(key);
        self.notify(WatchEvent::Delete {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.read();
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_string())
        };
        let iter = data.range((Bound::Included(start.to_string()), upper));
        let mut out = Vec::new();
        for (k, v) in iter {
            if limit != 0 && out.len() >= limit {
                break;
            }
            out.push((k.clone(), v.clone()));
        }
        Ok(out)
    }

    async fn txn(&self, compares: Vec<TxnCompare>, ops: Vec<TxnOp>) -> Result<bool> {
        let mut data = self.write();
        for cmp in &compares {
            let current = data.get(&cmp.key).map(|v| v.as_slice());
            if current != cmp.expect.as_deref() {
                return Ok(false);
            }
        }
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                    events.push(WatchEvent::Put { key, value });
                }
                TxnOp::Delete { key } => {
                    data.remove(&key);
                    events.push(WatchEvent::Delete { key });
                }
            }
        }
        drop(data);
        for event in events {
            self.notify(event);
        }
        Ok(true)
    }

    fn watch(&self, _prefix: &str) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

/// Helper: load and deserialize a JSON value, mapping a missing key to `None`.
pub async fn load_json<T: serde::de::DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        None => Ok(None),
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| MetaError::Internal(format!("decode {key}: {e}"))),
    }
}

/// Helper: serialize and store a JSON value.
pub async fn save_json<T: serde::Serialize>(
    store: &dyn MetaStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_vec(value).map_err(|e| MetaError::Internal(e.to_string()))?;
    store.put(key, raw).await
}
