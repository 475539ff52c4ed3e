/// In-process store with push notifications and fault injection
use super::{is_direct_child, child_path, PushStamp, Store, StoreEvent, StoreSubscription};
use crate::error::{ChatError, Result};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

struct Inner {
    data: BTreeMap<String, Vec<u8>>,
    watchers: Vec<Watcher>,
    next_seq: u64,
    last_timestamp: i64,
    clock: Clock,
    failing_writes: u32,
    failing_prefix: String,
    offline: bool,
}

impl Inner {
    fn check_online(&self) -> Result<()> {
        if self.offline {
            return Err(ChatError::Storage("store offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&mut self, path: &str) -> Result<()> {
        self.check_online()?;
        if self.failing_writes > 0 && path.starts_with(&self.failing_prefix) {
            self.failing_writes -= 1;
            return Err(ChatError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }

    fn write(&mut self, path: &str, value: Vec<u8>) {
        self.data.insert(path.to_string(), value.clone());
        self.notify(StoreEvent::Changed {
            path: path.to_string(),
            value,
        });
    }

    /// Deliver to matching watchers, pruning the ones whose receiver is gone
    fn notify(&mut self, event: StoreEvent) {
        let path = match &event {
            StoreEvent::Changed { path, .. } | StoreEvent::Removed { path } => path.clone(),
            StoreEvent::Lost(_) => return,
        };
        self.watchers.retain(|w| {
            if !path.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn drop_watchers(&mut self, reason: &str) {
        for w in self.watchers.drain(..) {
            let _ = w.tx.send(StoreEvent::Lost(reason.to_string()));
        }
    }
}

/// Store kept entirely in memory. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: BTreeMap::new(),
                watchers: Vec::new(),
                next_seq: 1,
                last_timestamp: 0,
                clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
                failing_writes: 0,
                failing_prefix: String::new(),
                offline: false,
            })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ChatError::Storage("memory store lock poisoned".to_string()))
    }

    /// Replace the server clock (milliseconds since epoch)
    pub fn set_clock<F>(&self, clock: F)
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        if let Ok(mut inner) = self.lock() {
            inner.clock = Arc::new(clock);
        }
    }

    /// Make the next `n` writes fail with a storage error
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next_writes_under("", n);
    }

    /// Make the next `n` writes at paths starting with `prefix` fail
    pub fn fail_next_writes_under(&self, prefix: &str, n: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_writes = n;
            inner.failing_prefix = prefix.to_string();
        }
    }

    /// Simulate losing the connection: every subscriber receives `Lost` and every
    /// operation fails until the store is brought back online.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.offline = offline;
            if offline {
                inner.drop_watchers("store went offline");
            }
        }
    }

    /// Drop every live subscription without touching stored data
    pub fn drop_subscriptions(&self) {
        if let Ok(mut inner) = self.lock() {
            debug!("Dropping {} store subscriptions", inner.watchers.len());
            inner.drop_watchers("connection reset");
        }
    }

    /// Number of registrations that have not been released yet
    pub fn subscriber_count(&self) -> usize {
        match self.lock() {
            Ok(mut inner) => {
                inner.watchers.retain(|w| !w.tx.is_closed());
                inner.watchers.len()
            }
            Err(_) => 0,
        }
    }

    /// Paths currently stored below `prefix`
    pub fn paths(&self, prefix: &str) -> Vec<String> {
        match self.lock() {
            Ok(inner) => inner
                .data
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Store for MemoryStore {
    fn put(&self, path: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.check_write(path)?;
        inner.write(path, value);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.lock()?;
        inner.check_online()?;
        Ok(inner.data.get(path).cloned())
    }

    fn compare_and_swap(&self, path: &str, expected: Option<&[u8]>, new: Vec<u8>) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.check_write(path)?;
        if inner.data.get(path).map(|v| v.as_slice()) != expected {
            return Ok(false);
        }
        inner.write(path, new);
        Ok(true)
    }

    fn push(
        &self,
        parent: &str,
        build: &dyn Fn(PushStamp) -> Result<Vec<u8>>,
    ) -> Result<PushStamp> {
        let mut inner = self.lock()?;
        inner.check_write(parent)?;

        let now = (inner.clock)();
        let stamp = PushStamp {
            seq: inner.next_seq,
            timestamp: now.max(inner.last_timestamp),
        };
        let value = build(stamp)?;

        inner.next_seq += 1;
        inner.last_timestamp = stamp.timestamp;
        inner.write(&child_path(parent, &stamp.key()), value);
        Ok(stamp)
    }

    fn children(&self, parent: &str, after: Option<&str>) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.lock()?;
        inner.check_online()?;

        let prefix = format!("{}/", parent.trim_end_matches('/'));
        let start = match after {
            Some(child) => Bound::Excluded(child_path(parent, child)),
            None => Bound::Included(prefix.clone()),
        };

        Ok(inner
            .data
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| is_direct_child(parent, k))
            .map(|(k, v)| (super::leaf(k).to_string(), v.clone()))
            .collect())
    }

    fn last_child(&self, parent: &str) -> Result<Option<(String, Vec<u8>)>> {
        let inner = self.lock()?;
        inner.check_online()?;

        let prefix = format!("{}/", parent.trim_end_matches('/'));
        Ok(inner
            .data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| is_direct_child(parent, k))
            .last()
            .map(|(k, v)| (super::leaf(k).to_string(), v.clone())))
    }

    fn subscribe(&self, parent: &str) -> Result<StoreSubscription> {
        let mut inner = self.lock()?;
        inner.check_online()?;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.watchers.push(Watcher {
            prefix: format!("{}/", parent.trim_end_matches('/')),
            tx,
        });
        Ok(StoreSubscription::new(rx))
    }

    fn server_time(&self) -> Result<i64> {
        let inner = self.lock()?;
        inner.check_online()?;
        Ok((inner.clock)().max(inner.last_timestamp))
    }
}
