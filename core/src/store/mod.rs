/// Store collaborator: hierarchical key-value persistence with push notifications
///
/// Paths are `/`-separated (`MaternalHealthSystem/conversations/<id>`). Children of a
/// path are the entries exactly one segment below it.
pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::error::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Key and server time assigned by the store to a pushed child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushStamp {
    pub seq: u64,
    pub timestamp: i64,
}

impl PushStamp {
    /// Child key for this stamp; zero-padded so lexical order is push order
    pub fn key(&self) -> String {
        child_key(self.seq)
    }
}

pub fn child_key(seq: u64) -> String {
    format!("{:020}", seq)
}

pub fn child_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Name of the last segment of `path`
pub fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether `path` sits directly below `parent`
pub(crate) fn is_direct_child(parent: &str, path: &str) -> bool {
    let prefix = format!("{}/", parent.trim_end_matches('/'));
    match path.strip_prefix(&prefix) {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}

/// Notification delivered to a path subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A value was written at `path`
    Changed { path: String, value: Vec<u8> },
    /// The value at `path` was removed
    Removed { path: String },
    /// The connection to the store dropped; no further events follow
    Lost(String),
}

/// Registration for push notifications under a path. Dropping it cancels delivery.
pub struct StoreSubscription {
    rx: mpsc::UnboundedReceiver<StoreEvent>,
    forwarder: Option<JoinHandle<()>>,
}

impl StoreSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<StoreEvent>) -> Self {
        Self {
            rx,
            forwarder: None,
        }
    }

    /// Subscription whose events are produced by a background task
    pub fn with_forwarder(rx: mpsc::UnboundedReceiver<StoreEvent>, forwarder: JoinHandle<()>) -> Self {
        Self {
            rx,
            forwarder: Some(forwarder),
        }
    }

    /// Next event, or `None` once the registration is gone
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }

    /// Stop delivery and release the registration
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.rx.close();
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Minimal persistence interface used by the messaging core
pub trait Store: Send + Sync {
    /// Atomic write of `value` at `path`
    fn put(&self, path: &str, value: Vec<u8>) -> Result<()>;

    /// One-shot read
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Conditional write: stores `new` only if the current value equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    fn compare_and_swap(&self, path: &str, expected: Option<&[u8]>, new: Vec<u8>) -> Result<bool>;

    /// Server-stamped append under `parent`. The store picks a monotonic child key and
    /// a non-decreasing server timestamp, builds the value from them and writes it
    /// before any later push under the same store is stamped.
    fn push(
        &self,
        parent: &str,
        build: &dyn Fn(PushStamp) -> Result<Vec<u8>>,
    ) -> Result<PushStamp>;

    /// Direct children of `parent` in key order, optionally only those after `after`
    fn children(&self, parent: &str, after: Option<&str>) -> Result<Vec<(String, Vec<u8>)>>;

    /// Direct child of `parent` with the greatest key
    fn last_child(&self, parent: &str) -> Result<Option<(String, Vec<u8>)>>;

    /// Push notifications for every write below `parent`
    fn subscribe(&self, parent: &str) -> Result<StoreSubscription>;

    /// Current server time in milliseconds since epoch
    fn server_time(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(child_path("root/messages/", "a"), "root/messages/a");
        assert_eq!(leaf("root/messages/dm-x"), "dm-x");
        assert!(is_direct_child("root/messages", "root/messages/dm-x"));
        assert!(!is_direct_child("root/messages", "root/messages/dm-x/0001"));
        assert!(!is_direct_child("root/messages", "root/messagesX/dm-x"));
        assert!(child_key(9) < child_key(10));
    }
}
