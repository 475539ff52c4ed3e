/// Persistent store backed by sled
/// Keys are the full paths; pushes draw keys from sled's monotonic id generator.
use super::{child_path, is_direct_child, leaf, PushStamp, Store, StoreEvent, StoreSubscription};
use crate::error::{ChatError, Result};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const META_TREE: &str = "meta";
const LAST_TIMESTAMP_KEY: &[u8] = b"last_push_timestamp";
const WATCH_POLL: Duration = Duration::from_millis(250);

fn storage_err(context: &str, e: sled::Error) -> ChatError {
    ChatError::Storage(format!("{}: {}", context, e))
}

#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    meta: sled::Tree,
    /// Last issued push timestamp; also serializes pushes
    push_lock: Arc<Mutex<i64>>,
}

impl SledStore {
    /// Open (or create) the store in the given data directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("messaging.db");
        debug!("Opening messaging store at {:?}", db_path);

        let db = sled::open(&db_path).map_err(|e| storage_err("Failed to open messaging DB", e))?;
        let meta = db
            .open_tree(META_TREE)
            .map_err(|e| storage_err("Failed to open meta tree", e))?;

        let last_timestamp = match meta
            .get(LAST_TIMESTAMP_KEY)
            .map_err(|e| storage_err("Failed to read push clock", e))?
        {
            Some(raw) => {
                let mut buf = [0u8; 8];
                if raw.len() == 8 {
                    buf.copy_from_slice(&raw);
                }
                i64::from_be_bytes(buf)
            }
            None => 0,
        };

        info!("Messaging store initialized at {:?}", db_path);
        Ok(Self {
            db,
            meta,
            push_lock: Arc::new(Mutex::new(last_timestamp)),
        })
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| storage_err("Failed to flush messaging DB", e))?;
        Ok(())
    }

    fn direct_children<I>(parent: &str, iter: I) -> Result<Vec<(String, Vec<u8>)>>
    where
        I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    {
        let mut out = Vec::new();
        for entry in iter {
            let (key, value) = entry.map_err(|e| storage_err("Failed to list children", e))?;
            if let Ok(path) = std::str::from_utf8(&key) {
                if is_direct_child(parent, path) {
                    out.push((leaf(path).to_string(), value.to_vec()));
                }
            }
        }
        Ok(out)
    }
}

impl Store for SledStore {
    fn put(&self, path: &str, value: Vec<u8>) -> Result<()> {
        self.db
            .insert(path.as_bytes(), value)
            .map_err(|e| storage_err("Failed to store value", e))?;
        self.flush()
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.db.get(path.as_bytes()) {
            Ok(Some(value)) => Ok(Some(value.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err("Failed to fetch value", e)),
        }
    }

    fn compare_and_swap(&self, path: &str, expected: Option<&[u8]>, new: Vec<u8>) -> Result<bool> {
        let swapped = self
            .db
            .compare_and_swap(path.as_bytes(), expected, Some(new))
            .map_err(|e| storage_err("Failed conditional write", e))?;
        match swapped {
            Ok(()) => {
                self.flush()?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn push(
        &self,
        parent: &str,
        build: &dyn Fn(PushStamp) -> Result<Vec<u8>>,
    ) -> Result<PushStamp> {
        let mut last_timestamp = self
            .push_lock
            .lock()
            .map_err(|_| ChatError::Storage("push lock poisoned".to_string()))?;

        let seq = self
            .db
            .generate_id()
            .map_err(|e| storage_err("Failed to generate id", e))?;
        let stamp = PushStamp {
            seq,
            timestamp: chrono::Utc::now().timestamp_millis().max(*last_timestamp),
        };
        let value = build(stamp)?;

        self.db
            .insert(child_path(parent, &stamp.key()).as_bytes(), value)
            .map_err(|e| storage_err("Failed to append child", e))?;
        self.meta
            .insert(LAST_TIMESTAMP_KEY, stamp.timestamp.to_be_bytes().to_vec())
            .map_err(|e| storage_err("Failed to persist push clock", e))?;
        self.flush()?;

        *last_timestamp = stamp.timestamp;
        Ok(stamp)
    }

    fn children(&self, parent: &str, after: Option<&str>) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        match after {
            Some(child) => {
                let start = child_path(parent, child).into_bytes();
                let iter = self
                    .db
                    .range::<Vec<u8>, _>((Bound::Excluded(start), Bound::Unbounded))
                    .take_while(|entry| match entry {
                        Ok((k, _)) => k.starts_with(prefix.as_bytes()),
                        Err(_) => true,
                    });
                Self::direct_children(parent, iter)
            }
            None => Self::direct_children(parent, self.db.scan_prefix(prefix.as_bytes())),
        }
    }

    fn last_child(&self, parent: &str) -> Result<Option<(String, Vec<u8>)>> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        for entry in self.db.scan_prefix(prefix.as_bytes()).rev() {
            let (key, value) = entry.map_err(|e| storage_err("Failed to read last child", e))?;
            if let Ok(path) = std::str::from_utf8(&key) {
                if is_direct_child(parent, path) {
                    return Ok(Some((leaf(path).to_string(), value.to_vec())));
                }
            }
        }
        Ok(None)
    }

    fn subscribe(&self, parent: &str) -> Result<StoreSubscription> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        let mut subscriber = self.db.watch_prefix(prefix.as_bytes());
        let (tx, rx) = mpsc::unbounded_channel();

        // sled's subscriber blocks; bridge it on the blocking pool until the
        // receiving side goes away.
        let forwarder = tokio::task::spawn_blocking(move || {
            loop {
                if tx.is_closed() {
                    break;
                }
                let event = match subscriber.next_timeout(WATCH_POLL) {
                    Ok(event) => event,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        warn!("sled watcher for {} disconnected", prefix);
                        let _ = tx.send(StoreEvent::Lost("watcher disconnected".to_string()));
                        break;
                    }
                };
                let forwarded = match event {
                    sled::Event::Insert { key, value } => StoreEvent::Changed {
                        path: String::from_utf8_lossy(&key).to_string(),
                        value: value.to_vec(),
                    },
                    sled::Event::Remove { key } => StoreEvent::Removed {
                        path: String::from_utf8_lossy(&key).to_string(),
                    },
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
        });

        Ok(StoreSubscription::with_forwarder(rx, forwarder))
    }

    fn server_time(&self) -> Result<i64> {
        let last_timestamp = self
            .push_lock
            .lock()
            .map_err(|_| ChatError::Storage("push lock poisoned".to_string()))?;
        Ok(chrono::Utc::now().timestamp_millis().max(*last_timestamp))
    }
}
