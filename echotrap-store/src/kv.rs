//! Embedded key/value store with TTL, append-only lists, pub/sub channels
//! and an advisory lock.
//!
//! Backed by sled trees:
//! - `kv` holds plain string values,
//! - `lists` holds list entries under `<list>\0<zero-padded index>` keys so a
//!   prefix scan yields them in append order,
//! - `lens` holds list length counters advanced atomically,
//! - `expiry` holds per-key deadlines (milliseconds) enforced lazily on read
//!   and by a background sweeper.
//!
//! Pub/sub is an in-process broadcast channel per subdomain, registered in a
//! `DashMap`. Handles are cheap clones; no handle is shared mutable state.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use echotrap_core::{Error, Result};

/// Buffered messages per pub/sub channel before a slow subscriber lags out.
const PUBSUB_CAPACITY: usize = 256;

fn read_err(err: sled::Error) -> Error {
    Error::StoreRead(err.to_string())
}

fn write_err(err: sled::Error) -> Error {
    Error::StoreWrite(err.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn decode_u64(bytes: &[u8]) -> u64 {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .unwrap_or_default()
}

fn decode_i64(bytes: &[u8]) -> i64 {
    bytes
        .try_into()
        .map(i64::from_be_bytes)
        .unwrap_or_default()
}

fn item_key(list: &str, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(list.len() + 9);
    key.extend_from_slice(list.as_bytes());
    key.push(0);
    key.extend_from_slice(format!("{:08}", index).as_bytes());
    key
}

fn list_prefix(list: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(list.len() + 1);
    prefix.extend_from_slice(list.as_bytes());
    prefix.push(0);
    prefix
}

/// The shared store. Clone to obtain an independent handle.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    kv: sled::Tree,
    lists: sled::Tree,
    lens: sled::Tree,
    expiry: sled::Tree,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl Store {
    /// Open (or create) the store under `path`.
    pub fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store for tests.
    pub fn open_temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> anyhow::Result<Self> {
        let kv = db.open_tree("kv")?;
        let lists = db.open_tree("lists")?;
        let lens = db.open_tree("lens")?;
        let expiry = db.open_tree("expiry")?;
        Ok(Self {
            db,
            kv,
            lists,
            lens,
            expiry,
            channels: Arc::new(DashMap::new()),
        })
    }

    /// An independent handle over the same store.
    pub fn handle(&self) -> Store {
        self.clone()
    }

    /// Read a value. Missing and expired keys both read as `None`.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.is_expired(key)? {
            self.remove_everything(key)?;
            return Ok(None);
        }
        let value = self.kv.get(key.as_bytes()).map_err(read_err)?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Write a value. A `ttl` renews the key's deadline on every write; with
    /// no `ttl` the key does not expire.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.kv
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(write_err)?;
        self.apply_ttl(key, ttl)
    }

    /// Remove a value key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.remove(key.as_bytes()).map_err(write_err)?;
        self.expiry.remove(key.as_bytes()).map_err(write_err)?;
        Ok(())
    }

    /// Renew (or set) the deadline for a key or list.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.apply_ttl(key, Some(ttl))
    }

    /// Append to a list, returning the new length.
    pub async fn append(&self, list: &str, value: &str) -> Result<u64> {
        let new_len = self
            .lens
            .update_and_fetch(list.as_bytes(), |old| {
                let next = old.map(decode_u64).unwrap_or(0) + 1;
                Some(next.to_be_bytes().to_vec())
            })
            .map_err(write_err)?
            .map(|v| decode_u64(&v))
            .unwrap_or(1);
        self.lists
            .insert(item_key(list, new_len - 1), value.as_bytes())
            .map_err(write_err)?;
        Ok(new_len)
    }

    /// All list entries in append order.
    pub async fn range(&self, list: &str) -> Result<Vec<String>> {
        if self.is_expired(list)? {
            self.remove_everything(list)?;
            return Ok(Vec::new());
        }
        let mut values = Vec::new();
        for entry in self.lists.scan_prefix(list_prefix(list)) {
            let (_, value) = entry.map_err(read_err)?;
            values.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(values)
    }

    /// One list entry by index.
    pub async fn index_at(&self, list: &str, index: u64) -> Result<Option<String>> {
        let value = self.lists.get(item_key(list, index)).map_err(read_err)?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Overwrite one list slot in place. The list is never compacted.
    pub async fn set_at(&self, list: &str, index: u64, value: &str) -> Result<()> {
        self.lists
            .insert(item_key(list, index), value.as_bytes())
            .map_err(write_err)?;
        Ok(())
    }

    /// Drop a whole list, entries and counter.
    pub async fn delete_list(&self, list: &str) -> Result<()> {
        let keys: Vec<_> = self
            .lists
            .scan_prefix(list_prefix(list))
            .keys()
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?;
        for key in keys {
            self.lists.remove(key).map_err(write_err)?;
        }
        self.lens.remove(list.as_bytes()).map_err(write_err)?;
        self.expiry.remove(list.as_bytes()).map_err(write_err)?;
        Ok(())
    }

    /// Publish to a channel. Messages to channels nobody subscribes to are
    /// dropped, matching fire-and-forget pub/sub semantics.
    pub async fn publish(&self, channel: &str, value: &str) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(value.to_string());
        }
        // Channels whose last subscriber went away are garbage.
        self.channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0);
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0)
            .subscribe()
    }

    /// Try to take a distributed advisory lock. Non-blocking: `None` means
    /// another holder owns a live lock.
    pub async fn try_lock(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let key = format!("lock:{}", name);
        let fence = Uuid::new_v4().to_string();
        let deadline = now_millis() + ttl.as_millis() as i64;
        let value = format!("{}:{}", deadline, fence);

        let current = self.kv.get(key.as_bytes()).map_err(read_err)?;
        if let Some(existing) = &current {
            let held = String::from_utf8_lossy(existing);
            let live = held
                .split(':')
                .next()
                .and_then(|ts| ts.parse::<i64>().ok())
                .map(|ts| ts > now_millis())
                .unwrap_or(false);
            if live {
                return Ok(None);
            }
        }

        let swapped = self
            .kv
            .compare_and_swap(
                key.as_bytes(),
                current.as_ref().map(|v| &**v),
                Some(value.as_bytes()),
            )
            .map_err(write_err)?;
        match swapped {
            Ok(()) => Ok(Some(LockGuard {
                store: self.handle(),
                key,
                value,
            })),
            Err(_) => Ok(None),
        }
    }

    /// Flush pending writes. Called on graceful shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await.map_err(write_err)?;
        Ok(())
    }

    /// Background task removing expired keys. Expiry is also enforced lazily
    /// on read, so the sweeper only bounds garbage.
    pub fn spawn_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.handle();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = store.sweep() {
                    warn!(%err, "ttl sweep failed");
                }
            }
        })
    }

    fn sweep(&self) -> Result<()> {
        let now = now_millis();
        let mut expired = Vec::new();
        for entry in self.expiry.iter() {
            let (key, deadline) = entry.map_err(read_err)?;
            if decode_i64(&deadline) <= now {
                expired.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "sweeping expired keys");
        }
        for key in expired {
            self.remove_everything(&key)?;
        }
        Ok(())
    }

    fn apply_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<()> {
        match ttl {
            Some(ttl) => {
                let deadline = now_millis() + ttl.as_millis() as i64;
                self.expiry
                    .insert(key.as_bytes(), deadline.to_be_bytes().to_vec())
                    .map_err(write_err)?;
            }
            None => {
                self.expiry.remove(key.as_bytes()).map_err(write_err)?;
            }
        }
        Ok(())
    }

    fn is_expired(&self, key: &str) -> Result<bool> {
        let deadline = self.expiry.get(key.as_bytes()).map_err(read_err)?;
        Ok(deadline
            .map(|d| decode_i64(&d) <= now_millis())
            .unwrap_or(false))
    }

    /// Remove a key from every namespace it may occupy: plain value, list
    /// entries, list counter and deadline.
    fn remove_everything(&self, key: &str) -> Result<()> {
        self.kv.remove(key.as_bytes()).map_err(write_err)?;
        self.lens.remove(key.as_bytes()).map_err(write_err)?;
        self.expiry.remove(key.as_bytes()).map_err(write_err)?;
        let keys: Vec<_> = self
            .lists
            .scan_prefix(list_prefix(key))
            .keys()
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?;
        for item in keys {
            self.lists.remove(item).map_err(write_err)?;
        }
        Ok(())
    }
}

/// Holder of an advisory lock. Release is explicit; an unreleased lock
/// simply decays when its deadline passes.
pub struct LockGuard {
    store: Store,
    key: String,
    value: String,
}

impl LockGuard {
    /// Release the lock if this guard still owns it.
    pub async fn release(self) -> Result<()> {
        let _ = self
            .store
            .kv
            .compare_and_swap(
                self.key.as_bytes(),
                Some(self.value.as_bytes()),
                None::<&[u8]>,
            )
            .map_err(write_err)?;
        self.store
            .expiry
            .remove(self.key.as_bytes())
            .map_err(write_err)?;
        Ok(())
    }
}
