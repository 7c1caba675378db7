//!
//! Per-CID job logger
//! ------------------
//! Append-only, datastore-backed log of human-readable messages about each
//! CID, with live fan-out to subscribers. Entries created while a Job is
//! executing carry that Job's id. History per CID is totally ordered by a
//! monotonic nanosecond timestamp; the logger never blocks on a slow
//! subscriber (entries are dropped on a full channel).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::datastore::Datastore;
use crate::types::{Cid, JobId, LogEntry};

const WATCHER_BUFFER: usize = 64;

struct WatcherEntry {
    id: u64,
    tx: mpsc::Sender<LogEntry>,
}

/// Datastore-backed log sink with live watchers.
pub struct JobLogger {
    ds: Arc<dyn Datastore>,
    last_ts: AtomicI64,
    next_watcher_id: AtomicU64,
    watchers: Arc<Mutex<Vec<WatcherEntry>>>,
    closed: Mutex<bool>,
}

impl JobLogger {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        JobLogger {
            ds,
            last_ts: AtomicI64::new(0),
            next_watcher_id: AtomicU64::new(0),
            watchers: Arc::new(Mutex::new(Vec::new())),
            closed: Mutex::new(false),
        }
    }

    /// Append a message for `cid`, associated with `jid` when the caller is
    /// executing a Job. Persistence failures are logged and swallowed: the
    /// log sink must never fail a reconciliation.
    pub fn log(&self, cid: &Cid, jid: Option<&JobId>, msg: impl Into<String>) {
        let msg = msg.into();
        info!(target: "tundra::joblog", "{}: {}", cid, msg);

        let ts = self.next_timestamp();
        let entry = LogEntry {
            cid: cid.clone(),
            job_id: jid.cloned(),
            timestamp: ts,
            message: msg,
        };
        match serde_json::to_vec(&entry) {
            Ok(buf) => {
                if let Err(e) = self.ds.put(&make_key(cid, ts), buf) {
                    warn!(target: "tundra::joblog", "saving log entry for {}: {:#}", cid, e);
                    return;
                }
            }
            Err(e) => {
                warn!(target: "tundra::joblog", "encoding log entry for {}: {}", cid, e);
                return;
            }
        }

        let watchers = self.watchers.lock();
        for w in watchers.iter() {
            if w.tx.try_send(entry.clone()).is_err() {
                warn!(target: "tundra::joblog", "slow log receiver, dropping entry");
            }
        }
    }

    /// Subscribe to all future log entries. The subscription ends when the
    /// returned watcher is dropped or the logger is closed.
    pub fn watch(&self) -> LogWatcher {
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().push(WatcherEntry { id, tx });
        LogWatcher { id, rx, registry: Arc::downgrade(&self.watchers) }
    }

    /// Full history for a CID in timestamp order.
    pub fn get(&self, cid: &Cid) -> Result<Vec<LogEntry>> {
        let pairs = self
            .ds
            .query_prefix(&format!("{}/", cid))
            .with_context(|| format!("querying log history of {cid}"))?;
        let mut out = Vec::with_capacity(pairs.len());
        for (key, buf) in pairs {
            let entry: LogEntry = serde_json::from_slice(&buf)
                .with_context(|| format!("decoding log entry {key}"))?;
            out.push(entry);
        }
        // Keys are zero-padded so the prefix scan already yields timestamp order.
        Ok(out)
    }

    /// Close the sink: all watcher channels are dropped, unblocking their
    /// receivers. Idempotent.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;
        self.watchers.lock().clear();
    }

    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        // Bump ties so per-CID keys stay unique and ordered.
        let mut prev = self.last_ts.load(Ordering::Relaxed);
        loop {
            let next = if now > prev { now } else { prev + 1 };
            match self.last_ts.compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Live subscription handle. Dropping it unregisters the watcher.
pub struct LogWatcher {
    id: u64,
    rx: mpsc::Receiver<LogEntry>,
    registry: std::sync::Weak<Mutex<Vec<WatcherEntry>>>,
}

impl LogWatcher {
    /// Next entry, or None once the logger is closed.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogEntry> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().retain(|w| w.id != self.id);
        }
    }
}

fn make_key(cid: &Cid, ts: i64) -> String {
    // Zero-padded timestamps keep lexicographic and numeric order aligned.
    format!("{}/{:020}", cid, ts)
}
