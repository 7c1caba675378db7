//!
//! tundra datastore
//! ----------------
//! A minimal transactional key/value layer every store in the crate sits
//! on. Keys are flat strings namespaced by prefix (`jstore/`, `astore/`,
//! `cistore/`, `ffs/manager/`, `ffs/joblogger/`, `deals/`); values are
//! JSON-encoded records owned by the calling store.
//!
//! Two things matter here:
//! - `batch` applies a group of puts/deletes atomically with respect to
//!   every other operation, which the job store relies on for its
//!   queue/lifecycle transitions.
//! - the optional snapshot file is written through on every mutation with
//!   an atomic tmp+rename, so a process kill never leaves a torn store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Transactional KV contract. Implementations serialize all operations
/// internally; callers never hold locks across datastore calls.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
    /// All entries whose key starts with `prefix`, sorted by key.
    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    /// Apply all ops atomically: either every op is visible or none is.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<(String, String)>,
}

/// In-memory BTreeMap store with optional write-through JSON snapshot.
pub struct MemDatastore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
    snapshot_path: Option<PathBuf>,
}

impl MemDatastore {
    /// Memory-only store; state dies with the process.
    pub fn new() -> Self {
        MemDatastore { map: RwLock::new(BTreeMap::new()), snapshot_path: None }
    }

    /// Disk-backed store: loads the snapshot at `path` if present and
    /// rewrites it on every mutation.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut map = BTreeMap::new();
        if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading datastore snapshot {}", path.display()))?;
            let snap: Snapshot = serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding datastore snapshot {}", path.display()))?;
            let b64 = base64::engine::general_purpose::STANDARD;
            for (k, v) in snap.entries {
                let val = b64.decode(v.as_bytes()).context("decoding snapshot value")?;
                map.insert(k, val);
            }
        }
        Ok(MemDatastore { map: RwLock::new(map), snapshot_path: Some(path) })
    }

    fn flush_locked(&self, map: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let Some(path) = &self.snapshot_path else { return Ok(()) };
        let b64 = base64::engine::general_purpose::STANDARD;
        let snap = Snapshot {
            version: 1,
            entries: map.iter().map(|(k, v)| (k.clone(), b64.encode(v))).collect(),
        };
        let bytes = serde_json::to_vec(&snap).context("encoding datastore snapshot")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("writing datastore snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming datastore snapshot into {}", path.display()))?;
        Ok(())
    }
}

impl Default for MemDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore for MemDatastore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut w = self.map.write();
        w.insert(key.to_string(), value);
        self.flush_locked(&w)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut w = self.map.write();
        w.remove(key);
        self.flush_locked(&w)
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let r = self.map.read();
        Ok(r.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut w = self.map.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    w.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    w.remove(&key);
                }
            }
        }
        self.flush_locked(&w)
    }
}

/// Prefix wrapper producing the namespaced key layout. Wrapping the same
/// inner store with different prefixes yields independent collections.
pub struct Namespaced {
    inner: Arc<dyn Datastore>,
    prefix: String,
}

impl Namespaced {
    pub fn wrap(inner: Arc<dyn Datastore>, namespace: &str) -> Arc<dyn Datastore> {
        let prefix = if namespace.ends_with('/') {
            namespace.to_string()
        } else {
            format!("{namespace}/")
        };
        Arc::new(Namespaced { inner, prefix })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl Datastore for Namespaced {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(&self.full_key(key))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.put(&self.full_key(key), value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.full_key(key))
    }

    fn has(&self, key: &str) -> Result<bool> {
        self.inner.has(&self.full_key(key))
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let full = self.full_key(prefix);
        let out = self.inner.query_prefix(&full)?;
        Ok(out
            .into_iter()
            .map(|(k, v)| (k[self.prefix.len()..].to_string(), v))
            .collect())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let ops = ops
            .into_iter()
            .map(|op| match op {
                BatchOp::Put { key, value } => BatchOp::Put { key: self.full_key(&key), value },
                BatchOp::Delete { key } => BatchOp::Delete { key: self.full_key(&key) },
            })
            .collect();
        self.inner.batch(ops)
    }
}
