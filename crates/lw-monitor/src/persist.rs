//! Durability mirror for session state.
//!
//! The in-memory [`SessionStore`](crate::store::SessionStore) is authoritative.
//! Every mutation is mirrored to a key-value store by a background writer
//! task that applies writes in submission order. A failed write is logged and
//! repaired by the next write of the same key.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lw_core::SessionId;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::MonitorError;

// =============================================================================
// Keys
// =============================================================================

/// Index of live session ids.
pub const SESSIONS_KEY: &str = "sessions";

/// Per-session key names, stored as `<name>_<sessionId>`.
pub mod keys {
    pub const SESSION: &str = "session";
    pub const LEAK_COUNT: &str = "leakCount";
    pub const PROCESSED_URLS: &str = "processedUrls";
    pub const LEAKED_URLS: &str = "leakedURLs";
    pub const OBSERVED_RESOURCES: &str = "observedResources";
    /// `{tabUrl, resources: [{surt, url, policies}]}` for resources with rule matches
    pub const POLICIES_BY_TAB: &str = "policiesByTab";
    pub const CSP_VIOLATIONS: &str = "cspViolations";
    pub const CSP_VIOLATION_COUNT: &str = "cspViolationCount";
    pub const REWRITE_LOG: &str = "rewriteLog";

    pub const ALL: [&str; 9] = [
        SESSION,
        LEAK_COUNT,
        PROCESSED_URLS,
        LEAKED_URLS,
        OBSERVED_RESOURCES,
        POLICIES_BY_TAB,
        CSP_VIOLATIONS,
        CSP_VIOLATION_COUNT,
        REWRITE_LOG,
    ];
}

#[inline]
pub fn session_key(name: &str, id: SessionId) -> String {
    format!("{}_{}", name, id)
}

/// Every key namespaced to `id`.
pub fn session_keys(id: SessionId) -> Vec<String> {
    keys::ALL.iter().map(|name| session_key(name, id)).collect()
}

// =============================================================================
// Key-Value Store
// =============================================================================

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, MonitorError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), MonitorError>;
    async fn remove(&self, keys: &[String]) -> Result<(), MonitorError>;
}

/// In-process store, used by tests and when no state file is configured.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: parking_lot::Mutex<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, MonitorError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), MonitorError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), MonitorError> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Whole-file JSON object store. Each write replaces the file atomically.
pub struct JsonFileKv {
    path: PathBuf,
    entries: AsyncMutex<serde_json::Map<String, Value>>,
}

impl JsonFileKv {
    /// Open `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => serde_json::Map::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                MonitorError::Config(format!("Failed to parse state file '{}': {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => serde_json::Map::new(),
            Err(e) => {
                return Err(MonitorError::Config(format!(
                    "Failed to read state file '{}': {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(Self {
            path,
            entries: AsyncMutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_out(&self, entries: &serde_json::Map<String, Value>, key: &str) -> Result<(), MonitorError> {
        let failed = |reason: String| MonitorError::StorageWriteFailed {
            key: key.to_string(),
            reason,
        };
        let text = serde_json::to_vec_pretty(entries).map_err(|e| failed(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| failed(e.to_string()))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await.map_err(|e| failed(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| failed(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for JsonFileKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, MonitorError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), MonitorError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.write_out(&entries, key).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), MonitorError> {
        let mut entries = self.entries.lock().await;
        let mut changed = false;
        for key in keys {
            changed |= entries.remove(key).is_some();
        }
        if !changed {
            return Ok(());
        }
        let label = keys.first().map(String::as_str).unwrap_or_default();
        self.write_out(&entries, label).await
    }
}

// =============================================================================
// Mirror Writer
// =============================================================================

enum MirrorOp {
    Set { key: String, value: Value },
    Remove { keys: Vec<String> },
    Flush(oneshot::Sender<()>),
}

/// Ordered, fire-and-forget write channel into a [`KvStore`].
#[derive(Clone, Default)]
pub struct Mirror {
    tx: Option<mpsc::UnboundedSender<MirrorOp>>,
}

impl Mirror {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(kv: Arc<dyn KvStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    MirrorOp::Set { key, value } => {
                        if let Err(e) = kv.set(&key, value).await {
                            log::warn!("mirror write failed: {}", e);
                        }
                    }
                    MirrorOp::Remove { keys } => {
                        if let Err(e) = kv.remove(&keys).await {
                            log::warn!("mirror delete failed: {}", e);
                        }
                    }
                    MirrorOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        (Self { tx: Some(tx) }, task)
    }

    /// A mirror that drops every write.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub(crate) fn set(&self, key: String, value: Value) {
        self.send(MirrorOp::Set { key, value });
    }

    pub(crate) fn remove(&self, keys: Vec<String>) {
        self.send(MirrorOp::Remove { keys });
    }

    fn send(&self, op: MirrorOp) {
        if let Some(tx) = &self.tx {
            if tx.send(op).is_err() {
                log::warn!("mirror writer stopped, durability write dropped");
            }
        }
    }

    /// Wait until every write submitted so far has been applied.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done, wait) = oneshot::channel();
        if tx.send(MirrorOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}
