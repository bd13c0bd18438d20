//! Console capture service.
//!
//! Collects page console output per session while the session is monitored.
//! It is independent of the leak core: the pipeline notifies it about
//! lifecycle changes through [`SessionObserver`] and never reads from it.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use lw_core::SessionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Lifecycle notifications from the pipeline.
pub trait SessionObserver: Send + Sync {
    /// The session entered monitoring on a boundary URL.
    fn session_monitoring(&self, _id: SessionId) {}
    /// The session is on a page outside the replay boundary.
    fn session_idle(&self, _id: SessionId) {}
    /// The session navigated; state from the previous page is gone.
    fn session_reset(&self, _id: SessionId) {}
    /// The tab closed.
    fn session_closed(&self, _id: SessionId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Classify a console line by keyword.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("error") {
            Self::Error
        } else if lower.contains("warning") {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded per-session console buffers.
pub struct ConsoleCapture {
    capacity: usize,
    buffers: Mutex<HashMap<SessionId, VecDeque<LogEntry>>>,
}

impl ConsoleCapture {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Start capturing for `id`. Already attached sessions keep their buffer.
    pub fn attach(&self, id: SessionId) {
        self.buffers.lock().entry(id).or_default();
    }

    pub fn detach(&self, id: SessionId) {
        if self.buffers.lock().remove(&id).is_some() {
            log::debug!("console capture detached from session {}", id);
        }
    }

    pub fn is_attached(&self, id: SessionId) -> bool {
        self.buffers.lock().contains_key(&id)
    }

    /// Record a console line. Dropped unless the session is attached.
    pub fn push(&self, id: SessionId, message: impl Into<String>) -> bool {
        let mut buffers = self.buffers.lock();
        let Some(buffer) = buffers.get_mut(&id) else {
            return false;
        };
        let message = message.into();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(LogEntry {
            level: LogLevel::classify(&message),
            message,
            recorded_at: Utc::now(),
        });
        true
    }

    pub fn entries(&self, id: SessionId) -> Vec<LogEntry> {
        self.buffers
            .lock()
            .get(&id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl SessionObserver for ConsoleCapture {
    fn session_monitoring(&self, id: SessionId) {
        self.attach(id);
    }

    fn session_idle(&self, id: SessionId) {
        self.detach(id);
    }

    fn session_reset(&self, id: SessionId) {
        self.detach(id);
    }

    fn session_closed(&self, id: SessionId) {
        self.detach(id);
    }
}
