//! Error taxonomy for the monitor.
//!
//! Only [`MonitorError::Config`] is fatal, and only at start-up. Everything
//! else degrades to missing enrichment: counting never stops because a lookup
//! or a durability write failed.

use lw_core::{SessionId, UrlError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Policy service unreachable: {0}")]
    PolicyServiceUnreachable(String),
    #[error("Policy service returned a bad response: {0}")]
    PolicyServiceBadResponse(String),
    #[error("Storage write failed for '{key}': {reason}")]
    StorageWriteFailed { key: String, reason: String },
    #[error("Discarded result for session {session_id} generation {generation} (current {current:?})")]
    StaleAsyncResult {
        session_id: SessionId,
        generation: u64,
        current: Option<u64>,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Monitor is no longer running")]
    MonitorStopped,
}

impl From<UrlError> for MonitorError {
    fn from(err: UrlError) -> Self {
        match err {
            UrlError::InvalidUrl(url) => Self::InvalidUrl(url),
        }
    }
}
