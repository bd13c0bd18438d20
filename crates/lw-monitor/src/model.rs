//! Per-session data model.

use chrono::{DateTime, Utc};
use lw_core::{ResourceType, SessionId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Lifecycle
// =============================================================================

/// Monitoring state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// Never seen
    Uninitialized,
    /// Known (e.g. from a violation report) but never activated
    Inactive,
    /// Active on a boundary URL, request events are counted
    Monitoring,
    /// Active on a URL outside the boundary, request events are ignored
    Idle,
    /// Tab closed, all state destroyed
    Closed,
}

impl MonitorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Inactive => "inactive",
            Self::Monitoring => "monitoring",
            Self::Idle => "idle",
            Self::Closed => "closed",
        }
    }
}

/// Session record metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub active_url: Option<String>,
    pub is_in_boundary: bool,
    pub created_at: DateTime<Utc>,
    /// Incremented on every reset; async results tagged with an older value are stale
    pub generation: u64,
    pub state: MonitorState,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            active_url: None,
            is_in_boundary: false,
            created_at: Utc::now(),
            generation: 0,
            state: MonitorState::Inactive,
        }
    }
}

// =============================================================================
// Observations
// =============================================================================

/// A rule returned by the policy service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub policy: String,
    pub surt: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub enabled: bool,
}

/// A resource fetched from outside the boundary, recorded once per generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub url: String,
    /// Exact-form SURT key, `None` when the URL could not be canonicalized
    pub canonical_key: Option<String>,
    #[serde(default)]
    pub resource_type: ResourceType,
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub matched_policies: Vec<Policy>,
}

impl ObservedResource {
    pub fn new(url: impl Into<String>, resource_type: ResourceType, canonical_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            canonical_key,
            resource_type,
            first_seen_at: Utc::now(),
            matched_policies: Vec::new(),
        }
    }
}

/// A Content-Security-Policy violation, deduplicated by blocked URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CspViolation {
    pub blocked_uri: String,
    pub violated_directive: String,
    #[serde(default)]
    pub document_uri: Option<String>,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteOutcome {
    Success,
    Failure,
}

/// One attempt to rewrite a blocked resource into the replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteAttempt {
    pub session_id: SessionId,
    pub resource_type: ResourceType,
    pub original_url: String,
    pub rewritten_url: String,
    pub outcome: RewriteOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Compact per-session counts for badges and popups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub leak_count: u64,
    pub violation_count: usize,
    pub policy_match_count: usize,
}
