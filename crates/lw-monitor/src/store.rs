//! Session State Store
//!
//! Owns every per-session collection. Each session lives behind its own
//! mutex, so operations on one session are serialized while different
//! sessions proceed independently. Callers only see the operations below;
//! the raw sets and counters never leave this module.
//!
//! Every mutation writes through to the [`Mirror`] while the session lock is
//! still held, so the mirror sees writes for one session in mutation order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lw_core::{Boundary, SessionId};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use crate::error::MonitorError;
use crate::model::{
    CspViolation, MonitorState, ObservedResource, Policy, RewriteAttempt, RewriteOutcome, Session,
};
use crate::persist::{keys, session_key, session_keys, KvStore, Mirror, SESSIONS_KEY};

/// Outcome of [`SessionStore::mark_observed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marked {
    /// This call inserted the URL into the dedup set
    pub is_new: bool,
    /// Generation the observation belongs to
    pub generation: u64,
}

// =============================================================================
// Session Record
// =============================================================================

pub(crate) struct SessionRecord {
    pub(crate) session: Session,
    processed: HashSet<String>,
    pub(crate) resources: Vec<ObservedResource>,
    resource_index: HashMap<String, usize>,
    pub(crate) leak_count: u64,
    violation_uris: HashSet<String>,
    pub(crate) violations: Vec<CspViolation>,
    pub(crate) rewrites: Vec<RewriteAttempt>,
    /// Set once destroyed; late holders of the record must not write
    destroyed: bool,
}

impl SessionRecord {
    fn new(id: SessionId) -> Self {
        Self {
            session: Session::new(id),
            processed: HashSet::new(),
            resources: Vec::new(),
            resource_index: HashMap::new(),
            leak_count: 0,
            violation_uris: HashSet::new(),
            violations: Vec::new(),
            rewrites: Vec::new(),
            destroyed: false,
        }
    }

    fn id(&self) -> SessionId {
        self.session.id
    }

    fn push_resource(&mut self, resource: ObservedResource) {
        self.resource_index.insert(resource.url.clone(), self.resources.len());
        self.processed.insert(resource.url.clone());
        self.resources.push(resource);
    }

    fn clear_generation(&mut self) {
        self.processed.clear();
        self.resources.clear();
        self.resource_index.clear();
        self.leak_count = 0;
        self.violation_uris.clear();
        self.violations.clear();
        self.session.generation += 1;
    }

    // -------------------------------------------------------------------------
    // Write-through
    // -------------------------------------------------------------------------

    fn mirror_session(&self, mirror: &Mirror) {
        if let Ok(value) = serde_json::to_value(&self.session) {
            mirror.set(session_key(keys::SESSION, self.id()), value);
        }
    }

    fn mirror_leaks(&self, mirror: &Mirror) {
        let id = self.id();
        mirror.set(session_key(keys::LEAK_COUNT, id), json!(self.leak_count));
        let mut processed: Vec<&str> = self.processed.iter().map(String::as_str).collect();
        processed.sort_unstable();
        mirror.set(session_key(keys::PROCESSED_URLS, id), json!(processed));
        let leaked: Vec<&str> = self.resources.iter().map(|r| r.url.as_str()).collect();
        mirror.set(session_key(keys::LEAKED_URLS, id), json!(leaked));
        self.mirror_resources(mirror);
    }

    fn mirror_resources(&self, mirror: &Mirror) {
        let id = self.id();
        if let Ok(value) = serde_json::to_value(&self.resources) {
            mirror.set(session_key(keys::OBSERVED_RESOURCES, id), value);
        }
        mirror.set(session_key(keys::POLICIES_BY_TAB, id), self.policies_by_tab());
    }

    fn policies_by_tab(&self) -> Value {
        let resources: Vec<Value> = self
            .resources
            .iter()
            .filter(|r| !r.matched_policies.is_empty())
            .map(|r| {
                json!({
                    "surt": r.canonical_key,
                    "url": r.url,
                    "policies": r.matched_policies,
                })
            })
            .collect();
        json!({
            "tabUrl": self.session.active_url,
            "resources": resources,
        })
    }

    fn mirror_violations(&self, mirror: &Mirror) {
        let id = self.id();
        if let Ok(value) = serde_json::to_value(&self.violations) {
            mirror.set(session_key(keys::CSP_VIOLATIONS, id), value);
        }
        mirror.set(session_key(keys::CSP_VIOLATION_COUNT, id), json!(self.violations.len()));
    }

    fn mirror_rewrites(&self, mirror: &Mirror) {
        if let Ok(value) = serde_json::to_value(&self.rewrites) {
            mirror.set(session_key(keys::REWRITE_LOG, self.id()), value);
        }
    }

    fn mirror_all(&self, mirror: &Mirror) {
        self.mirror_session(mirror);
        self.mirror_leaks(mirror);
        self.mirror_violations(mirror);
        self.mirror_rewrites(mirror);
    }
}

// =============================================================================
// Session Store
// =============================================================================

type SharedRecord = Arc<Mutex<SessionRecord>>;

pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SharedRecord>>,
    /// Ids closed during this process. One entry per closed tab, never
    /// persisted, so a restart starts empty.
    closed: RwLock<HashSet<SessionId>>,
    mirror: Mirror,
}

impl SessionStore {
    pub fn new(mirror: Mirror) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashSet::new()),
            mirror,
        }
    }

    /// Store without durability, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::new(Mirror::disabled())
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Rebuild sessions listed in the mirror's index.
    ///
    /// Entries that fail to decode are skipped with a warning; the store is
    /// authoritative from here on.
    pub async fn rehydrate(kv: &dyn KvStore, mirror: Mirror) -> Result<Self, MonitorError> {
        let store = Self::new(mirror);
        let ids: Vec<SessionId> = match kv.get(SESSIONS_KEY).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                log::warn!("ignoring unreadable session index: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        for id in ids {
            let mut record = SessionRecord::new(id);
            if let Some(session) = load::<Session>(kv, keys::SESSION, id).await? {
                record.session = session;
            }
            for resource in load::<Vec<ObservedResource>>(kv, keys::OBSERVED_RESOURCES, id).await?.unwrap_or_default() {
                if !record.processed.contains(&resource.url) {
                    record.push_resource(resource);
                }
            }
            // Dedup entries recorded before resource details were mirrored
            for url in load::<Vec<String>>(kv, keys::PROCESSED_URLS, id).await?.unwrap_or_default() {
                record.processed.insert(url);
            }
            record.leak_count = load::<u64>(kv, keys::LEAK_COUNT, id)
                .await?
                .unwrap_or(record.resources.len() as u64);
            for violation in load::<Vec<CspViolation>>(kv, keys::CSP_VIOLATIONS, id).await?.unwrap_or_default() {
                if record.violation_uris.insert(violation.blocked_uri.clone()) {
                    record.violations.push(violation);
                }
            }
            record.rewrites = load::<Vec<RewriteAttempt>>(kv, keys::REWRITE_LOG, id).await?.unwrap_or_default();

            log::info!(
                "rehydrated session {}: {} leaks, {} violations, {} rewrites",
                id,
                record.leak_count,
                record.violations.len(),
                record.rewrites.len()
            );
            store.sessions.write().insert(id, Arc::new(Mutex::new(record)));
        }
        Ok(store)
    }

    fn record(&self, id: SessionId) -> Option<SharedRecord> {
        self.sessions.read().get(&id).cloned()
    }

    fn mirror_index(&self, sessions: &HashMap<SessionId, SharedRecord>) {
        let mut ids: Vec<SessionId> = sessions.keys().copied().collect();
        ids.sort();
        self.mirror.set(SESSIONS_KEY.to_string(), json!(ids));
    }

    /// Run `f` on a live session record. `None` if unknown or destroyed.
    pub(crate) fn inspect<R>(&self, id: SessionId, f: impl FnOnce(&SessionRecord) -> R) -> Option<R> {
        let record = self.record(id)?;
        let guard = record.lock();
        if guard.destroyed {
            return None;
        }
        Some(f(&guard))
    }

    fn update<R>(&self, id: SessionId, f: impl FnOnce(&mut SessionRecord, &Mirror) -> R) -> Option<R> {
        let record = self.record(id)?;
        let mut guard = record.lock();
        if guard.destroyed {
            return None;
        }
        Some(f(&mut guard, &self.mirror))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn get_or_create(&self, id: SessionId) -> Session {
        if let Some(session) = self.inspect(id, |r| r.session.clone()) {
            return session;
        }

        let mut sessions = self.sessions.write();
        let record = sessions
            .entry(id)
            .or_insert_with(|| {
                log::debug!("session {} created", id);
                let record = SessionRecord::new(id);
                record.mirror_session(&self.mirror);
                Arc::new(Mutex::new(record))
            })
            .clone();
        self.closed.write().remove(&id);
        self.mirror_index(&sessions);
        drop(sessions);

        let session = record.lock().session.clone();
        session
    }

    /// Record the session's current page and its monitoring state.
    pub fn activate(&self, id: SessionId, url: Option<&str>, boundary: Boundary, state: MonitorState) -> Option<Session> {
        self.update(id, |record, mirror| {
            record.session.active_url = url.map(str::to_string);
            record.session.is_in_boundary = boundary == Boundary::InBoundary;
            record.session.state = state;
            record.mirror_session(mirror);
            mirror.set(session_key(keys::POLICIES_BY_TAB, id), record.policies_by_tab());
            record.session.clone()
        })
    }

    /// Clear the dedup set, violations and leak counter, and advance the
    /// generation. Returns the new generation.
    pub fn reset(&self, id: SessionId) -> Option<u64> {
        self.update(id, |record, mirror| {
            record.clear_generation();
            record.mirror_session(mirror);
            record.mirror_leaks(mirror);
            record.mirror_violations(mirror);
            log::debug!("session {} reset to generation {}", id, record.session.generation);
            record.session.generation
        })
    }

    /// Remove all in-memory and persisted state for the session.
    pub fn destroy(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(&id);
        self.closed.write().insert(id);

        let Some(record) = removed else {
            return false;
        };
        let mut guard = record.lock();
        guard.destroyed = true;
        self.mirror.remove(session_keys(id));
        self.mirror_index(&sessions);
        log::debug!("session {} destroyed", id);
        true
    }

    pub fn is_closed(&self, id: SessionId) -> bool {
        self.closed.read().contains(&id)
    }

    // -------------------------------------------------------------------------
    // Leaks
    // -------------------------------------------------------------------------

    /// Insert a resource into the session's dedup set.
    /// A URL already present leaves the set untouched.
    pub fn mark_observed(&self, id: SessionId, resource: ObservedResource) -> Option<Marked> {
        self.update(id, |record, mirror| {
            let generation = record.session.generation;
            if record.processed.contains(&resource.url) {
                return Marked { is_new: false, generation };
            }
            record.push_resource(resource);
            record.mirror_resources(mirror);
            Marked { is_new: true, generation }
        })
    }

    /// Returns the new leak count.
    pub fn increment_leak(&self, id: SessionId) -> Option<u64> {
        self.update(id, |record, mirror| {
            record.leak_count += 1;
            record.mirror_leaks(mirror);
            record.leak_count
        })
    }

    pub fn reset_leak(&self, id: SessionId) -> bool {
        self.update(id, |record, mirror| {
            record.leak_count = 0;
            mirror.set(session_key(keys::LEAK_COUNT, id), json!(0));
        })
        .is_some()
    }

    /// Attach lookup results to an observed resource.
    ///
    /// Fails with [`MonitorError::StaleAsyncResult`] without writing when the
    /// session was reset or destroyed after the lookup was issued.
    pub fn attach_policies(
        &self,
        id: SessionId,
        generation: u64,
        url: &str,
        policies: Vec<Policy>,
    ) -> Result<(), MonitorError> {
        let stale = |current: Option<u64>| MonitorError::StaleAsyncResult {
            session_id: id,
            generation,
            current,
        };
        self.update(id, |record, mirror| {
            if record.session.generation != generation {
                return Err(stale(Some(record.session.generation)));
            }
            let Some(&index) = record.resource_index.get(url) else {
                return Err(stale(Some(record.session.generation)));
            };
            record.resources[index].matched_policies = policies;
            record.mirror_resources(mirror);
            Ok(())
        })
        .unwrap_or_else(|| Err(stale(None)))
    }

    // -------------------------------------------------------------------------
    // Violations and rewrites
    // -------------------------------------------------------------------------

    /// Returns `true` when the blocked URI was not yet in the violation set.
    pub fn record_violation(&self, id: SessionId, violation: CspViolation) -> Option<bool> {
        self.update(id, |record, mirror| {
            if !record.violation_uris.insert(violation.blocked_uri.clone()) {
                return false;
            }
            record.violations.push(violation);
            record.mirror_violations(mirror);
            true
        })
    }

    /// Append to the rewrite log. Never deduplicated.
    pub fn record_rewrite(&self, id: SessionId, attempt: RewriteAttempt) -> bool {
        self.update(id, |record, mirror| {
            record.rewrites.push(attempt);
            record.mirror_rewrites(mirror);
        })
        .is_some()
    }

    /// Re-send the full state of every session to the mirror.
    pub fn mirror_everything(&self) {
        let sessions = self.sessions.read();
        self.mirror_index(&sessions);
        for record in sessions.values() {
            let guard = record.lock();
            if !guard.destroyed {
                guard.mirror_all(&self.mirror);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inspect(id, |r| r.session.clone())
    }

    pub fn state(&self, id: SessionId) -> MonitorState {
        if self.is_closed(id) {
            return MonitorState::Closed;
        }
        self.inspect(id, |r| r.session.state).unwrap_or(MonitorState::Uninitialized)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn leak_count(&self, id: SessionId) -> u64 {
        self.inspect(id, |r| r.leak_count).unwrap_or(0)
    }

    pub fn leaked_urls(&self, id: SessionId) -> Vec<String> {
        self.inspect(id, |r| r.resources.iter().map(|res| res.url.clone()).collect())
            .unwrap_or_default()
    }

    pub fn observed_resources(&self, id: SessionId) -> Vec<ObservedResource> {
        self.inspect(id, |r| r.resources.clone()).unwrap_or_default()
    }

    pub fn csp_violations(&self, id: SessionId) -> Vec<CspViolation> {
        self.inspect(id, |r| r.violations.clone()).unwrap_or_default()
    }

    pub fn rewrite_attempts(&self, id: SessionId, outcome: Option<RewriteOutcome>) -> Vec<RewriteAttempt> {
        self.inspect(id, |r| {
            r.rewrites
                .iter()
                .filter(|a| outcome.map_or(true, |o| a.outcome == o))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }
}

async fn load<T: serde::de::DeserializeOwned>(
    kv: &dyn KvStore,
    name: &str,
    id: SessionId,
) -> Result<Option<T>, MonitorError> {
    let key = session_key(name, id);
    let Some(value) = kv.get(&key).await? else {
        return Ok(None);
    };
    match serde_json::from_value::<T>(value) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(e) => {
            log::warn!("ignoring unreadable '{}': {}", key, e);
            Ok(None)
        }
    }
}

/// Convenience for tests and callers that only need a JSON view.
pub fn session_json(store: &SessionStore, id: SessionId) -> Option<Value> {
    let session = store.session(id)?;
    Some(json!({
        "session": session,
        "leakCount": store.leak_count(id),
        "leakedUrls": store.leaked_urls(id),
        "cspViolations": store.csp_violations(id),
        "rewriteAttempts": store.rewrite_attempts(id, None),
    }))
}
