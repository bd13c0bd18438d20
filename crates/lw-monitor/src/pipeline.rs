//! Event Ingestion Pipeline
//!
//! A single event loop consumes browser events in arrival order and drives
//! the [`SessionStore`]. Per session the loop runs this state machine:
//!
//! ```text
//! Uninitialized --> Inactive --activate(boundary URL)--> Monitoring
//!                          \--activate(other URL)-----> Idle
//! Monitoring/Idle --NavigationCommitted--> reset, then activate again
//! any --TabClosed--> Closed (terminal)
//! ```
//!
//! Only `Monitoring` sessions count request events. Policy lookups run as
//! spawned tasks and come back into the loop as ordinary events, tagged with
//! the generation they were issued in. A reset or close aborts outstanding
//! lookups; any result that still arrives is discarded by the generation
//! check in the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use lw_core::{classify, to_surt_exact, to_surt_prefix, Boundary, BoundaryPrefixes, ResourceType, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::capture::{ConsoleCapture, LogEntry, SessionObserver};
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::gateway::{select_policies, PolicyGateway};
use crate::model::{
    CspViolation, MonitorState, ObservedResource, Policy, RewriteAttempt, RewriteOutcome, Session, Summary,
};
use crate::store::SessionStore;
use crate::summary::summarize;

// =============================================================================
// Events
// =============================================================================

/// Inbound browser events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    TabActivated {
        session_id: SessionId,
        #[serde(default)]
        url: Option<String>,
    },
    NavigationCommitted {
        session_id: SessionId,
        url: String,
    },
    RequestCompleted {
        session_id: SessionId,
        url: String,
        #[serde(default)]
        resource_type: ResourceType,
        #[serde(default)]
        response_headers_present: bool,
    },
    ViolationReported {
        session_id: SessionId,
        blocked_uri: String,
        violated_directive: String,
        #[serde(default)]
        document_uri: Option<String>,
    },
    RewriteReported {
        session_id: SessionId,
        #[serde(default)]
        resource_type: ResourceType,
        original_url: String,
        rewritten_url: String,
        outcome: RewriteOutcome,
    },
    TabClosed {
        session_id: SessionId,
    },
}

impl MonitorEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::TabActivated { session_id, .. }
            | Self::NavigationCommitted { session_id, .. }
            | Self::RequestCompleted { session_id, .. }
            | Self::ViolationReported { session_id, .. }
            | Self::RewriteReported { session_id, .. }
            | Self::TabClosed { session_id } => *session_id,
        }
    }
}

enum Inbound {
    Event(MonitorEvent),
    PolicyResolved {
        session_id: SessionId,
        generation: u64,
        task_id: u64,
        url: String,
        result: Result<Vec<Policy>, MonitorError>,
    },
    Settle(oneshot::Sender<()>),
    Shutdown,
}

// =============================================================================
// Monitor
// =============================================================================

pub struct Monitor {
    prefixes: BoundaryPrefixes,
    include_disabled_policies: bool,
    store: Arc<SessionStore>,
    gateway: Option<Arc<dyn PolicyGateway>>,
    observers: Vec<Arc<dyn SessionObserver>>,
    capture: Option<Arc<ConsoleCapture>>,
    pending: HashMap<SessionId, HashMap<u64, JoinHandle<()>>>,
    next_task_id: u64,
    settle_waiters: Vec<oneshot::Sender<()>>,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Monitor {
    pub fn new(config: &MonitorConfig, store: Arc<SessionStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            prefixes: config.prefixes(),
            include_disabled_policies: config.include_disabled_policies,
            store,
            gateway: None,
            observers: Vec::new(),
            capture: None,
            pending: HashMap::new(),
            next_task_id: 0,
            settle_waiters: Vec::new(),
            tx,
            rx,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PolicyGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Register a console capture service; its buffers become queryable
    /// through the handle.
    pub fn with_capture(mut self, capture: Arc<ConsoleCapture>) -> Self {
        self.observers.push(capture.clone());
        self.capture = Some(capture);
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            tx: self.tx.clone(),
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            capture: self.capture.clone(),
            prefixes: self.prefixes.clone(),
            include_disabled_policies: self.include_disabled_policies,
        }
    }

    /// Run the loop on the current tokio runtime.
    pub fn spawn(self) -> (MonitorHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        while let Some(inbound) = self.rx.recv().await {
            match inbound {
                Inbound::Event(event) => self.handle_event(event),
                Inbound::PolicyResolved {
                    session_id,
                    generation,
                    task_id,
                    url,
                    result,
                } => self.on_policy_resolved(session_id, generation, task_id, &url, result),
                Inbound::Settle(done) => self.settle_waiters.push(done),
                Inbound::Shutdown => break,
            }
            self.notify_if_settled();
        }

        for (_, tasks) in self.pending.drain() {
            for (_, task) in tasks {
                task.abort();
            }
        }
        log::debug!("monitor loop stopped");
    }

    fn handle_event(&mut self, event: MonitorEvent) {
        let id = event.session_id();
        if self.store.is_closed(id) {
            log::debug!("session {}: ignoring event for closed session", id);
            return;
        }

        match event {
            MonitorEvent::TabActivated { url, .. } => self.activate(id, url.as_deref()),
            MonitorEvent::NavigationCommitted { url, .. } => self.on_navigation(id, &url),
            MonitorEvent::RequestCompleted { url, resource_type, .. } => {
                self.on_request_completed(id, url, resource_type)
            }
            MonitorEvent::ViolationReported {
                blocked_uri,
                violated_directive,
                document_uri,
                ..
            } => self.on_violation(id, blocked_uri, violated_directive, document_uri),
            MonitorEvent::RewriteReported {
                resource_type,
                original_url,
                rewritten_url,
                outcome,
                ..
            } => self.on_rewrite(id, resource_type, original_url, rewritten_url, outcome),
            MonitorEvent::TabClosed { .. } => self.on_closed(id),
        }
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Classify the session's page and subscribe or unsubscribe accordingly.
    /// An activation without a URL re-classifies the page the session last saw.
    fn activate(&mut self, id: SessionId, url: Option<&str>) {
        let session = self.store.get_or_create(id);
        let url = url.map(str::to_string).or(session.active_url);
        let boundary = classify(url.as_deref().unwrap_or_default(), &self.prefixes);
        let state = match boundary {
            Boundary::InBoundary => MonitorState::Monitoring,
            Boundary::OutOfBoundary => MonitorState::Idle,
        };
        let previous = session.state;
        self.store.activate(id, url.as_deref(), boundary, state);

        match state {
            MonitorState::Monitoring => {
                if previous != MonitorState::Monitoring {
                    log::info!("session {}: monitoring {}", id, url.as_deref().unwrap_or_default());
                }
                for observer in &self.observers {
                    observer.session_monitoring(id);
                }
            }
            _ => {
                if previous == MonitorState::Monitoring {
                    log::info!("session {}: left replay boundary, monitoring stopped", id);
                } else {
                    log::debug!("session {}: URL outside replay boundary: {:?}", id, url);
                }
                for observer in &self.observers {
                    observer.session_idle(id);
                }
            }
        }
    }

    fn on_navigation(&mut self, id: SessionId, url: &str) {
        self.store.get_or_create(id);
        self.cancel_lookups(id);
        if let Some(generation) = self.store.reset(id) {
            log::debug!("session {}: navigated, now generation {}", id, generation);
        }
        for observer in &self.observers {
            observer.session_reset(id);
        }
        self.activate(id, Some(url));
    }

    fn on_request_completed(&mut self, id: SessionId, url: String, resource_type: ResourceType) {
        if self.store.state(id) != MonitorState::Monitoring {
            return;
        }
        if classify(&url, &self.prefixes) == Boundary::InBoundary {
            return;
        }

        let canonical_key = match to_surt_exact(&url, &self.prefixes) {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("session {}: {}; counting leak without policy lookup", id, e);
                None
            }
        };

        let resource = ObservedResource::new(url.clone(), resource_type, canonical_key.clone());
        let Some(marked) = self.store.mark_observed(id, resource) else {
            return;
        };
        if !marked.is_new {
            log::debug!("session {}: duplicate leak {}", id, url);
            return;
        }

        let total = self.store.increment_leak(id).unwrap_or_default();
        log::info!("session {}: leak detected: {} (total leaks: {})", id, url, total);

        if let Some(key) = canonical_key {
            self.spawn_lookup(id, marked.generation, url, key);
        }
    }

    fn on_violation(&mut self, id: SessionId, blocked_uri: String, directive: String, document_uri: Option<String>) {
        self.store.get_or_create(id);
        let violation = CspViolation {
            blocked_uri,
            violated_directive: directive,
            document_uri,
            first_seen_at: Utc::now(),
        };
        let uri = violation.blocked_uri.clone();
        match self.store.record_violation(id, violation) {
            Some(true) => log::info!("session {}: CSP violation: {}", id, uri),
            _ => log::debug!("session {}: repeated CSP violation: {}", id, uri),
        }
    }

    fn on_rewrite(
        &mut self,
        id: SessionId,
        resource_type: ResourceType,
        original_url: String,
        rewritten_url: String,
        outcome: RewriteOutcome,
    ) {
        self.store.get_or_create(id);
        log::debug!("session {}: rewrite {:?} {} -> {}", id, outcome, original_url, rewritten_url);
        self.store.record_rewrite(
            id,
            RewriteAttempt {
                session_id: id,
                resource_type,
                original_url,
                rewritten_url,
                outcome,
                timestamp: Utc::now(),
            },
        );
    }

    fn on_closed(&mut self, id: SessionId) {
        self.cancel_lookups(id);
        self.store.destroy(id);
        for observer in &self.observers {
            observer.session_closed(id);
        }
        log::info!("session {}: tab closed, state cleared", id);
    }

    // -------------------------------------------------------------------------
    // Policy lookups
    // -------------------------------------------------------------------------

    fn spawn_lookup(&mut self, id: SessionId, generation: u64, url: String, key: String) {
        let Some(gateway) = self.gateway.clone() else {
            return;
        };
        let task_id = self.next_task_id;
        self.next_task_id += 1;

        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let result = gateway.lookup(&key).await;
            let _ = tx.send(Inbound::PolicyResolved {
                session_id: id,
                generation,
                task_id,
                url,
                result,
            });
        });
        self.pending.entry(id).or_default().insert(task_id, task);
    }

    fn cancel_lookups(&mut self, id: SessionId) {
        if let Some(tasks) = self.pending.remove(&id) {
            if !tasks.is_empty() {
                log::debug!("session {}: cancelling {} policy lookups", id, tasks.len());
            }
            for (_, task) in tasks {
                task.abort();
            }
        }
    }

    fn on_policy_resolved(
        &mut self,
        id: SessionId,
        generation: u64,
        task_id: u64,
        url: &str,
        result: Result<Vec<Policy>, MonitorError>,
    ) {
        if let Some(tasks) = self.pending.get_mut(&id) {
            tasks.remove(&task_id);
            if tasks.is_empty() {
                self.pending.remove(&id);
            }
        }

        let policies = match result {
            Ok(policies) => select_policies(policies, self.include_disabled_policies),
            Err(e) => {
                log::warn!("session {}: policy lookup for {} failed: {}", id, url, e);
                return;
            }
        };

        let count = policies.len();
        match self.store.attach_policies(id, generation, url, policies) {
            Ok(()) if count > 0 => log::info!("session {}: {} policies matched {}", id, count, url),
            Ok(()) => {}
            Err(e) => log::debug!("session {}: {}", id, e),
        }
    }

    fn notify_if_settled(&mut self) {
        if self.pending.is_empty() && !self.settle_waiters.is_empty() {
            for done in self.settle_waiters.drain(..) {
                let _ = done.send(());
            }
        }
    }
}

// =============================================================================
// Query Interface
// =============================================================================

/// Cloneable entry point for event sources and the presentation layer.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    store: Arc<SessionStore>,
    gateway: Option<Arc<dyn PolicyGateway>>,
    capture: Option<Arc<ConsoleCapture>>,
    prefixes: BoundaryPrefixes,
    include_disabled_policies: bool,
}

impl MonitorHandle {
    pub fn submit(&self, event: MonitorEvent) -> Result<(), MonitorError> {
        self.tx
            .send(Inbound::Event(event))
            .map_err(|_| MonitorError::MonitorStopped)
    }

    /// Wait until every event submitted so far is processed and no policy
    /// lookup is outstanding.
    pub async fn settle(&self) -> Result<(), MonitorError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Inbound::Settle(done))
            .map_err(|_| MonitorError::MonitorStopped)?;
        wait.await.map_err(|_| MonitorError::MonitorStopped)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Inbound::Shutdown);
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn get_summary(&self, id: SessionId) -> Summary {
        summarize(&self.store, id)
    }

    pub fn get_leaked_urls(&self, id: SessionId) -> Vec<String> {
        self.store.leaked_urls(id)
    }

    pub fn get_observed_resources(&self, id: SessionId) -> Vec<ObservedResource> {
        self.store.observed_resources(id)
    }

    pub fn get_csp_violations(&self, id: SessionId) -> Vec<CspViolation> {
        self.store.csp_violations(id)
    }

    pub fn get_rewrite_attempts(&self, id: SessionId, outcome: Option<RewriteOutcome>) -> Vec<RewriteAttempt> {
        self.store.rewrite_attempts(id, outcome)
    }

    pub fn get_logs(&self, id: SessionId) -> Vec<LogEntry> {
        self.capture.as_ref().map(|c| c.entries(id)).unwrap_or_default()
    }

    /// Forward a console line to the capture service, if one is registered.
    pub fn capture_log(&self, id: SessionId, message: impl Into<String>) -> bool {
        self.capture.as_ref().map_or(false, |c| c.push(id, message))
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.store.session_ids()
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.store.session(id)
    }

    pub fn session_state(&self, id: SessionId) -> MonitorState {
        self.store.state(id)
    }

    /// Look up rules for the session's current page by host wildcard.
    pub async fn check_page_policies(&self, id: SessionId) -> Result<Vec<Policy>, MonitorError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| MonitorError::PolicyServiceUnreachable("no policy service configured".to_string()))?;
        let url = self
            .store
            .session(id)
            .and_then(|s| s.active_url)
            .unwrap_or_default();
        let key = to_surt_prefix(&url, &self.prefixes)?;
        let policies = gateway.lookup(&key).await?;
        Ok(select_policies(policies, self.include_disabled_policies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event: MonitorEvent = serde_json::from_str(
            r#"{"type": "request_completed", "session_id": 3, "url": "https://a.com/x.js", "resource_type": "script"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            MonitorEvent::RequestCompleted {
                session_id: SessionId(3),
                url: "https://a.com/x.js".to_string(),
                resource_type: ResourceType::SCRIPT,
                response_headers_present: false,
            }
        );
        assert_eq!(event.session_id(), SessionId(3));

        let event: MonitorEvent = serde_json::from_str(r#"{"type": "tab_activated", "session_id": 1}"#).unwrap();
        assert_eq!(event, MonitorEvent::TabActivated { session_id: SessionId(1), url: None });
    }
}
