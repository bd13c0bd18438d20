use std::sync::Arc;

use async_trait::async_trait;
use lw_core::{ResourceType, SessionId};
use lw_monitor::{
    ConsoleCapture, JsonFileKv, KvStore, MemoryKv, Mirror, Monitor, MonitorConfig, MonitorError, MonitorEvent,
    MonitorHandle, MonitorState, Policy, PolicyGateway, RewriteOutcome, SessionStore, Summary,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

const TAB: SessionId = SessionId(42);
const REPLAY_PAGE: &str = "https://wayback.archive-it.org/20/1/https://example.com/";

/// Gateway that records every key and answers from a fixed script.
struct ScriptedGateway {
    calls: Mutex<Vec<String>>,
    policies: Vec<Policy>,
    fail: bool,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedGateway {
    fn answering(policies: Vec<Policy>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            policies,
            fail: false,
            gate: None,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::answering(Vec::new())
        }
    }

    fn gated(policies: Vec<Policy>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::answering(policies)
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PolicyGateway for ScriptedGateway {
    async fn lookup(&self, canonical_key: &str) -> Result<Vec<Policy>, MonitorError> {
        self.calls.lock().push(canonical_key.to_string());
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|e| MonitorError::PolicyServiceUnreachable(e.to_string()))?;
            permit.forget();
        }
        if self.fail {
            return Err(MonitorError::PolicyServiceUnreachable("connection refused".to_string()));
        }
        Ok(self.policies.clone())
    }
}

fn policy(name: &str, enabled: bool) -> Policy {
    Policy {
        policy: name.to_string(),
        surt: "(com,example,".to_string(),
        environment: "prod".to_string(),
        enabled,
    }
}

fn start(gateway: Option<Arc<ScriptedGateway>>) -> MonitorHandle {
    start_with_store(gateway, Arc::new(SessionStore::in_memory()))
}

fn start_with_store(gateway: Option<Arc<ScriptedGateway>>, store: Arc<SessionStore>) -> MonitorHandle {
    let mut monitor = Monitor::new(&MonitorConfig::default(), store);
    if let Some(gateway) = gateway {
        monitor = monitor.with_gateway(gateway);
    }
    let (handle, _task) = monitor.spawn();
    handle
}

fn activate(url: &str) -> MonitorEvent {
    MonitorEvent::TabActivated { session_id: TAB, url: Some(url.to_string()) }
}

fn navigate(url: &str) -> MonitorEvent {
    MonitorEvent::NavigationCommitted { session_id: TAB, url: url.to_string() }
}

fn request(url: &str) -> MonitorEvent {
    MonitorEvent::RequestCompleted {
        session_id: TAB,
        url: url.to_string(),
        resource_type: ResourceType::SCRIPT,
        response_headers_present: true,
    }
}

fn violation(uri: &str) -> MonitorEvent {
    MonitorEvent::ViolationReported {
        session_id: TAB,
        blocked_uri: uri.to_string(),
        violated_directive: "script-src-elem".to_string(),
        document_uri: Some(REPLAY_PAGE.to_string()),
    }
}

#[tokio::test]
async fn repeated_leak_counts_once() {
    let monitor = start(None);
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    for _ in 0..3 {
        monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    }
    monitor.submit(request("https://wayback.archive-it.org/20/1/https://cdn.example.com/b.js")).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(monitor.session_state(TAB), MonitorState::Monitoring);
    assert_eq!(monitor.get_summary(TAB).leak_count, 1);
    assert_eq!(monitor.get_leaked_urls(TAB), vec!["https://cdn.example.com/a.js".to_string()]);
}

#[tokio::test]
async fn idle_session_ignores_requests() {
    let monitor = start(None);
    monitor.submit(activate("https://example.com/")).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(monitor.session_state(TAB), MonitorState::Idle);
    assert_eq!(monitor.get_summary(TAB).leak_count, 0);

    // Requests before any activation are ignored too
    let other = SessionId(7);
    monitor
        .submit(MonitorEvent::RequestCompleted {
            session_id: other,
            url: "https://cdn.example.com/a.js".to_string(),
            resource_type: ResourceType::SCRIPT,
            response_headers_present: true,
        })
        .unwrap();
    monitor.settle().await.unwrap();
    assert_eq!(monitor.session_state(other), MonitorState::Uninitialized);
}

#[tokio::test]
async fn navigation_resets_generation_scoped_state() {
    let monitor = start(None);
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.submit(violation("https://cdn.example.com/a.js")).unwrap();
    monitor.settle().await.unwrap();
    assert_eq!(monitor.get_summary(TAB).leak_count, 1);

    monitor.submit(navigate("https://wayback.archive-it.org/20/2/https://example.com/next")).unwrap();
    monitor.settle().await.unwrap();
    let summary = monitor.get_summary(TAB);
    assert_eq!(summary.leak_count, 0);
    assert_eq!(summary.violation_count, 0);
    assert_eq!(monitor.session(TAB).unwrap().generation, 1);

    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.settle().await.unwrap();
    assert_eq!(monitor.get_summary(TAB).leak_count, 1);
}

#[tokio::test]
async fn navigation_out_of_boundary_stops_monitoring() {
    let monitor = start(None);
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(navigate("https://example.com/live")).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.settle().await.unwrap();

    let session = monitor.session(TAB).unwrap();
    assert_eq!(session.state, MonitorState::Idle);
    assert!(!session.is_in_boundary);
    assert_eq!(session.active_url.as_deref(), Some("https://example.com/live"));
    assert_eq!(monitor.get_summary(TAB).leak_count, 0);
}

#[tokio::test]
async fn violations_dedup_and_ignore_monitoring_state() {
    let monitor = start(None);
    monitor.submit(violation("https://fonts.example.com/f.woff2")).unwrap();
    monitor.submit(violation("https://fonts.example.com/f.woff2")).unwrap();
    monitor.submit(violation("inline")).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(monitor.session_state(TAB), MonitorState::Inactive);
    assert_eq!(monitor.get_summary(TAB).violation_count, 2);
    let violations = monitor.get_csp_violations(TAB);
    assert_eq!(violations[0].blocked_uri, "https://fonts.example.com/f.woff2");
    assert_eq!(violations[0].violated_directive, "script-src-elem");
}

#[tokio::test]
async fn enabled_policies_are_attached() {
    let gateway = Arc::new(ScriptedGateway::answering(vec![policy("block", true), policy("old", false)]));
    let monitor = start(Some(gateway.clone()));
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js?v=3")).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(gateway.calls(), vec!["(com,example,cdn,www)/a.js?v=3".to_string()]);
    let resources = monitor.get_observed_resources(TAB);
    assert_eq!(resources[0].canonical_key.as_deref(), Some("(com,example,cdn,www)/a.js?v=3"));
    assert_eq!(resources[0].matched_policies, vec![policy("block", true)]);
    assert_eq!(monitor.get_summary(TAB).policy_match_count, 1);
}

#[tokio::test]
async fn gateway_failure_never_blocks_counting() {
    let gateway = Arc::new(ScriptedGateway::failing());
    let monitor = start(Some(gateway.clone()));
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.submit(request("https://cdn.example.com/b.js")).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(gateway.calls().len(), 2);
    let summary = monitor.get_summary(TAB);
    assert_eq!(summary.leak_count, 2);
    assert_eq!(summary.policy_match_count, 0);
}

#[tokio::test]
async fn invalid_url_counts_without_lookup() {
    let gateway = Arc::new(ScriptedGateway::answering(vec![policy("block", true)]));
    let monitor = start(Some(gateway.clone()));
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://exa mple.com/x.js")).unwrap();
    monitor.settle().await.unwrap();

    assert!(gateway.calls().is_empty());
    assert_eq!(monitor.get_summary(TAB).leak_count, 1);
    assert_eq!(monitor.get_observed_resources(TAB)[0].canonical_key, None);
}

#[tokio::test]
async fn stale_lookup_never_touches_new_generation() {
    let gate = Arc::new(Semaphore::new(0));
    let gateway = Arc::new(ScriptedGateway::gated(vec![policy("block", true)], gate.clone()));
    let monitor = start(Some(gateway.clone()));

    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    // Lookup is now in flight; navigate before it answers
    monitor.submit(navigate(REPLAY_PAGE)).unwrap();
    gate.add_permits(1);
    monitor.settle().await.unwrap();

    assert_eq!(monitor.get_summary(TAB), Summary::default());
    assert!(monitor.get_observed_resources(TAB).is_empty());

    // The same URL in the new generation gets its own lookup
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    gate.add_permits(1);
    monitor.settle().await.unwrap();
    let resources = monitor.get_observed_resources(TAB);
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].matched_policies.len(), 1);
    assert_eq!(monitor.get_summary(TAB).leak_count, 1);
}

#[tokio::test]
async fn rewrite_log_is_append_only() {
    let monitor = start(None);
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    for outcome in [RewriteOutcome::Failure, RewriteOutcome::Failure, RewriteOutcome::Success] {
        monitor
            .submit(MonitorEvent::RewriteReported {
                session_id: TAB,
                resource_type: ResourceType::IMAGE,
                original_url: "https://img.example.com/logo.png".to_string(),
                rewritten_url: "https://wayback.archive-it.org/20/1/https://img.example.com/logo.png".to_string(),
                outcome,
            })
            .unwrap();
    }
    monitor.submit(navigate(REPLAY_PAGE)).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(monitor.get_rewrite_attempts(TAB, None).len(), 3);
    assert_eq!(monitor.get_rewrite_attempts(TAB, Some(RewriteOutcome::Failure)).len(), 2);
    assert_eq!(monitor.get_rewrite_attempts(TAB, Some(RewriteOutcome::Success))[0].resource_type, ResourceType::IMAGE);
}

#[tokio::test]
async fn tab_close_destroys_state_and_persisted_keys() {
    let kv = Arc::new(MemoryKv::new());
    let (mirror, _writer) = Mirror::spawn(kv.clone());
    let store = Arc::new(SessionStore::new(mirror));
    let monitor = start_with_store(None, store.clone());

    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.submit(violation("https://cdn.example.com/a.js")).unwrap();
    monitor.settle().await.unwrap();
    store.mirror().flush().await;
    assert!(kv.value("leakCount_42").is_some());

    monitor.submit(MonitorEvent::TabClosed { session_id: TAB }).unwrap();
    monitor.submit(request("https://cdn.example.com/late.js")).unwrap();
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.settle().await.unwrap();
    store.mirror().flush().await;

    assert_eq!(monitor.session_state(TAB), MonitorState::Closed);
    assert!(monitor.sessions().is_empty());
    assert_eq!(monitor.get_summary(TAB), Summary::default());
    assert!(kv.keys().iter().all(|k| !k.ends_with("_42")), "{:?}", kv.keys());
}

#[tokio::test]
async fn sessions_are_independent() {
    let monitor = start(None);
    let other = SessionId(43);
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(MonitorEvent::TabActivated { session_id: other, url: Some(REPLAY_PAGE.to_string()) }).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor
        .submit(MonitorEvent::RequestCompleted {
            session_id: other,
            url: "https://cdn.example.com/a.js".to_string(),
            resource_type: ResourceType::SCRIPT,
            response_headers_present: true,
        })
        .unwrap();
    monitor.submit(MonitorEvent::TabClosed { session_id: other }).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(monitor.get_summary(TAB).leak_count, 1);
    assert_eq!(monitor.session_state(other), MonitorState::Closed);
    assert_eq!(monitor.sessions(), vec![TAB]);
}

#[tokio::test]
async fn console_capture_follows_lifecycle() {
    let capture = Arc::new(ConsoleCapture::new(16));
    let monitor = Monitor::new(&MonitorConfig::default(), Arc::new(SessionStore::in_memory())).with_capture(capture.clone());
    let (monitor, _task) = monitor.spawn();

    assert!(!monitor.capture_log(TAB, "too early"));
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.settle().await.unwrap();
    assert!(monitor.capture_log(TAB, "Failed to load resource: net::ERR_BLOCKED_BY_CLIENT error"));
    assert_eq!(monitor.get_logs(TAB).len(), 1);

    monitor.submit(navigate("https://example.com/")).unwrap();
    monitor.settle().await.unwrap();
    assert!(monitor.get_logs(TAB).is_empty());
    assert!(!capture.is_attached(TAB));
}

#[tokio::test]
async fn reactivation_without_url_keeps_monitoring() {
    let monitor = start(None);
    monitor.submit(navigate(REPLAY_PAGE)).unwrap();
    monitor.submit(MonitorEvent::TabActivated { session_id: TAB, url: None }).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.settle().await.unwrap();

    assert_eq!(monitor.session_state(TAB), MonitorState::Monitoring);
    assert_eq!(monitor.session(TAB).unwrap().active_url.as_deref(), Some(REPLAY_PAGE));
    assert_eq!(monitor.get_summary(TAB).leak_count, 1);
}

#[tokio::test]
async fn activation_toggles_subscription() {
    let capture = Arc::new(ConsoleCapture::new(16));
    let monitor = Monitor::new(&MonitorConfig::default(), Arc::new(SessionStore::in_memory())).with_capture(capture.clone());
    let (monitor, _task) = monitor.spawn();

    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.settle().await.unwrap();
    assert_eq!(monitor.session_state(TAB), MonitorState::Monitoring);
    assert!(capture.is_attached(TAB));

    monitor.submit(activate("https://example.com/")).unwrap();
    monitor.submit(request("https://cdn.example.com/b.js")).unwrap();
    monitor.settle().await.unwrap();
    assert_eq!(monitor.session_state(TAB), MonitorState::Idle);
    assert!(!capture.is_attached(TAB));
    assert!(!monitor.capture_log(TAB, "while idle"));

    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.submit(request("https://cdn.example.com/c.js")).unwrap();
    monitor.settle().await.unwrap();
    assert_eq!(monitor.session_state(TAB), MonitorState::Monitoring);
    assert!(capture.is_attached(TAB));
    assert_eq!(
        monitor.get_leaked_urls(TAB),
        vec!["https://cdn.example.com/a.js".to_string(), "https://cdn.example.com/c.js".to_string()]
    );
}

#[tokio::test]
async fn page_policies_use_host_wildcard() {
    let gateway = Arc::new(ScriptedGateway::answering(vec![policy("block", true), policy("old", false)]));
    let monitor = start(Some(gateway.clone()));
    monitor.submit(activate(REPLAY_PAGE)).unwrap();
    monitor.settle().await.unwrap();

    let policies = monitor.check_page_policies(TAB).await.unwrap();
    assert_eq!(policies, vec![policy("block", true)]);
    assert_eq!(gateway.calls(), vec!["com,example,www)/%".to_string()]);

    let err = monitor.check_page_policies(SessionId(99)).await.unwrap_err();
    assert!(matches!(err, MonitorError::InvalidUrl(_)));
}

#[tokio::test]
async fn state_survives_restart_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let kv: Arc<dyn KvStore> = Arc::new(JsonFileKv::open(&path).await.unwrap());
        let (mirror, _writer) = Mirror::spawn(kv);
        let store = Arc::new(SessionStore::new(mirror));
        let monitor = start_with_store(None, store.clone());
        monitor.submit(activate(REPLAY_PAGE)).unwrap();
        monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
        monitor.submit(violation("https://cdn.example.com/a.js")).unwrap();
        monitor.settle().await.unwrap();
        store.mirror().flush().await;
        monitor.shutdown();
    }

    let kv = JsonFileKv::open(&path).await.unwrap();
    let store = Arc::new(SessionStore::rehydrate(&kv, Mirror::disabled()).await.unwrap());
    let monitor = start_with_store(None, store);
    monitor.submit(request("https://cdn.example.com/a.js")).unwrap();
    monitor.submit(request("https://cdn.example.com/b.js")).unwrap();
    monitor.settle().await.unwrap();

    let summary = monitor.get_summary(TAB);
    assert_eq!(summary.leak_count, 2);
    assert_eq!(summary.violation_count, 1);
}
