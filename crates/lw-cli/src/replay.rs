use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use lw_monitor::store::session_json;
use lw_monitor::summary::badge_text;
use lw_monitor::{
    ConsoleCapture, HttpPolicyGateway, JsonFileKv, KvStore, Mirror, Monitor, MonitorConfig, MonitorEvent,
    MonitorHandle, SessionStore,
};

pub struct ReplayOptions {
    pub input: PathBuf,
    pub config: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub offline: bool,
    pub json: bool,
    pub verbose: bool,
}

pub fn load_config(path: Option<&std::path::Path>) -> Result<MonitorConfig, String> {
    match path {
        Some(path) => MonitorConfig::from_file(path).map_err(|e| e.to_string()),
        None => Ok(MonitorConfig::default()),
    }
}

/// Parse a trace: one JSON event per line, `#` comments and blank lines skipped.
pub fn parse_trace(text: &str) -> Result<Vec<MonitorEvent>, String> {
    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(line)
            .map_err(|e| format!("Invalid event on line {}: {}", idx + 1, e))?;
        events.push(event);
    }
    Ok(events)
}

pub fn run_replay(opts: ReplayOptions) -> Result<(), String> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    runtime.block_on(run_replay_async(opts))
}

async fn run_replay_async(opts: ReplayOptions) -> Result<(), String> {
    let config = load_config(opts.config.as_deref())?;
    let text = fs::read_to_string(&opts.input)
        .map_err(|e| format!("Failed to read '{}': {}", opts.input.display(), e))?;
    let events = parse_trace(&text)?;
    log::info!("Loaded {} events from {}", events.len(), opts.input.display());

    let store = match &opts.state {
        Some(path) => {
            let kv = Arc::new(JsonFileKv::open(path).await.map_err(|e| e.to_string())?);
            let (mirror, _writer) = Mirror::spawn(kv.clone() as Arc<dyn KvStore>);
            let store = SessionStore::rehydrate(kv.as_ref(), mirror)
                .await
                .map_err(|e| e.to_string())?;
            log::info!(
                "Rehydrated {} sessions from {}",
                store.session_ids().len(),
                path.display()
            );
            store
        }
        None => SessionStore::in_memory(),
    };
    let store = Arc::new(store);

    let capture = Arc::new(ConsoleCapture::new(config.capture_capacity));
    let mut monitor = Monitor::new(&config, store.clone()).with_capture(capture);
    if !opts.offline {
        if let Some(gateway) = HttpPolicyGateway::from_config(&config).map_err(|e| e.to_string())? {
            monitor = monitor.with_gateway(Arc::new(gateway));
        }
    }
    let (handle, _task) = monitor.spawn();

    let start = Instant::now();
    let event_count = events.len();
    for event in events {
        handle.submit(event).map_err(|e| e.to_string())?;
    }
    handle.settle().await.map_err(|e| e.to_string())?;
    store.mirror().flush().await;
    let elapsed = start.elapsed();

    if opts.json {
        print_json(&handle)?;
    } else {
        print_table(&handle, opts.verbose);
        println!();
        println!(
            "Replayed {} events in {:.1}ms",
            event_count,
            elapsed.as_secs_f64() * 1000.0
        );
    }

    handle.shutdown();
    Ok(())
}

fn print_table(handle: &MonitorHandle, verbose: bool) {
    println!(
        "{:>8}  {:<12}  {:>6}  {:>10}  {:>8}  {:>8}  {:>6}",
        "session", "state", "leaks", "violations", "policies", "rewrites", "badge"
    );
    for id in handle.sessions() {
        let summary = handle.get_summary(id);
        println!(
            "{:>8}  {:<12}  {:>6}  {:>10}  {:>8}  {:>8}  {:>6}",
            id.to_string(),
            handle.session_state(id).as_str(),
            summary.leak_count,
            summary.violation_count,
            summary.policy_match_count,
            handle.get_rewrite_attempts(id, None).len(),
            badge_text(&summary)
        );
        if verbose {
            for resource in handle.get_observed_resources(id) {
                let policies: Vec<&str> = resource.matched_policies.iter().map(|p| p.policy.as_str()).collect();
                println!(
                    "          leak  {}  [{}]  {}",
                    resource.url,
                    resource.canonical_key.as_deref().unwrap_or("-"),
                    policies.join(", ")
                );
            }
            for violation in handle.get_csp_violations(id) {
                println!("          csp   {}  ({})", violation.blocked_uri, violation.violated_directive);
            }
        }
    }
}

fn print_json(handle: &MonitorHandle) -> Result<(), String> {
    let sessions: Vec<serde_json::Value> = handle
        .sessions()
        .into_iter()
        .filter_map(|id| {
            let mut value = session_json(handle.store(), id)?;
            value["summary"] = serde_json::to_value(handle.get_summary(id)).ok()?;
            Some(value)
        })
        .collect();
    let json = serde_json::to_string_pretty(&sessions)
        .map_err(|e| format!("Failed to serialize JSON: {}", e))?;
    println!("{}", json);
    Ok(())
}
