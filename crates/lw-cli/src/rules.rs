use std::path::Path;

use lw_core::to_surt_prefix;
use lw_monitor::gateway::{select_policies, PolicyGateway};
use lw_monitor::HttpPolicyGateway;

use crate::replay::load_config;

pub fn run_rules(url: &str, config_path: Option<&Path>) -> Result<(), String> {
    let config = load_config(config_path)?;
    let gateway = HttpPolicyGateway::from_config(&config)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "No policy_service_url configured".to_string())?;
    let key = to_surt_prefix(url, &config.prefixes()).map_err(|e| e.to_string())?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    let policies = runtime
        .block_on(gateway.lookup(&key))
        .map_err(|e| e.to_string())?;
    let policies = select_policies(policies, config.include_disabled_policies);

    println!("SURT: {}", key);
    if policies.is_empty() {
        println!("No rules matched this URL.");
        return Ok(());
    }
    for policy in &policies {
        println!();
        println!("  Policy:      {}", policy.policy);
        println!("  SURT:        {}", policy.surt);
        println!("  Environment: {}", policy.environment);
        println!("  Enabled:     {}", if policy.enabled { "Yes" } else { "No" });
    }
    Ok(())
}
