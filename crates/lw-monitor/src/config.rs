//! Monitor configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use lw_core::BoundaryPrefixes;
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

pub const DEFAULT_BOUNDARY_PREFIX: &str = "https://wayback.archive-it.org/";
pub const DEFAULT_POLICY_SERVICE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_CAPTURE_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Replay prefixes; anything fetched from elsewhere is a leak
    pub boundary_prefixes: Vec<String>,
    /// Base URL of the rule service, `None` disables policy enrichment
    pub policy_service_url: Option<String>,
    /// Request timeout for the rule service (no timeout when unset)
    pub policy_timeout_ms: Option<u64>,
    /// Attach rules the service reports as disabled
    pub include_disabled_policies: bool,
    /// Per-session console capture ring size
    pub capture_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            boundary_prefixes: vec![DEFAULT_BOUNDARY_PREFIX.to_string()],
            policy_service_url: Some(DEFAULT_POLICY_SERVICE_URL.to_string()),
            policy_timeout_ms: None,
            include_disabled_policies: false,
            capture_capacity: DEFAULT_CAPTURE_CAPACITY,
        }
    }
}

impl MonitorConfig {
    /// Load and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, MonitorError> {
        let text = fs::read_to_string(path)
            .map_err(|e| MonitorError::Config(format!("Failed to read '{}': {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, MonitorError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| MonitorError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.boundary_prefixes.is_empty() {
            return Err(MonitorError::Config("boundary_prefixes must not be empty".to_string()));
        }
        if self.boundary_prefixes.iter().any(String::is_empty) {
            return Err(MonitorError::Config("boundary prefix must not be empty".to_string()));
        }
        if let Some(url) = &self.policy_service_url {
            if !lw_core::url::has_http_scheme(url) {
                return Err(MonitorError::Config(format!("policy_service_url '{}' is not http(s)", url)));
            }
        }
        if self.capture_capacity == 0 {
            return Err(MonitorError::Config("capture_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn prefixes(&self) -> BoundaryPrefixes {
        BoundaryPrefixes::new(self.boundary_prefixes.iter().cloned())
    }

    pub fn policy_timeout(&self) -> Option<Duration> {
        self.policy_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prefixes().len(), 1);
        assert_eq!(config.policy_timeout(), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = MonitorConfig::from_json(r#"{"policy_service_url": null, "policy_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.boundary_prefixes, vec![DEFAULT_BOUNDARY_PREFIX.to_string()]);
        assert_eq!(config.policy_service_url, None);
        assert_eq!(config.policy_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_rejects_empty_prefixes() {
        let err = MonitorConfig::from_json(r#"{"boundary_prefixes": []}"#).unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
        let err = MonitorConfig::from_json(r#"{"boundary_prefixes": [""]}"#).unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_service_url() {
        let err = MonitorConfig::from_json(r#"{"policy_service_url": "localhost:8000"}"#).unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }
}
