//! Policy Query Gateway
//!
//! Looks up rules for a SURT key on the external rule service:
//!
//! ```text
//! GET /rules/for-request?surt=<key>
//! {"status": "success", "result": [{"policy", "surt", "environment", "enabled"}]}
//! ```
//!
//! Lookups are advisory. The pipeline logs failures and keeps counting.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;

use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::model::Policy;

/// SURT punctuation stays readable in the query string; the rule service
/// matches keys with literal commas and parentheses.
const SURT_QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b',')
    .remove(b'(')
    .remove(b')')
    .remove(b'/');

#[async_trait]
pub trait PolicyGateway: Send + Sync {
    async fn lookup(&self, canonical_key: &str) -> Result<Vec<Policy>, MonitorError>;
}

#[derive(Debug, Deserialize)]
struct RulesResponse {
    status: String,
    #[serde(default)]
    result: Option<Vec<Policy>>,
}

pub struct HttpPolicyGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPolicyGateway {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Gateway for the configured service, `None` when enrichment is disabled.
    pub fn from_config(config: &MonitorConfig) -> Result<Option<Self>, MonitorError> {
        let Some(base_url) = &config.policy_service_url else {
            return Ok(None);
        };
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.policy_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| MonitorError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Some(Self::new(base_url.clone(), client)))
    }

    pub fn request_url(&self, canonical_key: &str) -> String {
        format!(
            "{}/rules/for-request?surt={}",
            self.base_url,
            utf8_percent_encode(canonical_key, SURT_QUERY)
        )
    }
}

#[async_trait]
impl PolicyGateway for HttpPolicyGateway {
    async fn lookup(&self, canonical_key: &str) -> Result<Vec<Policy>, MonitorError> {
        let url = self.request_url(canonical_key);
        log::debug!("fetching rules from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MonitorError::PolicyServiceUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::PolicyServiceBadResponse(format!(
                "HTTP {} for '{}'",
                status, canonical_key
            )));
        }

        let body: RulesResponse = response
            .json()
            .await
            .map_err(|e| MonitorError::PolicyServiceBadResponse(e.to_string()))?;

        match (body.status.as_str(), body.result) {
            ("success", Some(result)) => Ok(result),
            (status, _) => Err(MonitorError::PolicyServiceBadResponse(format!(
                "status '{}' for '{}'",
                status, canonical_key
            ))),
        }
    }
}

/// Keep only enabled rules unless `include_disabled`.
pub fn select_policies(policies: Vec<Policy>, include_disabled: bool) -> Vec<Policy> {
    if include_disabled {
        policies
    } else {
        policies.into_iter().filter(|p| p.enabled).collect()
    }
}
