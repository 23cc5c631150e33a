//! Endpoint and probe result models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address extracted from an endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One candidate proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Descriptor line as it appeared in the input
    pub raw: String,
    /// Normalized identity, used as the blacklist key
    pub key: String,
    /// URL scheme, when the descriptor has one
    pub scheme: Option<String>,
    /// Address, when it can be extracted from the descriptor
    pub target: Option<Target>,
}

impl Endpoint {
    pub fn new(raw: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            key: key.into(),
            scheme: None,
            target: None,
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    Working,
    Failed(String),
    Timeout,
    /// The probe could not be run for local reasons (launch failure).
    Error(String),
    /// Stopped by shutdown before it produced a verdict.
    Cancelled,
}

impl ProbeStatus {
    /// Whether the endpoint itself is to blame, i.e. it belongs in the blacklist.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(self, ProbeStatus::Failed(_) | ProbeStatus::Timeout)
    }
}

/// Detailed result of a probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub status: ProbeStatus,
    pub elapsed_ms: Option<u64>,
}

impl ProbeResult {
    pub fn new(endpoint: Endpoint, status: ProbeStatus, elapsed_ms: Option<u64>) -> Self {
        Self {
            endpoint,
            status,
            elapsed_ms,
        }
    }

    pub fn cancelled(endpoint: Endpoint) -> Self {
        Self::new(endpoint, ProbeStatus::Cancelled, None)
    }

    pub fn is_working(&self) -> bool {
        matches!(self.status, ProbeStatus::Working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_builder() {
        let endpoint = Endpoint::new("vless://id@1.2.3.4:443#DE", "vless://id@1.2.3.4:443")
            .with_scheme("vless")
            .with_target(Target::new("1.2.3.4", 443));

        assert_eq!(endpoint.scheme.as_deref(), Some("vless"));
        assert_eq!(endpoint.target, Some(Target::new("1.2.3.4", 443)));
        assert_eq!(endpoint.to_string(), "vless://id@1.2.3.4:443");
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::new("example.com", 8080).to_string(), "example.com:8080");
        assert_eq!(Target::new("2001:db8::1", 443).to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_probe_status_classification() {
        assert!(ProbeStatus::Failed("exit 1".into()).is_endpoint_failure());
        assert!(ProbeStatus::Timeout.is_endpoint_failure());
        assert!(!ProbeStatus::Working.is_endpoint_failure());
        assert!(!ProbeStatus::Cancelled.is_endpoint_failure());
        assert!(!ProbeStatus::Error("spawn failed".into()).is_endpoint_failure());
    }

    #[test]
    fn test_probe_result() {
        let endpoint = Endpoint::new("1.2.3.4:80", "1.2.3.4:80");

        let result = ProbeResult::new(endpoint.clone(), ProbeStatus::Working, Some(120));
        assert!(result.is_working());
        assert_eq!(result.elapsed_ms, Some(120));

        let result = ProbeResult::cancelled(endpoint);
        assert!(!result.is_working());
        assert!(result.elapsed_ms.is_none());
    }
}
