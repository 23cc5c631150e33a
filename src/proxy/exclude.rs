//! Endpoint exclusion rules (`host:port` or bare `host`)

use crate::proxy::models::Target;
use crate::Result;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Set of addresses that must never be probed
#[derive(Debug, Clone, Default)]
pub struct ExcludeRules {
    exact: HashSet<(String, u16)>,
    hosts: HashSet<String>,
}

impl ExcludeRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse rules, one per line. `#` starts a comment.
    pub fn parse_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut rules = Self::default();

        for line in lines {
            let rule = line.split('#').next().unwrap_or_default().trim();
            if rule.is_empty() {
                continue;
            }
            match split_host_port(rule) {
                Some((host, port)) => {
                    rules.exact.insert((host.to_lowercase(), port));
                }
                None => {
                    let host = rule.trim_start_matches('[').trim_end_matches(']');
                    rules.hosts.insert(host.to_lowercase());
                }
            }
        }

        rules
    }

    /// Load rules from a file; a missing file means no rules
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            debug!(path = %path.display(), "exclude file not found, no rules loaded");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_lines(content.lines()))
    }

    /// Inline rules win over the file when they contain anything
    pub fn load(inline: Option<&str>, file: Option<&Path>) -> Result<Self> {
        match inline.map(str::trim).filter(|s| !s.is_empty()) {
            Some(content) => Ok(Self::parse_lines(content.lines())),
            None => match file {
                Some(path) => Self::from_file(path),
                None => Ok(Self::default()),
            },
        }
    }

    /// The rule matching `host:port`, if any
    pub fn matches(&self, host: &str, port: u16) -> Option<String> {
        let host = host.to_lowercase();
        if self.exact.contains(&(host.clone(), port)) {
            return Some(Target::new(host, port).to_string());
        }
        if self.hosts.contains(&host) {
            return Some(host);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.hosts.is_empty()
    }
}

/// Split `host:port` or `[v6]:port`. A bare IPv6 address has no port.
fn split_host_port(rule: &str) -> Option<(&str, u16)> {
    if let Some(rest) = rule.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }
    if rule.matches(':').count() != 1 {
        return None;
    }
    let (host, port) = rule.split_once(':')?;
    Some((host, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact_and_host_rules() {
        let rules = ExcludeRules::parse_lines(
            "1.2.3.4:443\nExample.COM\n# comment\n\n[2001:db8::1]:8443\n2001:db8::2 # host only"
                .lines(),
        );
        assert_eq!(rules.len(), 4);

        assert_eq!(rules.matches("1.2.3.4", 443), Some("1.2.3.4:443".to_string()));
        assert_eq!(rules.matches("1.2.3.4", 80), None);
        assert_eq!(rules.matches("example.com", 1), Some("example.com".to_string()));
        assert_eq!(
            rules.matches("2001:db8::1", 8443),
            Some("[2001:db8::1]:8443".to_string())
        );
        assert_eq!(rules.matches("2001:db8::2", 1), Some("2001:db8::2".to_string()));
        assert_eq!(rules.matches("5.6.7.8", 443), None);
    }

    #[test]
    fn test_load_prefers_inline_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exclude_endpoints");
        fs::write(&path, "9.9.9.9\n").unwrap();

        let rules = ExcludeRules::load(Some("1.1.1.1"), Some(&path)).unwrap();
        assert!(rules.matches("1.1.1.1", 1).is_some());
        assert!(rules.matches("9.9.9.9", 1).is_none());

        let rules = ExcludeRules::load(Some("   "), Some(&path)).unwrap();
        assert!(rules.matches("9.9.9.9", 1).is_some());
    }

    #[test]
    fn test_missing_file_means_no_rules() {
        let rules = ExcludeRules::from_file("/nonexistent/exclude_endpoints").unwrap();
        assert!(rules.is_empty());
        assert!(ExcludeRules::load(None, None).unwrap().is_empty());
    }
}
