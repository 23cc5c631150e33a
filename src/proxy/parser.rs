//! Endpoint parser for descriptor lists and flat files

use crate::proxy::models::{Endpoint, Target};
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// `scheme://[userinfo@]host:port[/path][?query]`, host may be a bracketed IPv6 address
static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*)://(?:([^@/?]*)@)?(\[[0-9A-Fa-f:.]+\]|[^:/?\[\]@]+):(\d{1,5})(?:[/?].*)?$")
        .expect("Invalid URL regex")
});

/// Bare `scheme://` prefix, for descriptors whose address is opaque (e.g. base64 payloads)
static SCHEME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*)://").expect("Invalid scheme regex")
});

/// `user:pass@host:port`
static AUTH_AT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^:@\s]+:[^@\s]+@([^:@\s]+):(\d{1,5})$").expect("Invalid user:pass@host:port regex")
});

/// Endpoint parser for descriptor strings and files
pub struct EndpointParser;

impl EndpointParser {
    /// Normalized identity of a descriptor line.
    ///
    /// Takes the first whitespace-separated token and drops any `#fragment`
    /// (display name, country tag). Blank and comment lines give `None`.
    pub fn normalize_key(line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let token = line.split_whitespace().next()?;
        let key = token.split('#').next().unwrap_or_default().trim();
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }

    /// Parse a single descriptor line
    ///
    /// Supports formats:
    /// - scheme://[USER@]HOST:PORT[/path][?query][#name]
    /// - USER:PASS@HOST:PORT
    /// - HOST:PORT
    /// - HOST:PORT:USER:PASS
    /// - scheme://OPAQUE (address unknown, e.g. base64 vmess links)
    pub fn parse_line(line: &str) -> Option<Endpoint> {
        let key = Self::normalize_key(line)?;
        let endpoint = Endpoint::new(line.trim(), key.clone());

        if let Some(caps) = URL_REGEX.captures(&key) {
            let host = caps[3].trim_start_matches('[').trim_end_matches(']');
            let port: u16 = caps[4].parse().ok()?;
            return Some(
                endpoint
                    .with_scheme(caps[1].to_lowercase())
                    .with_target(Target::new(host, port)),
            );
        }

        if let Some(caps) = SCHEME_REGEX.captures(&key) {
            return Some(endpoint.with_scheme(caps[1].to_lowercase()));
        }

        if let Some(caps) = AUTH_AT_REGEX.captures(&key) {
            let port: u16 = caps[2].parse().ok()?;
            return Some(endpoint.with_target(Target::new(&caps[1], port)));
        }

        Self::parse_colon_format(&key).map(|target| endpoint.with_target(target))
    }

    /// Parse HOST:PORT or HOST:PORT:USER:PASS format
    fn parse_colon_format(key: &str) -> Option<Target> {
        let parts: Vec<&str> = key.split(':').collect();

        match parts.len() {
            2 | 4 if !parts[0].is_empty() => {
                let port: u16 = parts[1].parse().ok()?;
                Some(Target::new(parts[0], port))
            }
            _ => None,
        }
    }

    /// Parse endpoints from a string, keeping the first occurrence of each key
    pub fn parse_string(content: &str) -> Vec<Endpoint> {
        let mut seen = HashSet::new();
        content
            .lines()
            .filter_map(Self::parse_line)
            .filter(|endpoint| seen.insert(endpoint.key.clone()))
            .collect()
    }

    /// Parse endpoints from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<Endpoint>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content))
    }

    /// Distinct `(key, raw)` pairs of a flat blacklist file.
    ///
    /// Keys keep the order of their first appearance; the raw line is the
    /// last one seen for that key.
    pub fn flat_entries(content: &str) -> Vec<(String, String)> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut entries: Vec<(String, String)> = Vec::new();

        for line in content.lines() {
            let Some(key) = Self::normalize_key(line) else {
                continue;
            };
            let raw = line.trim_end_matches('\r').to_string();
            match index.get(&key) {
                Some(&i) => entries[i].1 = raw,
                None => {
                    index.insert(key.clone(), entries.len());
                    entries.push((key, raw));
                }
            }
        }

        entries
    }

    /// Write descriptors one per line, each newline-terminated
    pub fn write_lines<P, I, S>(path: P, lines: I) -> Result<()>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut content = String::new();
        for line in lines {
            content.push_str(line.as_ref().trim_end_matches('\n'));
            content.push('\n');
        }

        fs::write(path, content)?;
        Ok(())
    }
}
