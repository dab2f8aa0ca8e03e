//! Host and path pattern matching

use std::collections::HashSet;

/// How a configured pattern is compared to a request value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Prefix,
    Exact,
    Suffix,
}

impl MatchKind {
    pub fn matches(self, pattern: &str, candidate: &str) -> bool {
        match self {
            MatchKind::Prefix => candidate.starts_with(pattern),
            MatchKind::Exact => candidate == pattern,
            MatchKind::Suffix => candidate.ends_with(pattern),
        }
    }

    /// Classify a host pattern: `*.example.com` matches by suffix,
    /// `example.*` by prefix, anything else exactly. The `*` is dropped.
    pub fn classify_host(host: &str) -> (MatchKind, String) {
        if let Some(suffix) = host.strip_prefix('*') {
            (MatchKind::Suffix, suffix.to_string())
        } else if let Some(prefix) = host.strip_suffix('*') {
            (MatchKind::Prefix, prefix.to_string())
        } else {
            (MatchKind::Exact, host.to_string())
        }
    }
}

/// One protected resource: a path pattern, optional hosts and the
/// credentials accepted for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    pub request_path: String,
    pub path_pattern: MatchKind,
    /// Empty means any host
    pub hosts: Vec<(MatchKind, String)>,
    /// Base64 encoded `user:pass` pairs
    pub encoded_credentials: HashSet<String>,
}

impl MatchRule {
    pub fn path_matches(&self, path: &str) -> bool {
        self.path_pattern.matches(&self.request_path, path)
    }

    /// `host` must already have its port stripped.
    pub fn host_matches(&self, host: &str) -> bool {
        self.hosts.is_empty()
            || self
                .hosts
                .iter()
                .any(|(kind, pattern)| kind.matches(pattern, host))
    }
}

/// Remove a trailing `:port` from an authority, leaving bracketed IPv6
/// literals such as `[::1]` intact.
pub fn strip_port(host: &str) -> &str {
    let Some(port_start) = host.rfind(':') else {
        return host;
    };
    match host.rfind(']') {
        Some(v6_end) if v6_end > port_start => host,
        _ => &host[..port_start],
    }
}
