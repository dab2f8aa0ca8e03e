//! SQL injection detection over decoded request parameters
//!
//! Detection itself is a black box behind [`InjectionOracle`]; this module
//! decides which keys are inspected and keeps an audit trail of the scan.

use crate::params::{Keys, QueryParams};
use itertools::Itertools;
use regex::RegexSet;
use std::fmt::Write as _;
use std::sync::OnceLock;

/// Lexical scanner deciding whether a single string carries an injection.
pub trait InjectionOracle: Send + Sync {
    fn is_injection(&self, input: &str) -> bool;
}

const SQLI_PATTERNS: &[&str] = &[
    // Tautologies after a closed string literal: ' OR 'a'='a, ' AND 1=1
    r"(?i)'\s*(or|and)\s+'?[\w]+'?\s*(=|<|>|like\b)",
    // Numeric tautologies: 1 OR 1=1
    r"(?i)\b(or|and)\s+\d+\s*=\s*\d+",
    r"(?i)\bunion\s+(all\s+)?select\b",
    // Stacked statements
    r"(?i);\s*(drop|delete|insert|update|shutdown|exec|alter|create)\b",
    // Literal closed and the rest of the query commented out
    r"(?i)'\s*(--|#|/\*)",
    r"/\*.*?\*/",
    // Time-based blind injection
    r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(",
    r"(?i)\bwaitfor\s+delay\b",
    r"(?i)\bxp_cmdshell\b",
    r"(?i)\bselect\b.+\bfrom\b.+\bwhere\b",
];

fn sqli_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(SQLI_PATTERNS).expect("Invalid SQLi regex pattern"))
}

/// Signature-based oracle used when no other scanner is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternOracle;

impl InjectionOracle for PatternOracle {
    fn is_injection(&self, input: &str) -> bool {
        !input.is_empty() && sqli_patterns().is_match(input)
    }
}

/// Outcome of scanning a parameter map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub detected: bool,
    /// Key whose value (or name) tripped the oracle
    pub key: Option<String>,
    /// Human readable trail of every key that was inspected
    pub audit: String,
}

/// Select the keys to inspect.
///
/// Include mode returns `keys` verbatim; exclude mode returns every param key
/// not listed in `keys`.
pub fn pick_keys(params: &QueryParams, include: bool, keys: &Keys) -> Keys {
    if include {
        return keys.clone();
    }
    params
        .keys()
        .filter(|k| !keys.contains(*k))
        .cloned()
        .collect()
}

/// Run `oracle` over the selected keys and their values.
///
/// Keys are visited in sorted order so the audit trail is stable. The scan
/// stops at the first positive.
pub fn detect(
    oracle: &dyn InjectionOracle,
    params: &QueryParams,
    include: bool,
    keys: &Keys,
) -> Detection {
    let mut detection = Detection::default();
    for key in pick_keys(params, include, keys).into_iter().sorted() {
        let Some(value) = params.get(&key) else {
            let _ = writeln!(detection.audit, "key [{key}] not in params");
            continue;
        };
        if oracle.is_injection(value) || oracle.is_injection(&key) {
            let _ = writeln!(detection.audit, "key [{key}] -- SQL injection detected");
            detection.detected = true;
            detection.key = Some(key);
            return detection;
        }
        let _ = writeln!(detection.audit, "key [{key}] passed detection");
    }
    detection
}

/// [`detect`] with the bundled [`PatternOracle`], returning only the verdict.
pub fn detect_sqli_on_params(params: &QueryParams, include: bool, keys: &Keys) -> bool {
    detect(&PatternOracle, params, include, keys).detected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::parse_path;

    fn keys(names: &[&str]) -> Keys {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pattern_oracle() {
        let oracle = PatternOracle;
        for bad in [
            "1' AND 1=1",
            "admin' --",
            "x' or 'a'='a",
            "1 OR 1=1",
            "1 UNION ALL SELECT password FROM users",
            "1; DROP TABLE users",
            "1' AND SLEEP(5)",
            "'; WAITFOR DELAY '0:0:5'--",
            "abc/**/def",
        ] {
            assert!(oracle.is_injection(bad), "{bad} should be flagged");
        }
        for good in [
            "",
            "world",
            "hello world",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
            "https://example.com/search?q=rust",
            "O'Reilly",
        ] {
            assert!(!oracle.is_injection(good), "{good} should pass");
        }
    }

    #[test]
    fn test_pick_keys() {
        let params = parse_path("/p?a=1&b=2&c=3");
        assert_eq!(pick_keys(&params, true, &keys(&["a", "z"])), keys(&["a", "z"]));
        assert_eq!(pick_keys(&params, false, &keys(&["a"])), keys(&["b", "c"]));
        assert_eq!(pick_keys(&params, false, &Keys::new()), keys(&["a", "b", "c"]));
    }

    #[test]
    fn test_detect_in_exclude_mode() {
        let params = parse_path("/test?param1=%271%27%20AND%201%3D1&param2=ok");
        let detection = detect(&PatternOracle, &params, false, &Keys::new());
        assert!(detection.detected);
        assert_eq!(detection.key.as_deref(), Some("param1"));
        assert!(detection.audit.contains("SQL injection detected"));

        // excluding the offending key lets the request through
        assert!(!detect_sqli_on_params(&params, false, &keys(&["param1"])));
    }

    #[test]
    fn test_detect_include_mode_logs_absent_keys() {
        let params = parse_path("/test?param1=value");
        let detection = detect(&PatternOracle, &params, true, &keys(&["missing", "param1"]));
        assert!(!detection.detected);
        assert_eq!(
            detection.audit,
            "key [missing] not in params\nkey [param1] passed detection\n"
        );
    }

    #[test]
    fn test_detect_include_mode_selects_keys() {
        let mut params = QueryParams::new();
        params.insert("param3".to_string(), "=1' AND 1=1".to_string());
        assert!(detect_sqli_on_params(&params, true, &keys(&["param1", "param3"])));
        assert!(!detect_sqli_on_params(&params, true, &keys(&["param1", "param2"])));
    }

    #[test]
    fn test_detect_checks_key_names() {
        let mut params = QueryParams::new();
        params.insert("x' OR 1=1 --".to_string(), "fine".to_string());
        assert!(detect_sqli_on_params(&params, false, &Keys::new()));
    }

    #[test]
    fn test_detect_with_custom_oracle() {
        struct Always;
        impl InjectionOracle for Always {
            fn is_injection(&self, _input: &str) -> bool {
                true
            }
        }
        let params = parse_path("/p?a=1");
        assert!(detect(&Always, &params, false, &Keys::new()).detected);
        assert!(!detect(&Always, &QueryParams::new(), false, &Keys::new()).detected);
    }
}
