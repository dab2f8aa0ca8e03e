//! basicauth-core: HTTP basic authentication scoped by method, host and path
//!
//! Rules are looked up by request method and evaluated in declaration order.
//! A rule applies when both its host patterns and its path pattern match; the
//! request must then carry one of the rule's credentials. A request matching
//! no rule is allowed.
//!
//! # Example
//!
//! ```rust,ignore
//! use basicauth_core::{AuthDecision, BasicAuth, BasicAuthConfig};
//!
//! let auth = BasicAuth::new(BasicAuthConfig::parse(config_json)?);
//! match auth.check("GET", "api.example.com:443", "/api/users", authorization) {
//!     AuthDecision::Allow => {}
//!     AuthDecision::Deny(denial) => {
//!         return reply(401, denial.body(), auth.www_authenticate());
//!     }
//! }
//! ```

pub mod config;
pub mod matcher;

// Re-export public types
pub use config::{BasicAuthConfig, ConfigError, DEFAULT_REALM};
pub use matcher::{strip_port, MatchKind, MatchRule};

use tracing::debug;

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// No `Authorization: Basic ...` header
    MissingCredentials,
    /// Credentials present but not accepted by the matching rule
    InvalidCredentials,
}

impl Denial {
    /// Body of the 401 local reply.
    pub fn body(&self) -> &'static str {
        match self {
            Denial::MissingCredentials => {
                "Request denied by Basic Auth check. No Basic Authentication information found."
            }
            Denial::InvalidCredentials => {
                "Request denied by Basic Auth check. Invalid username and/or password"
            }
        }
    }

    pub fn status(&self) -> u16 {
        401
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(Denial),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    config: BasicAuthConfig,
}

impl BasicAuth {
    pub fn new(config: BasicAuthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BasicAuthConfig {
        &self.config
    }

    pub fn realm(&self) -> &str {
        &self.config.realm
    }

    /// Value for the `WWW-Authenticate` header of a denial.
    pub fn www_authenticate(&self) -> String {
        format!("Basic realm={}", self.config.realm)
    }

    /// Check a request. `host` is the `:authority` (a port is ignored) and
    /// `path` is the full request path.
    pub fn check(
        &self,
        method: &str,
        host: &str,
        path: &str,
        authorization: Option<&str>,
    ) -> AuthDecision {
        let Some(rules) = self.config.rules.get(method) else {
            return AuthDecision::Allow;
        };
        let host = strip_port(host);

        for rule in rules {
            if !rule.host_matches(host) || !rule.path_matches(path) {
                continue;
            }
            if let AuthDecision::Deny(denial) = check_credentials(rule, authorization) {
                debug!(method = %method, host = %host, path = %path, reason = ?denial, "basic auth denied");
                return AuthDecision::Deny(denial);
            }
        }

        AuthDecision::Allow
    }
}

fn check_credentials(rule: &MatchRule, authorization: Option<&str>) -> AuthDecision {
    let Some(encoded) = authorization.and_then(|h| h.strip_prefix("Basic ")) else {
        return AuthDecision::Deny(Denial::MissingCredentials);
    };
    if rule.encoded_credentials.contains(encoded) {
        AuthDecision::Allow
    } else {
        AuthDecision::Deny(Denial::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "basic_auth_rules": [
            {
                "prefix": "/api",
                "request_methods": ["GET", "POST"],
                "credentials": ["ok:test", "admin:admin"]
            },
            {
                "exact": "/api/admin",
                "hosts": ["admin.example.com"],
                "request_methods": ["GET"],
                "credentials": ["admin:admin"]
            },
            {
                "suffix": ".png",
                "hosts": ["*.example.com"],
                "request_methods": ["GET"],
                "credentials": ["img:img"]
            }
        ]
    }"#;

    // base64("ok:test"), base64("admin:admin"), base64("img:img")
    const OK_TEST: &str = "Basic b2s6dGVzdA==";
    const ADMIN: &str = "Basic YWRtaW46YWRtaW4=";
    const IMG: &str = "Basic aW1nOmltZw==";

    fn auth() -> BasicAuth {
        BasicAuth::new(BasicAuthConfig::parse(CONFIG).unwrap())
    }

    #[test]
    fn test_unlisted_method_is_allowed() {
        assert_eq!(auth().check("DELETE", "example.com", "/api", None), AuthDecision::Allow);
    }

    #[test]
    fn test_unmatched_path_is_allowed() {
        assert_eq!(auth().check("GET", "example.com", "/public", None), AuthDecision::Allow);
    }

    #[test]
    fn test_missing_credentials() {
        let auth = auth();
        assert_eq!(
            auth.check("GET", "example.com", "/api/users", None),
            AuthDecision::Deny(Denial::MissingCredentials)
        );
        // header without the Basic scheme counts as missing
        assert_eq!(
            auth.check("GET", "example.com", "/api/users", Some("b2s6dGVzdA==")),
            AuthDecision::Deny(Denial::MissingCredentials)
        );
        assert_eq!(
            auth.check("GET", "example.com", "/api/users", Some("Bearer token")),
            AuthDecision::Deny(Denial::MissingCredentials)
        );
    }

    #[test]
    fn test_valid_and_invalid_credentials() {
        let auth = auth();
        assert_eq!(
            auth.check("POST", "example.com", "/api/users", Some(OK_TEST)),
            AuthDecision::Allow
        );
        assert_eq!(
            auth.check("POST", "example.com", "/api/users", Some("Basic d3Jvbmc6d3Jvbmc=")),
            AuthDecision::Deny(Denial::InvalidCredentials)
        );
    }

    #[test]
    fn test_later_rules_still_apply_after_a_pass() {
        let auth = auth();
        // ok:test passes the /api prefix rule but not the admin rule
        assert_eq!(
            auth.check("GET", "admin.example.com", "/api/admin", Some(OK_TEST)),
            AuthDecision::Deny(Denial::InvalidCredentials)
        );
        assert_eq!(
            auth.check("GET", "admin.example.com:8443", "/api/admin", Some(ADMIN)),
            AuthDecision::Allow
        );
        // the admin rule is host scoped
        assert_eq!(
            auth.check("GET", "other.example.com", "/api/admin", Some(OK_TEST)),
            AuthDecision::Allow
        );
    }

    #[test]
    fn test_host_suffix_rule() {
        let auth = auth();
        assert_eq!(
            auth.check("GET", "cdn.example.com", "/logo.png", Some(IMG)),
            AuthDecision::Allow
        );
        assert_eq!(
            auth.check("GET", "cdn.example.com", "/logo.png", None),
            AuthDecision::Deny(Denial::MissingCredentials)
        );
        assert_eq!(auth.check("GET", "cdn.example.org", "/logo.png", None), AuthDecision::Allow);
    }

    #[test]
    fn test_denial_rendering() {
        let auth = auth();
        assert_eq!(auth.www_authenticate(), "Basic realm=istio");
        assert_eq!(Denial::MissingCredentials.status(), 401);
        assert_eq!(
            Denial::InvalidCredentials.body(),
            "Request denied by Basic Auth check. Invalid username and/or password"
        );
    }
}
