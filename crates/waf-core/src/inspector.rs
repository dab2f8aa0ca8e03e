//! Per-request inspection driven by a [`WafConfig`]

use crate::config::WafConfig;
use crate::detector::{detect, Detection, InjectionOracle, PatternOracle};
use crate::params::{parse_body, parse_cookie_header, parse_path, Keys, QueryParams, URLENCODED};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// The request part an injection was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPart {
    Header,
    Cookie,
    Path,
    Body,
}

impl RequestPart {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPart::Header => "header",
            RequestPart::Cookie => "cookie",
            RequestPart::Path => "path",
            RequestPart::Body => "body",
        }
    }
}

impl fmt::Display for RequestPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub part: RequestPart,
    pub key: Option<String>,
}

/// Applies the configured field policies to each request part.
#[derive(Clone)]
pub struct WafInspector {
    config: WafConfig,
    oracle: Arc<dyn InjectionOracle>,
}

impl fmt::Debug for WafInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WafInspector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WafInspector {
    pub fn new(config: WafConfig) -> Self {
        Self::with_oracle(config, Arc::new(PatternOracle))
    }

    pub fn with_oracle(config: WafConfig, oracle: Arc<dyn InjectionOracle>) -> Self {
        Self { config, oracle }
    }

    pub fn config(&self) -> &WafConfig {
        &self.config
    }

    /// Inspect request headers. Header names are matched lowercase.
    pub fn inspect_headers<'a, I>(&self, headers: I) -> Option<Finding>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let params: QueryParams = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect();
        let policy = &self.config.header;
        self.run(RequestPart::Header, &params, policy.include, &policy.keys)
    }

    pub fn inspect_cookie(&self, cookie_header: &str) -> Option<Finding> {
        let params = parse_cookie_header(cookie_header);
        let policy = &self.config.cookie;
        self.run(RequestPart::Cookie, &params, policy.include, &policy.keys)
    }

    /// Inspect the query string of a request path with the `query_param` policy.
    pub fn inspect_path(&self, path: &str) -> Option<Finding> {
        let params = parse_path(path);
        let policy = &self.config.query_param;
        self.run(RequestPart::Path, &params, policy.include, &policy.keys)
    }

    /// Inspect a request body. Bodies that are not URL-encoded are skipped.
    pub fn inspect_body(&self, content_type: Option<&str>, body: &[u8]) -> Option<Finding> {
        if !content_type.is_some_and(is_urlencoded) {
            return None;
        }
        let body = String::from_utf8_lossy(body);
        let params = parse_body(&body);
        let policy = &self.config.query_param;
        self.run(RequestPart::Body, &params, policy.include, &policy.keys)
    }

    fn run(
        &self,
        part: RequestPart,
        params: &QueryParams,
        include: bool,
        keys: &Keys,
    ) -> Option<Finding> {
        let Detection {
            detected,
            key,
            audit,
        } = detect(self.oracle.as_ref(), params, include, keys);
        trace!(part = %part, audit = %audit, "sqli inspection");
        detected.then_some(Finding { part, key })
    }
}

/// Match on the media type only, ignoring parameters such as `charset`.
pub fn is_urlencoded(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|media| media.eq_ignore_ascii_case(URLENCODED))
}
