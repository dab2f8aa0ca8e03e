//! waf-core: request inspection for SQL injection
//!
//! Query strings, URL-encoded bodies, cookies and selected headers are decoded
//! into flat parameter maps and every selected key and value is handed to an
//! [`InjectionOracle`].
//!
//! # Example
//!
//! ```rust,ignore
//! use waf_core::{WafConfig, WafInspector};
//!
//! let inspector = WafInspector::new(WafConfig::parse(r#"{"cookie": {"exclude": ["session"]}}"#)?);
//! if let Some(finding) = inspector.inspect_path("/search?q=1%27%20AND%201%3D1") {
//!     println!("SQLi at {}", finding.part);
//! }
//! ```

pub mod config;
pub mod detector;
pub mod inspector;
pub mod params;

// Re-export public types
pub use config::{FieldPolicy, WafConfig, WafConfigError};
pub use detector::{detect, detect_sqli_on_params, pick_keys, Detection, InjectionOracle, PatternOracle};
pub use inspector::{is_urlencoded, Finding, RequestPart, WafInspector};
pub use params::{
    parse_body, parse_cookie_header, parse_path, parse_query_string, percent_decode, Keys,
    QueryParams, URLENCODED,
};
