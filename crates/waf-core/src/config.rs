//! WAF inspection configuration
//!
//! ```json
//! {
//!   "query_param": { "content-type": "application/x-www-form-urlencoded", "exclude": ["token"] },
//!   "header": { "include": ["x-forwarded-for"] },
//!   "cookie": { "exclude": ["session"] }
//! }
//! ```

use crate::params::{Keys, URLENCODED};
use itertools::Itertools;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Which keys of one request part are inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicy {
    /// `true`: only `keys` are inspected. `false`: everything except `keys`.
    pub include: bool,
    pub keys: Keys,
}

impl FieldPolicy {
    fn exclude_none() -> Self {
        Self {
            include: false,
            keys: Keys::new(),
        }
    }

    fn default_headers() -> Self {
        Self {
            include: true,
            keys: ["referer", "user-agent"].into_iter().map(String::from).collect(),
        }
    }

    fn apply(&mut self, section: &RawSection) {
        if let Some(exclude) = &section.exclude {
            self.include = false;
            self.keys = exclude.iter().cloned().collect();
        } else if let Some(include) = &section.include {
            self.include = true;
            self.keys.extend(include.iter().cloned());
        }
    }
}

impl fmt::Display for FieldPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.include { "include" } else { "exclude" };
        write!(f, "{mode} [{}]", self.keys.iter().sorted().join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WafConfig {
    pub content_type: String,
    pub query_param: FieldPolicy,
    pub header: FieldPolicy,
    pub cookie: FieldPolicy,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            content_type: URLENCODED.to_string(),
            query_param: FieldPolicy::exclude_none(),
            header: FieldPolicy::default_headers(),
            cookie: FieldPolicy::exclude_none(),
        }
    }
}

impl fmt::Display for WafConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "content-type: {}; query_param: {}; header: {}; cookie: {}",
            self.content_type, self.query_param, self.header, self.cookie
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WafConfigError {
    #[error("JSON parse error in configuration")]
    Json,

    #[error("missing content-type field under query_param")]
    MissingContentType,

    #[error("invalid content type, only application/x-www-form-urlencoded is supported")]
    UnsupportedContentType,

    #[error("include and exclude cannot both be present")]
    IncludeAndExclude,

    #[error("invalid value in {section} configuration: {detail}")]
    InvalidField {
        section: &'static str,
        detail: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct RawSection {
    #[serde(rename = "content-type")]
    content_type: Option<String>,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

impl RawSection {
    fn from_root(root: &Value, section: &'static str) -> Result<Option<Self>, WafConfigError> {
        match root.get(section) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                let raw: RawSection = serde_json::from_value(value.clone()).map_err(|e| {
                    WafConfigError::InvalidField {
                        section,
                        detail: e.to_string(),
                    }
                })?;
                if raw.include.is_some() && raw.exclude.is_some() {
                    return Err(WafConfigError::IncludeAndExclude);
                }
                Ok(Some(raw))
            }
        }
    }
}

impl WafConfig {
    /// Parse the filter configuration. Empty input yields [`WafConfig::default`].
    pub fn parse(config: &str) -> Result<Self, WafConfigError> {
        let mut parsed = Self::default();
        if config.trim().is_empty() {
            return Ok(parsed);
        }

        let root: Value = serde_json::from_str(config).map_err(|_| WafConfigError::Json)?;
        if !root.is_object() {
            return Err(WafConfigError::Json);
        }

        if let Some(section) = RawSection::from_root(&root, "query_param")? {
            let content_type = section
                .content_type
                .as_deref()
                .ok_or(WafConfigError::MissingContentType)?;
            if content_type != URLENCODED {
                return Err(WafConfigError::UnsupportedContentType);
            }
            parsed.content_type = content_type.to_string();
            parsed.query_param.apply(&section);
        }

        if let Some(section) = RawSection::from_root(&root, "cookie")? {
            parsed.cookie.apply(&section);
        }

        if let Some(section) = RawSection::from_root(&root, "header")? {
            parsed.header.apply(&section);
        }

        Ok(parsed)
    }
}
