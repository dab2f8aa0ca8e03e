//! Outbound policy server calls

use crate::cache::CheckPayload;
use crate::config::PolicyConfig;
use crate::PolicyError;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, HOST};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// Path of the allow rule on the policy server
pub const POLICY_PATH: &str = "/v1/data/test/allow";

/// Pending remote call resolving to the raw response body.
pub type PolicyFuture = BoxFuture<'static, Result<Bytes, PolicyError>>;

/// Dispatches a policy check.
///
/// An `Err` from `dispatch` means the call could not be started at all; a
/// started call reports transport failures through the returned future.
pub trait PolicyClient: Send + Sync {
    fn dispatch(&self, payload: &CheckPayload) -> Result<PolicyFuture, PolicyError>;
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    input: &'a CheckPayload,
}

/// Policy client speaking the OPA data API over HTTP
#[derive(Clone, Debug)]
pub struct HttpPolicyClient {
    http: Client,
    url: String,
    host: String,
    timeout: Duration,
}

impl HttpPolicyClient {
    pub fn new(http: Client, config: &PolicyConfig) -> Self {
        Self {
            http,
            url: format!("{}{}", config.service_url, POLICY_PATH),
            host: config.service_host.clone(),
            timeout: config.timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PolicyClient for HttpPolicyClient {
    fn dispatch(&self, payload: &CheckPayload) -> Result<PolicyFuture, PolicyError> {
        let body = serde_json::to_vec(&CheckRequest { input: payload })?;
        let request = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(HOST, &self.host)
            .timeout(self.timeout)
            .body(body)
            .build()?;

        let http = self.http.clone();
        Ok(Box::pin(async move {
            let resp = http.execute(request).await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(PolicyError::Status(status.as_u16()));
            }
            Ok(resp.bytes().await?)
        }))
    }
}
