use std::net::SocketAddr;
use std::sync::Arc;

use authz_core::PolicyMetrics;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Registry, Unit};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const PREFIX: &str = "meshfilter";

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
	/// `hit` or `miss`
	pub cache: &'static str,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
	pub outcome: &'static str,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
	pub filter: &'static str,
	pub status: String,
}

#[derive(Debug)]
pub struct Metrics {
	pub policy_cache_lookups: Family<CacheLabels, Counter>,
	pub policy_decisions: Family<DecisionLabels, Counter>,
	pub policy_remote_duration: Histogram,
	/// Requests answered locally by a filter
	pub local_replies: Family<RejectLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let registry = registry.sub_registry_with_prefix(PREFIX);

		let policy_cache_lookups = Family::<CacheLabels, Counter>::default();
		registry.register(
			"policy_cache_lookups",
			"Policy result cache lookups",
			policy_cache_lookups.clone(),
		);

		let policy_decisions = Family::<DecisionLabels, Counter>::default();
		registry.register(
			"policy_decisions",
			"Policy decisions by outcome and source",
			policy_decisions.clone(),
		);

		let policy_remote_duration = Histogram::new(exponential_buckets(0.001, 2.0, 14));
		registry.register_with_unit(
			"policy_remote_duration",
			"Round trip time of policy server calls",
			Unit::Seconds,
			policy_remote_duration.clone(),
		);

		let local_replies = Family::<RejectLabels, Counter>::default();
		registry.register(
			"local_replies",
			"Requests answered by a filter instead of the upstream",
			local_replies.clone(),
		);

		Metrics {
			policy_cache_lookups,
			policy_decisions,
			policy_remote_duration,
			local_replies,
		}
	}

	pub fn record_local_reply(&self, filter: &'static str, status: u16) {
		self
			.local_replies
			.get_or_create(&RejectLabels {
				filter,
				status: status.to_string(),
			})
			.inc();
	}
}

impl PolicyMetrics for Metrics {
	fn record_cache_lookup(&self, hit: bool) {
		let cache = if hit { "hit" } else { "miss" };
		self
			.policy_cache_lookups
			.get_or_create(&CacheLabels { cache })
			.inc();
	}

	fn record_decision(&self, outcome: &'static str) {
		self
			.policy_decisions
			.get_or_create(&DecisionLabels { outcome })
			.inc();
	}

	fn record_remote_rtt(&self, seconds: f64) {
		self.policy_remote_duration.observe(seconds);
	}
}

/// Render the registry in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> anyhow::Result<String> {
	let mut out = String::new();
	prometheus_client::encoding::text::encode(&mut out, registry)
		.map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))?;
	Ok(out)
}

/// Serve `GET /metrics` until the task is aborted.
pub async fn serve(addr: SocketAddr, registry: Arc<Registry>) {
	let listener = match TcpListener::bind(addr).await {
		Ok(listener) => listener,
		Err(err) => {
			warn!(%addr, %err, "failed to bind metrics listener");
			return;
		},
	};
	info!(%addr, "serving metrics");
	let router = Router::new().route(
		"/metrics",
		get(move || {
			let registry = registry.clone();
			async move {
				encode_text(&registry).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
			}
		}),
	);
	if let Err(err) = axum::serve(listener, router).await {
		warn!(%err, "metrics server exited unexpectedly");
	}
}
