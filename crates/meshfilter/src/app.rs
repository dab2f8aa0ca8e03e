use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use futures_util::future::join_all;
use prometheus_client::registry::Registry;
use ratelimit_core::InMemorySharedData;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::chain::FilterChain;
use crate::config::Config;
use crate::filter::RootContext;
use crate::filters::{HostServices, configure};
use crate::telemetry::metrics::{self, Metrics};

pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let http = reqwest::Client::builder()
		.build()
		.context("failed to build http client")?;
	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));
	let services = HostServices {
		shared_data: Arc::new(InMemorySharedData::new()),
		http,
		metrics: metrics.clone(),
	};

	let mut chains = Vec::with_capacity(config.workers);
	for worker in 0..config.workers {
		let roots = config
			.filters
			.iter()
			.map(|f| {
				configure(f.kind, &f.config, &services)
					.with_context(|| format!("failed to configure filter {} on worker {worker}", f.kind))
			})
			.collect::<anyhow::Result<Vec<_>>>()?;
		chains.push(Arc::new(
			FilterChain::new(roots, config.node.clone()).with_metrics(metrics.clone()),
		));
	}

	let registry = Arc::new(registry);
	let mut tickers = JoinSet::new();
	if let Some(addr) = config.metrics_addr {
		tickers.spawn(metrics::serve(addr, registry.clone()));
	}
	for root in chains.iter().flat_map(|c| c.roots()) {
		if let Some(period) = root.tick_period() {
			tickers.spawn(tick(root.clone(), period));
		}
	}

	info!(
		workers = config.workers,
		filters = ?chains.first().map(|c| c.names()).unwrap_or_default(),
		"filter chains started"
	);
	Ok(Bound {
		chains,
		next: AtomicUsize::new(0),
		registry,
		tickers,
	})
}

// One task per root, so a tick never overlaps the previous one.
async fn tick(root: Arc<dyn RootContext>, period: std::time::Duration) {
	let mut interval = tokio::time::interval(period);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	// the first tick completes immediately
	interval.tick().await;
	loop {
		interval.tick().await;
		debug!(filter = root.name(), "tick");
		root.on_tick();
	}
}

pub struct Bound {
	chains: Vec<Arc<FilterChain>>,
	next: AtomicUsize,
	registry: Arc<Registry>,
	// tick loops and the metrics listener
	tickers: JoinSet<()>,
}

impl Bound {
	pub fn chains(&self) -> &[Arc<FilterChain>] {
		&self.chains
	}

	pub fn metrics_text(&self) -> anyhow::Result<String> {
		metrics::encode_text(&self.registry)
	}

	/// Round-robin over the workers
	pub fn pick(&self) -> &Arc<FilterChain> {
		let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.chains.len();
		&self.chains[idx]
	}

	/// Stop the timers and wait for every filter to finish pending work.
	pub async fn shutdown(mut self) {
		self.tickers.abort_all();
		while self.tickers.join_next().await.is_some() {}

		let pending = self
			.chains
			.iter()
			.flat_map(|c| c.roots())
			.map(|root| root.on_done());
		join_all(pending).await;
		info!("filter chains stopped");
	}

	pub async fn wait_termination(self) -> anyhow::Result<()> {
		tokio::signal::ctrl_c()
			.await
			.context("failed to listen for shutdown signal")?;
		self.shutdown().await;
		Ok(())
	}
}
