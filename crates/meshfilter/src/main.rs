use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use meshfilter::{app, config, telemetry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshfilter", about = "Runs the mesh policy filter chains")]
struct Args {
	/// Host configuration file (YAML)
	#[arg(short, long, env = "MESHFILTER_CONFIG")]
	file: Option<PathBuf>,

	/// Configure every filter and exit
	#[arg(long)]
	validate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let config = match &args.file {
		Some(path) => config::load(path).await?,
		None => config::parse_config("")?,
	};
	telemetry::init_logging(&config.logging)?;

	let bound = app::run(Arc::new(config)).await?;
	if args.validate_only {
		info!("configuration is valid");
		bound.shutdown().await;
		return Ok(());
	}
	bound.wait_termination().await
}
