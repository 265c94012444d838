use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::warn;
use wiregate::config;
use wiregate_core::telemetry;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Path to the TOML configuration; created with defaults when missing.
	#[arg(short, long, value_name = "file", default_value = config::DEFAULT_CONFIG_FILE)]
	file: PathBuf,

	/// Load and validate the configuration, then exit.
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	// Settings come first: the log destination is itself configured. Messages
	// produced while loading are replayed once the subscriber exists.
	let loaded = config::load_or_create(&args.file);
	let access = loaded.settings.access_log();
	let _log_guard = telemetry::setup_logging(access.as_ref())?;
	for message in &loaded.warnings {
		warn!("{message}");
	}

	let cfg = config::Config::from_settings(loaded.settings)?;
	if args.validate_only {
		println!("Configuration is valid!");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			let bound = wiregate::app::run(Arc::new(cfg)).await?;
			bound.wait_termination().await
		})
}
