use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wallet_spv_sync::client::{SYNC_WORKERS, SpvClient};
use wallet_spv_sync::config::ClientConfig;
use wallet_spv_sync::error::{ConfigError, SyncError};
use wallet_spv_sync::events::{self, EventDispatcher, LoggingEventHandler};
use wallet_spv_sync::keychain::AddressBook;
use wallet_spv_sync::storage::{FileStateRepository, Storage};
use wallet_spv_sync::transport::GatewayClient;
use wallet_spv_sync::worker::ReadinessTracker;

/// Environment variable naming the JSON config file
const CONFIG_ENV: &str = "SPV_CONFIG";
const DISPATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("SPV sync failed: {}", e);
		std::process::exit(1);
	}
}

async fn load_config() -> Result<ClientConfig, SyncError> {
	match std::env::var_os(CONFIG_ENV) {
		Some(path) => {
			let path = PathBuf::from(path);
			info!("Loading config from {}", path.display());
			Ok(ClientConfig::load(&path).await?)
		}
		None => {
			warn!("{} is not set, using the default config", CONFIG_ENV);
			let config = ClientConfig::default();
			config.validate()?;
			Ok(config)
		}
	}
}

async fn run() -> Result<(), SyncError> {
	let config = load_config().await?;
	info!("Starting SPV sync for wallet {} on {}", config.wallet_id, config.network);

	let transport = GatewayClient::new(config.gateway_url.clone(), config.gateway_ws_url.clone())?
		.with_max_reconnects(config.transactions.max_retries);
	let repository = Arc::new(FileStateRepository::new(config.data_dir.clone()));
	let storage = Storage::load(
		repository,
		&config.network,
		&config.wallet_id,
		config.headers.max_headers_to_keep,
		config.storage.reorg_safe_depth,
	)
	.await?;

	let address_book = match &config.address_book {
		Some(path) => AddressBook::load(path).await?,
		None => {
			return Err(ConfigError::Invalid {
				field: "addressBook",
				reason: "a file with pre-derived addresses is required".to_string(),
			}
			.into());
		}
	};
	let paths = address_book.paths();

	let (sender, receiver) = events::channel();
	let (tracker, mut ready) = ReadinessTracker::new(SYNC_WORKERS);
	let mut dispatcher = EventDispatcher::new();
	dispatcher.register_handler(Box::new(LoggingEventHandler));
	dispatcher.register_handler(Box::new(tracker));
	let dispatcher = tokio::spawn(dispatcher.run(receiver));

	let client = SpvClient::new(
		config,
		Arc::new(transport),
		Arc::new(storage),
		Arc::new(address_book),
		paths,
		sender,
	);

	tokio::select! {
		result = client.start() => result?,
		_ = tokio::signal::ctrl_c() => {
			info!("Interrupted during initial sync");
			client.stop().await?;
			return Ok(());
		}
	}

	let interrupted = tokio::select! {
		_ = ready.wait_for(|ready| *ready) => {
			info!("Wallet is synced and following the chain");
			false
		}
		_ = tokio::signal::ctrl_c() => true,
	};
	if !interrupted {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!("Unable to listen for Ctrl-C: {}", e);
		}
	}

	info!("Shutting down");
	client.stop().await?;
	drop(client);
	match tokio::time::timeout(DISPATCHER_DRAIN_TIMEOUT, dispatcher).await {
		Ok(Err(e)) => warn!("Event dispatcher ended abnormally: {}", e),
		Err(_) => warn!("Event dispatcher did not drain in time"),
		Ok(Ok(())) => {}
	}
	Ok(())
}
