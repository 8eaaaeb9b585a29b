use crate::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration, loaded from a JSON file. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
	pub network: String,
	pub wallet_id: String,
	/// JSON-RPC endpoint of the gateway
	pub gateway_url: String,
	/// Websocket endpoint for subscriptions
	pub gateway_ws_url: String,
	pub data_dir: PathBuf,
	/// File with pre-derived addresses per derivation path
	pub address_book: Option<PathBuf>,
	pub gap_limit: u32,
	pub sync: SyncOptions,
	pub headers: HeadersSyncConfig,
	pub transactions: TransactionsSyncConfig,
	pub storage: StorageConfig,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			network: "testnet".to_string(),
			wallet_id: "default".to_string(),
			gateway_url: "http://127.0.0.1:3000".to_string(),
			gateway_ws_url: "ws://127.0.0.1:3000/ws".to_string(),
			data_dir: PathBuf::from("data"),
			address_book: None,
			gap_limit: 20,
			sync: SyncOptions::default(),
			headers: HeadersSyncConfig::default(),
			transactions: TransactionsSyncConfig::default(),
			storage: StorageConfig::default(),
		}
	}
}

/// Caller supplied shortcuts for where synchronization starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncOptions {
	/// Start from the tip and only keep following new blocks
	pub skip_synchronization: bool,
	/// Never fetch anything below this height
	pub skip_synchronization_before_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HeadersSyncConfig {
	pub max_headers_to_keep: usize,
	pub max_parallel_streams: usize,
	pub target_batch_size: u32,
	pub max_retries: u32,
	pub progress_update_interval_ms: u64,
}

impl Default for HeadersSyncConfig {
	fn default() -> Self {
		Self {
			max_headers_to_keep: 2000,
			max_parallel_streams: 5,
			target_batch_size: 50000,
			max_retries: 10,
			progress_update_interval_ms: 1000,
		}
	}
}

impl HeadersSyncConfig {
	pub fn progress_update_interval(&self) -> Duration {
		Duration::from_millis(self.progress_update_interval_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransactionsSyncConfig {
	pub max_retries: u32,
	pub false_positive_rate: f64,
	pub progress_update_interval_ms: u64,
	/// 100 ms polls spent waiting for parked merkle blocks on stop
	pub stop_drain_polls: u32,
}

impl Default for TransactionsSyncConfig {
	fn default() -> Self {
		Self {
			max_retries: 10,
			false_positive_rate: crate::bloom::DEFAULT_FALSE_POSITIVE_RATE,
			progress_update_interval_ms: 1000,
			stop_drain_polls: 50,
		}
	}
}

impl TransactionsSyncConfig {
	pub fn progress_update_interval(&self) -> Duration {
		Duration::from_millis(self.progress_update_interval_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
	pub autosave_interval_secs: u64,
	/// Blocks below the tip considered safe from reorgs when persisting
	pub reorg_safe_depth: u32,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			autosave_interval_secs: 10,
			reorg_safe_depth: 6,
		}
	}
}

impl ClientConfig {
	pub async fn load(path: &Path) -> Result<Self, ConfigError> {
		let content = tokio::fs::read_to_string(path).await?;
		let config: ClientConfig = serde_json::from_str(&content)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.gap_limit == 0 {
			return Err(ConfigError::Invalid {
				field: "gapLimit",
				reason: "must be greater than zero".to_string(),
			});
		}
		let rate = self.transactions.false_positive_rate;
		if !(rate > 0.0 && rate < 1.0) {
			return Err(ConfigError::Invalid {
				field: "transactions.falsePositiveRate",
				reason: format!("{} is outside (0, 1)", rate),
			});
		}
		if self.headers.max_headers_to_keep == 0 {
			return Err(ConfigError::Invalid {
				field: "headers.maxHeadersToKeep",
				reason: "must be greater than zero".to_string(),
			});
		}
		if self.headers.max_parallel_streams == 0 || self.headers.target_batch_size == 0 {
			return Err(ConfigError::Invalid {
				field: "headers.maxParallelStreams",
				reason: "stream partitioning needs at least one stream and a non-zero batch size"
					.to_string(),
			});
		}
		if self.storage.autosave_interval_secs == 0 {
			return Err(ConfigError::Invalid {
				field: "storage.autosaveIntervalSecs",
				reason: "must be greater than zero".to_string(),
			});
		}
		Ok(())
	}
}
