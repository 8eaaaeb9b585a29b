use super::{ChainState, WalletState};
use crate::error::StorageError;

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Repository for chain and wallet state persistence
#[async_trait::async_trait]
pub trait StateRepository: Send + Sync {
	async fn save_chain_state(&self, state: &ChainState, height: u32) -> Result<(), StorageError>;
	async fn load_chain_state(&self, network: &str) -> Result<Option<ChainState>, StorageError>;
	async fn save_wallet_state(&self, state: &WalletState) -> Result<(), StorageError>;
	async fn load_wallet_state(&self, wallet_id: &str) -> Result<Option<WalletState>, StorageError>;
}

/// File-based implementation of StateRepository
pub struct FileStateRepository {
	data_dir: PathBuf,
}

impl FileStateRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn chain_filename(&self, network: &str) -> PathBuf {
		self.data_dir.join(format!("chain_state_{}.json", network))
	}

	fn chain_metadata_filename(&self, network: &str) -> PathBuf {
		self.data_dir
			.join(format!("chain_state_{}.meta.json", network))
	}

	fn wallet_filename(&self, wallet_id: &str) -> PathBuf {
		self.data_dir
			.join(format!("wallet_state_{}.json", hex::encode(wallet_id)))
	}

	async fn write_json<T: serde::Serialize + Sync>(
		&self,
		filename: &PathBuf,
		value: &T,
	) -> Result<(), StorageError> {
		tokio::fs::create_dir_all(&self.data_dir).await?;

		// Write to a temporary file first so a crash never leaves a truncated state file
		let tmp = filename.with_extension("json.tmp");
		tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
		tokio::fs::rename(&tmp, filename).await?;
		Ok(())
	}

	async fn read_json<T: serde::de::DeserializeOwned>(
		&self,
		filename: &PathBuf,
	) -> Result<Option<T>, StorageError> {
		match tokio::fs::read(filename).await {
			Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}
}

#[async_trait::async_trait]
impl StateRepository for FileStateRepository {
	async fn save_chain_state(&self, state: &ChainState, height: u32) -> Result<(), StorageError> {
		let metadata = serde_json::json!({
			"sync_height": height,
			"chain_height": state.chain_height(),
			"timestamp": chrono::Utc::now().to_rfc3339(),
		});

		let filename = self.chain_filename(state.network());
		self.write_json(&filename, state).await?;
		self.write_json(&self.chain_metadata_filename(state.network()), &metadata)
			.await?;

		info!("Saved chain state to {:?} at height {}", filename, height);
		Ok(())
	}

	async fn load_chain_state(&self, network: &str) -> Result<Option<ChainState>, StorageError> {
		let filename = self.chain_filename(network);
		let Some(state) = self.read_json::<ChainState>(&filename).await? else {
			debug!("No chain state found at {:?}", filename);
			return Ok(None);
		};

		if state.network() != network {
			return Err(StorageError::Corrupted(format!(
				"{:?} holds state for network {}",
				filename,
				state.network()
			)));
		}

		info!(
			"Loaded chain state from {:?} (headers synced to {:?}, blocks synced to {:?})",
			filename,
			state.last_synced_header_height(),
			state.last_synced_block_height()
		);
		Ok(Some(state))
	}

	async fn save_wallet_state(&self, state: &WalletState) -> Result<(), StorageError> {
		let filename = self.wallet_filename(state.wallet_id());
		self.write_json(&filename, state).await?;
		debug!("Saved wallet state to {:?}", filename);
		Ok(())
	}

	async fn load_wallet_state(&self, wallet_id: &str) -> Result<Option<WalletState>, StorageError> {
		self.read_json(&self.wallet_filename(wallet_id)).await
	}
}

/// Keeps the last saved state in memory
#[derive(Default)]
pub struct MemoryStateRepository {
	chain: Mutex<Option<ChainState>>,
	wallet: Mutex<Option<WalletState>>,
	saves: AtomicUsize,
}

impl MemoryStateRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn saved_chain_state(&self) -> Option<ChainState> {
		super::lock(&self.chain).clone()
	}

	pub fn saved_wallet_state(&self) -> Option<WalletState> {
		super::lock(&self.wallet).clone()
	}

	/// Number of chain state saves so far
	pub fn save_count(&self) -> usize {
		self.saves.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl StateRepository for MemoryStateRepository {
	async fn save_chain_state(&self, state: &ChainState, _height: u32) -> Result<(), StorageError> {
		*super::lock(&self.chain) = Some(state.clone());
		self.saves.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn load_chain_state(&self, network: &str) -> Result<Option<ChainState>, StorageError> {
		Ok(super::lock(&self.chain)
			.clone()
			.filter(|state| state.network() == network))
	}

	async fn save_wallet_state(&self, state: &WalletState) -> Result<(), StorageError> {
		*super::lock(&self.wallet) = Some(state.clone());
		Ok(())
	}

	async fn load_wallet_state(&self, wallet_id: &str) -> Result<Option<WalletState>, StorageError> {
		Ok(super::lock(&self.wallet)
			.clone()
			.filter(|state| state.wallet_id() == wallet_id))
	}
}
