//! Local chain and wallet state.
//!
//! [`Storage`] owns both aggregates behind accessor methods and persists them through a
//! [`StateRepository`]. Writers either schedule a deferred save, flushed by [`StorageWorker`],
//! or save immediately at checkpoints.

mod chain_state;
mod repositories;
mod wallet_state;

pub use chain_state::{ChainState, TransactionRecord};
pub use repositories::{FileStateRepository, MemoryStateRepository, StateRepository};
pub use wallet_state::{AddressInfo, KeyChainState, WalletState};

use crate::error::{StorageError, SyncError};
use crate::types::{Transaction, TransactionMetadata};
use crate::worker::{Capability, Dependency, InjectionOrder, PluginDescriptor, Worker};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Locks a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Storage {
	chain: Mutex<ChainState>,
	wallet: Mutex<WalletState>,
	repository: Arc<dyn StateRepository>,
	save_scheduled: AtomicBool,
	reorg_safe_depth: u32,
}

impl Storage {
	pub fn new(
		chain: ChainState,
		wallet: WalletState,
		repository: Arc<dyn StateRepository>,
		reorg_safe_depth: u32,
	) -> Self {
		Self {
			chain: Mutex::new(chain),
			wallet: Mutex::new(wallet),
			repository,
			save_scheduled: AtomicBool::new(false),
			reorg_safe_depth,
		}
	}

	/// Restores persisted state, or starts from empty state
	pub async fn load(
		repository: Arc<dyn StateRepository>,
		network: &str,
		wallet_id: &str,
		max_headers: usize,
		reorg_safe_depth: u32,
	) -> Result<Self, StorageError> {
		let chain = match repository.load_chain_state(network).await? {
			Some(mut chain) => {
				chain.set_max_headers(max_headers);
				chain
			}
			None => {
				info!("Starting with empty chain state for {}", network);
				ChainState::new(network, max_headers)
			}
		};
		let wallet = repository
			.load_wallet_state(wallet_id)
			.await?
			.unwrap_or_else(|| WalletState::new(wallet_id));

		Ok(Self::new(chain, wallet, repository, reorg_safe_depth))
	}

	pub fn chain(&self) -> MutexGuard<'_, ChainState> {
		lock(&self.chain)
	}

	pub fn wallet(&self) -> MutexGuard<'_, WalletState> {
		lock(&self.wallet)
	}

	/// Stores a transaction and returns the wallet addresses it touches
	pub fn import_transaction(
		&self,
		transaction: Transaction,
		metadata: Option<TransactionMetadata>,
	) -> Vec<String> {
		let affected: BTreeSet<String> = {
			let wallet = self.wallet();
			transaction
				.addresses()
				.filter(|address| wallet.contains_address(address))
				.map(str::to_string)
				.collect()
		};
		self.chain().import_transaction(transaction, metadata);
		affected.into_iter().collect()
	}

	pub fn schedule_state_save(&self) {
		self.save_scheduled.store(true, Ordering::SeqCst);
	}

	pub fn is_save_scheduled(&self) -> bool {
		self.save_scheduled.load(Ordering::SeqCst)
	}

	/// Persists the reorg-safe part of the state now
	pub async fn save_state(&self) -> Result<(), StorageError> {
		self.save_scheduled.store(false, Ordering::SeqCst);

		let (chain, wallet, safe_height) = {
			let chain = self.chain();
			let safe_height = chain.chain_height().saturating_sub(self.reorg_safe_depth);
			let mut wallet = self.wallet();
			wallet.update_last_known_block(safe_height);
			(chain.reorg_safe_snapshot(safe_height), wallet.clone(), safe_height)
		};

		self.repository.save_chain_state(&chain, safe_height).await?;
		self.repository.save_wallet_state(&wallet).await?;
		debug!("State saved at reorg-safe height {}", safe_height);
		Ok(())
	}

	/// Saves if a save was scheduled since the last one. Returns whether it saved.
	pub async fn save_scheduled_state(&self) -> Result<bool, StorageError> {
		if !self.is_save_scheduled() {
			return Ok(false);
		}
		self.save_state().await?;
		Ok(true)
	}
}

/// Periodically flushes scheduled saves
pub struct StorageWorker {
	storage: Arc<Storage>,
}

impl StorageWorker {
	pub const NAME: &'static str = "StorageWorker";

	pub fn new(storage: Arc<Storage>) -> Self {
		Self { storage }
	}

	/// Placed ahead of the synchronizers so that it stops last and flushes their final writes
	pub fn descriptor(first_sync_worker: &'static str) -> PluginDescriptor {
		PluginDescriptor {
			name: Self::NAME,
			dependencies: vec![Dependency::Capability(Capability::Storage)],
			order: InjectionOrder {
				before: Some(first_sync_worker),
				after: None,
			},
		}
	}
}

#[async_trait::async_trait]
impl Worker for StorageWorker {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	async fn execute(&self) -> Result<(), SyncError> {
		self.storage.save_scheduled_state().await?;
		Ok(())
	}

	async fn on_stop(&self) -> Result<(), SyncError> {
		self.storage.save_scheduled_state().await?;
		Ok(())
	}
}
