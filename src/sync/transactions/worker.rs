use super::reader::{
	AddressAppender, MerkleBlockVerdict, ReaderEvent, TransactionsReader, TransactionsReaderOptions,
};
use crate::config::{SyncOptions, TransactionsSyncConfig};
use crate::error::{SyncError, ValidationError};
use crate::events::{EventSender, TransactionsEvent};
use crate::keychain::KeyChain;
use crate::storage::{Storage, lock};
use crate::sync::headers::BlockHeadersSyncWorker;
use crate::sync::mediator::ChainSyncMediator;
use crate::sync::progress::{ProgressThrottle, TransactionsSyncProgress, percent};
use crate::sync::stopped;
use crate::transport::CoreTransport;
use crate::types::{InstantLock, MerkleBlock, Transaction, TransactionMetadata};
use crate::worker::{Capability, Dependency, InjectionOrder, PluginDescriptor, Worker};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionsSyncState {
	Idle,
	HistoricalSync,
	ContinuousSync,
}

/// Merkle block waiting for its header to arrive
type ParkedBlock = (MerkleBlock, MerkleBlockVerdict);

struct TransactionsSyncInner {
	transport: Arc<dyn CoreTransport>,
	storage: Arc<Storage>,
	keychain: Arc<dyn KeyChain>,
	mediator: Arc<ChainSyncMediator>,
	events: EventSender,
	config: TransactionsSyncConfig,
	options: SyncOptions,
	chain_tip: watch::Receiver<u32>,
	state: Mutex<TransactionsSyncState>,
	sync_checkpoint: Mutex<Option<u32>>,
	stop: watch::Sender<bool>,
	continuous_task: Mutex<Option<JoinHandle<()>>>,
}

/// Synchronizes wallet transactions: historical sync up to the header tip during `on_start`,
/// then a continuous subscription started by `execute`.
#[derive(Clone)]
pub struct TransactionsSyncWorker {
	inner: Arc<TransactionsSyncInner>,
}

impl TransactionsSyncWorker {
	pub const NAME: &'static str = "TransactionsSyncWorker";

	#[allow(clippy::too_many_arguments)]
	pub fn new(
		transport: Arc<dyn CoreTransport>,
		storage: Arc<Storage>,
		keychain: Arc<dyn KeyChain>,
		mediator: Arc<ChainSyncMediator>,
		events: EventSender,
		chain_tip: watch::Receiver<u32>,
		config: TransactionsSyncConfig,
		options: SyncOptions,
	) -> Self {
		let (stop, _) = watch::channel(false);
		Self {
			inner: Arc::new(TransactionsSyncInner {
				transport,
				storage,
				keychain,
				mediator,
				events,
				config,
				options,
				chain_tip,
				state: Mutex::new(TransactionsSyncState::Idle),
				sync_checkpoint: Mutex::new(None),
				stop,
				continuous_task: Mutex::new(None),
			}),
		}
	}

	pub fn descriptor() -> PluginDescriptor {
		PluginDescriptor {
			name: Self::NAME,
			dependencies: vec![
				Dependency::Capability(Capability::Storage),
				Dependency::Capability(Capability::Transport),
				Dependency::Capability(Capability::KeyChain),
				Dependency::Capability(Capability::Mediator),
				Dependency::Capability(Capability::ChainTip),
				Dependency::Plugin(BlockHeadersSyncWorker::NAME),
			],
			order: InjectionOrder {
				before: None,
				after: Some(BlockHeadersSyncWorker::NAME),
			},
		}
	}

	pub fn state(&self) -> TransactionsSyncState {
		*lock(&self.inner.state)
	}

	pub fn start_block_height(&self) -> u32 {
		self.inner.start_block_height()
	}

	pub async fn sync_historical(&self) -> Result<(), SyncError> {
		let inner = &self.inner;
		inner.enter(TransactionsSyncState::HistoricalSync)?;
		inner.stop.send_replace(false);

		let tip = inner.storage.chain().chain_height();
		let start = inner.start_block_height();
		let result = if start >= tip {
			info!("Transactions are already synced to {}", tip);
			inner.finish_historical(tip).await
		} else {
			inner
				.historical_sync(start, tip)
				.instrument(info_span!("transactions_sync", from = start, to = tip))
				.await
		};
		inner.leave();
		result
	}

	pub fn start_continuous_sync(&self) -> Result<(), SyncError> {
		let inner = &self.inner;
		inner.enter(TransactionsSyncState::ContinuousSync)?;
		inner.stop.send_replace(false);

		let from = inner.start_block_height();
		let mut reader = TransactionsReader::new(
			inner.transport.clone(),
			TransactionsReaderOptions::from(&inner.config),
		);
		if let Err(e) = reader.start_continuous_sync(from, inner.keychain.watched_addresses()) {
			inner.leave();
			return Err(e);
		}

		let task_inner = inner.clone();
		let task = tokio::spawn(
			async move { task_inner.continuous_sync(reader).await }
				.instrument(info_span!("transactions_continuous", from)),
		);
		*lock(&inner.continuous_task) = Some(task);
		Ok(())
	}

	/// Stops syncing. Continuous sync first waits for parked merkle blocks to resolve.
	pub async fn stop_sync(&self) {
		self.inner.stop.send_replace(true);
		let task = lock(&self.inner.continuous_task).take();
		if let Some(task) = task {
			if let Err(e) = task.await {
				error!("Continuous transactions sync task failed: {}", e);
			}
		}
	}
}

impl TransactionsSyncInner {
	fn enter(&self, next: TransactionsSyncState) -> Result<(), SyncError> {
		let mut state = lock(&self.state);
		if *state != TransactionsSyncState::Idle {
			return Err(SyncError::usage(format!(
				"Unable to start {:?}: transactions sync is in {:?}",
				next, *state
			)));
		}
		*state = next;
		Ok(())
	}

	fn leave(&self) {
		*lock(&self.state) = TransactionsSyncState::Idle;
	}

	fn start_block_height(&self) -> u32 {
		let checkpoint = lock(&self.sync_checkpoint).unwrap_or(0);
		let chain = self.storage.chain();
		let height = if self.options.skip_synchronization {
			chain.chain_height()
		} else {
			let persisted = chain.last_synced_block_height().unwrap_or(0);
			persisted.max(self.options.skip_synchronization_before_height.unwrap_or(0))
		};
		height.max(checkpoint).max(1)
	}

	async fn historical_sync(&self, from: u32, to: u32) -> Result<(), SyncError> {
		let mut reader = TransactionsReader::new(
			self.transport.clone(),
			TransactionsReaderOptions::from(&self.config),
		);
		reader.start_historical_sync(from, to, self.keychain.watched_addresses())?;

		let mut pending: HashMap<String, Transaction> = HashMap::new();
		let mut synced_height = from;
		let mut throttle = ProgressThrottle::new(self.config.progress_update_interval());
		let mut stop = self.stop.subscribe();

		loop {
			tokio::select! {
				event = reader.next_event() => match event {
					Some(ReaderEvent::HistoricalTransactions(transactions))
					| Some(ReaderEvent::NewTransactions { transactions, .. }) => {
						debug!("{} transactions waiting for verification", transactions.len());
						for transaction in transactions {
							pending.insert(transaction.hash.clone(), transaction);
						}
					}
					Some(ReaderEvent::MerkleBlock { merkle_block, mut verdict }) => {
						if let Some(height) =
							self.verify_historical_block(&merkle_block, &mut verdict, &mut pending)?
						{
							synced_height = synced_height.max(height);
							throttle.schedule();
						}
					}
					Some(ReaderEvent::InstantLocks(locks)) => self.import_instant_locks(locks),
					Some(ReaderEvent::HistoricalDataObtained) => {
						if !pending.is_empty() {
							return Err(ValidationError::UnverifiedTransactions(pending.len()).into());
						}
						self.report_progress(to, from, to);
						return self.finish_historical(to).await;
					}
					Some(ReaderEvent::Error(e)) => return Err(e),
					Some(ReaderEvent::Stopped) | None => return Ok(()),
				},
				_ = stopped(&mut stop) => {
					reader.stop();
					info!("Historical transactions sync cancelled");
					return Ok(());
				}
				_ = throttle.wait() => {
					throttle.clear();
					self.report_progress(synced_height, from, to);
				}
			}
		}
	}

	/// Imports the pending transactions confirmed by `merkle_block` and settles its verdict.
	/// Returns the confirmed height, or `None` when the block was rejected.
	fn verify_historical_block(
		&self,
		merkle_block: &MerkleBlock,
		verdict: &mut MerkleBlockVerdict,
		pending: &mut HashMap<String, Transaction>,
	) -> Result<Option<u32>, SyncError> {
		let block_hash = merkle_block.block_hash();
		let metadata = match self.block_metadata(block_hash) {
			Ok(Some(metadata)) => metadata,
			Ok(None) => {
				let e = ValidationError::MissingHeaderMetadata(block_hash.to_string());
				verdict.reject(SyncError::MerkleBlockRejected(e.to_string()))?;
				return Ok(None);
			}
			Err(e) => {
				verdict.reject(SyncError::MerkleBlockRejected(e.to_string()))?;
				return Ok(None);
			}
		};

		let hashes = merkle_block.transaction_hashes();
		if let Some(missing) = pending.keys().find(|hash| !hashes.contains(*hash)) {
			let e = ValidationError::TransactionNotInBlock {
				tx: missing.clone(),
				block: block_hash.to_string(),
			};
			verdict.reject(SyncError::MerkleBlockRejected(e.to_string()))?;
			return Ok(None);
		}

		let height = metadata.height;
		let mut new_addresses = Vec::new();
		for (_, transaction) in pending.drain() {
			new_addresses.extend(self.import_transaction(transaction, Some(metadata.clone()))?);
		}
		verdict.accept(height, new_addresses)?;

		{
			let mut chain = self.storage.chain();
			chain.update_last_synced_block_height(height);
			chain.prune_headers_metadata(height);
		}
		*lock(&self.sync_checkpoint) = Some(height);
		self.storage.schedule_state_save();
		Ok(Some(height))
	}

	async fn finish_historical(&self, tip: u32) -> Result<(), SyncError> {
		if *self.stop.borrow() {
			return Ok(());
		}
		self.storage.chain().update_last_synced_block_height(tip);
		*lock(&self.sync_checkpoint) = Some(tip);
		self.storage.save_state().await?;
		info!("Historical transactions sync completed at {}", tip);
		Ok(())
	}

	async fn continuous_sync(self: Arc<Self>, mut reader: TransactionsReader) {
		let mut parked: Vec<ParkedBlock> = Vec::new();
		let mut tip = self.chain_tip.clone();
		let mut stop = self.stop.subscribe();

		loop {
			tokio::select! {
				event = reader.next_event() => match event {
					Some(ReaderEvent::NewTransactions { transactions, addresses }) => {
						if let Err(e) = self.import_unconfirmed(transactions, &addresses) {
							self.events.emit(TransactionsEvent::Error(e));
						}
					}
					Some(ReaderEvent::MerkleBlock { merkle_block, verdict }) => {
						match self.confirm_block(merkle_block, verdict) {
							Ok(Some(block)) => parked.push(block),
							Ok(None) => {}
							Err(e) => self.events.emit(TransactionsEvent::Error(e)),
						}
					}
					Some(ReaderEvent::InstantLocks(locks)) => self.import_instant_locks(locks),
					Some(ReaderEvent::Error(e)) => {
						error!("Continuous transactions sync failed: {}", e);
						self.events.emit(TransactionsEvent::Error(e));
						break;
					}
					Some(ReaderEvent::Stopped) | None => break,
					Some(ReaderEvent::HistoricalTransactions(_))
					| Some(ReaderEvent::HistoricalDataObtained) => {}
				},
				_ = tip_changed(&mut tip) => {
					parked = self.retry_parked(parked);
				}
				_ = stopped(&mut stop) => break,
			}
		}

		self.drain_parked(parked).await;
		reader.stop();
		self.leave();
	}

	/// Waits for parked blocks to resolve, then rejects what is left
	async fn drain_parked(&self, mut parked: Vec<ParkedBlock>) {
		for _ in 0..self.config.stop_drain_polls {
			if parked.is_empty() {
				return;
			}
			tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
			parked = self.retry_parked(parked);
		}
		for (merkle_block, mut verdict) in parked {
			warn!("Dropping merkle block {} without a known header", merkle_block.block_hash());
			let _ = verdict.reject(SyncError::MerkleBlockRejected(format!(
				"header of block {} was not received before stop",
				merkle_block.block_hash()
			)));
		}
	}

	fn retry_parked(&self, parked: Vec<ParkedBlock>) -> Vec<ParkedBlock> {
		let mut still_parked = Vec::new();
		for (merkle_block, verdict) in parked {
			match self.confirm_block(merkle_block, verdict) {
				Ok(Some(block)) => still_parked.push(block),
				Ok(None) => {}
				Err(e) => self.events.emit(TransactionsEvent::Error(e)),
			}
		}
		still_parked
	}

	/// Confirms the wallet transactions in a continuous merkle block. The block is handed back
	/// when its header is not known yet.
	fn confirm_block(
		&self,
		merkle_block: MerkleBlock,
		mut verdict: MerkleBlockVerdict,
	) -> Result<Option<ParkedBlock>, SyncError> {
		let block_hash = merkle_block.block_hash().to_string();
		let metadata = match self.block_metadata(&block_hash) {
			Ok(Some(metadata)) => metadata,
			Ok(None) => {
				debug!("Parking merkle block {} until its header arrives", block_hash);
				return Ok(Some((merkle_block, verdict)));
			}
			Err(e) => {
				verdict.reject(SyncError::MerkleBlockRejected(e.to_string()))?;
				return Ok(None);
			}
		};

		let checkpoint = lock(&self.sync_checkpoint).unwrap_or(0);
		if metadata.height <= checkpoint {
			debug!("Ignoring merkle block {} at {}", block_hash, metadata.height);
			return Ok(None);
		}

		let confirmed: Vec<Transaction> = {
			let chain = self.storage.chain();
			merkle_block
				.transaction_hashes()
				.iter()
				.filter_map(|hash| chain.transaction(hash))
				.filter(|record| record.metadata.is_none())
				.map(|record| record.transaction.clone())
				.collect()
		};

		let mut new_addresses = Vec::new();
		for transaction in confirmed {
			new_addresses.extend(self.import_transaction(transaction.clone(), Some(metadata.clone()))?);
			self.events.emit(TransactionsEvent::ConfirmedTransaction(transaction));
		}
		verdict.accept(metadata.height, new_addresses)?;

		{
			let mut chain = self.storage.chain();
			chain.update_last_synced_block_height(metadata.height);
			chain.prune_headers_metadata(metadata.height);
		}
		*lock(&self.sync_checkpoint) = Some(metadata.height);
		self.storage.schedule_state_save();
		Ok(None)
	}

	fn import_unconfirmed(
		&self,
		transactions: Vec<Transaction>,
		addresses: &AddressAppender,
	) -> Result<(), SyncError> {
		let mut new_addresses = Vec::new();
		for transaction in transactions {
			new_addresses.extend(self.import_transaction(transaction, None)?);
		}
		addresses.append(new_addresses);
		self.storage.schedule_state_save();
		Ok(())
	}

	/// Stores a transaction and marks the wallet addresses it touches as used. Returns the
	/// addresses issued to keep the gap.
	fn import_transaction(
		&self,
		transaction: Transaction,
		metadata: Option<TransactionMetadata>,
	) -> Result<Vec<String>, SyncError> {
		let affected = self.storage.import_transaction(transaction, metadata);
		let mut new_addresses = Vec::new();
		for address in affected {
			new_addresses.extend(self.keychain.mark_address_as_used(&address)?);
		}
		Ok(new_addresses)
	}

	fn import_instant_locks(&self, locks: Vec<InstantLock>) {
		if locks.is_empty() {
			return;
		}
		for instant_lock in locks {
			let txid = instant_lock.txid.clone();
			self.storage.chain().import_instant_lock(instant_lock);
			self.events.emit(TransactionsEvent::InstantLocked(txid));
		}
		self.storage.schedule_state_save();
	}

	fn block_metadata(&self, block_hash: &str) -> Result<Option<TransactionMetadata>, ValidationError> {
		let chain = self.storage.chain();
		self.mediator.transaction_metadata(&chain, block_hash)
	}

	fn report_progress(&self, synced_height: u32, from: u32, to: u32) {
		let total_blocks_count = to - from;
		let synced_blocks_count = synced_height.saturating_sub(from).min(total_blocks_count);
		let transactions_count = self.storage.chain().transactions_count();
		self.events.emit(TransactionsEvent::Progress(TransactionsSyncProgress {
			progress: percent(synced_blocks_count, total_blocks_count),
			synced_blocks_count,
			total_blocks_count,
			transactions_count,
		}));
	}
}

/// Resolves when the chain tip moves. Never resolves once the header worker is gone.
async fn tip_changed(tip: &mut watch::Receiver<u32>) {
	if tip.changed().await.is_err() {
		std::future::pending::<()>().await;
	}
}

#[async_trait::async_trait]
impl Worker for TransactionsSyncWorker {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	async fn on_start(&self) -> Result<(), SyncError> {
		self.sync_historical().await.inspect_err(|e| {
			error!("Historical transactions sync failed: {}", e);
		})
	}

	async fn execute(&self) -> Result<(), SyncError> {
		self.start_continuous_sync()
	}

	async fn on_stop(&self) -> Result<(), SyncError> {
		self.stop_sync().await;
		Ok(())
	}
}
