use super::provider::{BlockHeadersProvider, BlockHeadersProviderOptions, ProviderEvent};
use super::spv_chain::SpvChain;
use crate::config::{HeadersSyncConfig, SyncOptions};
use crate::error::{SyncError, ValidationError};
use crate::events::{EventSender, HeadersEvent};
use crate::storage::{Storage, lock};
use crate::sync::progress::{HeadersSyncProgress, ProgressThrottle, SyncProgress};
use crate::sync::stopped;
use crate::transport::CoreTransport;
use crate::types::BlockHeader;
use crate::worker::{Capability, Dependency, InjectionOrder, PluginDescriptor, Worker};

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersSyncState {
	Idle,
	HistoricalSync,
	ContinuousSync,
}

struct HeadersSyncInner {
	transport: Arc<dyn CoreTransport>,
	storage: Arc<Storage>,
	events: EventSender,
	config: HeadersSyncConfig,
	options: SyncOptions,
	state: Mutex<HeadersSyncState>,
	/// Height the last historical run completed at
	sync_checkpoint: Mutex<Option<u32>>,
	/// Lowest height continuous sync accepts
	continuous_floor: Mutex<Option<u32>>,
	/// Chain kept between historical and continuous sync
	chain: Mutex<Option<SpvChain>>,
	chain_tip: watch::Sender<u32>,
	stop: watch::Sender<bool>,
	continuous_task: Mutex<Option<JoinHandle<()>>>,
}

/// Synchronizes block headers: a historical read during `on_start`, then a continuous
/// subscription started by `execute`.
#[derive(Clone)]
pub struct BlockHeadersSyncWorker {
	inner: Arc<HeadersSyncInner>,
}

impl BlockHeadersSyncWorker {
	pub const NAME: &'static str = "BlockHeadersSyncWorker";

	pub fn new(
		transport: Arc<dyn CoreTransport>,
		storage: Arc<Storage>,
		events: EventSender,
		config: HeadersSyncConfig,
		options: SyncOptions,
	) -> Self {
		let tip = storage.chain().chain_height();
		let (chain_tip, _) = watch::channel(tip);
		let (stop, _) = watch::channel(false);
		Self {
			inner: Arc::new(HeadersSyncInner {
				transport,
				storage,
				events,
				config,
				options,
				state: Mutex::new(HeadersSyncState::Idle),
				sync_checkpoint: Mutex::new(None),
				continuous_floor: Mutex::new(None),
				chain: Mutex::new(None),
				chain_tip,
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
				Dependency::Capability(Capability::Events),
			],
			order: InjectionOrder::default(),
		}
	}

	pub fn state(&self) -> HeadersSyncState {
		*lock(&self.inner.state)
	}

	/// Height the header chain is synced to, published on every change
	pub fn subscribe_chain_tip(&self) -> watch::Receiver<u32> {
		self.inner.chain_tip.subscribe()
	}

	pub fn start_block_height(&self, tip: u32) -> u32 {
		self.inner.start_block_height(tip)
	}

	/// Runs historical sync up to the chain height known to storage
	pub async fn sync_historical(&self) -> Result<(), SyncError> {
		let inner = &self.inner;
		let tip = inner.storage.chain().chain_height();
		if tip < 1 {
			return Err(ValidationError::InvalidBestHeight(i64::from(tip)).into());
		}
		let start = inner.start_block_height(tip);
		if start > tip {
			return Err(ValidationError::StartAboveTip { start, tip }.into());
		}

		inner.enter(HeadersSyncState::HistoricalSync)?;
		inner.stop.send_replace(false);
		let result = if start == tip {
			info!("Headers are already synced to {}", tip);
			inner.finish_historical(None, tip).await
		} else {
			inner
				.historical_sync(start, tip)
				.instrument(info_span!("headers_sync", from = start, to = tip))
				.await
		};
		inner.leave();
		result
	}

	/// Spawns the continuous sync loop from the synced height
	pub async fn start_continuous_sync(&self) -> Result<(), SyncError> {
		let inner = &self.inner;
		inner.enter(HeadersSyncState::ContinuousSync)?;
		inner.stop.send_replace(false);

		let from = lock(&inner.sync_checkpoint)
			.unwrap_or_else(|| inner.storage.chain().chain_height());
		*lock(&inner.continuous_floor) = Some(from);

		let mut provider = BlockHeadersProvider::new(
			inner.transport.clone(),
			BlockHeadersProviderOptions::from(&inner.config),
		);
		if let Some(chain) = lock(&inner.chain).take() {
			provider = provider.with_chain(chain);
		}
		if let Err(e) = provider.start_continuous_sync(from).await {
			inner.leave();
			return Err(e);
		}

		info!("Following new block headers from {}", from);
		let task_inner = inner.clone();
		let task = tokio::spawn(
			async move { task_inner.continuous_sync(provider).await }
				.instrument(info_span!("headers_continuous", from)),
		);
		*lock(&inner.continuous_task) = Some(task);
		Ok(())
	}

	/// Applies a batch of new tip headers. Returns whether the chain height advanced.
	pub fn continuous_chain_update(
		&self,
		headers: &[BlockHeader],
		batch_head_height: u32,
	) -> Result<bool, ValidationError> {
		self.inner.continuous_chain_update(headers, batch_head_height)
	}

	/// Cancels any running stream and waits for the continuous loop to wind down
	pub async fn stop_sync(&self) {
		self.inner.stop.send_replace(true);
		let task = lock(&self.inner.continuous_task).take();
		if let Some(task) = task {
			if let Err(e) = task.await {
				error!("Continuous headers sync task failed: {}", e);
			}
		}
	}
}

impl HeadersSyncInner {
	fn enter(&self, next: HeadersSyncState) -> Result<(), SyncError> {
		let mut state = lock(&self.state);
		if *state != HeadersSyncState::Idle {
			return Err(SyncError::usage(format!(
				"Unable to start {:?}: headers sync is in {:?}",
				next, *state
			)));
		}
		*state = next;
		Ok(())
	}

	fn leave(&self) {
		*lock(&self.state) = HeadersSyncState::Idle;
	}

	fn start_block_height(&self, tip: u32) -> u32 {
		let checkpoint = *lock(&self.sync_checkpoint);
		let height = if self.options.skip_synchronization {
			tip.saturating_sub(self.config.max_headers_to_keep as u32)
		} else {
			let persisted = self.storage.chain().last_synced_header_height().unwrap_or(1);
			persisted.max(self.options.skip_synchronization_before_height.unwrap_or(0))
		};
		height.max(checkpoint.unwrap_or(0)).max(1)
	}

	async fn historical_sync(&self, from: u32, to: u32) -> Result<(), SyncError> {
		let mut provider = BlockHeadersProvider::new(
			self.transport.clone(),
			BlockHeadersProviderOptions::from(&self.config),
		);
		provider.read_historical(from, to).await?;

		let total = to - from;
		let mut throttle = ProgressThrottle::new(self.config.progress_update_interval());
		let mut stop = self.stop.subscribe();

		loop {
			tokio::select! {
				event = provider.next_event() => match event {
					Some(ProviderEvent::ChainUpdated { headers, .. }) => {
						self.historical_chain_update(&headers);
						throttle.schedule();
					}
					Some(ProviderEvent::HistoricalDataObtained) => {
						self.report_progress(provider.chain(), total);
						return self.finish_historical(provider.take_chain(), to).await;
					}
					Some(ProviderEvent::Error(e)) => {
						provider.stop();
						return Err(e);
					}
					None => {
						debug!("Historical headers sync stopped");
						return Ok(());
					}
				},
				_ = stopped(&mut stop) => {
					if provider.stop() {
						info!("Historical headers sync cancelled");
					}
					return Ok(());
				}
				_ = throttle.wait() => {
					throttle.clear();
					self.report_progress(provider.chain(), total);
				}
			}
		}
	}

	fn historical_chain_update(&self, headers: &[BlockHeader]) {
		let Some(last) = headers.last() else {
			return;
		};
		{
			let mut chain = self.storage.chain();
			chain.push_block_headers(headers.iter().cloned());
			chain.update_headers_metadata(headers);
			chain.update_last_synced_header_height(last.height);
		}
		self.storage.schedule_state_save();
	}

	async fn finish_historical(&self, chain: Option<SpvChain>, tip: u32) -> Result<(), SyncError> {
		let keep = self.config.max_headers_to_keep;
		let chain = chain.map(|mut chain| {
			chain.prune_to(keep);
			chain
		});
		{
			let mut state = self.storage.chain();
			if let Some(chain) = &chain {
				state.set_block_headers(chain.longest_chain().iter().cloned());
			}
			state.update_last_synced_header_height(tip);
			if state.chain_height() < tip {
				state.update_chain_height(tip);
			}
		}
		*lock(&self.sync_checkpoint) = Some(tip);
		*lock(&self.chain) = chain;
		self.chain_tip.send_replace(tip);

		self.storage.save_state().await?;
		info!("Historical headers sync completed at {}", tip);
		Ok(())
	}

	async fn continuous_sync(self: Arc<Self>, mut provider: BlockHeadersProvider) {
		let mut stop = self.stop.subscribe();
		loop {
			tokio::select! {
				event = provider.next_event() => match event {
					Some(ProviderEvent::ChainUpdated { headers, batch_head_height }) => {
						if headers.is_empty() {
							continue;
						}
						if let Err(e) = self.continuous_chain_update(&headers, batch_head_height) {
							error!("Continuous headers sync failed: {}", e);
							self.events.emit(HeadersEvent::Error(e.into()));
							provider.stop();
							break;
						}
					}
					Some(ProviderEvent::HistoricalDataObtained) => {}
					Some(ProviderEvent::Error(e)) => {
						error!("Continuous headers stream failed: {}", e);
						self.events.emit(HeadersEvent::Error(e));
						break;
					}
					None => break,
				},
				_ = stopped(&mut stop) => {
					if provider.stop() {
						info!("Continuous headers sync cancelled");
					}
					break;
				}
			}
		}
		*lock(&self.chain) = provider.take_chain();
		self.leave();
	}

	fn continuous_chain_update(
		&self,
		headers: &[BlockHeader],
		batch_head_height: u32,
	) -> Result<bool, ValidationError> {
		if headers.is_empty() {
			return Err(ValidationError::EmptyHeaderBatch(batch_head_height));
		}
		let new_height = batch_head_height + headers.len() as u32 - 1;
		let floor = lock(&self.continuous_floor).unwrap_or(0);

		let mut chain = self.storage.chain();
		let current = chain.chain_height();
		if new_height < floor {
			return Err(ValidationError::HeightDecrease {
				new: new_height,
				current,
			});
		}
		if new_height <= current {
			debug!("Ignoring stale headers up to {} (tip {})", new_height, current);
			return Ok(false);
		}
		if batch_head_height > current + 1 {
			return Err(ValidationError::HeaderGap {
				head: batch_head_height,
				current,
			});
		}

		let fresh = &headers[(current + 1).saturating_sub(batch_head_height) as usize..];
		chain.update_chain_height(new_height);
		chain.push_block_headers(fresh.iter().cloned());
		chain.update_headers_metadata(fresh);
		chain.update_last_synced_header_height(new_height);
		drop(chain);

		self.storage.schedule_state_save();
		self.events.emit(HeadersEvent::BlockHeightChanged(new_height));
		for header in fresh {
			self.events.emit(HeadersEvent::NewBlock(header.clone()));
		}
		self.chain_tip.send_replace(new_height);
		Ok(true)
	}

	fn report_progress(&self, chain: Option<&SpvChain>, total: u32) {
		let Some(chain) = chain else {
			return;
		};
		let confirmed = chain.confirmed_count().min(total);
		let total_synced = (chain.confirmed_count() + chain.orphan_count()).min(total);

		match HeadersSyncProgress::from_counts(confirmed, total_synced, total) {
			Ok(progress) => self.events.emit(HeadersEvent::Progress(progress)),
			Err(e) => self.events.emit(HeadersEvent::Error(e.into())),
		}
		if let Ok(progress) = SyncProgress::from_counts(confirmed, total_synced, total) {
			self.events.emit(HeadersEvent::SyncProgress(progress));
		}
	}
}

#[async_trait::async_trait]
impl Worker for BlockHeadersSyncWorker {
	fn name(&self) -> &'static str {
		Self::NAME
	}

	async fn on_start(&self) -> Result<(), SyncError> {
		self.sync_historical().await.inspect_err(|e| {
			error!("Historical headers sync failed: {}", e);
		})
	}

	async fn execute(&self) -> Result<(), SyncError> {
		self.start_continuous_sync().await
	}

	async fn on_stop(&self) -> Result<(), SyncError> {
		self.stop_sync().await;
		Ok(())
	}
}
