use super::spv_chain::SpvChain;
use crate::config::HeadersSyncConfig;
use crate::error::{SyncError, ValidationError};
use crate::transport::{CoreTransport, HeaderBatch, RangeOptions, StatusCode, TransportError};
use crate::types::BlockHeader;

use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeadersProviderOptions {
	pub max_parallel_streams: usize,
	pub target_batch_size: u32,
	pub max_retries: u32,
}

impl From<&HeadersSyncConfig> for BlockHeadersProviderOptions {
	fn from(config: &HeadersSyncConfig) -> Self {
		Self {
			max_parallel_streams: config.max_parallel_streams.max(1),
			target_batch_size: config.target_batch_size.max(1),
			max_retries: config.max_retries,
		}
	}
}

#[derive(Debug)]
pub enum ProviderEvent {
	/// Headers that joined the longest chain. Empty when a batch was only retained as orphans.
	ChainUpdated {
		headers: Vec<BlockHeader>,
		batch_head_height: u32,
	},
	HistoricalDataObtained,
	Error(SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
	Idle,
	Historical { to: u32 },
	Continuous,
}

/// Height range served by one subscription
#[derive(Debug, Clone)]
struct Partition {
	next_height: u32,
	/// Inclusive; `None` for the open-ended continuous stream
	end_height: Option<u32>,
	retries: u32,
	generation: u32,
}

impl Partition {
	fn range(&self) -> RangeOptions {
		RangeOptions {
			from_block_height: self.next_height,
			count: self
				.end_height
				.map(|end| end + 1 - self.next_height)
				.unwrap_or(0),
		}
	}
}

type TaggedBatch = ((usize, u32), Option<Result<HeaderBatch, TransportError>>);

/// Reads headers from range-partitioned concurrent subscriptions into an [`SpvChain`]
pub struct BlockHeadersProvider {
	transport: Arc<dyn CoreTransport>,
	options: BlockHeadersProviderOptions,
	chain: Option<SpvChain>,
	partitions: HashMap<usize, Partition>,
	streams: SelectAll<BoxStream<'static, TaggedBatch>>,
	mode: Mode,
}

impl BlockHeadersProvider {
	pub fn new(transport: Arc<dyn CoreTransport>, options: BlockHeadersProviderOptions) -> Self {
		Self {
			transport,
			options,
			chain: None,
			partitions: HashMap::new(),
			streams: SelectAll::new(),
			mode: Mode::Idle,
		}
	}

	pub fn chain(&self) -> Option<&SpvChain> {
		self.chain.as_ref()
	}

	/// Continues on top of a chain kept from an earlier read
	pub fn with_chain(mut self, chain: SpvChain) -> Self {
		self.chain = Some(chain);
		self
	}

	pub fn take_chain(&mut self) -> Option<SpvChain> {
		self.chain.take()
	}

	/// Whether a subscription is still tracked
	pub fn is_streaming(&self) -> bool {
		!self.partitions.is_empty()
	}

	/// Starts reading `(from, to]` on top of the header at `from`
	pub async fn read_historical(&mut self, from: u32, to: u32) -> Result<(), SyncError> {
		if self.mode != Mode::Idle {
			return Err(SyncError::usage("Header provider is already reading"));
		}
		if to <= from {
			return Err(ValidationError::InvalidBlockCount(i64::from(to) - i64::from(from)).into());
		}

		let root = self.transport.get_block_header_by_height(from).await?;
		self.chain = Some(SpvChain::new(root, from));

		let total = to - from;
		let num_streams = ((f64::from(total) / f64::from(self.options.target_batch_size)).round()
			as usize)
			.clamp(1, self.options.max_parallel_streams);
		let batch_size = total.div_ceil(num_streams as u32);

		info!(
			"Reading headers {}..={} over {} streams of up to {} headers",
			from + 1,
			to,
			num_streams,
			batch_size
		);

		self.mode = Mode::Historical { to };
		let mut start = from + 1;
		let mut id = 0;
		while start <= to {
			let end = (start + batch_size - 1).min(to);
			self.partitions.insert(
				id,
				Partition {
					next_height: start,
					end_height: Some(end),
					retries: 0,
					generation: 0,
				},
			);
			self.subscribe(id);
			start = end + 1;
			id += 1;
		}
		Ok(())
	}

	/// Follows new headers above `from`
	pub async fn start_continuous_sync(&mut self, from: u32) -> Result<(), SyncError> {
		if self.mode != Mode::Idle {
			return Err(SyncError::usage("Header provider is already reading"));
		}

		let chain_is_current = self
			.chain
			.as_ref()
			.is_some_and(|chain| chain.tip_height() == from);
		if !chain_is_current {
			let root = self.transport.get_block_header_by_height(from).await?;
			self.chain = Some(SpvChain::new(root, from));
		}

		self.mode = Mode::Continuous;
		self.partitions.insert(
			0,
			Partition {
				next_height: from + 1,
				end_height: None,
				retries: 0,
				generation: 0,
			},
		);
		self.subscribe(0);
		Ok(())
	}

	/// Queues the partition's subscription. The request itself runs when the stream is polled,
	/// so `next_event` stays cancel safe.
	fn subscribe(&mut self, id: usize) {
		let Some(partition) = self.partitions.get(&id) else {
			return;
		};
		let range = partition.range();
		let key = (id, partition.generation);
		debug!(
			"Subscribing headers partition {} from {} (count {})",
			id, range.from_block_height, range.count
		);

		let transport = self.transport.clone();
		let batches = stream::once(async move { transport.subscribe_block_headers(range).await })
			.flat_map(|subscribed| match subscribed {
				Ok(batches) => batches,
				Err(e) => stream::iter([Err(e)]).boxed(),
			});
		let tagged = batches
			.map(move |item| (key, Some(item)))
			.chain(stream::once(async move { (key, None) }))
			.boxed();
		self.streams.push(tagged);
	}

	/// Drops every subscription. Returns whether any was live.
	pub fn stop(&mut self) -> bool {
		let was_streaming = self.is_streaming();
		self.partitions.clear();
		self.streams = SelectAll::new();
		self.mode = Mode::Idle;
		was_streaming
	}

	/// Waits for the next provider event. `None` once nothing is subscribed.
	pub async fn next_event(&mut self) -> Option<ProviderEvent> {
		loop {
			if self.partitions.is_empty() {
				return None;
			}
			let ((id, generation), item) = self.streams.next().await?;
			let Some(partition) = self.partitions.get(&id) else {
				continue;
			};
			if partition.generation != generation {
				continue;
			}

			match item {
				Some(Ok(batch)) => {
					if let Some(event) = self.handle_batch(id, batch) {
						return Some(event);
					}
				}
				Some(Err(e)) => {
					if let Some(event) = self.retry(id, e) {
						return Some(event);
					}
				}
				None => {
					if let Some(event) = self.handle_end(id) {
						return Some(event);
					}
				}
			}
		}
	}

	fn handle_batch(&mut self, id: usize, batch: HeaderBatch) -> Option<ProviderEvent> {
		if let Some(partition) = self.partitions.get_mut(&id) {
			let batch_end = batch.batch_head_height + batch.headers.len() as u32;
			partition.next_height = partition.next_height.max(batch_end);
			partition.retries = 0;
		}

		let Some(chain) = self.chain.as_mut() else {
			self.stop();
			return Some(ProviderEvent::Error(
				crate::error::ChainError::NotInitialized.into(),
			));
		};
		match chain.add_headers(batch.headers) {
			Ok(headers) => Some(ProviderEvent::ChainUpdated {
				batch_head_height: headers
					.first()
					.map(|header| header.height)
					.unwrap_or(batch.batch_head_height),
				headers,
			}),
			Err(e) => {
				self.stop();
				Some(ProviderEvent::Error(e.into()))
			}
		}
	}

	/// Resubscribes the partition from its next unreceived height if retries remain
	fn retry(&mut self, id: usize, error: TransportError) -> Option<ProviderEvent> {
		let max_retries = self.options.max_retries;
		let retryable = error.is_retryable();
		let Some(partition) = self.partitions.get_mut(&id) else {
			return None;
		};
		if !retryable || partition.retries >= max_retries {
			warn!("Headers partition {} failed: {}", id, error);
			self.stop();
			return Some(ProviderEvent::Error(error.into()));
		}

		partition.retries += 1;
		partition.generation += 1;
		warn!(
			"Headers partition {} failed ({}), retrying from {} ({}/{})",
			id, error, partition.next_height, partition.retries, max_retries
		);
		self.subscribe(id);
		None
	}

	fn handle_end(&mut self, id: usize) -> Option<ProviderEvent> {
		let partition = self.partitions.get(&id)?.clone();
		match (self.mode, partition.end_height) {
			(Mode::Historical { .. }, Some(end)) if partition.next_height <= end => {
				let error = TransportError::new(
					StatusCode::Unavailable,
					format!("Headers stream ended at {} before {}", partition.next_height, end),
				);
				self.retry(id, error)
			}
			(Mode::Historical { to }, _) => {
				self.partitions.remove(&id);
				if !self.partitions.is_empty() {
					return None;
				}
				self.mode = Mode::Idle;
				self.streams = SelectAll::new();

				let tip = self.chain.as_ref().map_or(0, SpvChain::tip_height);
				if tip < to {
					return Some(ProviderEvent::Error(
						ValidationError::IncompleteHeaderChain { tip, expected: to }.into(),
					));
				}
				Some(ProviderEvent::HistoricalDataObtained)
			}
			_ => {
				let error = TransportError::new(
					StatusCode::Unavailable,
					"Continuous headers stream ended unexpectedly",
				);
				self.retry(id, error)
			}
		}
	}
}
