use crate::bloom::BloomFilter;
use crate::config::TransactionsSyncConfig;
use crate::error::{SyncError, ValidationError, VerdictError};
use crate::transport::{
	CoreTransport, RangeOptions, StreamChunk, StreamEvent, SubscriptionArgs, TransportError,
	TxStream,
};
use crate::types::{InstantLock, MerkleBlock, Transaction};

use futures::stream::{self, StreamExt};
use itertools::Itertools;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionsReaderOptions {
	pub max_retries: u32,
	pub false_positive_rate: f64,
}

impl From<&TransactionsSyncConfig> for TransactionsReaderOptions {
	fn from(config: &TransactionsSyncConfig) -> Self {
		Self {
			max_retries: config.max_retries,
			false_positive_rate: config.false_positive_rate,
		}
	}
}

#[derive(Debug)]
enum ReaderCommand {
	Accept {
		stream_id: u64,
		height: u32,
		new_addresses: Vec<String>,
	},
	Reject {
		stream_id: u64,
		error: SyncError,
	},
	AppendAddresses(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerdictState {
	Pending,
	Accepted,
	Rejected,
}

/// Single-use decision on a surfaced merkle block. Exactly one of `accept` or `reject` may be
/// called, once.
#[derive(Debug)]
pub struct MerkleBlockVerdict {
	stream_id: u64,
	commands: mpsc::UnboundedSender<ReaderCommand>,
	state: VerdictState,
}

impl MerkleBlockVerdict {
	/// Confirms the block at `height`. Addresses derived while processing it widen the filter.
	pub fn accept(&mut self, height: u32, new_addresses: Vec<String>) -> Result<(), VerdictError> {
		match self.state {
			VerdictState::Accepted => return Err(VerdictError::AlreadyAccepted),
			VerdictState::Rejected => return Err(VerdictError::AcceptRejected),
			VerdictState::Pending => {}
		}
		self.state = VerdictState::Accepted;
		// A closed channel means the reader is gone and nothing is left to confirm.
		let _ = self.commands.send(ReaderCommand::Accept {
			stream_id: self.stream_id,
			height,
			new_addresses,
		});
		Ok(())
	}

	/// Destroys the stream the block came from with `error`
	pub fn reject(&mut self, error: SyncError) -> Result<(), VerdictError> {
		match self.state {
			VerdictState::Accepted => return Err(VerdictError::RejectAccepted),
			VerdictState::Rejected => return Err(VerdictError::AlreadyRejected),
			VerdictState::Pending => {}
		}
		self.state = VerdictState::Rejected;
		let _ = self.commands.send(ReaderCommand::Reject {
			stream_id: self.stream_id,
			error,
		});
		Ok(())
	}

	pub fn is_resolved(&self) -> bool {
		self.state != VerdictState::Pending
	}
}

/// Reports addresses derived while processing continuous transactions
#[derive(Debug, Clone)]
pub struct AddressAppender {
	commands: mpsc::UnboundedSender<ReaderCommand>,
}

impl AddressAppender {
	pub fn append(&self, addresses: Vec<String>) {
		if !addresses.is_empty() {
			let _ = self.commands.send(ReaderCommand::AppendAddresses(addresses));
		}
	}
}

#[derive(Debug)]
pub enum ReaderEvent {
	HistoricalTransactions(Vec<Transaction>),
	NewTransactions {
		transactions: Vec<Transaction>,
		addresses: AddressAppender,
	},
	MerkleBlock {
		merkle_block: MerkleBlock,
		verdict: MerkleBlockVerdict,
	},
	InstantLocks(Vec<InstantLock>),
	HistoricalDataObtained,
	Error(SyncError),
	Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionMode {
	/// `last` is the inclusive end of the requested window. Restarts and retries keep it.
	Historical { last: u32 },
	Continuous,
}

/// One logical sync run. Survives restarts and retries of the underlying stream.
struct SyncSession {
	mode: SessionMode,
	from: u32,
	count: u32,
	/// Lowest height a continuous accept may report
	floor: u32,
	addresses: Vec<String>,
	address_set: HashSet<String>,
	args: SubscriptionArgs,
	stream: TxStream,
	/// Cleared before a deliberate cancel so the resulting error is not mistaken for a fault
	active_stream_id: Option<u64>,
	retries: u32,
	last_confirmed: Option<u32>,
	pending_expansion: Vec<String>,
	stopping: bool,
}

impl SyncSession {
	fn resume_height(&self) -> u32 {
		self.last_confirmed.map_or(self.from, |height| height + 1)
	}

	fn new_addresses(&self, candidates: impl IntoIterator<Item = String>) -> Vec<String> {
		candidates
			.into_iter()
			.filter(|address| !self.address_set.contains(address))
			.unique()
			.collect()
	}
}

enum Step {
	Command(ReaderCommand),
	Stream(Option<StreamEvent>),
}

/// Reads the transaction stream for one wallet.
///
/// The reader owns the subscription; merkle block verdicts and appended addresses come back
/// through a command channel and are applied before the next stream item is read.
pub struct TransactionsReader {
	transport: Arc<dyn CoreTransport>,
	options: TransactionsReaderOptions,
	commands_tx: mpsc::UnboundedSender<ReaderCommand>,
	commands_rx: mpsc::UnboundedReceiver<ReaderCommand>,
	session: Option<SyncSession>,
	next_stream_id: u64,
}

impl TransactionsReader {
	pub fn new(transport: Arc<dyn CoreTransport>, options: TransactionsReaderOptions) -> Self {
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		Self {
			transport,
			options,
			commands_tx,
			commands_rx,
			session: None,
			next_stream_id: 0,
		}
	}

	pub fn is_active(&self) -> bool {
		self.session.is_some()
	}

	/// Addresses the current subscription filters on
	pub fn addresses(&self) -> &[String] {
		self.session
			.as_ref()
			.map_or(&[], |session| session.addresses.as_slice())
	}

	pub fn start_historical_sync(
		&mut self,
		from: u32,
		to: u32,
		addresses: Vec<String>,
	) -> Result<(), SyncError> {
		if self.session.is_some() {
			return Err(SyncError::usage("Historical sync has already been started"));
		}
		validate_start(from, &addresses)?;
		let count = i64::from(to) - i64::from(from) + 1;
		if count <= 0 {
			return Err(ValidationError::InvalidBlockCount(count).into());
		}

		info!("Starting historical transactions sync {}..={}", from, to);
		self.start_session(SessionMode::Historical { last: to }, from, count as u32, addresses)
	}

	pub fn start_continuous_sync(&mut self, from: u32, addresses: Vec<String>) -> Result<(), SyncError> {
		if self.session.is_some() {
			return Err(SyncError::usage("Continuous sync has already been started"));
		}
		validate_start(from, &addresses)?;

		info!("Starting continuous transactions sync from {}", from);
		self.start_session(SessionMode::Continuous, from, 0, addresses)
	}

	fn start_session(
		&mut self,
		mode: SessionMode,
		from: u32,
		count: u32,
		addresses: Vec<String>,
	) -> Result<(), SyncError> {
		let addresses: Vec<String> = addresses.into_iter().unique().collect();
		let args = SubscriptionArgs {
			bloom_filter: BloomFilter::for_addresses(&addresses, self.options.false_positive_rate)?,
			range: RangeOptions {
				from_block_height: from,
				count,
			},
		};
		let (stream_id, stream) = self.open_stream(mode, args.clone());
		self.session = Some(SyncSession {
			mode,
			from,
			count,
			floor: from,
			address_set: addresses.iter().cloned().collect(),
			addresses,
			args,
			stream,
			active_stream_id: Some(stream_id),
			retries: 0,
			last_confirmed: None,
			pending_expansion: Vec::new(),
			stopping: false,
		});
		Ok(())
	}

	/// Opens a stream lazily: the transport is asked for it on first poll
	fn open_stream(&mut self, mode: SessionMode, args: SubscriptionArgs) -> (u64, TxStream) {
		self.next_stream_id += 1;
		let transport = self.transport.clone();
		let opened = stream::once(async move {
			match mode {
				SessionMode::Historical { .. } => transport.create_historical_sync_stream(args).await,
				SessionMode::Continuous => transport.create_continuous_sync_stream(args).await,
			}
		})
		.flat_map(|opened| match opened {
			Ok(stream) => stream::unfold(stream, |mut stream| async move {
				stream.next().await.map(|event| (event, stream))
			})
			.boxed(),
			Err(e) => stream::iter([StreamEvent::Error(e)]).boxed(),
		});
		(self.next_stream_id, TxStream::new(opened.boxed()))
	}

	/// Cancels the subscription. The next event is `Stopped`.
	pub fn stop(&mut self) -> bool {
		let Some(session) = self.session.as_mut() else {
			return false;
		};
		session.stopping = true;
		session.active_stream_id = None;
		session.stream.cancel();
		true
	}

	/// Waits for the next event. `None` once no session is running.
	pub async fn next_event(&mut self) -> Option<ReaderEvent> {
		loop {
			let Self {
				commands_rx,
				session,
				..
			} = &mut *self;
			let session = session.as_mut()?;

			let step = tokio::select! {
				biased;
				Some(command) = commands_rx.recv() => Step::Command(command),
				event = session.stream.next() => Step::Stream(event),
			};

			let event = match step {
				Step::Command(command) => self.handle_command(command),
				Step::Stream(Some(event)) => self.handle_stream_event(event),
				Step::Stream(None) => self.handle_exhausted(),
			};
			if event.is_some() {
				return event;
			}
		}
	}

	fn handle_command(&mut self, command: ReaderCommand) -> Option<ReaderEvent> {
		let session = self.session.as_mut()?;
		match command {
			ReaderCommand::AppendAddresses(addresses) => {
				let added = session.new_addresses(addresses);
				for address in added {
					if !session.pending_expansion.contains(&address) {
						session.pending_expansion.push(address);
					}
				}
				None
			}
			ReaderCommand::Reject { stream_id, error } => {
				if session.active_stream_id != Some(stream_id) {
					debug!("Ignoring verdict for a replaced stream");
					return None;
				}
				warn!("Merkle block rejected: {}", error);
				self.end_session(Some(error))
			}
			ReaderCommand::Accept {
				stream_id,
				height,
				new_addresses,
			} => {
				if session.active_stream_id != Some(stream_id) {
					return self.merge_replaced_accept(height, new_addresses);
				}
				self.handle_accept(height, new_addresses)
			}
		}
	}

	/// A block surfaced by a replaced stream still counts as confirmed. Its addresses widen the
	/// filter on the next restart.
	fn merge_replaced_accept(&mut self, height: u32, new_addresses: Vec<String>) -> Option<ReaderEvent> {
		let session = self.session.as_mut()?;
		let in_range = match session.mode {
			SessionMode::Historical { last } => height <= last,
			SessionMode::Continuous => height >= session.floor,
		};
		if !in_range {
			debug!("Ignoring out of range verdict at {} for a replaced stream", height);
			return None;
		}

		session.last_confirmed = Some(session.last_confirmed.map_or(height, |h| h.max(height)));
		for address in session.new_addresses(new_addresses) {
			if !session.pending_expansion.contains(&address) {
				session.pending_expansion.push(address);
			}
		}
		debug!("Merged verdict at {} for a replaced stream", height);
		None
	}

	fn handle_accept(&mut self, height: u32, new_addresses: Vec<String>) -> Option<ReaderEvent> {
		let session = self.session.as_mut()?;
		match session.mode {
			SessionMode::Historical { last } if height > last => {
				let error = ValidationError::HeightBeyondRange { height, last };
				return self.end_session(Some(error.into()));
			}
			SessionMode::Continuous if height < session.floor => {
				let error = ValidationError::HeightBelowFloor {
					height,
					floor: session.floor,
				};
				return self.end_session(Some(error.into()));
			}
			_ => {}
		}

		session.last_confirmed = Some(session.last_confirmed.map_or(height, |h| h.max(height)));
		session.retries = 0;

		let pending = std::mem::take(&mut session.pending_expansion);
		let added = session.new_addresses(pending.into_iter().chain(new_addresses));
		if added.is_empty() {
			return None;
		}

		match session.mode {
			SessionMode::Historical { last } => {
				if height >= last {
					debug!("Historical window is exhausted, no restart needed");
					return None;
				}
				let count = session.count.saturating_sub(height.saturating_sub(session.from));
				info!(
					"Restarting historical transactions sync from {} with {} more addresses",
					height + 1,
					added.len()
				);
				self.restart(height + 1, count, added)
			}
			SessionMode::Continuous => {
				info!(
					"Restarting continuous transactions sync from {} with {} more addresses",
					height + 1,
					added.len()
				);
				self.restart(height + 1, 0, added)
			}
		}
	}

	fn handle_stream_event(&mut self, event: StreamEvent) -> Option<ReaderEvent> {
		let session = self.session.as_mut()?;
		match event {
			StreamEvent::Data(response) => {
				let Some(chunk) = response.into_chunk() else {
					warn!("Dropping stream response without a known payload");
					return None;
				};
				self.handle_chunk(chunk)
			}
			StreamEvent::Error(e) => {
				if session.active_stream_id.is_none() {
					debug!("Ignoring error from a cancelled stream: {}", e);
					return if session.stopping {
						self.end_session(None)
					} else {
						None
					};
				}
				self.handle_error(e)
			}
			StreamEvent::End => match session.mode {
				SessionMode::Historical { .. } if !session.stopping => {
					info!("Historical transactions data obtained");
					self.session = None;
					Some(ReaderEvent::HistoricalDataObtained)
				}
				_ => self.end_session(None),
			},
			StreamEvent::BeforeReconnect(request) => {
				let pending = std::mem::take(&mut session.pending_expansion);
				let added = session.new_addresses(pending);
				match self.updated_args(added) {
					Ok(args) => {
						debug!(
							"Reconnecting transactions stream from {}",
							args.range.from_block_height
						);
						request.update(args);
						None
					}
					Err(e) => self.end_session(Some(e)),
				}
			}
		}
	}

	fn handle_chunk(&mut self, chunk: StreamChunk) -> Option<ReaderEvent> {
		let session = self.session.as_mut()?;
		match chunk {
			StreamChunk::Transactions(transactions) => {
				if session.mode == SessionMode::Continuous && !session.pending_expansion.is_empty() {
					// The filter is stale while an expansion is pending. The batch is fetched
					// again after the restart.
					let added = std::mem::take(&mut session.pending_expansion);
					let from = session.resume_height();
					info!(
						"Transactions arrived before the filter was widened, restarting from {}",
						from
					);
					return self.restart(from, 0, added);
				}

				let total = transactions.len();
				let transactions: Vec<Transaction> = transactions
					.into_iter()
					.filter(|transaction| transaction.involves_any(&session.address_set))
					.collect();
				if transactions.len() < total {
					debug!("Dropped {} bloom filter false positives", total - transactions.len());
				}
				if transactions.is_empty() {
					return None;
				}

				Some(match session.mode {
					SessionMode::Historical { .. } => ReaderEvent::HistoricalTransactions(transactions),
					SessionMode::Continuous => ReaderEvent::NewTransactions {
						transactions,
						addresses: AddressAppender {
							commands: self.commands_tx.clone(),
						},
					},
				})
			}
			StreamChunk::MerkleBlock(merkle_block) => {
				let stream_id = session.active_stream_id?;
				Some(ReaderEvent::MerkleBlock {
					merkle_block,
					verdict: MerkleBlockVerdict {
						stream_id,
						commands: self.commands_tx.clone(),
						state: VerdictState::Pending,
					},
				})
			}
			StreamChunk::InstantLocks(locks) => {
				if session.mode == SessionMode::Continuous && !session.pending_expansion.is_empty() {
					let added = std::mem::take(&mut session.pending_expansion);
					let from = session.resume_height();
					if let Some(event) = self.restart(from, 0, added) {
						return Some(event);
					}
				}
				Some(ReaderEvent::InstantLocks(locks))
			}
		}
	}

	fn handle_error(&mut self, error: TransportError) -> Option<ReaderEvent> {
		let max_retries = self.options.max_retries;
		let session = self.session.as_mut()?;
		if !error.is_retryable() || session.retries >= max_retries {
			warn!("Transactions stream failed: {}", error);
			return self.end_session(Some(error.into()));
		}

		session.retries += 1;
		let from = session.resume_height();
		let count = match session.mode {
			SessionMode::Historical { last } if from > last => {
				info!("Stream failed after the historical window was confirmed");
				self.session = None;
				return Some(ReaderEvent::HistoricalDataObtained);
			}
			SessionMode::Historical { last } => last - from + 1,
			SessionMode::Continuous => 0,
		};
		warn!(
			"Transactions stream failed ({}), retrying from {} ({}/{})",
			error, from, session.retries, max_retries
		);
		self.restart(from, count, Vec::new())
	}

	fn handle_exhausted(&mut self) -> Option<ReaderEvent> {
		let session = self.session.as_ref()?;
		if let SessionMode::Historical { .. } = session.mode {
			if !session.stopping {
				self.session = None;
				return Some(ReaderEvent::HistoricalDataObtained);
			}
		}
		self.end_session(None)
	}

	/// Arguments for resuming the current session with `added` addresses
	fn updated_args(&mut self, added: Vec<String>) -> Result<SubscriptionArgs, SyncError> {
		let false_positive_rate = self.options.false_positive_rate;
		let Some(session) = self.session.as_mut() else {
			return Err(SyncError::usage("No transactions sync session is running"));
		};
		session.address_set.extend(added.iter().cloned());
		session.addresses.extend(added);

		let from = session.resume_height();
		let count = match session.mode {
			SessionMode::Historical { last } => (last + 1).saturating_sub(from),
			SessionMode::Continuous => 0,
		};
		session.args = SubscriptionArgs {
			bloom_filter: BloomFilter::for_addresses(&session.addresses, false_positive_rate)?,
			range: RangeOptions {
				from_block_height: from,
				count,
			},
		};
		Ok(session.args.clone())
	}

	/// Replaces the stream with one from `from` that also watches `added`
	fn restart(&mut self, from: u32, count: u32, added: Vec<String>) -> Option<ReaderEvent> {
		let false_positive_rate = self.options.false_positive_rate;
		let session = self.session.as_mut()?;
		session.address_set.extend(added.iter().cloned());
		session.addresses.extend(added);

		let bloom_filter = match BloomFilter::for_addresses(&session.addresses, false_positive_rate) {
			Ok(filter) => filter,
			Err(e) => return self.end_session(Some(e.into())),
		};
		session.args = SubscriptionArgs {
			bloom_filter,
			range: RangeOptions {
				from_block_height: from,
				count,
			},
		};
		session.from = from;
		session.count = count;

		session.active_stream_id = None;
		session.stream.cancel();

		let mode = session.mode;
		let args = session.args.clone();
		let (stream_id, stream) = self.open_stream(mode, args);
		if let Some(session) = self.session.as_mut() {
			session.stream = stream;
			session.active_stream_id = Some(stream_id);
		}
		None
	}

	fn end_session(&mut self, error: Option<SyncError>) -> Option<ReaderEvent> {
		if let Some(mut session) = self.session.take() {
			session.active_stream_id = None;
			session.stream.cancel();
		}
		Some(match error {
			Some(e) => ReaderEvent::Error(e),
			None => ReaderEvent::Stopped,
		})
	}
}

fn validate_start(from: u32, addresses: &[String]) -> Result<(), ValidationError> {
	if from < 1 {
		return Err(ValidationError::InvalidFromHeight(i64::from(from)));
	}
	if addresses.is_empty() {
		return Err(ValidationError::EmptyAddresses);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::{MockTransport, merkle_block_for, tx_paying};
	use crate::transport::{ReconnectRequest, StatusCode, TxStreamResponse};

	fn options() -> TransactionsReaderOptions {
		TransactionsReaderOptions {
			max_retries: 2,
			false_positive_rate: 0.001,
		}
	}

	fn addresses(list: &[&str]) -> Vec<String> {
		list.iter().map(|address| address.to_string()).collect()
	}

	fn filter(list: &[&str]) -> BloomFilter {
		BloomFilter::for_addresses(list, 0.001).unwrap()
	}

	#[test]
	fn invalid_starts_are_rejected() {
		let transport = Arc::new(MockTransport::with_chain(10));
		let mut reader = TransactionsReader::new(transport, options());

		assert!(matches!(
			reader.start_historical_sync(0, 10, addresses(&["yA"])),
			Err(SyncError::Validation(ValidationError::InvalidFromHeight(0)))
		));
		assert!(matches!(
			reader.start_continuous_sync(5, Vec::new()),
			Err(SyncError::Validation(ValidationError::EmptyAddresses))
		));
		assert!(matches!(
			reader.start_historical_sync(10, 5, addresses(&["yA"])),
			Err(SyncError::Validation(ValidationError::InvalidBlockCount(-4)))
		));

		reader.start_historical_sync(1, 10, addresses(&["yA"])).unwrap();
		assert!(matches!(
			reader.start_historical_sync(1, 10, addresses(&["yA"])),
			Err(SyncError::Usage(_))
		));
	}

	#[tokio::test]
	async fn accepted_block_with_new_addresses_restarts_with_wider_filter() {
		let transport = Arc::new(MockTransport::with_chain(1000));
		let first = transport.prepare_tx_stream();
		let second = transport.prepare_tx_stream();
		first
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(300, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_historical_sync(100, 1000, addresses(&["yA", "yB"])).unwrap();

		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict.accept(300, addresses(&["yC", "yD"])).unwrap();
		second.unbounded_send(StreamEvent::End).unwrap();

		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::HistoricalDataObtained)
		));
		assert!(first.is_closed());

		let args = transport.historical_args();
		assert_eq!(args.len(), 2);
		assert_eq!(args[0].range, RangeOptions { from_block_height: 100, count: 901 });
		assert_eq!(args[1].range, RangeOptions { from_block_height: 301, count: 701 });
		assert_eq!(args[1].bloom_filter, filter(&["yA", "yB", "yC", "yD"]));
		assert!(reader.next_event().await.is_none());
	}

	#[tokio::test]
	async fn accept_without_new_addresses_keeps_the_stream() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(50, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_historical_sync(1, 100, addresses(&["yA"])).unwrap();
		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict.accept(50, Vec::new()).unwrap();
		stream.unbounded_send(StreamEvent::End).unwrap();

		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::HistoricalDataObtained)
		));
		assert_eq!(transport.historical_args().len(), 1);
	}

	#[test]
	fn verdict_callbacks_are_exclusive() {
		let (commands, _receiver) = mpsc::unbounded_channel();
		let verdict = |state| MerkleBlockVerdict {
			stream_id: 1,
			commands: commands.clone(),
			state,
		};

		let mut accepted = verdict(VerdictState::Pending);
		accepted.accept(1, Vec::new()).unwrap();
		assert_eq!(
			accepted.reject(SyncError::usage("late")).unwrap_err(),
			VerdictError::RejectAccepted
		);
		assert_eq!(accepted.accept(1, Vec::new()).unwrap_err(), VerdictError::AlreadyAccepted);

		let mut rejected = verdict(VerdictState::Pending);
		rejected.reject(SyncError::usage("bad block")).unwrap();
		assert_eq!(rejected.accept(1, Vec::new()).unwrap_err(), VerdictError::AcceptRejected);
		assert_eq!(
			rejected.reject(SyncError::usage("again")).unwrap_err(),
			VerdictError::AlreadyRejected
		);
	}

	#[tokio::test]
	async fn accept_beyond_historical_range_is_fatal() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(150, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport, options());
		reader.start_historical_sync(1, 100, addresses(&["yA"])).unwrap();
		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict.accept(150, Vec::new()).unwrap();

		let Some(ReaderEvent::Error(e)) = reader.next_event().await else {
			panic!("expected an error");
		};
		assert_eq!(
			e.to_string(),
			"Validation error: Merkle block height is greater than expected range: 150 > 100"
		);
		assert!(!reader.is_active());
	}

	#[tokio::test]
	async fn rejected_block_ends_the_session_with_its_error() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(10, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport, options());
		reader.start_historical_sync(1, 100, addresses(&["yA"])).unwrap();
		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict
			.reject(SyncError::MerkleBlockRejected("unknown header".to_string()))
			.unwrap();

		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::Error(SyncError::MerkleBlockRejected(_)))
		));
		assert!(stream.is_closed());
	}

	#[tokio::test]
	async fn transient_errors_resume_after_the_last_confirmed_block() {
		let transport = Arc::new(MockTransport::with_chain(1000));
		let first = transport.prepare_tx_stream();
		let second = transport.prepare_tx_stream();
		first
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(150, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_historical_sync(100, 1000, addresses(&["yA"])).unwrap();
		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict.accept(150, Vec::new()).unwrap();

		first
			.unbounded_send(StreamEvent::Error(TransportError::new(StatusCode::Unavailable, "gone")))
			.unwrap();
		second.unbounded_send(StreamEvent::End).unwrap();
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::HistoricalDataObtained)
		));

		let args = transport.historical_args();
		assert_eq!(args[1].range, RangeOptions { from_block_height: 151, count: 850 });
		assert_eq!(args[1].bloom_filter, args[0].bloom_filter);
	}

	#[tokio::test]
	async fn fatal_errors_end_the_session() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();
		stream
			.unbounded_send(StreamEvent::Error(TransportError::new(StatusCode::InvalidArgument, "bad filter")))
			.unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_historical_sync(1, 100, addresses(&["yA"])).unwrap();
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::Error(SyncError::Transport(e))) if e.code == StatusCode::InvalidArgument
		));
		assert!(reader.next_event().await.is_none());
		assert_eq!(transport.historical_args().len(), 1);
	}

	#[tokio::test]
	async fn false_positives_are_dropped_locally() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::transactions(vec![tx_paying(
				"t0", "foreign",
			)])))
			.unwrap();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::transactions(vec![
				tx_paying("t1", "foreign"),
				tx_paying("t2", "yA"),
			])))
			.unwrap();
		stream.unbounded_send(StreamEvent::Data(TxStreamResponse::default())).unwrap();
		stream.unbounded_send(StreamEvent::End).unwrap();

		let mut reader = TransactionsReader::new(transport, options());
		reader.start_historical_sync(1, 100, addresses(&["yA"])).unwrap();

		let Some(ReaderEvent::HistoricalTransactions(transactions)) = reader.next_event().await else {
			panic!("expected transactions");
		};
		assert_eq!(transactions.len(), 1);
		assert_eq!(transactions[0].hash, "t2");
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::HistoricalDataObtained)
		));
	}

	#[tokio::test]
	async fn second_batch_during_pending_expansion_restarts_continuous_sync() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let first = transport.prepare_tx_stream();
		let second = transport.prepare_tx_stream();
		for hash in ["t1", "t2"] {
			first
				.unbounded_send(StreamEvent::Data(TxStreamResponse::transactions(vec![tx_paying(
					hash, "yA",
				)])))
				.unwrap();
		}
		second
			.unbounded_send(StreamEvent::Data(TxStreamResponse::transactions(vec![tx_paying(
				"t2", "yB",
			)])))
			.unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_continuous_sync(50, addresses(&["yA"])).unwrap();

		let Some(ReaderEvent::NewTransactions { transactions, addresses: appender }) =
			reader.next_event().await
		else {
			panic!("expected new transactions");
		};
		assert_eq!(transactions[0].hash, "t1");
		appender.append(addresses(&["yB"]));

		let Some(ReaderEvent::NewTransactions { transactions, .. }) = reader.next_event().await else {
			panic!("expected new transactions");
		};
		assert_eq!(transactions[0].hash, "t2");
		assert!(first.is_closed());

		let args = transport.continuous_args();
		assert_eq!(args.len(), 2);
		assert_eq!(args[1].range, RangeOptions { from_block_height: 50, count: 0 });
		assert_eq!(args[1].bloom_filter, filter(&["yA", "yB"]));
		assert_eq!(reader.addresses(), addresses(&["yA", "yB"]).as_slice());
	}

	#[tokio::test]
	async fn continuous_accept_below_floor_is_fatal() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(40, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport, options());
		reader.start_continuous_sync(50, addresses(&["yA"])).unwrap();
		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict.accept(40, Vec::new()).unwrap();
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::Error(SyncError::Validation(ValidationError::HeightBelowFloor {
				height: 40,
				floor: 50
			})))
		));
	}

	#[tokio::test]
	async fn reconnect_uses_the_latest_resume_point_and_filter() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(60, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport, options());
		reader.start_continuous_sync(50, addresses(&["yA"])).unwrap();
		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict.accept(60, Vec::new()).unwrap();

		let (request, answer) = ReconnectRequest::new(SubscriptionArgs {
			bloom_filter: filter(&["yA"]),
			range: RangeOptions { from_block_height: 50, count: 0 },
		});
		stream.unbounded_send(StreamEvent::BeforeReconnect(request)).unwrap();
		stream
			.unbounded_send(StreamEvent::Data(TxStreamResponse::instant_locks(Vec::new())))
			.unwrap();

		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::InstantLocks(_))
		));
		let args = answer.await.unwrap();
		assert_eq!(args.range, RangeOptions { from_block_height: 61, count: 0 });
		assert_eq!(args.bloom_filter, filter(&["yA"]));
	}

	#[tokio::test]
	async fn stop_swallows_the_cancellation() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let stream = transport.prepare_tx_stream();

		let mut reader = TransactionsReader::new(transport, options());
		reader.start_continuous_sync(50, addresses(&["yA"])).unwrap();
		assert!(reader.stop());

		assert!(matches!(reader.next_event().await, Some(ReaderEvent::Stopped)));
		assert!(reader.next_event().await.is_none());
		assert!(!reader.stop());
		drop(stream);
	}

	#[tokio::test]
	async fn historical_window_end_survives_expansion_restart() {
		let transport = Arc::new(MockTransport::with_chain(1100));
		let first = transport.prepare_tx_stream();
		let second = transport.prepare_tx_stream();
		first
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(300, &[]))))
			.unwrap();
		second
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(1001, &[]))))
			.unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_historical_sync(100, 1000, addresses(&["yA", "yB"])).unwrap();
		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		verdict.accept(300, addresses(&["yC", "yD"])).unwrap();

		let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
			panic!("expected a merkle block from the restarted stream");
		};
		verdict.accept(1001, Vec::new()).unwrap();
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::Error(SyncError::Validation(ValidationError::HeightBeyondRange {
				height: 1001,
				last: 1000
			})))
		));
		assert_eq!(
			transport.historical_args()[1].range,
			RangeOptions { from_block_height: 301, count: 701 }
		);
	}

	#[tokio::test]
	async fn every_expansion_widens_the_previous_filter() {
		let transport = Arc::new(MockTransport::with_chain(1000));
		let streams: Vec<_> = (0..4).map(|_| transport.prepare_tx_stream()).collect();
		let expansions = [(200, "yB"), (400, "yC"), (600, "yD")];
		for (stream, (height, _)) in streams.iter().zip(expansions) {
			stream
				.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(
					height,
					&[],
				))))
				.unwrap();
		}
		streams[3].unbounded_send(StreamEvent::End).unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_historical_sync(100, 1000, addresses(&["yA"])).unwrap();
		for (height, address) in expansions {
			let Some(ReaderEvent::MerkleBlock { mut verdict, .. }) = reader.next_event().await else {
				panic!("expected a merkle block at {}", height);
			};
			verdict.accept(height, addresses(&[address])).unwrap();
		}
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::HistoricalDataObtained)
		));

		let args = transport.historical_args();
		assert_eq!(args.len(), 4);
		let watched = ["yA", "yB", "yC", "yD"];
		for (n, subscription) in args.iter().enumerate() {
			for address in &watched[..=n] {
				assert!(subscription.bloom_filter.contains_address(address).unwrap());
			}
			assert_eq!(subscription.bloom_filter, filter(&watched[..=n]));
		}
		assert_eq!(
			args.iter().map(|a| a.range.from_block_height).collect::<Vec<_>>(),
			vec![100, 201, 401, 601]
		);
	}

	#[tokio::test]
	async fn verdict_from_replaced_stream_still_advances_the_resume_point() {
		let transport = Arc::new(MockTransport::with_chain(100));
		let first = transport.prepare_tx_stream();
		let second = transport.prepare_tx_stream();
		let third = transport.prepare_tx_stream();
		first
			.unbounded_send(StreamEvent::Data(TxStreamResponse::merkle_block(merkle_block_for(60, &[]))))
			.unwrap();
		for hash in ["t1", "t2"] {
			first
				.unbounded_send(StreamEvent::Data(TxStreamResponse::transactions(vec![tx_paying(
					hash, "yA",
				)])))
				.unwrap();
		}
		second
			.unbounded_send(StreamEvent::Data(TxStreamResponse::instant_locks(Vec::new())))
			.unwrap();
		third
			.unbounded_send(StreamEvent::Data(TxStreamResponse::instant_locks(Vec::new())))
			.unwrap();

		let mut reader = TransactionsReader::new(transport.clone(), options());
		reader.start_continuous_sync(50, addresses(&["yA"])).unwrap();

		let Some(ReaderEvent::MerkleBlock { verdict: mut parked, .. }) = reader.next_event().await else {
			panic!("expected a merkle block");
		};
		let Some(ReaderEvent::NewTransactions { addresses: appender, .. }) = reader.next_event().await
		else {
			panic!("expected new transactions");
		};
		appender.append(addresses(&["yB"]));
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::InstantLocks(_))
		));
		assert!(first.is_closed());

		parked.accept(60, addresses(&["yC"])).unwrap();
		second
			.unbounded_send(StreamEvent::Data(TxStreamResponse::transactions(vec![tx_paying(
				"t3", "yA",
			)])))
			.unwrap();
		assert!(matches!(
			reader.next_event().await,
			Some(ReaderEvent::InstantLocks(_))
		));

		let args = transport.continuous_args();
		assert_eq!(args.len(), 3);
		assert_eq!(args[1].range, RangeOptions { from_block_height: 50, count: 0 });
		assert_eq!(args[2].range, RangeOptions { from_block_height: 61, count: 0 });
		assert_eq!(args[2].bloom_filter, filter(&["yA", "yB", "yC"]));
	}
}
