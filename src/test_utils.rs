//! Fixtures shared by the unit tests: a deterministic chain and a channel-driven transport.

use crate::error::KeyChainError;
use crate::keychain::AddressDeriver;
use crate::storage::{AddressInfo, ChainState, MemoryStateRepository, Storage, WalletState};
use crate::transport::{
	CoreTransport, HeaderBatch, HeadersStream, RangeOptions, StatusCode, StreamEvent,
	SubscriptionArgs, TransportError, TxStream,
};
use crate::types::{BlockHeader, ChainStatus, MerkleBlock, Transaction, TxOutput, reverse_hex};

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Headers served per batch by [`MockTransport`]
pub const MOCK_BATCH_SIZE: u32 = 10;

fn block_hash(height: u32) -> String {
	format!("{:064x}", height)
}

pub fn header_at(height: u32) -> BlockHeader {
	BlockHeader {
		height,
		hash: block_hash(height),
		prev_hash: block_hash(height.saturating_sub(1)),
		time: 1_600_000_000 + height,
		bits: 0,
		nonce: 0,
	}
}

/// Headers `from..=to`
pub fn headers_range(from: u32, to: u32) -> Vec<BlockHeader> {
	(from..=to).map(header_at).collect()
}

pub fn tx_paying(hash: &str, address: &str) -> Transaction {
	Transaction {
		hash: hash.to_string(),
		inputs: Vec::new(),
		outputs: vec![TxOutput {
			address: Some(address.to_string()),
			value: 1_000,
		}],
	}
}

/// Merkle block at `height` matching the given transaction ids
pub fn merkle_block_for(height: u32, txids: &[&str]) -> MerkleBlock {
	MerkleBlock {
		header: header_at(height),
		total_transactions: txids.len().max(1) as u32,
		hashes: txids.iter().map(|txid| reverse_hex(txid)).collect(),
		flags: Vec::new(),
	}
}

/// Storage whose wallet owns `addresses` on path `m/0`, indexes in order
pub fn storage_with_addresses(addresses: &[&str]) -> (Arc<Storage>, Arc<MemoryStateRepository>) {
	let mut wallet = WalletState::new("w");
	let keychain = wallet.keychain_mut("m/0");
	for (index, address) in addresses.iter().enumerate() {
		keychain.addresses.insert(
			index as u32,
			AddressInfo {
				address: address.to_string(),
				used: false,
			},
		);
	}
	let repository = Arc::new(MemoryStateRepository::new());
	let storage = Storage::new(
		ChainState::new("testnet", 2000),
		wallet,
		repository.clone(),
		6,
	);
	(Arc::new(storage), repository)
}

/// Derives `"{path}/{index}"`
pub struct FixedDeriver;

impl AddressDeriver for FixedDeriver {
	fn derive(&self, path: &str, index: u32) -> Result<String, KeyChainError> {
		Ok(format!("{}/{}", path, index))
	}
}

/// In-memory gateway.
///
/// Headers come from [`header_at`]. Transaction streams are fed by the test through the senders
/// returned by [`MockTransport::prepare_tx_stream`], consumed in subscription order.
pub struct MockTransport {
	height: watch::Sender<u32>,
	header_subscriptions: Mutex<Vec<RangeOptions>>,
	header_failure: Mutex<Option<(usize, TransportError)>>,
	prepared_streams: Mutex<VecDeque<UnboundedReceiver<StreamEvent>>>,
	/// Keeps unprepared streams open
	idle_senders: Mutex<Vec<UnboundedSender<StreamEvent>>>,
	historical_args: Mutex<Vec<SubscriptionArgs>>,
	continuous_args: Mutex<Vec<SubscriptionArgs>>,
}

impl MockTransport {
	pub fn with_chain(height: u32) -> Self {
		let (height, _) = watch::channel(height);
		Self {
			height,
			header_subscriptions: Mutex::new(Vec::new()),
			header_failure: Mutex::new(None),
			prepared_streams: Mutex::new(VecDeque::new()),
			idle_senders: Mutex::new(Vec::new()),
			historical_args: Mutex::new(Vec::new()),
			continuous_args: Mutex::new(Vec::new()),
		}
	}

	/// Mines blocks up to `height`, feeding open-ended header subscriptions
	pub fn extend_chain(&self, height: u32) {
		self.height.send_replace(height);
	}

	pub fn header_subscriptions(&self) -> Vec<RangeOptions> {
		crate::storage::lock(&self.header_subscriptions).clone()
	}

	/// The next header subscription fails with `error` after serving `batches` batches
	pub fn fail_header_stream_after(&self, batches: usize, error: TransportError) {
		*crate::storage::lock(&self.header_failure) = Some((batches, error));
	}

	/// Returns the sender feeding the next transaction stream that is not yet prepared
	pub fn prepare_tx_stream(&self) -> UnboundedSender<StreamEvent> {
		let (sender, receiver) = unbounded();
		crate::storage::lock(&self.prepared_streams).push_back(receiver);
		sender
	}

	pub fn historical_args(&self) -> Vec<SubscriptionArgs> {
		crate::storage::lock(&self.historical_args).clone()
	}

	pub fn continuous_args(&self) -> Vec<SubscriptionArgs> {
		crate::storage::lock(&self.continuous_args).clone()
	}

	fn next_tx_stream(&self) -> TxStream {
		let prepared = crate::storage::lock(&self.prepared_streams).pop_front();
		let receiver = prepared.unwrap_or_else(|| {
			let (sender, receiver) = unbounded();
			crate::storage::lock(&self.idle_senders).push(sender);
			receiver
		});
		TxStream::new(receiver.boxed())
	}
}

/// Batches of at most [`MOCK_BATCH_SIZE`] headers covering `from..=to`
fn header_batches(from: u32, to: u32) -> Vec<Result<HeaderBatch, TransportError>> {
	let mut batches = Vec::new();
	let mut next = from;
	while next <= to {
		let end = to.min(next + MOCK_BATCH_SIZE - 1);
		batches.push(Ok(HeaderBatch {
			headers: headers_range(next, end),
			batch_head_height: next,
		}));
		next = end + 1;
	}
	batches
}

#[async_trait::async_trait]
impl CoreTransport for MockTransport {
	async fn get_chain_status(&self) -> Result<ChainStatus, TransportError> {
		let height = *self.height.borrow();
		Ok(ChainStatus {
			best_block_height: height,
			best_block_hash: block_hash(height),
			network: "testnet".to_string(),
		})
	}

	async fn get_block_header_by_height(&self, height: u32) -> Result<BlockHeader, TransportError> {
		if height > *self.height.borrow() {
			return Err(TransportError::new(
				StatusCode::NotFound,
				format!("No block at height {}", height),
			));
		}
		Ok(header_at(height))
	}

	async fn subscribe_block_headers(&self, range: RangeOptions) -> Result<HeadersStream, TransportError> {
		crate::storage::lock(&self.header_subscriptions).push(range);

		let headers: HeadersStream = if range.count > 0 {
			let to = (range.from_block_height + range.count - 1).min(*self.height.borrow());
			stream::iter(header_batches(range.from_block_height, to)).boxed()
		} else {
			let state = (range.from_block_height, self.height.subscribe());
			stream::unfold(state, |(next, mut height)| async move {
				loop {
					let tip = *height.borrow_and_update();
					if next <= tip {
						let end = tip.min(next + MOCK_BATCH_SIZE - 1);
						let batch = HeaderBatch {
							headers: headers_range(next, end),
							batch_head_height: next,
						};
						return Some((Ok(batch), (end + 1, height)));
					}
					if height.changed().await.is_err() {
						return None;
					}
				}
			})
			.boxed()
		};

		match crate::storage::lock(&self.header_failure).take() {
			Some((batches, error)) => Ok(headers
				.take(batches)
				.chain(stream::once(async move { Err(error) }))
				.boxed()),
			None => Ok(headers),
		}
	}

	async fn create_historical_sync_stream(&self, args: SubscriptionArgs) -> Result<TxStream, TransportError> {
		crate::storage::lock(&self.historical_args).push(args);
		Ok(self.next_tx_stream())
	}

	async fn create_continuous_sync_stream(&self, args: SubscriptionArgs) -> Result<TxStream, TransportError> {
		crate::storage::lock(&self.continuous_args).push(args);
		Ok(self.next_tx_stream())
	}
}
