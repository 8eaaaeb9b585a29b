use crate::bloom::BloomFilter;
use crate::types::{BlockHeader, InstantLock, MerkleBlock, Transaction};

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Status codes reported by the gateway for failed calls and streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
	Cancelled,
	Unknown,
	InvalidArgument,
	DeadlineExceeded,
	NotFound,
	FailedPrecondition,
	Internal,
	Unavailable,
}

impl StatusCode {
	pub fn is_retryable(self) -> bool {
		matches!(
			self,
			StatusCode::Cancelled
				| StatusCode::Unknown
				| StatusCode::DeadlineExceeded
				| StatusCode::Internal
				| StatusCode::Unavailable
		)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct TransportError {
	pub code: StatusCode,
	pub message: String,
}

impl TransportError {
	pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}

	pub fn cancelled() -> Self {
		Self::new(StatusCode::Cancelled, "Stream cancelled on client")
	}

	pub fn is_cancelled(&self) -> bool {
		self.code == StatusCode::Cancelled
	}

	pub fn is_retryable(&self) -> bool {
		self.code.is_retryable()
	}
}

impl From<reqwest::Error> for TransportError {
	fn from(e: reqwest::Error) -> Self {
		let code = if e.is_timeout() {
			StatusCode::DeadlineExceeded
		} else if e.is_connect() {
			StatusCode::Unavailable
		} else {
			StatusCode::Unknown
		};
		Self::new(code, e.to_string())
	}
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
	fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
		Self::new(StatusCode::Unavailable, e.to_string())
	}
}

impl From<serde_json::Error> for TransportError {
	fn from(e: serde_json::Error) -> Self {
		Self::new(StatusCode::Internal, format!("Malformed gateway message: {}", e))
	}
}

/// Height window of a subscription. `count == 0` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeOptions {
	pub from_block_height: u32,
	pub count: u32,
}

/// Arguments a transaction stream is (re)opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionArgs {
	pub bloom_filter: BloomFilter,
	pub range: RangeOptions,
}

/// One streamed message. Exactly one of the fields is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStreamResponse {
	#[serde(default)]
	pub raw_transactions: Option<Vec<Transaction>>,
	#[serde(default)]
	pub raw_merkle_block: Option<MerkleBlock>,
	#[serde(default)]
	pub instant_send_lock_messages: Option<Vec<InstantLock>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
	Transactions(Vec<Transaction>),
	MerkleBlock(MerkleBlock),
	InstantLocks(Vec<InstantLock>),
}

impl TxStreamResponse {
	pub fn transactions(transactions: Vec<Transaction>) -> Self {
		Self {
			raw_transactions: Some(transactions),
			..Default::default()
		}
	}

	pub fn merkle_block(block: MerkleBlock) -> Self {
		Self {
			raw_merkle_block: Some(block),
			..Default::default()
		}
	}

	pub fn instant_locks(locks: Vec<InstantLock>) -> Self {
		Self {
			instant_send_lock_messages: Some(locks),
			..Default::default()
		}
	}

	/// Returns `None` for chunks carrying none of the known payloads
	pub fn into_chunk(self) -> Option<StreamChunk> {
		if let Some(transactions) = self.raw_transactions {
			return Some(StreamChunk::Transactions(transactions));
		}
		if let Some(block) = self.raw_merkle_block {
			return Some(StreamChunk::MerkleBlock(block));
		}
		self.instant_send_lock_messages
			.map(StreamChunk::InstantLocks)
	}
}

/// Asks the consumer for the arguments to use when a dropped continuous stream reconnects
#[derive(Debug)]
pub struct ReconnectRequest {
	previous: SubscriptionArgs,
	responder: oneshot::Sender<SubscriptionArgs>,
}

impl ReconnectRequest {
	pub fn new(previous: SubscriptionArgs) -> (Self, oneshot::Receiver<SubscriptionArgs>) {
		let (responder, receiver) = oneshot::channel();
		(
			Self {
				previous,
				responder,
			},
			receiver,
		)
	}

	pub fn previous(&self) -> &SubscriptionArgs {
		&self.previous
	}

	pub fn update(self, args: SubscriptionArgs) {
		// The stream may already be gone, in which case nobody waits for the answer.
		let _ = self.responder.send(args);
	}
}

#[derive(Debug)]
pub enum StreamEvent {
	Data(TxStreamResponse),
	Error(TransportError),
	End,
	BeforeReconnect(ReconnectRequest),
}

/// Transaction stream handle with cooperative cancellation.
///
/// After `cancel()` the underlying connection is dropped and the next poll yields a
/// `Cancelled` error, after which the stream is exhausted.
pub struct TxStream {
	inner: BoxStream<'static, StreamEvent>,
	cancelled: bool,
	cancel_reported: bool,
}

impl TxStream {
	pub fn new(inner: BoxStream<'static, StreamEvent>) -> Self {
		Self {
			inner,
			cancelled: false,
			cancel_reported: false,
		}
	}

	pub fn cancel(&mut self) {
		if !self.cancelled {
			self.cancelled = true;
			self.inner = stream::empty().boxed();
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled
	}

	pub async fn next(&mut self) -> Option<StreamEvent> {
		if self.cancelled {
			if self.cancel_reported {
				return None;
			}
			self.cancel_reported = true;
			return Some(StreamEvent::Error(TransportError::cancelled()));
		}
		self.inner.next().await
	}
}

impl std::fmt::Debug for TxStream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TxStream")
			.field("cancelled", &self.cancelled)
			.finish()
	}
}

/// Consecutive headers starting at `batch_head_height`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderBatch {
	pub headers: Vec<BlockHeader>,
	pub batch_head_height: u32,
}

pub type HeadersStream = BoxStream<'static, Result<HeaderBatch, TransportError>>;
