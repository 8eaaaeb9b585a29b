//! Error taxonomy shared by every synchronizer.
//!
//! Validation failures are reported and abort the current operation, transport failures carry
//! a status code that decides whether they are retried, and assembly failures are fatal at
//! startup.

use crate::bloom::BloomError;
use crate::transport::TransportError;

/// Top-level error returned by the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Validation error: {0}")]
	Validation(#[from] ValidationError),

	#[error("Transport error: {0}")]
	Transport(#[from] TransportError),

	#[error("Plugin assembly error: {0}")]
	Assembly(#[from] AssemblyError),

	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),

	#[error("Configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("Header chain error: {0}")]
	Chain(#[from] ChainError),

	#[error("Key chain error: {0}")]
	KeyChain(#[from] KeyChainError),

	#[error("Bloom filter error: {0}")]
	Bloom(#[from] BloomError),

	#[error("Merkle block verdict error: {0}")]
	Verdict(#[from] VerdictError),

	#[error("Merkle block rejected: {0}")]
	MerkleBlockRejected(String),

	#[error("{0}")]
	Usage(String),
}

impl SyncError {
	pub fn usage(message: impl Into<String>) -> Self {
		SyncError::Usage(message.into())
	}

	/// Whether the error is a transport failure that may succeed when retried
	pub fn is_retryable(&self) -> bool {
		matches!(self, SyncError::Transport(e) if e.is_retryable())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
	#[error("Invalid fromBlockHeight: {0}")]
	InvalidFromHeight(i64),

	#[error("Empty addresses list provided")]
	EmptyAddresses,

	#[error("Invalid total amount of blocks to sync: {0}")]
	InvalidBlockCount(i64),

	#[error("Merkle block height is greater than expected range: {height} > {last}")]
	HeightBeyondRange { height: u32, last: u32 },

	#[error("Merkle block height is lesser than expected startBlockHeight: {height} < {floor}")]
	HeightBelowFloor { height: u32, floor: u32 },

	#[error("Invalid best block height {0}")]
	InvalidBestHeight(i64),

	#[error("Start block height {start} is greater than best block height {tip}")]
	StartAboveTip { start: u32, tip: u32 },

	#[error("Header metadata was not found for block {0}")]
	MissingHeaderMetadata(String),

	#[error("Invalid header metadata time for block {0}")]
	InvalidHeaderTime(String),

	#[error("Transaction {tx} was not found in merkle block {block}")]
	TransactionNotInBlock { tx: String, block: String },

	#[error("No new headers received for batch at height {0}")]
	EmptyHeaderBatch(u32),

	#[error("New chain height {new} is less than latest height {current}")]
	HeightDecrease { new: u32, current: u32 },

	#[error("Header batch at height {head} does not connect to chain height {current}")]
	HeaderGap { head: u32, current: u32 },

	#[error("Historical data obtained but {0} transactions are still waiting for verification")]
	UnverifiedTransactions(usize),

	#[error("Synced headers count {synced} is greater than total headers count {total}.")]
	SyncedBeyondTotal { synced: u32, total: u32 },

	#[error("Historical headers ended at height {tip}, expected {expected}")]
	IncompleteHeaderChain { tip: u32, expected: u32 },

	#[error("Invalid sync state: {0}")]
	InvalidSyncState(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
	#[error("Plugin {plugin} depends on unknown dependency {dependency}")]
	UnknownDependency { plugin: String, dependency: String },

	#[error("Conflicting injection order between plugins: {0}")]
	ConflictingOrder(String),

	#[error("Plugin {0} is registered twice")]
	DuplicatePlugin(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Stored state is inconsistent: {0}")]
	Corrupted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Failed to read config file: {0}")]
	Read(#[from] std::io::Error),

	#[error("Failed to parse config file: {0}")]
	Parse(#[from] serde_json::Error),

	#[error("Invalid config value for {field}: {reason}")]
	Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
	#[error("Header {hash} does not link to previous header {prev_hash} in its batch")]
	BrokenBatch { hash: String, prev_hash: String },

	#[error("Header chain is not initialized")]
	NotInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyChainError {
	#[error("No address available for {path}/{index}")]
	Exhausted { path: String, index: u32 },

	#[error("Unknown derivation path {0}")]
	UnknownPath(String),
}

/// Misuse of a merkle block verdict
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerdictError {
	#[error("Unable to accept rejected merkle block")]
	AcceptRejected,

	#[error("Unable to reject accepted merkle block")]
	RejectAccepted,

	#[error("Merkle block has already been accepted")]
	AlreadyAccepted,

	#[error("Merkle block has already been rejected")]
	AlreadyRejected,
}
