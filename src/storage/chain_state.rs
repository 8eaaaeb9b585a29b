use crate::types::{
	BlockHeader, HeaderMetadata, HeadersMetadata, InstantLock, Transaction, TransactionMetadata,
};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
	pub transaction: Transaction,
	pub metadata: Option<TransactionMetadata>,
}

/// Chain view of one network: tip, checkpoints, the recent header window and imported
/// transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
	network: String,
	/// Best height reported by the gateway or reached by header sync
	chain_height: u32,
	last_synced_header_height: Option<u32>,
	/// Transaction sync checkpoint
	last_synced_block_height: Option<u32>,
	max_headers: usize,
	block_headers: VecDeque<BlockHeader>,
	headers_metadata: HeadersMetadata,
	transactions: HashMap<String, TransactionRecord>,
	instant_locks: HashMap<String, InstantLock>,
}

impl ChainState {
	pub fn new(network: impl Into<String>, max_headers: usize) -> Self {
		Self {
			network: network.into(),
			chain_height: 0,
			last_synced_header_height: None,
			last_synced_block_height: None,
			max_headers,
			block_headers: VecDeque::new(),
			headers_metadata: HashMap::new(),
			transactions: HashMap::new(),
			instant_locks: HashMap::new(),
		}
	}

	pub fn network(&self) -> &str {
		&self.network
	}

	pub fn chain_height(&self) -> u32 {
		self.chain_height
	}

	pub fn update_chain_height(&mut self, height: u32) {
		self.chain_height = height;
	}

	pub fn last_synced_header_height(&self) -> Option<u32> {
		self.last_synced_header_height
	}

	pub fn update_last_synced_header_height(&mut self, height: u32) {
		self.last_synced_header_height = Some(height);
	}

	pub fn last_synced_block_height(&self) -> Option<u32> {
		self.last_synced_block_height
	}

	pub fn update_last_synced_block_height(&mut self, height: u32) {
		self.last_synced_block_height = Some(height);
	}

	pub fn max_headers(&self) -> usize {
		self.max_headers
	}

	pub fn set_max_headers(&mut self, max_headers: usize) {
		self.max_headers = max_headers;
		self.trim_headers();
	}

	pub fn block_headers(&self) -> &VecDeque<BlockHeader> {
		&self.block_headers
	}

	/// Replaces the header window, keeping only the most recent `max_headers`
	pub fn set_block_headers(&mut self, headers: impl IntoIterator<Item = BlockHeader>) {
		self.block_headers = headers.into_iter().collect();
		self.trim_headers();
	}

	/// Appends headers at the tip of the window, evicting the oldest ones
	pub fn push_block_headers(&mut self, headers: impl IntoIterator<Item = BlockHeader>) {
		self.block_headers.extend(headers);
		self.trim_headers();
	}

	fn trim_headers(&mut self) {
		while self.block_headers.len() > self.max_headers {
			self.block_headers.pop_front();
		}
	}

	pub fn header_metadata(&self, block_hash: &str) -> Option<HeaderMetadata> {
		self.headers_metadata.get(block_hash).copied()
	}

	pub fn headers_metadata_len(&self) -> usize {
		self.headers_metadata.len()
	}

	pub fn update_headers_metadata(&mut self, headers: &[BlockHeader]) {
		for header in headers {
			self.headers_metadata.insert(
				header.hash.clone(),
				HeaderMetadata {
					height: header.height,
					time: header.time,
				},
			);
		}
	}

	/// Drops metadata below `height` unless a header in the window still references it
	pub fn prune_headers_metadata(&mut self, height: u32) -> usize {
		let retained: HashSet<&str> = self
			.block_headers
			.iter()
			.map(|header| header.hash.as_str())
			.collect();
		let before = self.headers_metadata.len();
		self.headers_metadata
			.retain(|hash, meta| meta.height >= height || retained.contains(hash.as_str()));
		before - self.headers_metadata.len()
	}

	pub fn has_transaction(&self, hash: &str) -> bool {
		self.transactions.contains_key(hash)
	}

	pub fn transaction(&self, hash: &str) -> Option<&TransactionRecord> {
		self.transactions.get(hash)
	}

	pub fn transactions_count(&self) -> usize {
		self.transactions.len()
	}

	/// Stores the transaction. Metadata already known for it is only replaced by new metadata.
	pub fn import_transaction(
		&mut self,
		transaction: Transaction,
		metadata: Option<TransactionMetadata>,
	) {
		let instant_locked = self.instant_locks.contains_key(&transaction.hash);
		let record = self
			.transactions
			.entry(transaction.hash.clone())
			.or_insert_with(|| TransactionRecord {
				transaction: transaction.clone(),
				metadata: None,
			});
		record.transaction = transaction;
		if let Some(mut metadata) = metadata {
			metadata.instant_locked |= instant_locked;
			record.metadata = Some(metadata);
		}
	}

	pub fn import_instant_lock(&mut self, lock: InstantLock) {
		if let Some(metadata) = self
			.transactions
			.get_mut(&lock.txid)
			.and_then(|record| record.metadata.as_mut())
		{
			metadata.instant_locked = true;
		}
		self.instant_locks.insert(lock.txid.clone(), lock);
	}

	pub fn instant_lock(&self, txid: &str) -> Option<&InstantLock> {
		self.instant_locks.get(txid)
	}

	/// Copy of the state that cannot be invalidated by a reorg shallower than the tip distance
	/// to `safe_height`.
	pub fn reorg_safe_snapshot(&self, safe_height: u32) -> ChainState {
		let mut snapshot = self.clone();
		snapshot.transactions.retain(|_, record| {
			record
				.metadata
				.as_ref()
				.is_some_and(|metadata| metadata.height <= safe_height)
		});
		snapshot.last_synced_block_height = self
			.last_synced_block_height
			.map(|height| height.min(safe_height));
		snapshot
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::{header_at, tx_paying};

	fn confirmed_at(height: u32) -> TransactionMetadata {
		TransactionMetadata::from_header(
			"block",
			HeaderMetadata {
				height,
				time: 1_600_000_000,
			},
		)
		.unwrap()
	}

	#[test]
	fn header_window_keeps_most_recent() {
		let mut state = ChainState::new("testnet", 3);
		state.set_block_headers((1..=5).map(header_at));
		let heights: Vec<u32> = state.block_headers().iter().map(|h| h.height).collect();
		assert_eq!(heights, vec![3, 4, 5]);

		state.push_block_headers(vec![header_at(6)]);
		let heights: Vec<u32> = state.block_headers().iter().map(|h| h.height).collect();
		assert_eq!(heights, vec![4, 5, 6]);
	}

	#[test]
	fn pruning_keeps_metadata_of_retained_headers() {
		let mut state = ChainState::new("testnet", 2);
		let headers: Vec<BlockHeader> = (1..=5).map(header_at).collect();
		state.update_headers_metadata(&headers);
		state.set_block_headers(vec![headers[1].clone()]);

		let removed = state.prune_headers_metadata(4);

		assert_eq!(removed, 2);
		assert!(state.header_metadata(&headers[0].hash).is_none());
		assert!(state.header_metadata(&headers[1].hash).is_some());
		assert!(state.header_metadata(&headers[3].hash).is_some());
	}

	#[test]
	fn reorg_safe_snapshot_drops_recent_and_unconfirmed_transactions() {
		let mut state = ChainState::new("testnet", 10);
		state.import_transaction(tx_paying("old", "yA"), Some(confirmed_at(90)));
		state.import_transaction(tx_paying("recent", "yA"), Some(confirmed_at(99)));
		state.import_transaction(tx_paying("mempool", "yA"), None);
		state.update_last_synced_block_height(99);

		let snapshot = state.reorg_safe_snapshot(94);

		assert!(snapshot.has_transaction("old"));
		assert!(!snapshot.has_transaction("recent"));
		assert!(!snapshot.has_transaction("mempool"));
		assert_eq!(snapshot.last_synced_block_height(), Some(94));
		assert_eq!(state.transactions_count(), 3);
	}

	#[test]
	fn instant_lock_marks_known_transaction() {
		let mut state = ChainState::new("testnet", 10);
		state.import_transaction(tx_paying("t1", "yA"), Some(confirmed_at(5)));
		state.import_instant_lock(InstantLock {
			txid: "t1".into(),
			inputs: vec![],
			signature: String::new(),
		});

		let record = state.transaction("t1").unwrap();
		assert!(record.metadata.as_ref().unwrap().instant_locked);
	}

	#[test]
	fn unconfirmed_reimport_keeps_metadata() {
		let mut state = ChainState::new("testnet", 10);
		state.import_transaction(tx_paying("t1", "yA"), Some(confirmed_at(5)));
		state.import_transaction(tx_paying("t1", "yA"), None);
		assert_eq!(state.transaction("t1").unwrap().metadata, Some(confirmed_at(5)));
	}
}
