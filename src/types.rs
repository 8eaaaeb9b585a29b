//! Chain data model exchanged with the gateway and kept in local state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Block header as delivered by the header subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
	/// Filled in locally once the header is linked into the chain
	#[serde(default)]
	pub height: u32,
	pub hash: String,
	pub prev_hash: String,
	pub time: u32,
	#[serde(default)]
	pub bits: u32,
	#[serde(default)]
	pub nonce: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutPoint {
	pub txid: String,
	pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
	pub prev_out: OutPoint,
	#[serde(default)]
	pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOutput {
	#[serde(default)]
	pub address: Option<String>,
	pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
	pub hash: String,
	#[serde(default)]
	pub inputs: Vec<TxInput>,
	#[serde(default)]
	pub outputs: Vec<TxOutput>,
}

impl Transaction {
	/// Addresses spent from or paid to by this transaction
	pub fn addresses(&self) -> impl Iterator<Item = &str> {
		self.inputs
			.iter()
			.filter_map(|input| input.address.as_deref())
			.chain(
				self.outputs
					.iter()
					.filter_map(|output| output.address.as_deref()),
			)
	}

	pub fn involves_any(&self, addresses: &HashSet<String>) -> bool {
		self.addresses().any(|address| addresses.contains(address))
	}
}

/// Merkle block carrying the partial tree for the filtered transactions of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleBlock {
	pub header: BlockHeader,
	pub total_transactions: u32,
	/// Tree hashes in wire (little-endian) byte order
	pub hashes: Vec<String>,
	#[serde(default)]
	pub flags: Vec<u8>,
}

impl MerkleBlock {
	pub fn block_hash(&self) -> &str {
		&self.header.hash
	}

	/// Transaction ids matched by the block, converted to display (big-endian) order
	pub fn transaction_hashes(&self) -> HashSet<String> {
		self.hashes.iter().map(|hash| reverse_hex(hash)).collect()
	}
}

/// Reverses the byte order of a hex encoded hash. Input that is not valid hex is returned as is.
pub fn reverse_hex(hash: &str) -> String {
	match hex::decode(hash) {
		Ok(mut bytes) => {
			bytes.reverse();
			hex::encode(bytes)
		}
		Err(_) => hash.to_string(),
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantLock {
	pub txid: String,
	#[serde(default)]
	pub inputs: Vec<OutPoint>,
	#[serde(default)]
	pub signature: String,
}

/// Height and time of a known block, keyed by block hash in chain state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMetadata {
	pub height: u32,
	pub time: u32,
}

pub type HeadersMetadata = HashMap<String, HeaderMetadata>;

/// Confirmation data attached to an imported transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetadata {
	pub block_hash: String,
	pub height: u32,
	pub time: DateTime<Utc>,
	#[serde(default)]
	pub instant_locked: bool,
	#[serde(default)]
	pub chain_locked: bool,
}

impl TransactionMetadata {
	pub fn from_header(block_hash: &str, metadata: HeaderMetadata) -> Option<Self> {
		let time = DateTime::<Utc>::from_timestamp(i64::from(metadata.time), 0)?;
		Some(Self {
			block_hash: block_hash.to_string(),
			height: metadata.height,
			time,
			instant_locked: false,
			chain_locked: false,
		})
	}
}

/// Tip information returned by the gateway status call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
	pub best_block_height: u32,
	#[serde(default)]
	pub best_block_hash: String,
	#[serde(default)]
	pub network: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merkle_block_hashes_are_reported_in_display_order() {
		let block = MerkleBlock {
			header: BlockHeader {
				height: 0,
				hash: "aa".into(),
				prev_hash: "bb".into(),
				time: 1,
				bits: 0,
				nonce: 0,
			},
			total_transactions: 2,
			hashes: vec!["0102ff".into(), "not-hex".into()],
			flags: vec![],
		};

		let hashes = block.transaction_hashes();
		assert!(hashes.contains("ff0201"));
		assert!(hashes.contains("not-hex"));
	}

	#[test]
	fn transaction_matches_input_and_output_addresses() {
		let tx = Transaction {
			hash: "t1".into(),
			inputs: vec![TxInput {
				prev_out: OutPoint {
					txid: "p".into(),
					vout: 0,
				},
				address: Some("yIn".into()),
			}],
			outputs: vec![TxOutput {
				address: Some("yOut".into()),
				value: 5,
			}],
		};

		let watched: HashSet<String> = ["yOut".to_string()].into();
		assert!(tx.involves_any(&watched));
		let watched: HashSet<String> = ["yIn".to_string()].into();
		assert!(tx.involves_any(&watched));
		let watched: HashSet<String> = ["other".to_string()].into();
		assert!(!tx.involves_any(&watched));
	}

	#[test]
	fn metadata_time_is_converted_from_unix_seconds() {
		let meta = TransactionMetadata::from_header(
			"hash",
			HeaderMetadata {
				height: 10,
				time: 1_600_000_000,
			},
		)
		.unwrap();
		assert_eq!(meta.height, 10);
		assert_eq!(meta.time.timestamp(), 1_600_000_000);
	}
}
