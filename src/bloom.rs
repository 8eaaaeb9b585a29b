//! BIP37 bloom filter built from the watched address set.
//!
//! The filter is a pure function of the address set: addresses are sorted and de-duplicated
//! and the tweak is fixed, so two syncs watching the same addresses send identical filters.

use serde::{Deserialize, Serialize};
use std::cmp;

/// Maximum size of a bloom filter in bytes
pub const MAX_BLOOM_FILTER_SIZE: usize = 36000;

pub const MAX_HASH_FUNCS: u32 = 50;

pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.0001;

const FILTER_TWEAK: u32 = 0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BloomError {
	#[error("Invalid element count: {0}")]
	InvalidElementCount(usize),

	#[error("Invalid false positive rate: {0}")]
	InvalidFalsePositiveRate(f64),

	#[error("Failed to hash filter element: {0}")]
	Hash(String),
}

/// Update behaviour requested from the peer when it matches an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomFlags {
	None = 0,
	All = 1,
	PubkeyOnly = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
	data: Vec<u8>,
	n_hash_funcs: u32,
	n_tweak: u32,
	flags: BloomFlags,
}

impl BloomFilter {
	pub fn new(
		elements: usize,
		false_positive_rate: f64,
		tweak: u32,
		flags: BloomFlags,
	) -> Result<Self, BloomError> {
		if elements == 0 {
			return Err(BloomError::InvalidElementCount(elements));
		}
		if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
			return Err(BloomError::InvalidFalsePositiveRate(false_positive_rate));
		}

		let ln2 = std::f64::consts::LN_2;
		let size_bits = (-1.0 / (ln2 * ln2) * elements as f64 * false_positive_rate.ln()).ceil();
		let size_bytes = cmp::max(1, cmp::min((size_bits / 8.0) as usize, MAX_BLOOM_FILTER_SIZE));
		let n_hash_funcs = ((size_bytes * 8) as f64 / elements as f64 * ln2) as u32;
		let n_hash_funcs = cmp::max(1, cmp::min(n_hash_funcs, MAX_HASH_FUNCS));

		Ok(Self {
			data: vec![0; size_bytes],
			n_hash_funcs,
			n_tweak: tweak,
			flags,
		})
	}

	/// Builds the filter for a watched address set
	pub fn for_addresses<S: AsRef<str>>(
		addresses: &[S],
		false_positive_rate: f64,
	) -> Result<Self, BloomError> {
		let mut sorted: Vec<&str> = addresses.iter().map(AsRef::as_ref).collect();
		sorted.sort_unstable();
		sorted.dedup();

		let mut filter = Self::new(
			sorted.len(),
			false_positive_rate,
			FILTER_TWEAK,
			BloomFlags::None,
		)?;
		for address in sorted {
			filter.insert(address.as_bytes())?;
		}
		Ok(filter)
	}

	fn bit_index(&self, round: u32, mut data: &[u8]) -> Result<usize, BloomError> {
		let seed = round.wrapping_mul(0xfba4c795).wrapping_add(self.n_tweak);
		let hash = murmur3::murmur3_32(&mut data, seed)
			.map_err(|e| BloomError::Hash(e.to_string()))?;
		Ok(hash as usize % (self.data.len() * 8))
	}

	pub fn insert(&mut self, data: &[u8]) -> Result<(), BloomError> {
		for round in 0..self.n_hash_funcs {
			let index = self.bit_index(round, data)?;
			self.data[index >> 3] |= 1 << (index & 7);
		}
		Ok(())
	}

	pub fn contains(&self, data: &[u8]) -> Result<bool, BloomError> {
		for round in 0..self.n_hash_funcs {
			let index = self.bit_index(round, data)?;
			if self.data[index >> 3] & (1 << (index & 7)) == 0 {
				return Ok(false);
			}
		}
		Ok(true)
	}

	pub fn contains_address(&self, address: &str) -> Result<bool, BloomError> {
		self.contains(address.as_bytes())
	}

	pub fn data(&self) -> &[u8] {
		&self.data
	}

	pub fn n_hash_funcs(&self) -> u32 {
		self.n_hash_funcs
	}

	pub fn n_tweak(&self) -> u32 {
		self.n_tweak
	}

	pub fn flags(&self) -> BloomFlags {
		self.flags
	}
}

/// Wire representation sent with stream subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomFilterPayload {
	pub v_data: String,
	pub n_hash_funcs: u32,
	pub n_tweak: u32,
	pub n_flags: u8,
}

impl From<&BloomFilter> for BloomFilterPayload {
	fn from(filter: &BloomFilter) -> Self {
		Self {
			v_data: hex::encode(&filter.data),
			n_hash_funcs: filter.n_hash_funcs,
			n_tweak: filter.n_tweak,
			n_flags: filter.flags as u8,
		}
	}
}
