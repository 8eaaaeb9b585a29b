use crate::error::ChainError;
use crate::types::BlockHeader;

use std::collections::HashSet;
use tracing::{debug, trace};

/// Longest contiguous header chain plus the orphan chunks that do not link to it yet.
///
/// Every header in the chain links by `prev_hash` to the one before it, down to the root.
/// Heights are positional: the root sits at `root_height`.
#[derive(Debug, Clone)]
pub struct SpvChain {
	root_height: u32,
	headers: Vec<BlockHeader>,
	hashes: HashSet<String>,
	orphan_chunks: Vec<Vec<BlockHeader>>,
}

impl SpvChain {
	pub fn new(mut root: BlockHeader, root_height: u32) -> Self {
		root.height = root_height;
		let hashes = HashSet::from([root.hash.clone()]);
		Self {
			root_height,
			headers: vec![root],
			hashes,
			orphan_chunks: Vec::new(),
		}
	}

	pub fn root_height(&self) -> u32 {
		self.root_height
	}

	pub fn tip(&self) -> &BlockHeader {
		// `headers` always holds at least the root
		&self.headers[self.headers.len() - 1]
	}

	pub fn tip_height(&self) -> u32 {
		self.root_height + self.headers.len() as u32 - 1
	}

	pub fn longest_chain(&self) -> &[BlockHeader] {
		&self.headers
	}

	/// Headers linked above the root
	pub fn confirmed_count(&self) -> u32 {
		self.headers.len() as u32 - 1
	}

	pub fn orphan_count(&self) -> u32 {
		self.orphan_chunks.iter().map(Vec::len).sum::<usize>() as u32
	}

	pub fn contains(&self, hash: &str) -> bool {
		self.hashes.contains(hash)
	}

	/// Adds a batch of consecutive headers and returns the headers that became part of the
	/// longest chain, in height order. A batch that does not link yet is kept as an orphan chunk.
	pub fn add_headers(&mut self, headers: Vec<BlockHeader>) -> Result<Vec<BlockHeader>, ChainError> {
		for pair in headers.windows(2) {
			if pair[1].prev_hash != pair[0].hash {
				return Err(ChainError::BrokenBatch {
					hash: pair[1].hash.clone(),
					prev_hash: pair[1].prev_hash.clone(),
				});
			}
		}

		let fresh: Vec<BlockHeader> = headers
			.into_iter()
			.skip_while(|header| self.hashes.contains(&header.hash))
			.collect();
		let Some(first) = fresh.first() else {
			trace!("Ignoring batch of known headers");
			return Ok(Vec::new());
		};

		if first.prev_hash != self.tip().hash {
			debug!(
				"Retaining orphan chunk of {} headers starting at {}",
				fresh.len(),
				first.hash
			);
			self.orphan_chunks.push(fresh);
			return Ok(Vec::new());
		}

		let mut confirmed = self.append(fresh);
		while let Some(linked) = self.take_linked_orphans() {
			confirmed.extend(self.append(linked));
		}

		let hashes = &self.hashes;
		self.orphan_chunks.retain(|chunk| {
			chunk
				.last()
				.is_some_and(|header| !hashes.contains(&header.hash))
		});
		Ok(confirmed)
	}

	fn append(&mut self, headers: Vec<BlockHeader>) -> Vec<BlockHeader> {
		let mut appended = Vec::with_capacity(headers.len());
		for mut header in headers {
			header.height = self.tip_height() + 1;
			self.hashes.insert(header.hash.clone());
			self.headers.push(header.clone());
			appended.push(header);
		}
		appended
	}

	/// Removes the orphan chunk that continues the tip and returns its unseen suffix
	fn take_linked_orphans(&mut self) -> Option<Vec<BlockHeader>> {
		let tip_hash = self.tip().hash.clone();
		let (chunk_index, offset) = self
			.orphan_chunks
			.iter()
			.enumerate()
			.find_map(|(chunk_index, chunk)| {
				chunk
					.iter()
					.position(|header| header.prev_hash == tip_hash)
					.map(|offset| (chunk_index, offset))
			})?;
		let mut chunk = self.orphan_chunks.swap_remove(chunk_index);
		Some(chunk.split_off(offset))
	}

	/// Drops all but the most recent `keep` headers of the longest chain
	pub fn prune_to(&mut self, keep: usize) {
		let keep = keep.max(1);
		if self.headers.len() <= keep {
			return;
		}
		let removed = self.headers.len() - keep;
		for header in self.headers.drain(..removed) {
			self.hashes.remove(&header.hash);
		}
		self.root_height += removed as u32;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_utils::{header_at, headers_range};

	fn chain() -> SpvChain {
		SpvChain::new(header_at(100), 100)
	}

	#[test]
	fn in_order_batches_extend_the_tip() {
		let mut chain = chain();
		let confirmed = chain.add_headers(headers_range(101, 110)).unwrap();
		assert_eq!(confirmed.len(), 10);
		assert_eq!(chain.tip_height(), 110);
		assert_eq!(chain.tip().hash, header_at(110).hash);
		assert_eq!(chain.confirmed_count(), 10);
	}

	#[test]
	fn out_of_order_batches_link_once_the_gap_is_filled() {
		let mut chain = chain();

		assert!(chain.add_headers(headers_range(121, 130)).unwrap().is_empty());
		assert!(chain.add_headers(headers_range(111, 120)).unwrap().is_empty());
		assert_eq!(chain.tip_height(), 100);
		assert_eq!(chain.orphan_count(), 20);

		let confirmed = chain.add_headers(headers_range(101, 110)).unwrap();
		assert_eq!(confirmed.len(), 30);
		assert_eq!(
			confirmed.iter().map(|h| h.height).collect::<Vec<_>>(),
			(101..=130).collect::<Vec<_>>()
		);
		assert_eq!(chain.tip_height(), 130);
		assert_eq!(chain.orphan_count(), 0);
	}

	#[test]
	fn overlapping_batches_are_deduplicated() {
		let mut chain = chain();
		chain.add_headers(headers_range(101, 110)).unwrap();

		assert!(chain.add_headers(headers_range(105, 110)).unwrap().is_empty());
		let confirmed = chain.add_headers(headers_range(108, 112)).unwrap();
		assert_eq!(
			confirmed.iter().map(|h| h.height).collect::<Vec<_>>(),
			vec![111, 112]
		);
		assert_eq!(chain.orphan_count(), 0);
	}

	#[test]
	fn overlapping_orphan_chunks_are_linked_from_the_tip() {
		let mut chain = chain();
		chain.add_headers(headers_range(111, 120)).unwrap();
		chain.add_headers(headers_range(115, 125)).unwrap();

		chain.add_headers(headers_range(101, 110)).unwrap();

		assert_eq!(chain.tip_height(), 125);
		assert_eq!(chain.orphan_count(), 0);
	}

	#[test]
	fn broken_batch_is_rejected() {
		let mut chain = chain();
		let mut batch = headers_range(101, 103);
		batch[2].prev_hash = "ff".repeat(32);
		assert!(matches!(
			chain.add_headers(batch),
			Err(ChainError::BrokenBatch { .. })
		));
		assert_eq!(chain.tip_height(), 100);
	}

	#[test]
	fn pruning_moves_the_root() {
		let mut chain = chain();
		chain.add_headers(headers_range(101, 110)).unwrap();
		chain.prune_to(3);
		assert_eq!(chain.root_height(), 108);
		assert_eq!(chain.tip_height(), 110);
		assert!(!chain.contains(&header_at(107).hash));

		let confirmed = chain.add_headers(headers_range(111, 111)).unwrap();
		assert_eq!(confirmed[0].height, 111);
	}
}
