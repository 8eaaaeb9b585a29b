//! HD address bookkeeping with a gap limit.
//!
//! Key derivation itself happens outside this crate behind [`AddressDeriver`]. The store only
//! decides which indexes must be issued so that `gap_limit` unused addresses always follow the
//! last used one on every path.

use crate::error::KeyChainError;
use crate::storage::{AddressInfo, KeyChainState, Storage};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub trait AddressDeriver: Send + Sync {
	fn derive(&self, path: &str, index: u32) -> Result<String, KeyChainError>;
}

/// Watched address set as seen by the synchronizers
pub trait KeyChain: Send + Sync {
	fn watched_addresses(&self) -> Vec<String>;

	/// Marks an address used and returns the addresses issued to keep the gap
	fn mark_address_as_used(&self, address: &str) -> Result<Vec<String>, KeyChainError>;
}

pub struct KeyChainStore {
	storage: Arc<Storage>,
	deriver: Arc<dyn AddressDeriver>,
	paths: Vec<String>,
	gap_limit: u32,
}

impl KeyChainStore {
	pub fn new(
		storage: Arc<Storage>,
		deriver: Arc<dyn AddressDeriver>,
		paths: Vec<String>,
		gap_limit: u32,
	) -> Self {
		Self {
			storage,
			deriver,
			paths,
			gap_limit,
		}
	}

	/// Issues missing addresses on every path. Returns the newly issued ones.
	pub fn ensure_gap(&self) -> Result<Vec<String>, KeyChainError> {
		let mut wallet = self.storage.wallet();
		let mut issued = Vec::new();
		for path in &self.paths {
			issued.extend(fill_gap(
				wallet.keychain_mut(path),
				path,
				self.deriver.as_ref(),
				self.gap_limit,
			)?);
		}
		Ok(issued)
	}
}

fn fill_gap(
	keychain: &mut KeyChainState,
	path: &str,
	deriver: &dyn AddressDeriver,
	gap_limit: u32,
) -> Result<Vec<String>, KeyChainError> {
	let target = keychain.last_used_index().map_or(0, |index| index + 1) + gap_limit;
	let mut issued = Vec::new();
	for index in keychain.next_index()..target {
		let address = deriver.derive(path, index)?;
		keychain.addresses.insert(
			index,
			AddressInfo {
				address: address.clone(),
				used: false,
			},
		);
		issued.push(address);
	}
	if !issued.is_empty() {
		debug!("Issued {} addresses on {}", issued.len(), path);
	}
	Ok(issued)
}

impl KeyChain for KeyChainStore {
	fn watched_addresses(&self) -> Vec<String> {
		self.storage.wallet().addresses()
	}

	fn mark_address_as_used(&self, address: &str) -> Result<Vec<String>, KeyChainError> {
		let mut wallet = self.storage.wallet();
		let Some((path, index)) = wallet.find_address(address) else {
			return Ok(Vec::new());
		};

		let keychain = wallet.keychain_mut(&path);
		match keychain.addresses.get_mut(&index) {
			Some(info) if !info.used => info.used = true,
			_ => return Ok(Vec::new()),
		}
		fill_gap(keychain, &path, self.deriver.as_ref(), self.gap_limit)
	}
}

/// Pre-derived addresses per derivation path, loaded from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressBook {
	paths: BTreeMap<String, Vec<String>>,
}

impl AddressBook {
	pub fn new(paths: BTreeMap<String, Vec<String>>) -> Self {
		Self { paths }
	}

	pub async fn load(path: &Path) -> Result<Self, crate::error::ConfigError> {
		let content = tokio::fs::read_to_string(path).await?;
		Ok(serde_json::from_str(&content)?)
	}

	pub fn paths(&self) -> Vec<String> {
		self.paths.keys().cloned().collect()
	}
}

impl AddressDeriver for AddressBook {
	fn derive(&self, path: &str, index: u32) -> Result<String, KeyChainError> {
		let addresses = self
			.paths
			.get(path)
			.ok_or_else(|| KeyChainError::UnknownPath(path.to_string()))?;
		addresses
			.get(index as usize)
			.cloned()
			.ok_or(KeyChainError::Exhausted {
				path: path.to_string(),
				index,
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::{ChainState, MemoryStateRepository, WalletState};

	struct IndexDeriver;

	impl AddressDeriver for IndexDeriver {
		fn derive(&self, path: &str, index: u32) -> Result<String, KeyChainError> {
			Ok(format!("{}/{}", path, index))
		}
	}

	fn store(gap_limit: u32) -> KeyChainStore {
		let storage = Arc::new(Storage::new(
			ChainState::new("testnet", 10),
			WalletState::new("w"),
			Arc::new(MemoryStateRepository::new()),
			6,
		));
		KeyChainStore::new(
			storage,
			Arc::new(IndexDeriver),
			vec!["m/0".to_string(), "m/1".to_string()],
			gap_limit,
		)
	}

	#[test]
	fn initial_gap_is_issued_on_every_path() {
		let store = store(3);
		let issued = store.ensure_gap().unwrap();
		assert_eq!(issued.len(), 6);
		assert!(store.ensure_gap().unwrap().is_empty());
		assert_eq!(store.watched_addresses().len(), 6);
	}

	#[test]
	fn using_an_address_extends_the_gap() {
		let store = store(3);
		store.ensure_gap().unwrap();

		let issued = store.mark_address_as_used("m/0/1").unwrap();
		assert_eq!(issued, vec!["m/0/3".to_string(), "m/0/4".to_string()]);

		assert!(store.mark_address_as_used("m/0/1").unwrap().is_empty());
		assert!(store.mark_address_as_used("m/0/0").unwrap().is_empty());
		assert!(store.mark_address_as_used("unknown").unwrap().is_empty());
	}

	#[test]
	fn address_book_runs_out() {
		let book = AddressBook::new(BTreeMap::from([(
			"m/0".to_string(),
			vec!["yA".to_string()],
		)]));
		assert_eq!(book.derive("m/0", 0).unwrap(), "yA");
		assert_eq!(
			book.derive("m/0", 1),
			Err(KeyChainError::Exhausted {
				path: "m/0".to_string(),
				index: 1
			})
		);
		assert!(matches!(
			book.derive("m/9", 0),
			Err(KeyChainError::UnknownPath(_))
		));
	}
}
