use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInfo {
	pub address: String,
	pub used: bool,
}

/// Addresses issued on one derivation path, by index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChainState {
	pub addresses: BTreeMap<u32, AddressInfo>,
}

impl KeyChainState {
	pub fn next_index(&self) -> u32 {
		self.addresses
			.keys()
			.next_back()
			.map(|index| index + 1)
			.unwrap_or(0)
	}

	/// Index of the last used address, if any
	pub fn last_used_index(&self) -> Option<u32> {
		self.addresses
			.iter()
			.rev()
			.find(|(_, info)| info.used)
			.map(|(index, _)| *index)
	}

	pub fn position(&self, address: &str) -> Option<u32> {
		self.addresses
			.iter()
			.find(|(_, info)| info.address == address)
			.map(|(index, _)| *index)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
	wallet_id: String,
	/// Highest block considered safe from reorgs at the last save
	last_known_block: Option<u32>,
	keychains: BTreeMap<String, KeyChainState>,
}

impl WalletState {
	pub fn new(wallet_id: impl Into<String>) -> Self {
		Self {
			wallet_id: wallet_id.into(),
			last_known_block: None,
			keychains: BTreeMap::new(),
		}
	}

	pub fn wallet_id(&self) -> &str {
		&self.wallet_id
	}

	pub fn last_known_block(&self) -> Option<u32> {
		self.last_known_block
	}

	pub fn update_last_known_block(&mut self, height: u32) {
		self.last_known_block = Some(height);
	}

	pub fn keychain(&self, path: &str) -> Option<&KeyChainState> {
		self.keychains.get(path)
	}

	pub fn keychain_mut(&mut self, path: &str) -> &mut KeyChainState {
		self.keychains.entry(path.to_string()).or_default()
	}

	/// Derivation path and index of a wallet address
	pub fn find_address(&self, address: &str) -> Option<(String, u32)> {
		self.keychains.iter().find_map(|(path, keychain)| {
			keychain
				.position(address)
				.map(|index| (path.clone(), index))
		})
	}

	pub fn contains_address(&self, address: &str) -> bool {
		self.find_address(address).is_some()
	}

	/// Every issued address, ordered by path then index
	pub fn addresses(&self) -> Vec<String> {
		self.keychains
			.values()
			.flat_map(|keychain| keychain.addresses.values())
			.map(|info| info.address.clone())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn finds_addresses_across_paths() {
		let mut state = WalletState::new("w");
		state.keychain_mut("m/0").addresses.insert(
			0,
			AddressInfo {
				address: "yA".into(),
				used: false,
			},
		);
		state.keychain_mut("m/1").addresses.insert(
			3,
			AddressInfo {
				address: "yB".into(),
				used: true,
			},
		);

		assert_eq!(state.find_address("yB"), Some(("m/1".to_string(), 3)));
		assert!(!state.contains_address("yC"));
		assert_eq!(state.addresses(), vec!["yA".to_string(), "yB".to_string()]);
		assert_eq!(state.keychain("m/1").unwrap().next_index(), 4);
		assert_eq!(state.keychain("m/1").unwrap().last_used_index(), Some(3));
		assert_eq!(state.keychain("m/0").unwrap().last_used_index(), None);
	}
}
