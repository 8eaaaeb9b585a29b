use crate::error::{SyncError, ValidationError};
use crate::events::{EventSender, WalletEvent};
use crate::storage::ChainState;
use crate::types::TransactionMetadata;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::sync::PoisonError;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
	Offline,
	ChainStatusSync,
	HistoricalSync,
	ContinuousSync,
}

impl fmt::Display for SyncPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SyncPhase::Offline => "OFFLINE",
			SyncPhase::ChainStatusSync => "CHAIN_STATUS_SYNC",
			SyncPhase::HistoricalSync => "HISTORICAL_SYNC",
			SyncPhase::ContinuousSync => "CONTINUOUS_SYNC",
		};
		f.write_str(name)
	}
}

impl FromStr for SyncPhase {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"OFFLINE" => Ok(SyncPhase::Offline),
			"CHAIN_STATUS_SYNC" => Ok(SyncPhase::ChainStatusSync),
			"HISTORICAL_SYNC" => Ok(SyncPhase::HistoricalSync),
			"CONTINUOUS_SYNC" => Ok(SyncPhase::ContinuousSync),
			other => Err(ValidationError::InvalidSyncState(other.to_string())),
		}
	}
}

/// Shared sync phase consulted by both synchronizers
pub struct ChainSyncMediator {
	phase: RwLock<SyncPhase>,
	events: EventSender,
}

impl ChainSyncMediator {
	pub fn new(events: EventSender) -> Self {
		Self {
			phase: RwLock::new(SyncPhase::Offline),
			events,
		}
	}

	pub fn phase(&self) -> SyncPhase {
		*self.phase.read().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn set_phase(&self, phase: SyncPhase) {
		let previous = {
			let mut current = self.phase.write().unwrap_or_else(PoisonError::into_inner);
			std::mem::replace(&mut *current, phase)
		};
		if previous != phase {
			info!("Sync phase {} -> {}", previous, phase);
			self.events.emit(WalletEvent::PhaseChanged(phase));
		}
	}

	/// Sets the phase from its wire name. Undefined names are rejected.
	pub fn set_phase_str(&self, phase: &str) -> Result<(), SyncError> {
		self.set_phase(phase.parse::<SyncPhase>()?);
		Ok(())
	}

	/// Confirmation metadata for a block from the locally synced header index.
	///
	/// `Ok(None)` means the header is not known yet.
	pub fn transaction_metadata(
		&self,
		chain: &ChainState,
		block_hash: &str,
	) -> Result<Option<TransactionMetadata>, ValidationError> {
		let phase = self.phase();
		if !matches!(phase, SyncPhase::HistoricalSync | SyncPhase::ContinuousSync) {
			return Err(ValidationError::InvalidSyncState(format!(
				"no header index available while {}",
				phase
			)));
		}
		let Some(header) = chain.header_metadata(block_hash) else {
			return Ok(None);
		};
		if header.time == 0 {
			return Err(ValidationError::InvalidHeaderTime(block_hash.to_string()));
		}
		TransactionMetadata::from_header(block_hash, header)
			.map(Some)
			.ok_or_else(|| ValidationError::InvalidHeaderTime(block_hash.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events;
	use crate::test_utils::header_at;

	#[test]
	fn phase_names_round_trip_and_reject_unknown() {
		for phase in [
			SyncPhase::Offline,
			SyncPhase::ChainStatusSync,
			SyncPhase::HistoricalSync,
			SyncPhase::ContinuousSync,
		] {
			assert_eq!(phase.to_string().parse::<SyncPhase>().unwrap(), phase);
		}
		assert_eq!(
			"SYNCING".parse::<SyncPhase>(),
			Err(ValidationError::InvalidSyncState("SYNCING".to_string()))
		);
	}

	#[test]
	fn invalid_state_assignment_keeps_phase() {
		let (sender, mut receiver) = events::channel();
		let mediator = ChainSyncMediator::new(sender);
		mediator.set_phase(SyncPhase::HistoricalSync);
		assert!(mediator.set_phase_str("bogus").is_err());
		assert_eq!(mediator.phase(), SyncPhase::HistoricalSync);

		mediator.set_phase(SyncPhase::HistoricalSync);
		let mut changes = 0;
		while receiver.try_recv().is_ok() {
			changes += 1;
		}
		assert_eq!(changes, 1);
	}

	#[test]
	fn metadata_comes_from_local_header_index() {
		let (sender, _receiver) = events::channel();
		let mediator = ChainSyncMediator::new(sender);
		let mut chain = ChainState::new("testnet", 10);
		let header = header_at(7);
		chain.update_headers_metadata(std::slice::from_ref(&header));

		assert!(mediator.transaction_metadata(&chain, &header.hash).is_err());

		mediator.set_phase(SyncPhase::HistoricalSync);
		let metadata = mediator
			.transaction_metadata(&chain, &header.hash)
			.unwrap()
			.unwrap();
		assert_eq!(metadata.height, 7);
		assert_eq!(metadata.block_hash, header.hash);
		assert_eq!(mediator.transaction_metadata(&chain, "unknown").unwrap(), None);
	}
}
