//! SPV synchronization engine for a light wallet.
//!
//! Block headers are fetched over parallel gateway streams and linked into a local header
//! chain. Wallet transactions arrive through a bloom-filtered subscription and are confirmed
//! against merkle blocks whose headers are already known. [`client::SpvClient`] drives both
//! synchronizers through the chain status, historical and continuous phases.

pub mod bloom;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod keychain;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use client::SpvClient;
pub use config::ClientConfig;
pub use error::SyncError;
