//! Block header synchronization.
//!
//! [`BlockHeadersProvider`] multiplexes range-partitioned header subscriptions into an
//! [`SpvChain`]; [`BlockHeadersSyncWorker`] drives it through historical and continuous sync
//! and publishes the results to storage and the event bus.

mod provider;
mod spv_chain;
mod worker;

pub use provider::{BlockHeadersProvider, BlockHeadersProviderOptions, ProviderEvent};
pub use spv_chain::SpvChain;
pub use worker::{BlockHeadersSyncWorker, HeadersSyncState};
