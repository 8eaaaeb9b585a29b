//! Gateway transport consumed by the synchronizers.
//!
//! The engine only talks to the network through [`CoreTransport`]. The gateway client is the
//! production implementation; tests use a channel-driven mock.

/// HTTP and websocket client for the gateway
mod client;
/// Reconnecting wrapper for continuous transaction streams
mod reconnect;
/// Wire types and stream handles
mod types;

pub use client::GatewayClient;
pub use types::*;

use crate::types::{BlockHeader, ChainStatus};

#[async_trait::async_trait]
pub trait CoreTransport: Send + Sync {
	async fn get_chain_status(&self) -> Result<ChainStatus, TransportError>;

	async fn get_block_header_by_height(&self, height: u32) -> Result<BlockHeader, TransportError>;

	/// Streams header batches for the range. `count == 0` keeps the stream open for new blocks.
	async fn subscribe_block_headers(
		&self,
		range: RangeOptions,
	) -> Result<HeadersStream, TransportError>;

	async fn create_historical_sync_stream(
		&self,
		args: SubscriptionArgs,
	) -> Result<TxStream, TransportError>;

	/// Open-ended stream. Dropped connections are re-established after a `BeforeReconnect` event.
	async fn create_continuous_sync_stream(
		&self,
		args: SubscriptionArgs,
	) -> Result<TxStream, TransportError>;
}
