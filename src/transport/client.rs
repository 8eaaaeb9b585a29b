//!
//! JSON client for the wallet gateway.
//!
//! Unary calls are JSON-RPC requests over HTTP. Header and transaction streams are websocket
//! subscriptions: after a `connection_init`/`connection_ack` handshake the client sends one
//! `subscribe` frame and receives `next`, `error` and `complete` frames.

use super::reconnect::reconnecting_stream;
use super::types::*;
use super::CoreTransport;
use crate::bloom::BloomFilterPayload;
use crate::types::{BlockHeader, ChainStatus};

use futures::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_tungstenite::{
	connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, error, info};

const DEFAULT_MAX_RECONNECTS: u32 = 10;

/// Gateway client
#[derive(Clone)]
pub struct GatewayClient {
	http_client: Client,
	/// JSON-RPC endpoint for unary calls.
	gateway_url: String,
	/// Websocket endpoint for subscriptions.
	ws_url: String,
	/// Consecutive reconnect attempts allowed for a continuous stream.
	max_reconnects: u32,
}

/// Frame received on a subscription
#[derive(Debug)]
pub(crate) enum SubscriptionMessage {
	Next(Value),
	Error(TransportError),
	Complete,
}

impl GatewayClient {
	pub fn new(gateway_url: String, ws_url: String) -> Result<Self, TransportError> {
		let http_client = Client::builder()
			.timeout(Duration::from_secs(30))
			.build()?;

		Ok(Self {
			http_client,
			gateway_url,
			ws_url,
			max_reconnects: DEFAULT_MAX_RECONNECTS,
		})
	}

	pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
		self.max_reconnects = max_reconnects;
		self
	}

	async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, TransportError> {
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": method,
			"params": params,
		});

		let response = self
			.http_client
			.post(&self.gateway_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(TransportError::new(
				StatusCode::Unavailable,
				format!("HTTP error: {}", response.status()),
			));
		}

		let mut response_json: Value = response.json().await?;

		if let Some(error) = response_json.get("error") {
			return Err(parse_error(error));
		}

		let result = response_json
			.get_mut("result")
			.map(Value::take)
			.ok_or_else(|| TransportError::new(StatusCode::Internal, "No data returned"))?;
		Ok(serde_json::from_value(result)?)
	}

	/// Opens a websocket subscription and yields its frames until `complete` or an error
	pub(crate) async fn open_subscription(
		&self,
		method: &'static str,
		params: Value,
	) -> Result<BoxStream<'static, SubscriptionMessage>, TransportError> {
		debug!("Opening {} subscription at {}", method, self.ws_url);

		let request = self.ws_url.clone().into_client_request()?;
		let (ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		ws_sender
			.send(Message::Text(json!({ "type": "connection_init" }).to_string()))
			.await?;

		match ws_receiver.next().await {
			Some(Ok(Message::Text(text))) => {
				let parsed: Value = serde_json::from_str(&text)?;
				if parsed.get("type").and_then(Value::as_str) != Some("connection_ack") {
					return Err(TransportError::new(
						StatusCode::Unavailable,
						"Connection not acknowledged",
					));
				}
			}
			Some(Ok(_)) => {
				return Err(TransportError::new(
					StatusCode::Unavailable,
					"Unexpected message type during handshake",
				));
			}
			Some(Err(e)) => return Err(e.into()),
			None => {
				return Err(TransportError::new(
					StatusCode::Unavailable,
					"Connection closed during handshake",
				));
			}
		}

		let subscribe = json!({
			"id": method,
			"type": "subscribe",
			"payload": {
				"method": method,
				"params": params,
			}
		});
		ws_sender.send(Message::Text(subscribe.to_string())).await?;

		let frames = stream::unfold((ws_receiver, ws_sender, false), |(mut receiver, sender, done)| async move {
			if done {
				return None;
			}
			loop {
				let message = match receiver.next().await {
					Some(Ok(Message::Text(text))) => match parse_frame(&text) {
						Some(message) => message,
						None => continue,
					},
					Some(Ok(Message::Close(_))) | None => SubscriptionMessage::Error(
						TransportError::new(StatusCode::Unavailable, "Gateway closed the subscription"),
					),
					Some(Ok(_)) => continue,
					Some(Err(e)) => SubscriptionMessage::Error(e.into()),
				};
				let done = !matches!(message, SubscriptionMessage::Next(_));
				return Some((message, (receiver, sender, done)));
			}
		});

		Ok(frames.boxed())
	}

	/// Opens one transaction subscription without reconnect handling
	pub(crate) async fn open_transactions_stream(
		&self,
		args: &SubscriptionArgs,
	) -> Result<BoxStream<'static, StreamEvent>, TransportError> {
		let params = json!({
			"bloomFilter": BloomFilterPayload::from(&args.bloom_filter),
			"fromBlockHeight": args.range.from_block_height,
			"count": args.range.count,
		});
		let frames = self
			.open_subscription("subscribeToTransactionsWithProofs", params)
			.await?;

		Ok(frames
			.map(|message| match message {
				SubscriptionMessage::Next(payload) => {
					match serde_json::from_value::<TxStreamResponse>(payload) {
						Ok(response) => StreamEvent::Data(response),
						Err(e) => {
							error!("Failed to deserialize transactions stream chunk: {}", e);
							StreamEvent::Error(e.into())
						}
					}
				}
				SubscriptionMessage::Error(e) => StreamEvent::Error(e),
				SubscriptionMessage::Complete => StreamEvent::End,
			})
			.boxed())
	}
}

fn parse_error(error: &Value) -> TransportError {
	let code = error
		.get("code")
		.cloned()
		.and_then(|code| serde_json::from_value::<StatusCode>(code).ok())
		.unwrap_or(StatusCode::Unknown);
	let message = error
		.get("message")
		.and_then(Value::as_str)
		.unwrap_or("Unknown gateway error");
	TransportError::new(code, message)
}

fn parse_frame(text: &str) -> Option<SubscriptionMessage> {
	let parsed = match serde_json::from_str::<Value>(text) {
		Ok(parsed) => parsed,
		Err(e) => return Some(SubscriptionMessage::Error(e.into())),
	};

	match parsed.get("type").and_then(Value::as_str) {
		Some("next") => match parsed.get("payload").and_then(|p| p.get("data")) {
			Some(data) => Some(SubscriptionMessage::Next(data.clone())),
			None => Some(SubscriptionMessage::Error(TransportError::new(
				StatusCode::Internal,
				"Subscription frame without data",
			))),
		},
		Some("error") => {
			let payload = parsed.get("payload").cloned().unwrap_or(Value::Null);
			Some(SubscriptionMessage::Error(parse_error(&payload)))
		}
		Some("complete") => {
			debug!("Subscription completed");
			Some(SubscriptionMessage::Complete)
		}
		Some(other) => {
			debug!("Ignoring message type: {}", other);
			None
		}
		None => Some(SubscriptionMessage::Error(TransportError::new(
			StatusCode::Internal,
			"Message missing type field",
		))),
	}
}

#[async_trait::async_trait]
impl CoreTransport for GatewayClient {
	async fn get_chain_status(&self) -> Result<ChainStatus, TransportError> {
		let status: ChainStatus = self.call("getBlockchainStatus", json!({})).await?;
		info!("Gateway reports best block height {}", status.best_block_height);
		Ok(status)
	}

	async fn get_block_header_by_height(&self, height: u32) -> Result<BlockHeader, TransportError> {
		let mut header: BlockHeader = self
			.call("getBlockHeaderByHeight", json!({ "height": height }))
			.await?;
		header.height = height;
		Ok(header)
	}

	async fn subscribe_block_headers(
		&self,
		range: RangeOptions,
	) -> Result<HeadersStream, TransportError> {
		let frames = self
			.open_subscription(
				"subscribeToBlockHeadersWithChainLocks",
				json!({
					"fromBlockHeight": range.from_block_height,
					"count": range.count,
				}),
			)
			.await?;

		Ok(frames
			.take_while(|message| {
				futures::future::ready(!matches!(message, SubscriptionMessage::Complete))
			})
			.map(|message| match message {
				SubscriptionMessage::Next(payload) => Ok(serde_json::from_value::<HeaderBatch>(payload)?),
				SubscriptionMessage::Error(e) => Err(e),
				SubscriptionMessage::Complete => Err(TransportError::new(
					StatusCode::Internal,
					"Subscription already completed",
				)),
			})
			.boxed())
	}

	async fn create_historical_sync_stream(
		&self,
		args: SubscriptionArgs,
	) -> Result<TxStream, TransportError> {
		let events = self.open_transactions_stream(&args).await?;
		Ok(TxStream::new(events))
	}

	async fn create_continuous_sync_stream(
		&self,
		args: SubscriptionArgs,
	) -> Result<TxStream, TransportError> {
		reconnecting_stream(self.clone(), args, self.max_reconnects).await
	}
}
