use super::client::GatewayClient;
use super::types::{ReconnectRequest, StreamEvent, SubscriptionArgs, TransportError, TxStream};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Continuous transaction stream that survives dropped connections.
///
/// A retryable error is replaced by a `BeforeReconnect` event. The consumer answers it with the
/// arguments to resubscribe with; an unanswered request reuses the previous arguments.
pub(crate) async fn reconnecting_stream(
	client: GatewayClient,
	args: SubscriptionArgs,
	max_reconnects: u32,
) -> Result<TxStream, TransportError> {
	let first = client.open_transactions_stream(&args).await?;
	let (events, receiver) = mpsc::unbounded_channel();

	tokio::spawn(forward(client, args, first, events, max_reconnects));

	let inner = stream::unfold(receiver, |mut receiver| async move {
		receiver.recv().await.map(|event| (event, receiver))
	});
	Ok(TxStream::new(inner.boxed()))
}

async fn forward(
	client: GatewayClient,
	mut args: SubscriptionArgs,
	mut current: BoxStream<'static, StreamEvent>,
	events: mpsc::UnboundedSender<StreamEvent>,
	max_reconnects: u32,
) {
	let mut reconnects = 0u32;

	loop {
		let event = tokio::select! {
			_ = events.closed() => {
				debug!("Continuous stream consumer is gone, closing connection");
				return;
			}
			event = current.next() => event,
		};

		match event {
			Some(StreamEvent::Error(e)) if e.is_retryable() && reconnects < max_reconnects => {
				reconnects += 1;
				warn!(
					"Continuous stream dropped ({}), reconnecting ({}/{})",
					e, reconnects, max_reconnects
				);

				let (request, answer) = ReconnectRequest::new(args.clone());
				if events.send(StreamEvent::BeforeReconnect(request)).is_err() {
					return;
				}
				tokio::select! {
					_ = events.closed() => return,
					updated = answer => {
						if let Ok(updated) = updated {
							args = updated;
						}
					}
				}

				match client.open_transactions_stream(&args).await {
					Ok(stream) => current = stream,
					Err(e) => {
						let _ = events.send(StreamEvent::Error(e));
						return;
					}
				}
			}
			Some(StreamEvent::Error(e)) => {
				let _ = events.send(StreamEvent::Error(e));
				return;
			}
			Some(StreamEvent::End) | None => {
				let _ = events.send(StreamEvent::End);
				return;
			}
			Some(event) => {
				reconnects = 0;
				if events.send(event).is_err() {
					return;
				}
			}
		}
	}
}
