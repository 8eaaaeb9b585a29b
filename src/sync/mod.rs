pub mod headers;
pub mod mediator;
pub mod progress;
pub mod transactions;

use tokio::sync::watch;

/// Resolves once the stop flag is raised, or when its sender is gone
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
	let _ = stop.wait_for(|stopped| *stopped).await;
}
