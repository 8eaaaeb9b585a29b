//! Event bus shared by the synchronizers and the host.
//!
//! Each component emits its own scoped event type ([`HeadersEvent`], [`TransactionsEvent`],
//! [`WorkerEvent`]) through an [`EventSender`]. Events travel over an unbounded channel to an
//! [`EventDispatcher`], which fans them out to the registered handlers in registration order.
//! An error event that nobody receives is logged instead of being lost silently.

use crate::error::SyncError;
use crate::sync::mediator::SyncPhase;
use crate::sync::progress::{HeadersSyncProgress, SyncProgress, TransactionsSyncProgress};
use crate::types::{BlockHeader, Transaction};

use tokio::sync::mpsc;
use tracing::{error, info};

/// Events emitted by the block header synchronizer
#[derive(Debug)]
pub enum HeadersEvent {
    BlockHeightChanged(u32),
    NewBlock(BlockHeader),
    Progress(HeadersSyncProgress),
    /// Normalized confirmed/unconfirmed/total progress
    SyncProgress(SyncProgress),
    Error(SyncError),
}

/// Events emitted by the transaction synchronizer
#[derive(Debug)]
pub enum TransactionsEvent {
    ConfirmedTransaction(Transaction),
    InstantLocked(String),
    Progress(TransactionsSyncProgress),
    Error(SyncError),
}

/// Lifecycle events emitted by the worker scheduler
#[derive(Debug)]
pub enum WorkerEvent {
    Started(&'static str),
    /// A tick of the worker completed without error
    Executed(&'static str),
    Stopped(&'static str),
    Error {
        worker: &'static str,
        error: SyncError,
    },
}

#[derive(Debug)]
pub enum WalletEvent {
    Headers(HeadersEvent),
    Transactions(TransactionsEvent),
    Worker(WorkerEvent),
    PhaseChanged(SyncPhase),
}

impl WalletEvent {
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            WalletEvent::Headers(HeadersEvent::Error(e))
            | WalletEvent::Transactions(TransactionsEvent::Error(e))
            | WalletEvent::Worker(WorkerEvent::Error { error: e, .. }) => Some(e),
            _ => None,
        }
    }
}

impl From<HeadersEvent> for WalletEvent {
    fn from(event: HeadersEvent) -> Self {
        WalletEvent::Headers(event)
    }
}

impl From<TransactionsEvent> for WalletEvent {
    fn from(event: TransactionsEvent) -> Self {
        WalletEvent::Transactions(event)
    }
}

impl From<WorkerEvent> for WalletEvent {
    fn from(event: WorkerEvent) -> Self {
        WalletEvent::Worker(event)
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<WalletEvent>;

/// Cloneable emitting side of the bus
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<WalletEvent>,
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn emit(&self, event: impl Into<WalletEvent>) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event.into()) {
            if let Some(e) = event.error() {
                error!("Unhandled sync error: {}", e);
            }
        }
    }
}

/// Trait for handling wallet events.
#[async_trait::async_trait]
pub trait EventHandler: Send {
    async fn handle(&mut self, event: &WalletEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
pub struct EventDispatcher {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Handlers are called in the order they are registered.
    pub fn register_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: &WalletEvent) {
        if self.handlers.is_empty() {
            if let Some(e) = event.error() {
                error!("Unhandled sync error: {}", e);
            }
            return;
        }
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }

    /// Dispatches events until every sender is dropped
    pub async fn run(mut self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.dispatch(&event).await;
        }
    }
}

/// Logs progress and failures
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&mut self, event: &WalletEvent) -> Result<(), SyncError> {
        match event {
            WalletEvent::Headers(HeadersEvent::BlockHeightChanged(height)) => {
                info!("Block height changed to {}", height);
            }
            WalletEvent::Headers(HeadersEvent::Progress(progress)) => {
                info!(
                    "Headers sync: {:.1}% confirmed, {:.1}% total ({}/{} headers)",
                    progress.confirmed_progress,
                    progress.total_progress,
                    progress.confirmed_synced_count,
                    progress.total_count
                );
            }
            WalletEvent::Transactions(TransactionsEvent::Progress(progress)) => {
                info!(
                    "Transactions sync: {:.1}% ({}/{} blocks, {} transactions)",
                    progress.progress,
                    progress.synced_blocks_count,
                    progress.total_blocks_count,
                    progress.transactions_count
                );
            }
            WalletEvent::Transactions(TransactionsEvent::ConfirmedTransaction(tx)) => {
                info!("Transaction {} confirmed", tx.hash);
            }
            WalletEvent::PhaseChanged(phase) => info!("Sync phase: {}", phase),
            other => {
                if let Some(e) = other.error() {
                    error!("Sync error: {}", e);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingEventHandler"
    }
}
