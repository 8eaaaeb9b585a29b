//! SPV client host.
//!
//! `SpvClient` wires the synchronizers together and drives them through the sync phases:
//!
//! 1. `CHAIN_STATUS_SYNC` - fetch the best height from the gateway and persist it
//! 2. `HISTORICAL_SYNC` - start every worker in plugin order; `on_start` catches up to the tip
//! 3. `CONTINUOUS_SYNC` - run each synchronizer's first `execute`, which follows new blocks
//!
//! Stopping walks the workers in reverse order, saves state and returns to `OFFLINE`.

use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::events::EventSender;
use crate::keychain::{AddressDeriver, KeyChainStore};
use crate::storage::{Storage, StorageWorker, lock};
use crate::sync::headers::BlockHeadersSyncWorker;
use crate::sync::mediator::{ChainSyncMediator, SyncPhase};
use crate::sync::transactions::TransactionsSyncWorker;
use crate::transport::CoreTransport;
use crate::worker::{Capability, PluginAssembler, Worker, WorkerOptions, WorkerRunner};

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Instrument, error, info, info_span};

/// Workers whose first execution marks the client as ready
pub const SYNC_WORKERS: [&str; 2] = [BlockHeadersSyncWorker::NAME, TransactionsSyncWorker::NAME];

pub struct SpvClient {
    config: ClientConfig,
    transport: Arc<dyn CoreTransport>,
    storage: Arc<Storage>,
    keychain: Arc<KeyChainStore>,
    mediator: Arc<ChainSyncMediator>,
    events: EventSender,
    runners: Mutex<Vec<WorkerRunner>>,
}

impl SpvClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn CoreTransport>,
        storage: Arc<Storage>,
        deriver: Arc<dyn AddressDeriver>,
        paths: Vec<String>,
        events: EventSender,
    ) -> Self {
        let keychain = Arc::new(KeyChainStore::new(
            storage.clone(),
            deriver,
            paths,
            config.gap_limit,
        ));
        let mediator = Arc::new(ChainSyncMediator::new(events.clone()));
        Self {
            config,
            transport,
            storage,
            keychain,
            mediator,
            events,
            runners: Mutex::new(Vec::new()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn phase(&self) -> SyncPhase {
        self.mediator.phase()
    }

    /// Names of the running workers in start order
    pub fn workers(&self) -> Vec<&'static str> {
        lock(&self.runners).iter().map(WorkerRunner::name).collect()
    }

    /// Syncs to the current tip and keeps following the chain until `stop` is called
    pub async fn start(&self) -> Result<(), SyncError> {
        let span = info_span!("wallet", id = %self.config.wallet_id);
        async {
            if !lock(&self.runners).is_empty() {
                return Err(SyncError::usage("SPV client is already started"));
            }

            self.sync_chain_status().await?;
            let issued = self.keychain.ensure_gap()?;
            if !issued.is_empty() {
                info!("Issued {} addresses to fill the gap limit", issued.len());
            }

            let runners = self.assemble()?;
            *lock(&self.runners) = runners.clone();

            self.mediator.set_phase(SyncPhase::HistoricalSync);
            for runner in &runners {
                if let Err(e) = runner.start().await {
                    error!("Worker {} failed to start: {}", runner.name(), e);
                    if let Err(stop_error) = self.stop().await {
                        error!("Failed to stop after start failure: {}", stop_error);
                    }
                    return Err(e);
                }
            }

            self.mediator.set_phase(SyncPhase::ContinuousSync);
            for runner in runners.iter().filter(|runner| runner.options().interval.is_zero()) {
                if let Some(execution) = runner.tick() {
                    if let Err(e) = execution.await {
                        error!("Worker {} execution panicked: {}", runner.name(), e);
                    }
                }
            }
            info!("SPV client is following the chain");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Stops the workers in reverse start order and persists state
    pub async fn stop(&self) -> Result<(), SyncError> {
        let span = info_span!("wallet", id = %self.config.wallet_id);
        async {
            let runners = std::mem::take(&mut *lock(&self.runners));
            let mut first_error = None;
            for runner in runners.iter().rev() {
                if let Err(e) = runner.stop().await {
                    error!("Failed to stop worker {}: {}", runner.name(), e);
                    first_error.get_or_insert(e);
                }
            }

            self.storage.save_state().await?;
            self.mediator.set_phase(SyncPhase::Offline);
            info!("SPV client stopped");
            first_error.map_or(Ok(()), Err)
        }
        .instrument(span)
        .await
    }

    async fn sync_chain_status(&self) -> Result<u32, SyncError> {
        self.mediator.set_phase(SyncPhase::ChainStatusSync);
        let status = self.transport.get_chain_status().await?;
        info!("Gateway reports best block {}", status.best_block_height);
        self.storage
            .chain()
            .update_chain_height(status.best_block_height);
        self.storage.save_state().await?;
        Ok(status.best_block_height)
    }

    fn assemble(&self) -> Result<Vec<WorkerRunner>, SyncError> {
        let headers = BlockHeadersSyncWorker::new(
            self.transport.clone(),
            self.storage.clone(),
            self.events.clone(),
            self.config.headers.clone(),
            self.config.sync.clone(),
        );
        let transactions = TransactionsSyncWorker::new(
            self.transport.clone(),
            self.storage.clone(),
            self.keychain.clone(),
            self.mediator.clone(),
            self.events.clone(),
            headers.subscribe_chain_tip(),
            self.config.transactions.clone(),
            self.config.sync.clone(),
        );

        let sync_options = WorkerOptions {
            execute_on_start: false,
            first_execution_required: true,
            ..Default::default()
        };
        let storage_options = WorkerOptions {
            interval: Duration::from_secs(self.config.storage.autosave_interval_secs),
            execute_on_start: false,
            ..Default::default()
        };

        let mut assembler: PluginAssembler<(Arc<dyn Worker>, WorkerOptions)> =
            PluginAssembler::new([
                Capability::Storage,
                Capability::Transport,
                Capability::KeyChain,
                Capability::Events,
                Capability::Mediator,
                Capability::ChainTip,
            ]);
        assembler.register(
            TransactionsSyncWorker::descriptor(),
            (Arc::new(transactions), sync_options.clone()),
        );
        assembler.register(
            BlockHeadersSyncWorker::descriptor(),
            (Arc::new(headers), sync_options),
        );
        assembler.register(
            StorageWorker::descriptor(BlockHeadersSyncWorker::NAME),
            (Arc::new(StorageWorker::new(self.storage.clone())), storage_options),
        );

        Ok(assembler
            .assemble()?
            .into_iter()
            .map(|(_, (worker, options))| WorkerRunner::new(worker, options, self.events.clone()))
            .collect())
    }
}
