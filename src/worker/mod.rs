//! Background worker scheduling.
//!
//! A [`Worker`] is driven by a [`WorkerRunner`]: `on_start` once, then `execute` on every tick
//! of an optional interval timer, then `on_stop`. A tick never overlaps a previous one that is
//! still running. Tick errors are logged and emitted on the bus, never propagated.

/// Dependency-ordered plugin assembly
pub mod assembler;

pub use assembler::{Capability, Dependency, InjectionOrder, PluginAssembler, PluginDescriptor};

use crate::error::SyncError;
use crate::events::{EventHandler, EventSender, WalletEvent, WorkerEvent};
use crate::storage::lock;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[async_trait::async_trait]
pub trait Worker: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	async fn on_start(&self) -> Result<(), SyncError> {
		Ok(())
	}

	async fn execute(&self) -> Result<(), SyncError>;

	async fn on_stop(&self) -> Result<(), SyncError> {
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
	/// Zero disables the repeating timer
	pub interval: Duration,
	pub execute_on_start: bool,
	/// The worker stops itself once this many ticks have run
	pub max_passes: Option<u64>,
	/// Host readiness waits for the first successful tick
	pub first_execution_required: bool,
}

impl Default for WorkerOptions {
	fn default() -> Self {
		Self {
			interval: Duration::ZERO,
			execute_on_start: true,
			max_passes: None,
			first_execution_required: false,
		}
	}
}

#[derive(Default)]
struct RunnerState {
	started: AtomicBool,
	in_flight: AtomicBool,
	passes: AtomicU64,
	timer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WorkerRunner {
	worker: Arc<dyn Worker>,
	options: WorkerOptions,
	events: EventSender,
	state: Arc<RunnerState>,
}

impl WorkerRunner {
	pub fn new(worker: Arc<dyn Worker>, options: WorkerOptions, events: EventSender) -> Self {
		Self {
			worker,
			options,
			events,
			state: Arc::new(RunnerState::default()),
		}
	}

	pub fn name(&self) -> &'static str {
		self.worker.name()
	}

	pub fn options(&self) -> &WorkerOptions {
		&self.options
	}

	pub fn is_started(&self) -> bool {
		self.state.started.load(Ordering::SeqCst)
	}

	/// Ticks completed since the last start
	pub fn passes(&self) -> u64 {
		self.state.passes.load(Ordering::SeqCst)
	}

	/// Runs `on_start`, then the first tick if configured, and arms the timer.
	///
	/// Starting an already started worker is a no-op. An `on_start` failure leaves the worker
	/// stopped and is returned to the caller.
	pub async fn start(&self) -> Result<(), SyncError> {
		if self.state.started.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		info!("Starting worker {}", self.name());
		self.events.emit(WorkerEvent::Started(self.name()));

		if let Err(e) = self.worker.on_start().await {
			self.state.started.store(false, Ordering::SeqCst);
			return Err(e);
		}
		if !self.is_started() {
			debug!("Worker {} was stopped during start", self.name());
			return Ok(());
		}

		if self.options.execute_on_start {
			self.tick();
		}

		if !self.options.interval.is_zero() {
			let runner = self.clone();
			let period = self.options.interval;
			let timer = tokio::spawn(async move {
				let mut interval = tokio::time::interval_at(Instant::now() + period, period);
				interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
				loop {
					interval.tick().await;
					runner.tick();
				}
			});
			*lock(&self.state.timer) = Some(timer);
		}
		Ok(())
	}

	/// Spawns one execution unless the previous one is still in flight
	pub fn tick(&self) -> Option<JoinHandle<()>> {
		if !self.is_started() {
			return None;
		}
		if self
			.state
			.in_flight
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			debug!("Worker {} is still executing, skipping tick", self.name());
			return None;
		}

		let runner = self.clone();
		if let Some(max_passes) = self.options.max_passes {
			if self.passes() >= max_passes {
				self.state.in_flight.store(false, Ordering::SeqCst);
				info!("Worker {} reached {} passes", self.name(), max_passes);
				return Some(tokio::spawn(async move {
					if let Err(e) = runner.stop().await {
						error!("Failed to stop worker {}: {}", runner.name(), e);
					}
				}));
			}
		}

		Some(tokio::spawn(async move {
			let name = runner.name();
			let result = runner.worker.execute().await;
			runner.state.passes.fetch_add(1, Ordering::SeqCst);
			runner.state.in_flight.store(false, Ordering::SeqCst);
			match result {
				Ok(()) => runner.events.emit(WorkerEvent::Executed(name)),
				Err(e) => {
					error!("Worker {} failed: {}", name, e);
					runner.events.emit(WorkerEvent::Error {
						worker: name,
						error: e,
					});
				}
			}
		}))
	}

	/// Disarms the timer and runs `on_stop`. Stopping a stopped worker is a no-op.
	pub async fn stop(&self) -> Result<(), SyncError> {
		if !self.state.started.swap(false, Ordering::SeqCst) {
			return Ok(());
		}
		if let Some(timer) = lock(&self.state.timer).take() {
			timer.abort();
		}
		self.state.passes.store(0, Ordering::SeqCst);

		info!("Stopping worker {}", self.name());
		let result = self.worker.on_stop().await;
		self.events.emit(WorkerEvent::Stopped(self.name()));
		result
	}
}

/// Turns the first successful execution of each required worker into one ready signal
pub struct ReadinessTracker {
	pending: HashSet<&'static str>,
	ready: watch::Sender<bool>,
}

impl ReadinessTracker {
	pub fn new(
		required: impl IntoIterator<Item = &'static str>,
	) -> (Self, watch::Receiver<bool>) {
		let pending: HashSet<&'static str> = required.into_iter().collect();
		let (ready, receiver) = watch::channel(pending.is_empty());
		(Self { pending, ready }, receiver)
	}

	/// Returns true once every required worker has executed
	pub fn observe(&mut self, event: &WorkerEvent) -> bool {
		if let WorkerEvent::Executed(name) = event {
			if self.pending.remove(name) && self.pending.is_empty() {
				info!("All workers completed their first execution");
				self.ready.send_replace(true);
			}
		}
		self.pending.is_empty()
	}
}

#[async_trait::async_trait]
impl EventHandler for ReadinessTracker {
	async fn handle(&mut self, event: &WalletEvent) -> Result<(), SyncError> {
		if let WalletEvent::Worker(event) = event {
			self.observe(event);
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"ReadinessTracker"
	}
}
