//! Orderly teardown of the engine.
//!
//! `Running -> ShuttingDown -> Terminated`. The first trigger performs the teardown:
//! managed children are terminated (and killed after the grace period), then the hub
//! stops accepting subscribers, background tasks are told to stop and are awaited.
//! Later triggers just wait for `Terminated`.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::hub::Hub;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
	Running,
	ShuttingDown,
	Terminated,
}

pub struct ShutdownCoordinator {
	state: watch::Sender<EngineState>,
	/// Flipped once children are reclaimed; the tailer and listener watch it.
	close: watch::Sender<bool>,
	supervisor: Arc<Supervisor>,
	hub: Arc<Hub>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
	pub fn new(supervisor: Arc<Supervisor>, hub: Arc<Hub>) -> Arc<Self> {
		let (state, _) = watch::channel(EngineState::Running);
		let (close, _) = watch::channel(false);
		Arc::new(Self {
			state,
			close,
			supervisor,
			hub,
			tasks: Mutex::new(Vec::new()),
		})
	}

	pub fn state(&self) -> EngineState {
		*self.state.borrow()
	}

	/// Receiver that flips to `true` when background tasks should stop.
	pub fn close_signal(&self) -> watch::Receiver<bool> {
		self.close.subscribe()
	}

	/// Resolves when background tasks should stop. Suitable for
	/// `axum::serve(..).with_graceful_shutdown(..)`.
	pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
		let mut close = self.close.subscribe();
		async move {
			let _ = close.wait_for(|closed| *closed).await;
		}
	}

	/// Register a background task to await during teardown.
	pub async fn track(&self, handle: JoinHandle<()>) {
		self.tasks.lock().await.push(handle);
	}

	/// Move from `Running` to `ShuttingDown`. Returns false if already past `Running`.
	pub fn trigger(&self) -> bool {
		self.state.send_if_modified(|state| {
			if *state == EngineState::Running {
				*state = EngineState::ShuttingDown;
				true
			} else {
				false
			}
		})
	}

	/// Run the teardown, or wait for the one already in progress.
	pub async fn shutdown(&self) {
		if !self.trigger() {
			let mut state = self.state.subscribe();
			let _ = state.wait_for(|s| *s == EngineState::Terminated).await;
			return;
		}

		tracing::info!("received shutdown signal...");
		self.supervisor.shutdown().await;

		self.hub.close().await;
		self.close.send_replace(true);

		let tasks = std::mem::take(&mut *self.tasks.lock().await);
		for task in tasks {
			if let Err(e) = task.await {
				if !e.is_cancelled() {
					tracing::error!("background task failed during shutdown: {}", e);
				}
			}
		}

		self.state.send_replace(EngineState::Terminated);
		tracing::info!("vigil shutdown complete");
	}

	/// Wait for SIGINT/SIGTERM, then shut down.
	pub async fn run_until_signal(self: Arc<Self>) {
		if let Err(e) = wait_for_shutdown_signal().await {
			tracing::error!("failed to install signal handlers: {}", e);
			let _ = tokio::signal::ctrl_c().await;
		}
		self.shutdown().await;
	}
}

pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
	use tokio::signal::unix::{signal, SignalKind};

	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sigterm = signal(SignalKind::terminate())?;

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {},
		_ = sigint.recv() => {},
		_ = sigterm.recv() => {},
	}
	Ok(())
}
