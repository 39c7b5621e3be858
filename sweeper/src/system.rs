
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;


/// A struct to be held in scope while a task is working.
pub struct RuntimeWorker {
	mgr: RuntimeManager,
	name: &'static str,
	critical: bool,
}

impl std::ops::Drop for RuntimeWorker {
	fn drop(&mut self) {
		self.mgr.drop_worker(self.name, self.critical);
	}
}

struct Inner {
	shutdown: CancellationToken,
	workers: AtomicUsize,
	notify: Notify,
}

/// Coordinates the tasks of a running sweeper.
///
/// Cancelling the manager is the global shutdown signal.
#[derive(Clone)]
pub struct RuntimeManager {
	inner: Arc<Inner>,
}

impl RuntimeManager {
	pub fn new() -> RuntimeManager {
		RuntimeManager {
			inner: Arc::new(Inner {
				shutdown: CancellationToken::new(),
				workers: AtomicUsize::new(0),
				notify: Notify::new(),
			}),
		}
	}

	fn add_worker(&self) {
		self.inner.workers.fetch_add(1, atomic::Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	fn sub_worker(&self) {
		let old = self.inner.workers.fetch_sub(1, atomic::Ordering::SeqCst);
		assert_ne!(old, 0);
		self.inner.notify.notify_waiters();
	}

	/// Create a worker that will inform the [RuntimeManager] when it goes out of scope.
	pub fn spawn(&self, name: &'static str) -> RuntimeWorker {
		self.add_worker();
		slog!(WorkerStarted, name: name.into(), critical: false);
		RuntimeWorker {
			mgr: self.clone(),
			name: name,
			critical: false,
		}
	}

	/// Create a worker that will inform the [RuntimeManager] when it goes out of scope.
	///
	/// When a critical worker ends, shutdown will be triggered.
	pub fn spawn_critical(&self, name: &'static str) -> RuntimeWorker {
		self.add_worker();
		slog!(WorkerStarted, name: name.into(), critical: true);
		RuntimeWorker {
			mgr: self.clone(),
			name: name,
			critical: true,
		}
	}

	fn drop_worker(&self, name: &'static str, critical: bool) {
		self.sub_worker();
		if critical && !self.inner.shutdown.is_cancelled() {
			slog!(CriticalWorkerStopped, name: name.into());
			self.shutdown();
		} else {
			slog!(WorkerStopped, name: name.into());
		}
	}

	/// Start shutdown. Calling this more than once has no further effect.
	pub fn shutdown(&self) {
		self.inner.shutdown.cancel();
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}

	pub fn shutdown_done(&self) -> bool {
		self.inner.workers.load(atomic::Ordering::SeqCst) == 0
	}

	/// Wait for all workers to finish.
	pub async fn wait(&self) {
		loop {
			let notified = self.inner.notify.notified();
			if self.shutdown_done() {
				return;
			}
			notified.await;
		}
	}

	/// Start shutdown and wait for it to finish.
	pub async fn shutdown_wait(&self) {
		self.shutdown();
		self.wait().await;
	}

	pub fn shutdown_signal(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
		self.inner.shutdown.cancelled()
	}

	/// A token that is cancelled on shutdown, owned so it can move into tasks.
	pub fn shutdown_token(&self) -> CancellationToken {
		self.inner.shutdown.clone()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use std::time::Duration;

	#[tokio::test]
	async fn shutdown_waits_for_workers() {
		let rtmgr = RuntimeManager::new();
		let worker = rtmgr.spawn("test");
		assert!(!rtmgr.shutdown_done());

		let token = rtmgr.shutdown_token();
		tokio::spawn(async move {
			token.cancelled().await;
			tokio::time::sleep(Duration::from_millis(10)).await;
			drop(worker);
		});

		rtmgr.shutdown_wait().await;
		assert!(rtmgr.shutdown_done());
		// idempotent
		rtmgr.shutdown();
		rtmgr.shutdown_wait().await;
		assert!(rtmgr.is_shutdown());
	}

	#[tokio::test]
	async fn critical_worker_triggers_shutdown() {
		let rtmgr = RuntimeManager::new();
		let worker = rtmgr.spawn_critical("critical");
		assert!(!rtmgr.is_shutdown());
		drop(worker);
		assert!(rtmgr.is_shutdown());
		rtmgr.shutdown_signal().await;
	}
}
