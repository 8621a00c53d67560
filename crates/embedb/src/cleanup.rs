use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Action = Box<dyn FnOnce() + Send>;

/// Actions to run once when the host program shuts down.
///
/// Cloning yields another handle to the same registry. Entries run on the
/// first of: an explicit [`run`](Self::run), the signal handler installed by
/// [`install_signal_handler`](Self::install_signal_handler), or the last handle
/// being dropped. A panicking entry is logged and does not stop the others.
/// A second `run` returns only after the first one has finished.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
	inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
	entries: Mutex<Vec<(String, Action)>>,
	ran: AtomicBool,
	running: Mutex<()>,
}

impl Inner {
	fn entries(&self) -> MutexGuard<'_, Vec<(String, Action)>> {
		self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn run(&self) {
		let _running = self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		let entries = {
			let mut entries = self.entries();
			self.ran.store(true, Ordering::SeqCst);
			std::mem::take(&mut *entries)
		};
		for (name, action) in entries {
			run_entry(&name, action);
		}
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		self.run();
	}
}

fn run_entry(name: &str, action: Action) {
	tracing::debug!("running cleanup: {}", name);
	if std::panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
		tracing::error!("cleanup '{}' panicked", name);
	}
}

impl std::fmt::Debug for CleanupRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CleanupRegistry")
			.field("entries", &self.len())
			.field("ran", &self.has_run())
			.finish()
	}
}

impl CleanupRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds an entry. Registering after the registry has run executes the
	/// action right away.
	pub fn register(&self, name: impl Into<String>, action: impl FnOnce() + Send + 'static) {
		let name = name.into();
		let action: Action = Box::new(action);
		{
			let mut entries = self.inner.entries();
			if !self.inner.ran.load(Ordering::SeqCst) {
				entries.push((name, action));
				return;
			}
		}
		run_entry(&name, action);
	}

	/// Pending entries.
	pub fn len(&self) -> usize {
		self.inner.entries().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn has_run(&self) -> bool {
		self.inner.ran.load(Ordering::SeqCst)
	}

	/// Runs every pending entry. Later calls find nothing left to do.
	/// Blocks while entries tear processes down; call it from
	/// `spawn_blocking` inside a runtime.
	pub fn run(&self) {
		self.inner.run();
	}

	/// Waits for SIGINT or SIGTERM, then runs the entries on a blocking
	/// thread and returns once they are done.
	pub async fn run_on_signal(&self) {
		shutdown_signal().await;
		tracing::info!("shutting down");
		let runner = self.clone();
		if let Err(e) = tokio::task::spawn_blocking(move || runner.run()).await {
			tracing::error!("cleanup task failed: {}", e);
		}
	}

	/// On SIGINT or SIGTERM: run the entries, then exit the process with
	/// status 130. Must be called within a tokio runtime.
	pub fn install_signal_handler(&self) -> tokio::task::JoinHandle<()> {
		let registry = self.clone();
		tokio::spawn(async move {
			registry.run_on_signal().await;
			std::process::exit(130);
		})
	}
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			tracing::error!("failed to listen for ctrl-c: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				tracing::error!("failed to listen for SIGTERM: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
