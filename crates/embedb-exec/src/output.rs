use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// tracing target for every console line of a managed process.
pub const CONSOLE_TARGET: &str = "embedb::console";

/// Rolling buffer of a process's last console lines, plus the single
/// coordination point that pattern waits block on.
///
/// Reader tasks push lines, the exit task closes the console once output has
/// been drained; both wake whoever is waiting.
#[derive(Clone)]
pub struct ConsoleWatcher {
	inner: Arc<Mutex<ConsoleState>>,
	notify: Arc<Notify>,
}

struct ConsoleState {
	ring: VecDeque<String>,
	capacity: usize,
	awaited: Option<AwaitedPattern>,
	closed: bool,
}

struct AwaitedPattern {
	pattern: String,
	matched: bool,
}

impl ConsoleWatcher {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			inner: Arc::new(Mutex::new(ConsoleState {
				ring: VecDeque::with_capacity(capacity),
				capacity,
				awaited: None,
				closed: false,
			})),
			notify: Arc::new(Notify::new()),
		}
	}

	fn state(&self) -> MutexGuard<'_, ConsoleState> {
		self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn push_line(&self, line: String) {
		{
			let mut state = self.state();
			if let Some(awaited) = state.awaited.as_mut() {
				if !awaited.matched && line.contains(&awaited.pattern) {
					awaited.matched = true;
				}
			}
			if state.ring.len() >= state.capacity {
				state.ring.pop_front();
			}
			state.ring.push_back(line);
		}
		self.notify.notify_waiters();
	}

	/// No more lines will arrive; pending and future waits return `false`.
	pub fn close(&self) {
		self.state().closed = true;
		self.notify.notify_waiters();
	}

	pub fn is_closed(&self) -> bool {
		self.state().closed
	}

	pub fn last_lines(&self) -> Vec<String> {
		self.state().ring.iter().cloned().collect()
	}

	/// Starts testing incoming lines against `pattern`. Lines that arrived
	/// before this call are not considered.
	pub fn arm(&self, pattern: &str) {
		self.state().awaited = Some(AwaitedPattern {
			pattern: pattern.to_string(),
			matched: false,
		});
	}

	pub async fn await_pattern(&self, pattern: &str, timeout: Duration) -> bool {
		self.arm(pattern);
		self.wait_armed(timeout).await
	}

	/// Waits for the pattern set by [`arm`](Self::arm).
	pub async fn wait_armed(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(outcome) = self.check_armed() {
				return outcome;
			}

			tokio::select! {
				_ = &mut notified => continue,
				_ = tokio::time::sleep_until(deadline) => {
					let mut state = self.state();
					let matched = state.awaited.as_ref().is_some_and(|a| a.matched);
					state.awaited = None;
					return matched;
				}
			}
		}
	}

	fn check_armed(&self) -> Option<bool> {
		let mut state = self.state();
		match state.awaited.as_ref() {
			Some(awaited) if awaited.matched => {
				state.awaited = None;
				Some(true)
			}
			None => Some(false),
			Some(_) if state.closed => {
				state.awaited = None;
				Some(false)
			}
			Some(_) => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
	Error,
	Warn,
	Info,
}

/// Severity of a console line, going by the markers database servers print.
pub fn classify(line: &str) -> LineLevel {
	if line.contains("ERROR") {
		LineLevel::Error
	} else if line.contains("[Warning]") || line.contains("WARNING") {
		LineLevel::Warn
	} else {
		LineLevel::Info
	}
}

/// Routes console lines of one tagged stream to tracing and into the owning
/// process's [`ConsoleWatcher`].
#[derive(Clone)]
pub struct OutputDispatcher {
	tag: Arc<str>,
	console: ConsoleWatcher,
}

impl OutputDispatcher {
	pub fn new(tag: &str, console: ConsoleWatcher) -> Self {
		Self {
			tag: Arc::from(tag),
			console,
		}
	}

	pub fn tag(&self) -> &str {
		&self.tag
	}

	pub fn dispatch(&self, line: &str) {
		let stream: &str = &self.tag;
		match classify(line) {
			LineLevel::Error => tracing::error!(target: CONSOLE_TARGET, stream, "{}", line),
			LineLevel::Warn => tracing::warn!(target: CONSOLE_TARGET, stream, "{}", line),
			LineLevel::Info => tracing::info!(target: CONSOLE_TARGET, stream, "{}", line),
		}
		self.console.push_line(line.to_string());
	}
}
