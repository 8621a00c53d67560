use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::invocation::{Invocation, OutputSink};
use crate::output::{ConsoleWatcher, OutputDispatcher};
use crate::types::{ProcessListener, ProcessState};

/// How long `destroy` waits after SIGTERM before sending SIGKILL.
pub const DEFAULT_DESTROY_GRACE: Duration = Duration::from_secs(5);

/// How long the exit task keeps draining output after the child has exited.
/// A grandchild holding the pipe open must not keep the process "alive".
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a lingering drain gets to close its sink once told to stop.
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const REAP_INTERVAL: Duration = Duration::from_millis(25);

/// The spawned child, shared by the exit task and [`ManagedProcess::terminate_now`].
/// Whichever side reaps first caches the status for the other.
#[derive(Clone)]
struct ChildSlot(Arc<Mutex<Option<Child>>>);

impl ChildSlot {
	fn empty() -> Self {
		Self(Arc::new(Mutex::new(None)))
	}

	fn lock(&self) -> MutexGuard<'_, Option<Child>> {
		self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn try_reap(&self) -> std::io::Result<Option<ExitStatus>> {
		match self.lock().as_mut() {
			Some(child) => child.try_wait(),
			None => Ok(None),
		}
	}
}

/// A supervised child process with captured console output and a recorded
/// terminal state.
///
/// One instance owns exactly one OS process generation. State, pid, exit code
/// and the last console lines stay readable after the process is gone.
pub struct ManagedProcess {
	pending: Mutex<Option<Invocation>>,
	description: String,
	tag: String,
	console: ConsoleWatcher,
	state: Arc<watch::Sender<ProcessState>>,
	destroy: Arc<watch::Sender<bool>>,
	pid: Arc<OnceLock<u32>>,
	child: ChildSlot,
	grace: Duration,
}

impl ManagedProcess {
	pub fn new(invocation: Invocation) -> Self {
		let console = ConsoleWatcher::new(invocation.console_lines);
		let (state, _) = watch::channel(ProcessState::Created);
		let (destroy, _) = watch::channel(false);
		Self {
			description: invocation.command_line(),
			tag: invocation.tag.clone(),
			pending: Mutex::new(Some(invocation)),
			console,
			state: Arc::new(state),
			destroy: Arc::new(destroy),
			pid: Arc::new(OnceLock::new()),
			child: ChildSlot::empty(),
			grace: DEFAULT_DESTROY_GRACE,
		}
	}

	pub fn with_destroy_grace(mut self, grace: Duration) -> Self {
		self.grace = grace;
		self
	}

	pub fn tag(&self) -> &str {
		&self.tag
	}

	pub fn description(&self) -> &str {
		&self.description
	}

	pub fn console(&self) -> &ConsoleWatcher {
		&self.console
	}

	pub fn state(&self) -> ProcessState {
		*self.state.borrow()
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid.get().copied()
	}

	pub fn exit_code(&self) -> Option<i32> {
		self.state().exit_code()
	}

	/// Reads the state written by the exit task, the same source `wait_for_exit` uses.
	pub fn is_alive(&self) -> bool {
		self.state().is_running()
	}

	pub fn last_console_lines(&self) -> Vec<String> {
		self.console.last_lines()
	}

	/// Spawns the OS process and the tasks that drain its output and detect
	/// its exit. Must be called within a tokio runtime.
	pub fn start(&self) -> Result<()> {
		let invocation = self
			.pending
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.take()
			.ok_or_else(|| Error::AlreadyStarted(self.tag.clone()))?;

		self.state.send_replace(ProcessState::Starting);
		tracing::debug!("starting {}: {}", self.tag, self.description);

		let Invocation {
			executable,
			args,
			env,
			working_dir,
			stdin,
			stdout_sink,
			listener,
			destroy_on_exit,
			tag,
			..
		} = invocation;

		let mut cmd = Command::new(&executable);
		cmd.args(&args)
			.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(destroy_on_exit)
			.process_group(0);
		if let Some(dir) = &working_dir {
			cmd.current_dir(dir);
		}
		for (key, val) in &env {
			cmd.env(key, val);
		}

		let mut child = match cmd.spawn() {
			Ok(child) => child,
			Err(source) => {
				let program = executable.display().to_string();
				tracing::error!("failed to spawn {}: {}", program, source);
				self.console.close();
				self.state.send_replace(ProcessState::Completed { exit_code: -1 });
				return Err(Error::SpawnFailed { program, source });
			}
		};

		let pid = child.id().unwrap_or(0);
		let _ = self.pid.set(pid);
		tracing::info!("{} started (pid {})", tag, pid);

		if let (Some(input), Some(mut writer)) = (stdin, child.stdin.take()) {
			let tag = tag.clone();
			tokio::spawn(async move {
				if let Err(e) = writer.write_all(&input).await {
					tracing::debug!("{}: stdin closed early: {}", tag, e);
				}
				let _ = writer.shutdown().await;
			});
		}

		let (drain_stop, _) = watch::channel(false);
		let dispatcher = OutputDispatcher::new(&tag, self.console.clone());
		let mut drains = Vec::new();
		if let Some(stdout) = child.stdout.take() {
			let stop = drain_stop.subscribe();
			drains.push(match stdout_sink {
				Some(sink) => tokio::spawn(copy_to_sink(stdout, sink, tag.clone(), stop)),
				None => tokio::spawn(pipe_lines(stdout, dispatcher.clone(), stop)),
			});
		}
		if let Some(stderr) = child.stderr.take() {
			drains.push(tokio::spawn(pipe_lines(stderr, dispatcher, drain_stop.subscribe())));
		}

		*self.child.lock() = Some(child);
		self.state.send_replace(ProcessState::Running { pid });

		let exit = ExitWatch {
			tag,
			pid,
			state: Arc::clone(&self.state),
			destroy: self.destroy.subscribe(),
			console: self.console.clone(),
			child: self.child.clone(),
			listener,
			grace: self.grace,
			drain_stop,
		};
		tokio::spawn(exit.run(drains));

		Ok(())
	}

	/// Arms `pattern` before spawning so no early line can slip past, then
	/// waits for it.
	pub async fn start_and_await_console_pattern(&self, pattern: &str, timeout: Duration) -> Result<bool> {
		self.console.arm(pattern);
		self.start()?;
		Ok(self.console.wait_armed(timeout).await)
	}

	/// `true` once a console line containing `pattern` shows up; `false` on
	/// timeout or when the process exits first.
	pub async fn await_console_pattern(&self, pattern: &str, timeout: Duration) -> bool {
		self.console.await_pattern(pattern, timeout).await
	}

	/// Waits for the process to terminate and returns its exit code. Repeated
	/// calls return the same recorded code.
	pub async fn wait_for_exit(&self) -> Result<i32> {
		if self.state() == ProcessState::Created {
			return Err(Error::NotStarted(self.tag.clone()));
		}
		let mut rx = self.state.subscribe();
		let code = rx
			.wait_for(|s| s.is_terminal())
			.await
			.ok()
			.and_then(|s| s.exit_code());
		Ok(code.unwrap_or(-1))
	}

	/// Terminates the process group: SIGTERM, then SIGKILL after the grace
	/// period. Returns once the process is gone. No-op when it never ran or
	/// has already terminated.
	pub async fn destroy(&self) {
		if !self.is_alive() {
			return;
		}
		tracing::debug!("destroying {} (pid {:?})", self.tag, self.pid());
		self.destroy.send_replace(true);
		let mut rx = self.state.subscribe();
		let _ = rx.wait_for(|s| s.is_terminal()).await;
	}

	/// Synchronous teardown for shutdown paths, usable where no runtime is
	/// driving the exit task (drop hooks on a current-thread runtime). Signals
	/// the process group, reaps the child directly and records `Destroyed`.
	/// Escalates to SIGKILL once `grace` has passed.
	pub fn terminate_now(&self, grace: Duration) {
		let Some(pid) = self.pid().filter(|_| self.is_alive()) else {
			return;
		};
		self.destroy.send_replace(true);
		signal_group(pid, Signal::SIGTERM);

		let step = Duration::from_millis(10);
		let started = std::time::Instant::now();
		let mut killed = false;
		loop {
			if !self.is_alive() {
				return;
			}
			let exit_code = match self.child.try_reap() {
				Ok(Some(status)) => Some(exit_code_of(status)),
				Ok(None) => None,
				Err(e) => {
					tracing::error!("{} (pid {}): wait failed: {}", self.tag, pid, e);
					Some(-1)
				}
			};
			if let Some(exit_code) = exit_code {
				self.console.close();
				if publish_terminal(&self.state, ProcessState::Destroyed { exit_code }) {
					tracing::info!("{} (pid {}) destroyed (exit {})", self.tag, pid, exit_code);
				}
				return;
			}

			let waited = started.elapsed();
			if !killed && waited >= grace {
				tracing::warn!("{} (pid {}) ignored SIGTERM, killing", self.tag, pid);
				signal_group(pid, Signal::SIGKILL);
				killed = true;
			} else if killed && waited >= grace * 2 + Duration::from_secs(1) {
				tracing::error!("{} (pid {}) could not be reaped", self.tag, pid);
				return;
			}
			std::thread::sleep(step);
		}
	}
}

/// Records `state` unless a terminal state is already recorded.
fn publish_terminal(sender: &watch::Sender<ProcessState>, state: ProcessState) -> bool {
	sender.send_if_modified(|current| {
		if current.is_terminal() {
			false
		} else {
			*current = state;
			true
		}
	})
}

fn exit_code_of(status: ExitStatus) -> i32 {
	status.code().unwrap_or(-1)
}

struct ExitWatch {
	tag: String,
	pid: u32,
	state: Arc<watch::Sender<ProcessState>>,
	destroy: watch::Receiver<bool>,
	console: ConsoleWatcher,
	child: ChildSlot,
	listener: Option<Arc<dyn ProcessListener>>,
	grace: Duration,
	drain_stop: watch::Sender<bool>,
}

impl ExitWatch {
	async fn run(mut self, drains: Vec<JoinHandle<()>>) {
		let mut destroyed = false;
		let mut kill_at: Option<tokio::time::Instant> = None;
		let mut tick = tokio::time::interval(REAP_INTERVAL);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		let status = loop {
			match self.child.try_reap() {
				Ok(Some(status)) => break Ok(status),
				Ok(None) => {}
				Err(e) => break Err(e),
			}
			if kill_at.is_some_and(|at| tokio::time::Instant::now() >= at) {
				tracing::warn!("{} (pid {}) ignored SIGTERM, killing", self.tag, self.pid);
				signal_group(self.pid, Signal::SIGKILL);
				kill_at = None;
			}
			tokio::select! {
				_ = tick.tick() => {}
				_ = flag_raised(&mut self.destroy), if !destroyed => {
					destroyed = true;
					signal_group(self.pid, Signal::SIGTERM);
					kill_at = Some(tokio::time::Instant::now() + self.grace);
				}
			}
		};
		let destroyed = destroyed || *self.destroy.borrow();

		let exit_code = match status {
			Ok(status) => exit_code_of(status),
			Err(e) => {
				tracing::error!("{} (pid {}): wait failed: {}", self.tag, self.pid, e);
				-1
			}
		};

		self.finish_drains(drains).await;
		self.console.close();

		// Listener runs before waiters can observe the terminal state.
		if let Some(listener) = &self.listener {
			if exit_code == 0 && !destroyed {
				listener.on_complete(exit_code);
			} else {
				listener.on_failed(exit_code);
			}
		}

		let state = if destroyed {
			ProcessState::Destroyed { exit_code }
		} else {
			ProcessState::Completed { exit_code }
		};
		if publish_terminal(&self.state, state) {
			let verb = if destroyed { "destroyed" } else { "exited" };
			tracing::info!("{} (pid {}) {} (exit {})", self.tag, self.pid, verb, exit_code);
		}
	}

	/// Waits for output to end. Drains still open at the deadline are told to
	/// stop so a sink gets shut down, and are aborted if they do not finish.
	async fn finish_drains(&self, drains: Vec<JoinHandle<()>>) {
		let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
		let mut lingering = Vec::new();
		for mut drain in drains {
			if tokio::time::timeout_at(deadline, &mut drain).await.is_err() {
				lingering.push(drain);
			}
		}
		if lingering.is_empty() {
			return;
		}

		tracing::debug!("{}: output still open after exit, detaching", self.tag);
		self.drain_stop.send_replace(true);
		for mut drain in lingering {
			if tokio::time::timeout(SINK_CLOSE_TIMEOUT, &mut drain).await.is_err() {
				drain.abort();
			}
		}
	}
}

async fn flag_raised(rx: &mut watch::Receiver<bool>) {
	loop {
		if *rx.borrow_and_update() {
			return;
		}
		if rx.changed().await.is_err() {
			std::future::pending::<()>().await;
		}
	}
}

async fn pipe_lines<R: AsyncRead + Unpin>(reader: R, dispatcher: OutputDispatcher, mut stop: watch::Receiver<bool>) {
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::with_capacity(256);
	loop {
		buf.clear();
		let read = tokio::select! {
			read = reader.read_until(b'\n', &mut buf) => read,
			_ = flag_raised(&mut stop) => break,
		};
		match read {
			Ok(0) => break,
			Ok(_) => {
				let line = String::from_utf8_lossy(&buf);
				dispatcher.dispatch(line.trim_end_matches(['\n', '\r']));
			}
			Err(e) => {
				tracing::debug!("{}: output read failed: {}", dispatcher.tag(), e);
				break;
			}
		}
	}
}

/// Owns the sink for the lifetime of the copy, so it is shut down exactly once
/// whether the copy finishes, fails or is stopped.
async fn copy_to_sink<R: AsyncRead + Unpin>(
	mut reader: R,
	mut sink: OutputSink,
	tag: String,
	mut stop: watch::Receiver<bool>,
) {
	let copied = tokio::select! {
		copied = tokio::io::copy(&mut reader, &mut sink) => Some(copied),
		_ = flag_raised(&mut stop) => None,
	};
	match copied {
		Some(Ok(bytes)) => tracing::debug!("{}: wrote {} bytes to output sink", tag, bytes),
		Some(Err(e)) => tracing::error!("{}: writing output sink failed: {}", tag, e),
		None => tracing::debug!("{}: output still open, closing sink", tag),
	}
	if let Err(e) = sink.shutdown().await {
		tracing::error!("{}: closing output sink failed: {}", tag, e);
	}
}

pub(crate) fn signal_group(pid: u32, signal: Signal) {
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;
	if pid == 0 {
		return;
	}
	if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
		tracing::debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
	}
}
