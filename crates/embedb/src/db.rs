use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use embedb_exec::{ManagedProcess, OutputSink, DEFAULT_DESTROY_GRACE};
use serde::Serialize;
use tokio::sync::watch;

use crate::cleanup::CleanupRegistry;
use crate::commands::{self, Credentials, DumpOptions};
use crate::config::DbConfiguration;
use crate::dirs::DirectorySet;
use crate::error::{CommandFailure, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DbState {
	Unprepared,
	DirectoriesReady,
	Installed,
	Running,
	Stopped,
}

/// Lifecycle of one embedded database instance.
///
/// `prepare_directories`, `install`, `start` and `stop` are serialized: a
/// second caller waits for the first to finish. Client runs and dumps go
/// straight to their own processes.
pub struct Db {
	config: Arc<DbConfiguration>,
	control: tokio::sync::Mutex<()>,
	state: watch::Sender<DbState>,
	shared: Arc<Shared>,
	registry: CleanupRegistry,
	cleanup_registered: AtomicBool,
}

/// What the exit hook needs. Kept apart from [`Db`] so the hook never holds
/// the control lock.
struct Shared {
	port: u16,
	server: Mutex<Option<Arc<ManagedProcess>>>,
	dirs: DirectorySet,
	delete_on_shutdown: bool,
}

impl Shared {
	fn server(&self) -> MutexGuard<'_, Option<Arc<ManagedProcess>>> {
		self.server.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn current_server(&self) -> Option<Arc<ManagedProcess>> {
		self.server().clone()
	}

	fn cleanup(&self) {
		if let Some(server) = self.current_server().filter(|s| s.is_alive()) {
			tracing::info!("shutdown hook: stopping database on port {}", self.port);
			server.terminate_now(DEFAULT_DESTROY_GRACE);
		}
		if self.delete_on_shutdown {
			for failure in self.dirs.remove_ephemeral() {
				tracing::warn!("{}", failure);
			}
		}
	}
}

impl Db {
	pub fn new(config: DbConfiguration, registry: CleanupRegistry) -> Self {
		let shared = Arc::new(Shared {
			port: config.port,
			server: Mutex::new(None),
			dirs: config.directories.clone(),
			delete_on_shutdown: config.delete_temp_dirs_on_shutdown,
		});
		let (state, _) = watch::channel(DbState::Unprepared);
		Self {
			config: Arc::new(config),
			control: tokio::sync::Mutex::new(()),
			state,
			shared,
			registry,
			cleanup_registered: AtomicBool::new(false),
		}
	}

	/// Fresh instance: directories prepared and a new data directory installed.
	pub async fn new_embedded(config: DbConfiguration, registry: CleanupRegistry) -> Result<Self> {
		let db = Self::new(config, registry);
		db.install().await?;
		Ok(db)
	}

	/// Instance over an existing data directory: directories prepared, no
	/// install step.
	pub async fn open_embedded(config: DbConfiguration, registry: CleanupRegistry) -> Result<Self> {
		let db = Self::new(config, registry);
		db.prepare_directories().await?;
		Ok(db)
	}

	pub fn configuration(&self) -> &DbConfiguration {
		&self.config
	}

	pub fn directories(&self) -> &DirectorySet {
		&self.config.directories
	}

	pub fn registry(&self) -> &CleanupRegistry {
		&self.registry
	}

	/// Reports `Stopped` for a server that died on its own.
	pub fn state(&self) -> DbState {
		match self.stored_state() {
			DbState::Running if !self.is_running() => DbState::Stopped,
			state => state,
		}
	}

	fn stored_state(&self) -> DbState {
		*self.state.borrow()
	}

	pub fn is_running(&self) -> bool {
		self.shared.current_server().is_some_and(|s| s.is_alive())
	}

	/// The current server process, if one was started.
	pub fn server(&self) -> Option<Arc<ManagedProcess>> {
		self.shared.current_server()
	}

	// ── Control plane ───────────────────────────────────────────────────────

	pub async fn prepare_directories(&self) -> Result<()> {
		let _guard = self.control.lock().await;
		self.prepare_locked()
	}

	fn prepare_locked(&self) -> Result<()> {
		if self.is_running() {
			return Err(Error::ServerRunning);
		}
		self.config.directories.prepare()?;
		self.register_cleanup();
		self.state.send_replace(DbState::DirectoriesReady);
		Ok(())
	}

	fn register_cleanup(&self) {
		if self.cleanup_registered.swap(true, Ordering::SeqCst) {
			return;
		}
		let shared = Arc::clone(&self.shared);
		self.registry
			.register(format!("embedb on port {}", self.config.port), move || shared.cleanup());
	}

	/// Runs the install tool against the data directory. Its exit code is
	/// only logged: some distributions report failure on a usable install.
	pub async fn install(&self) -> Result<()> {
		let _guard = self.control.lock().await;
		self.install_locked().await
	}

	async fn install_locked(&self) -> Result<()> {
		if self.is_running() {
			return Err(Error::ServerRunning);
		}
		if self.stored_state() == DbState::Unprepared {
			self.prepare_locked()?;
		}

		tracing::info!(
			"Installing a new embedded database to: {}",
			self.config.directories.base.path.display()
		);
		let process = ManagedProcess::new(commands::install(&self.config)?);
		process.start()?;
		let code = process.wait_for_exit().await?;
		if code == 0 {
			tracing::info!("mysql_install_db finished");
		} else {
			tracing::warn!("mysql_install_db exited with code {}, continuing", code);
		}
		self.state.send_replace(DbState::Installed);
		Ok(())
	}

	/// Starts the server and waits for the readiness line. No-op when the
	/// server is already up. An instance that was never prepared gets its
	/// directories and install first; after an explicit
	/// [`prepare_directories`](Self::prepare_directories) the data directory
	/// is used as is.
	pub async fn start(&self) -> Result<()> {
		let _guard = self.control.lock().await;
		if self.is_running() {
			tracing::debug!("database on port {} already running", self.config.port);
			return Ok(());
		}
		if self.stored_state() == DbState::Unprepared {
			self.install_locked().await?;
		}
		self.start_locked().await
	}

	async fn start_locked(&self) -> Result<()> {
		tracing::info!("Starting up the database...");
		let process = Arc::new(ManagedProcess::new(commands::server(&self.config)?));
		*self.shared.server() = Some(Arc::clone(&process));

		let pattern = &self.config.ready_pattern;
		let timeout = self.config.startup_timeout();
		let ready = process.start_and_await_console_pattern(pattern, timeout).await?;
		if !ready {
			let last_lines = process.last_console_lines();
			process.destroy().await;
			tracing::error!("database did not become ready within {}ms", self.config.startup_timeout_ms);
			return Err(Error::StartupTimeout {
				pattern: pattern.clone(),
				timeout_ms: self.config.startup_timeout_ms,
				last_lines,
			});
		}

		self.state.send_replace(DbState::Running);
		tracing::info!("Database startup complete.");
		Ok(())
	}

	/// Stops a running server. Safe to call any number of times.
	pub async fn stop(&self) {
		let _guard = self.control.lock().await;
		match self.shared.current_server().filter(|s| s.is_alive()) {
			Some(server) => {
				tracing::info!("Stopping the database...");
				server.destroy().await;
				tracing::info!("Database stopped.");
			}
			None => tracing::info!("Database was already stopped."),
		}
		if self.stored_state() == DbState::Running {
			self.state.send_replace(DbState::Stopped);
		}
	}

	// ── Client ──────────────────────────────────────────────────────────────

	/// Pipes `script` into the client tool and waits for it.
	pub async fn run_command(
		&self,
		script: impl Into<Vec<u8>>,
		credentials: &Credentials,
		schema: Option<&str>,
		continue_on_error: bool,
	) -> Result<()> {
		let invocation = commands::client(&self.config, script.into(), credentials, schema, continue_on_error)?;
		let description = format!("{} script", invocation.tag());
		let process = ManagedProcess::new(invocation);

		let result = match process.start() {
			Ok(()) => process.wait_for_exit().await.map_err(CommandFailure::from),
			Err(e) => Err(CommandFailure::from(e)),
		};
		match result {
			Ok(0) => Ok(()),
			Ok(code) => Err(Error::CommandFailed {
				description,
				cause: CommandFailure::ExitCode(code),
			}),
			Err(cause) => Err(Error::CommandFailed { description, cause }),
		}
	}

	/// Runs one SQL command with default credentials. With `verbose` the
	/// command text is logged, otherwise only its size.
	pub async fn run(&self, command: &str, verbose: bool) -> Result<()> {
		if verbose {
			tracing::info!("Running a command: {}", command);
		} else {
			tracing::info!("Running a command of {} KiB", command.len().div_ceil(1024));
		}
		self.run_command(command, &Credentials::default(), None, false).await
	}

	pub async fn source(
		&self,
		script: impl Into<Vec<u8>>,
		credentials: &Credentials,
		schema: Option<&str>,
		continue_on_error: bool,
	) -> Result<()> {
		self.run_command(script, credentials, schema, continue_on_error).await
	}

	pub async fn source_file(
		&self,
		path: &Path,
		credentials: &Credentials,
		schema: Option<&str>,
		continue_on_error: bool,
	) -> Result<()> {
		let script = tokio::fs::read(path).await.map_err(|e| Error::CommandFailed {
			description: format!("script from {}", path.display()),
			cause: CommandFailure::Io(e),
		})?;
		tracing::info!("Running script {}", path.display());
		self.run_command(script, credentials, schema, continue_on_error).await
	}

	pub async fn create_db(&self, name: &str) -> Result<()> {
		let name = name.replace('`', "``");
		self.run(&format!("create database if not exists `{}`;", name), true).await
	}

	// ── Dump ────────────────────────────────────────────────────────────────

	/// Starts a dump writing to `sink` and returns the running process. The
	/// sink is closed when the dump's output ends.
	pub fn dump(&self, sink: OutputSink, schemas: &[&str], options: &DumpOptions) -> Result<ManagedProcess> {
		tracing::info!("Dumping {}", schemas.join(", "));
		let process = ManagedProcess::new(commands::dump(&self.config, sink, schemas, options)?);
		process.start()?;
		Ok(process)
	}

	/// Dumps into `path` and waits for the dump to finish.
	pub async fn dump_to_file(&self, path: &Path, schemas: &[&str], options: &DumpOptions) -> Result<()> {
		let file = tokio::fs::File::create(path).await.map_err(|e| Error::CommandFailed {
			description: format!("dump to {}", path.display()),
			cause: CommandFailure::Io(e),
		})?;
		let process = self.dump(Box::new(file), schemas, options)?;
		let code = process.wait_for_exit().await?;
		if code != 0 {
			return Err(Error::CommandFailed {
				description: format!("dump to {}", path.display()),
				cause: CommandFailure::ExitCode(code),
			});
		}
		tracing::info!("Dump written to {}", path.display());
		Ok(())
	}

	pub async fn dump_sql(&self, path: &Path, schemas: &[&str], credentials: Credentials) -> Result<()> {
		self.dump_to_file(path, schemas, &DumpOptions::sql(credentials)).await
	}

	pub async fn dump_xml(&self, path: &Path, schemas: &[&str], credentials: Credentials) -> Result<()> {
		self.dump_to_file(path, schemas, &DumpOptions::xml(credentials)).await
	}
}

impl std::fmt::Debug for Db {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Db")
			.field("port", &self.config.port)
			.field("state", &self.state())
			.finish()
	}
}
