use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use embedb_exec::ProcessListener;
use serde::{Deserialize, Serialize};

use crate::dirs::DirectorySet;
use crate::error::{Error, Result};

// ── Executables ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Executable {
	Server,
	Client,
	Dump,
	InstallDb,
	PrintDefaults,
}

impl Executable {
	pub const ALL: [Executable; 5] = [
		Executable::Server,
		Executable::Client,
		Executable::Dump,
		Executable::InstallDb,
		Executable::PrintDefaults,
	];

	/// Location inside the base directory of a stock server distribution.
	pub fn default_relative_path(self, windows: bool) -> PathBuf {
		let path = match (self, windows) {
			(Executable::Server, _) => "bin/mariadbd",
			(Executable::Client, _) => "bin/mariadb",
			(Executable::Dump, _) => "bin/mariadb-dump",
			(Executable::InstallDb, false) => "scripts/mariadb-install-db",
			(Executable::InstallDb, true) => "bin/mariadb-install-db",
			(Executable::PrintDefaults, _) => "bin/my_print_defaults",
		};
		if windows {
			PathBuf::from(format!("{}.exe", path))
		} else {
			PathBuf::from(path)
		}
	}
}

/// Per-tool overrides; unset tools resolve inside the base directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutablePaths {
	pub server: Option<PathBuf>,
	pub client: Option<PathBuf>,
	pub dump: Option<PathBuf>,
	pub install_db: Option<PathBuf>,
	pub print_defaults: Option<PathBuf>,
}

impl ExecutablePaths {
	pub fn get(&self, kind: Executable) -> Option<&PathBuf> {
		match kind {
			Executable::Server => self.server.as_ref(),
			Executable::Client => self.client.as_ref(),
			Executable::Dump => self.dump.as_ref(),
			Executable::InstallDb => self.install_db.as_ref(),
			Executable::PrintDefaults => self.print_defaults.as_ref(),
		}
	}

	pub fn set(&mut self, kind: Executable, path: impl Into<PathBuf>) {
		let slot = match kind {
			Executable::Server => &mut self.server,
			Executable::Client => &mut self.client,
			Executable::Dump => &mut self.dump,
			Executable::InstallDb => &mut self.install_db,
			Executable::PrintDefaults => &mut self.print_defaults,
		};
		*slot = Some(path.into());
	}
}

// ── Builder (config.toml) ────────────────────────────────────────────────────

/// User-facing configuration. Every field is optional; [`build`](Self::build)
/// fills in defaults. Deserializes from TOML:
///
/// ```toml
/// port = 3307
/// base_dir = "/opt/mariadb"
/// args = ["--lower_case_table_names=1"]
///
/// [executables]
/// server = "/usr/sbin/mariadbd"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DbConfigBuilder {
	/// `0` picks a free local port.
	pub port: u16,
	pub socket: Option<PathBuf>,
	pub base_dir: Option<PathBuf>,
	pub lib_dir: Option<PathBuf>,
	pub data_dir: Option<PathBuf>,
	pub tmp_dir: Option<PathBuf>,
	pub executables: ExecutablePaths,
	pub args: Vec<String>,
	pub security_disabled: Option<bool>,
	pub default_character_set: Option<String>,
	pub delete_temp_dirs_on_shutdown: Option<bool>,
	pub startup_timeout_ms: Option<u64>,
	pub ready_pattern: Option<String>,
	pub windows: Option<bool>,
	pub log_lines: Option<usize>,
	#[serde(skip)]
	pub listener: Option<Arc<dyn ProcessListener>>,
}

pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_READY_PATTERN: &str = ": ready for connections.";

impl DbConfigBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_toml_str(content: &str) -> Result<Self> {
		toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
	}

	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
		toml::from_str(&content).map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
	}

	pub fn build(self) -> Result<DbConfiguration> {
		let port = if self.port == 0 { free_port()? } else { self.port };
		let windows = self.windows.unwrap_or(cfg!(windows));
		let directories = DirectorySet::resolve(port, self.base_dir, self.lib_dir, self.data_dir, self.tmp_dir);

		let executables = Executable::ALL
			.into_iter()
			.map(|kind| {
				let path = self
					.executables
					.get(kind)
					.cloned()
					.unwrap_or_else(|| directories.base.path.join(kind.default_relative_path(windows)));
				(kind, path)
			})
			.collect();

		let socket = self
			.socket
			.unwrap_or_else(|| std::env::temp_dir().join(format!("embedb.{}.sock", port)));

		Ok(DbConfiguration {
			port,
			socket,
			directories,
			executables,
			args: self.args,
			security_disabled: self.security_disabled.unwrap_or(true),
			default_character_set: self.default_character_set.filter(|s| !s.trim().is_empty()),
			delete_temp_dirs_on_shutdown: self.delete_temp_dirs_on_shutdown.unwrap_or(true),
			startup_timeout_ms: self.startup_timeout_ms.unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
			ready_pattern: self.ready_pattern.unwrap_or_else(|| DEFAULT_READY_PATTERN.to_string()),
			windows,
			log_lines: self.log_lines.unwrap_or(embedb_exec::DEFAULT_CONSOLE_LINES),
			listener: self.listener,
		})
	}
}

fn free_port() -> Result<u16> {
	let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
		.map_err(|e| Error::Config(format!("no free port available: {}", e)))?;
	let port = listener
		.local_addr()
		.map_err(|e| Error::Config(format!("no free port available: {}", e)))?
		.port();
	Ok(port)
}

// ── Resolved configuration ───────────────────────────────────────────────────

/// Fully resolved configuration of one database instance.
#[derive(Debug, Clone, Serialize)]
pub struct DbConfiguration {
	pub port: u16,
	pub socket: PathBuf,
	pub directories: DirectorySet,
	pub executables: BTreeMap<Executable, PathBuf>,
	pub args: Vec<String>,
	pub security_disabled: bool,
	pub default_character_set: Option<String>,
	pub delete_temp_dirs_on_shutdown: bool,
	pub startup_timeout_ms: u64,
	pub ready_pattern: String,
	pub windows: bool,
	pub log_lines: usize,
	#[serde(skip)]
	pub listener: Option<Arc<dyn ProcessListener>>,
}

impl DbConfiguration {
	pub fn executable(&self, kind: Executable) -> PathBuf {
		self.executables
			.get(&kind)
			.cloned()
			.unwrap_or_else(|| self.directories.base.path.join(kind.default_relative_path(self.windows)))
	}

	pub fn startup_timeout(&self) -> Duration {
		Duration::from_millis(self.startup_timeout_ms)
	}

	/// Variable the server's shared-library directory is exported through.
	pub fn library_env_var(&self) -> &'static str {
		if self.windows {
			"PATH"
		} else if cfg!(target_os = "macos") {
			"DYLD_LIBRARY_PATH"
		} else {
			"LD_LIBRARY_PATH"
		}
	}

	/// Whether the user supplied a server argument starting with `name`.
	pub fn has_argument(&self, name: &str) -> bool {
		self.args.iter().any(|arg| arg.starts_with(name))
	}

	pub fn socket_absolute(&self) -> PathBuf {
		std::path::absolute(&self.socket).unwrap_or_else(|_| self.socket.clone())
	}
}
