use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// Executable lookup, finalized invocations and spawn failures.
	#[error(transparent)]
	Exec(#[from] embedb_exec::Error),

	#[error("failed to prepare directory {}: {source}", .path.display())]
	DirectorySetupFailed {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error(
		"database did not start: '{pattern}' not seen within {timeout_ms}ms{}",
		format_lines(.last_lines)
	)]
	StartupTimeout {
		pattern: String,
		timeout_ms: u64,
		last_lines: Vec<String>,
	},

	#[error("failed running a {description}: {cause}")]
	CommandFailed {
		description: String,
		#[source]
		cause: CommandFailure,
	},

	#[error("cleanup of {} failed: {source}", .path.display())]
	CleanupFailed {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("database server is running, stop it first")]
	ServerRunning,

	#[error("invalid configuration: {0}")]
	Config(String),
}

#[derive(Debug, Error)]
pub enum CommandFailure {
	#[error("exited with code {0}")]
	ExitCode(i32),

	#[error(transparent)]
	Exec(#[from] embedb_exec::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

fn format_lines(lines: &[String]) -> String {
	if lines.is_empty() {
		String::new()
	} else {
		format!("\nlast console lines:\n{}", lines.join("\n"))
	}
}
