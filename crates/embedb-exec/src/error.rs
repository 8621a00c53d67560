use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("executable not found or not runnable: {}", .0.display())]
	ExecutableNotFound(PathBuf),

	#[error("invocation already finalized, it can no longer be changed")]
	InvocationFinalized,

	#[error("failed to spawn {program}: {source}")]
	SpawnFailed {
		program: String,
		#[source]
		source: std::io::Error,
	},

	#[error("{0}: process already started")]
	AlreadyStarted(String),

	#[error("{0}: process was never started")]
	NotStarted(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}
