use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

/// A directory and whether this crate owns it.
///
/// Ephemeral directories are defaulted under the system temp root and may be
/// wiped or deleted. Persistent ones were supplied by the user and are never
/// deleted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirSpec {
	pub path: PathBuf,
	pub ephemeral: bool,
}

impl DirSpec {
	pub fn ephemeral(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into(), ephemeral: true }
	}

	pub fn persistent(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into(), ephemeral: false }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectorySet {
	pub base: DirSpec,
	pub lib: DirSpec,
	pub data: DirSpec,
	pub tmp: DirSpec,
}

/// Root for every defaulted directory: `<temp>/embedb`.
pub fn default_root() -> PathBuf {
	std::env::temp_dir().join("embedb")
}

impl DirectorySet {
	/// Fills in defaults for any directory not given. Defaults live under
	/// [`default_root`] and are namespaced by `port` so instances on different
	/// ports never share a directory. `lib` defaults to `<base>/libs`.
	pub fn resolve(
		port: u16,
		base: Option<PathBuf>,
		lib: Option<PathBuf>,
		data: Option<PathBuf>,
		tmp: Option<PathBuf>,
	) -> Self {
		let root = default_root();
		let base = match base {
			Some(path) => DirSpec::persistent(path),
			None => DirSpec::ephemeral(root.join("base").join(port.to_string())),
		};
		let lib = match lib {
			Some(path) => DirSpec::persistent(path),
			None => DirSpec {
				path: base.path.join("libs"),
				ephemeral: base.ephemeral,
			},
		};
		let data = match data {
			Some(path) => DirSpec::persistent(path),
			None => DirSpec::ephemeral(root.join("data").join(port.to_string())),
		};
		let tmp = match tmp {
			Some(path) => DirSpec::persistent(path),
			None => DirSpec::ephemeral(root.join("tmp").join(port.to_string())),
		};
		Self { base, lib, data, tmp }
	}

	pub fn all(&self) -> [&DirSpec; 4] {
		[&self.base, &self.lib, &self.data, &self.tmp]
	}

	pub fn ephemeral(&self) -> impl Iterator<Item = &DirSpec> {
		self.all().into_iter().filter(|d| d.ephemeral)
	}

	/// Wipes an ephemeral data directory, then makes sure all four exist.
	pub fn prepare(&self) -> Result<()> {
		if self.data.ephemeral && self.data.path.exists() {
			tracing::debug!("wiping temporary data directory {}", self.data.path.display());
			std::fs::remove_dir_all(&self.data.path).map_err(|source| Error::DirectorySetupFailed {
				path: self.data.path.clone(),
				source,
			})?;
		}

		for dir in self.all() {
			std::fs::create_dir_all(&dir.path).map_err(|source| Error::DirectorySetupFailed {
				path: dir.path.clone(),
				source,
			})?;
		}
		Ok(())
	}

	/// Best-effort removal of every ephemeral directory. Already missing
	/// directories are fine; other failures are returned for logging.
	pub fn remove_ephemeral(&self) -> Vec<Error> {
		let mut failures = Vec::new();
		for dir in self.ephemeral() {
			match std::fs::remove_dir_all(&dir.path) {
				Ok(()) => tracing::debug!("removed {}", dir.path.display()),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(source) => failures.push(Error::CleanupFailed {
					path: dir.path.clone(),
					source,
				}),
			}
		}
		failures
	}
}
