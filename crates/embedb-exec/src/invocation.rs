use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWrite;

use crate::error::{Error, Result};
use crate::types::ProcessListener;

/// Byte sink that receives a process's stdout verbatim instead of the console.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

pub const DEFAULT_CONSOLE_LINES: usize = 100;

/// Everything needed to launch one child process. Built by
/// [`InvocationBuilder`] and consumed by [`ManagedProcess`](crate::ManagedProcess).
pub struct Invocation {
	pub(crate) executable: PathBuf,
	pub(crate) args: Vec<String>,
	pub(crate) env: BTreeMap<String, String>,
	pub(crate) working_dir: Option<PathBuf>,
	pub(crate) stdin: Option<Vec<u8>>,
	pub(crate) stdout_sink: Option<OutputSink>,
	pub(crate) listener: Option<Arc<dyn ProcessListener>>,
	pub(crate) destroy_on_exit: bool,
	pub(crate) tag: String,
	pub(crate) console_lines: usize,
}

impl Invocation {
	pub fn executable(&self) -> &Path {
		&self.executable
	}

	pub fn args(&self) -> &[String] {
		&self.args
	}

	pub fn env(&self) -> &BTreeMap<String, String> {
		&self.env
	}

	pub fn working_dir(&self) -> Option<&Path> {
		self.working_dir.as_deref()
	}

	pub fn tag(&self) -> &str {
		&self.tag
	}

	pub fn destroy_on_exit(&self) -> bool {
		self.destroy_on_exit
	}

	pub fn has_stdin(&self) -> bool {
		self.stdin.is_some()
	}

	pub fn has_stdout_sink(&self) -> bool {
		self.stdout_sink.is_some()
	}

	/// Executable and arguments joined for log lines.
	pub fn command_line(&self) -> String {
		let mut line = self.executable.display().to_string();
		for arg in &self.args {
			line.push(' ');
			line.push_str(arg);
		}
		line
	}
}

impl std::fmt::Debug for Invocation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Invocation")
			.field("executable", &self.executable)
			.field("args", &self.args)
			.field("env", &self.env)
			.field("working_dir", &self.working_dir)
			.field("stdin", &self.stdin.as_ref().map(Vec::len))
			.field("stdout_sink", &self.stdout_sink.is_some())
			.field("destroy_on_exit", &self.destroy_on_exit)
			.field("tag", &self.tag)
			.finish()
	}
}

/// Append-only builder for an [`Invocation`].
///
/// Argument order is kept exactly as added. After [`build`](Self::build) every
/// mutator fails with [`Error::InvocationFinalized`].
pub struct InvocationBuilder {
	executable: PathBuf,
	args: Vec<String>,
	env: BTreeMap<String, String>,
	working_dir: Option<PathBuf>,
	stdin: Option<Vec<u8>>,
	stdout_sink: Option<OutputSink>,
	listener: Option<Arc<dyn ProcessListener>>,
	destroy_on_exit: bool,
	tag: Option<String>,
	console_lines: usize,
	finalized: bool,
}

impl InvocationBuilder {
	pub fn new(executable: impl Into<PathBuf>) -> Self {
		Self {
			executable: executable.into(),
			args: Vec::new(),
			env: BTreeMap::new(),
			working_dir: None,
			stdin: None,
			stdout_sink: None,
			listener: None,
			destroy_on_exit: true,
			tag: None,
			console_lines: DEFAULT_CONSOLE_LINES,
			finalized: false,
		}
	}

	pub fn executable(&self) -> &Path {
		&self.executable
	}

	pub fn args(&self) -> &[String] {
		&self.args
	}

	fn check_open(&self) -> Result<()> {
		if self.finalized {
			return Err(Error::InvocationFinalized);
		}
		Ok(())
	}

	pub fn arg(&mut self, arg: impl Into<String>) -> Result<&mut Self> {
		self.check_open()?;
		self.args.push(arg.into());
		Ok(self)
	}

	pub fn args_from<I, S>(&mut self, args: I) -> Result<&mut Self>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.check_open()?;
		self.args.extend(args.into_iter().map(Into::into));
		Ok(self)
	}

	/// Adds `prefix` and `value` as one argument, e.g. `-u` + `root` → `-uroot`.
	pub fn arg_joined(&mut self, prefix: &str, value: &str) -> Result<&mut Self> {
		self.arg(format!("{}{}", prefix, value))
	}

	/// Adds `name=<absolute path>`. Some tools resolve relative paths against
	/// their own working directory, so the path is made absolute here.
	pub fn file_arg(&mut self, name: &str, path: &Path) -> Result<&mut Self> {
		self.check_open()?;
		let absolute = std::path::absolute(path)?;
		self.args.push(format!("{}={}", name, absolute.display()));
		Ok(self)
	}

	/// Overlays one variable on top of the inherited environment.
	pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<&mut Self> {
		self.check_open()?;
		self.env.insert(key.into(), value.into());
		Ok(self)
	}

	pub fn working_dir(&mut self, dir: impl Into<PathBuf>) -> Result<&mut Self> {
		self.check_open()?;
		self.working_dir = Some(dir.into());
		Ok(self)
	}

	/// Bytes written to the child's stdin, which is closed afterwards.
	pub fn stdin_bytes(&mut self, input: impl Into<Vec<u8>>) -> Result<&mut Self> {
		self.check_open()?;
		self.stdin = Some(input.into());
		Ok(self)
	}

	pub fn stdout_sink(&mut self, sink: OutputSink) -> Result<&mut Self> {
		self.check_open()?;
		self.stdout_sink = Some(sink);
		Ok(self)
	}

	pub fn listener(&mut self, listener: Arc<dyn ProcessListener>) -> Result<&mut Self> {
		self.check_open()?;
		self.listener = Some(listener);
		Ok(self)
	}

	/// Kill the child when the runtime that supervises it goes away.
	pub fn destroy_on_exit(&mut self, destroy: bool) -> Result<&mut Self> {
		self.check_open()?;
		self.destroy_on_exit = destroy;
		Ok(self)
	}

	/// Stream tag used when dispatching console lines. Defaults to the
	/// executable's file name.
	pub fn tag(&mut self, tag: impl Into<String>) -> Result<&mut Self> {
		self.check_open()?;
		self.tag = Some(tag.into());
		Ok(self)
	}

	pub fn console_lines(&mut self, lines: usize) -> Result<&mut Self> {
		self.check_open()?;
		self.console_lines = lines.max(1);
		Ok(self)
	}

	pub fn build(&mut self) -> Result<Invocation> {
		self.check_open()?;
		let executable = resolve_executable(&self.executable)?;
		self.finalized = true;

		let tag = self.tag.take().unwrap_or_else(|| {
			executable
				.file_name()
				.map(|n| n.to_string_lossy().to_string())
				.unwrap_or_else(|| "process".to_string())
		});

		Ok(Invocation {
			executable,
			args: std::mem::take(&mut self.args),
			env: std::mem::take(&mut self.env),
			working_dir: self.working_dir.take(),
			stdin: self.stdin.take(),
			stdout_sink: self.stdout_sink.take(),
			listener: self.listener.take(),
			destroy_on_exit: self.destroy_on_exit,
			tag,
			console_lines: self.console_lines,
		})
	}
}

fn resolve_executable(executable: &Path) -> Result<PathBuf> {
	let bare_name = !executable.is_absolute() && executable.components().count() == 1;
	if bare_name {
		return which::which(executable).map_err(|_| Error::ExecutableNotFound(executable.to_path_buf()));
	}

	if is_runnable(executable) {
		Ok(executable.to_path_buf())
	} else {
		Err(Error::ExecutableNotFound(executable.to_path_buf()))
	}
}

#[cfg(unix)]
fn is_runnable(path: &Path) -> bool {
	use std::os::unix::fs::PermissionsExt;
	match std::fs::metadata(path) {
		Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
		Err(_) => false,
	}
}

#[cfg(not(unix))]
fn is_runnable(path: &Path) -> bool {
	path.is_file()
}
