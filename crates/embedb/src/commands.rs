//! Command lines for the server distribution's tools.

use std::sync::Arc;

use embedb_exec::{Invocation, InvocationBuilder, OutputSink, ProcessListener};

use crate::config::{DbConfiguration, Executable};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
	pub user: Option<String>,
	pub password: Option<String>,
}

impl Credentials {
	pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			user: Some(user.into()),
			password: Some(password.into()),
		}
	}

	pub fn user(&self) -> Option<&str> {
		self.user.as_deref().filter(|u| !u.trim().is_empty())
	}

	pub fn password(&self) -> Option<&str> {
		self.password.as_deref().filter(|p| !p.is_empty())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOptions {
	pub compact: bool,
	pub lock_tables: bool,
	pub xml: bool,
	pub credentials: Credentials,
}

impl DumpOptions {
	pub fn sql(credentials: Credentials) -> Self {
		Self { compact: true, lock_tables: true, xml: false, credentials }
	}

	pub fn xml(credentials: Credentials) -> Self {
		Self { compact: true, lock_tables: true, xml: true, credentials }
	}
}

fn base_builder(config: &DbConfiguration, kind: Executable, tag: &str) -> Result<InvocationBuilder> {
	let dirs = &config.directories;
	let mut b = InvocationBuilder::new(config.executable(kind));
	b.tag(tag)?
		.console_lines(config.log_lines)?
		.working_dir(&dirs.base.path)?
		.env(config.library_env_var(), dirs.lib.path.display().to_string())?;
	Ok(b)
}

/// Install tool run once against an empty data directory.
pub fn install(config: &DbConfiguration) -> Result<Invocation> {
	let dirs = &config.directories;
	let mut b = base_builder(config, Executable::InstallDb, "mysql_install_db")?;
	if config.windows {
		b.file_arg("--datadir", &dirs.data.path)?;
	} else {
		b.file_arg("--datadir", &dirs.data.path)?
			.file_arg("--basedir", &dirs.base.path)?
			.arg("--no-defaults")?
			.arg("--force")?
			.arg("--skip-name-resolve")?;
	}
	Ok(b.build()?)
}

/// Server command line. `--no-defaults` has to be the first argument: it
/// changes how every later option is read.
pub fn server(config: &DbConfiguration) -> Result<Invocation> {
	let dirs = &config.directories;
	let mut b = base_builder(config, Executable::Server, "mysqld")?;
	b.arg("--no-defaults")?.arg("--console")?;
	if config.security_disabled {
		b.arg("--skip-grant-tables")?;
	}
	if !config.has_argument("--max_allowed_packet") {
		b.arg("--max_allowed_packet=64M")?;
	}
	b.file_arg("--basedir", &dirs.base.path)?
		.file_arg("--datadir", &dirs.data.path)?
		.file_arg("--tmpdir", &dirs.tmp.path)?
		.arg(format!("--port={}", config.port))?;
	if !config.windows {
		b.file_arg("--socket", &config.socket)?;
	}
	b.args_from(config.args.iter().cloned())?;
	if let Some(charset) = &config.default_character_set {
		b.arg_joined("--character-set-server=", charset)?;
	}
	// The supervisor's own exit hook owns teardown of the server.
	b.destroy_on_exit(false)?;
	Ok(b.build()?)
}

/// Client invocation with `script` piped to stdin.
pub fn client(
	config: &DbConfiguration,
	script: Vec<u8>,
	credentials: &Credentials,
	schema: Option<&str>,
	continue_on_error: bool,
) -> Result<Invocation> {
	let mut b = base_builder(config, Executable::Client, "mysql")?;
	b.arg("--default-character-set=utf8")?;
	if let Some(user) = credentials.user() {
		b.arg_joined("-u", user)?;
	}
	if let Some(password) = credentials.password() {
		b.arg_joined("-p", password)?;
	}
	if let Some(schema) = schema.filter(|s| !s.is_empty()) {
		b.arg_joined("-D", schema)?;
	}
	if continue_on_error {
		b.arg("-f")?;
	}
	socket_or_port(&mut b, config)?;
	if let Some(charset) = &config.default_character_set {
		b.arg_joined("--default-character-set=", charset)?;
	}
	if let Some(listener) = &config.listener {
		b.listener(listener.clone())?;
	}
	b.stdin_bytes(script)?;
	Ok(b.build()?)
}

/// Dump invocation writing to `sink`. One schema is passed positionally,
/// several go through `--databases`.
pub fn dump(config: &DbConfiguration, sink: OutputSink, schemas: &[&str], options: &DumpOptions) -> Result<Invocation> {
	let mut b = base_builder(config, Executable::Dump, "mysqldump")?;
	b.stdout_sink(sink)?.arg(format!("--port={}", config.port))?;
	if !config.windows {
		b.file_arg("--socket", &config.socket)?;
	}
	if options.lock_tables {
		b.arg("--flush-logs")?.arg("--lock-tables")?;
	}
	if options.compact {
		b.arg("--compact")?;
	}
	if options.xml {
		b.arg("--xml")?;
	}
	if let Some(user) = options.credentials.user() {
		b.arg("-u")?.arg(user)?;
		if let Some(password) = options.credentials.password() {
			b.arg_joined("-p", password)?;
		}
	}
	if schemas.len() > 1 {
		b.arg("--databases")?;
	}
	b.args_from(schemas.iter().copied())?;
	b.destroy_on_exit(true)?
		.listener(Arc::new(DumpListener { schemas: schemas.join(", ") }))?;
	Ok(b.build()?)
}

struct DumpListener {
	schemas: String,
}

impl ProcessListener for DumpListener {
	fn on_complete(&self, _exit_code: i32) {
		tracing::info!("dump of {} completed", self.schemas);
	}

	fn on_failed(&self, exit_code: i32) {
		tracing::warn!("dump of {} failed with exit code {}", self.schemas, exit_code);
	}
}

fn socket_or_port(b: &mut InvocationBuilder, config: &DbConfiguration) -> Result<()> {
	if config.windows {
		b.arg(format!("--port={}", config.port))?;
	} else {
		b.file_arg("--socket", &config.socket)?;
	}
	Ok(())
}
