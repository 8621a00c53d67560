use std::path::PathBuf;

use embedb::{CleanupRegistry, Credentials, Db, DbConfigBuilder, DbConfiguration, DumpOptions};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();

	if args.is_empty() {
		print_usage();
		return;
	}

	match args[0].as_str() {
		"help" | "--help" | "-h" => print_usage(),
		"version" | "--version" | "-V" => println!("embedb {}", env!("CARGO_PKG_VERSION")),
		"run" => block_on(cmd_run(&args[1..])),
		"source" => block_on(cmd_source(&args[1..])),
		"dump" => block_on(cmd_dump(&args[1..])),
		"config" => cmd_config(&args[1..]),
		other => {
			eprintln!("unknown command: {}", other);
			eprintln!("run 'embedb help' for usage");
			std::process::exit(1);
		}
	}
}

fn print_usage() {
	eprintln!("{} {}: embedded MariaDB/MySQL runner", "embedb".bold(), env!("CARGO_PKG_VERSION"));
	eprintln!();
	eprintln!("usage: {} <command> [options]", "embedb".bold());
	eprintln!();
	eprintln!("{}", "commands".cyan().bold());
	eprintln!("  {} [--no-install]                 Prepare, install, start; stop on Ctrl-C", "run".bold());
	eprintln!("  {} <script.sql> [--database NAME]  Pipe a script into a running server", "source".bold());
	eprintln!("  {} <out> <schema...> [--xml]        Dump schemas to a file", "dump".bold());
	eprintln!("  {}                                Print the resolved configuration", "config".bold());
	eprintln!();
	eprintln!("{}", "options".cyan().bold());
	eprintln!("  --config FILE        TOML configuration (default: ./embedb.toml if present)");
	eprintln!("  --port PORT          Server port (overrides the configuration)");
	eprintln!("  --user NAME          Client user");
	eprintln!("  --password PASS      Client password");
	eprintln!("  --force              Keep going after SQL errors (source)");
	eprintln!();
	eprintln!("Log verbosity follows RUST_LOG (default: info).");
}

fn block_on<F: std::future::Future<Output = Result<(), embedb::Error>>>(fut: F) {
	init_tracing();
	let runtime = match tokio::runtime::Runtime::new() {
		Ok(rt) => rt,
		Err(e) => fail(&format!("failed to start runtime: {}", e)),
	};
	if let Err(e) = runtime.block_on(fut) {
		fail(&e.to_string());
	}
}

fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn fail(message: &str) -> ! {
	eprintln!("{} {}", "error:".red().bold(), message);
	std::process::exit(1);
}

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Opts {
	config: Option<PathBuf>,
	port: Option<u16>,
	database: Option<String>,
	user: Option<String>,
	password: Option<String>,
	force: bool,
	xml: bool,
	no_install: bool,
}

impl Opts {
	fn credentials(&self) -> Credentials {
		Credentials {
			user: self.user.clone(),
			password: self.password.clone(),
		}
	}
}

fn parse_opts(args: &[String]) -> (Opts, Vec<String>) {
	let mut opts = Opts::default();
	let mut rest = Vec::new();
	let mut i = 0;
	while i < args.len() {
		let value = |i: usize| match args.get(i + 1) {
			Some(v) => v.clone(),
			None => fail(&format!("{} needs a value", args[i])),
		};
		match args[i].as_str() {
			"--config" | "-c" => {
				opts.config = Some(PathBuf::from(value(i)));
				i += 1;
			}
			"--port" | "-P" => {
				let raw = value(i);
				match raw.parse() {
					Ok(port) => opts.port = Some(port),
					Err(_) => fail(&format!("invalid port: {}", raw)),
				}
				i += 1;
			}
			"--database" | "-D" => {
				opts.database = Some(value(i));
				i += 1;
			}
			"--user" | "-u" => {
				opts.user = Some(value(i));
				i += 1;
			}
			"--password" | "-p" => {
				opts.password = Some(value(i));
				i += 1;
			}
			"--force" | "-f" => opts.force = true,
			"--xml" => opts.xml = true,
			"--no-install" => opts.no_install = true,
			_ => rest.push(args[i].clone()),
		}
		i += 1;
	}
	(opts, rest)
}

fn load_config(opts: &Opts) -> Result<DbConfiguration, embedb::Error> {
	load_builder(opts)?.build()
}

fn load_builder(opts: &Opts) -> Result<DbConfigBuilder, embedb::Error> {
	let mut builder = match &opts.config {
		Some(path) => DbConfigBuilder::load(path)?,
		None => {
			let default = PathBuf::from("embedb.toml");
			if default.is_file() {
				DbConfigBuilder::load(&default)?
			} else {
				DbConfigBuilder::new()
			}
		}
	};
	if let Some(port) = opts.port {
		builder.port = port;
	}
	Ok(builder)
}

/// Configuration for commands that talk to an already running server. Port 0
/// would pick a fresh random port, which no running server listens on.
fn attach_config(opts: &Opts) -> Result<DbConfiguration, embedb::Error> {
	let builder = load_builder(opts)?;
	if let Err(hint) = check_attach_port(&builder) {
		fail(hint);
	}
	builder.build()
}

fn check_attach_port(builder: &DbConfigBuilder) -> Result<(), &'static str> {
	if builder.port == 0 {
		return Err("no port configured; pass --port or a --config with the port 'embedb run' uses");
	}
	Ok(())
}

// ── Commands ────────────────────────────────────────────────────────────────

async fn cmd_run(args: &[String]) -> Result<(), embedb::Error> {
	let (opts, _) = parse_opts(args);
	let config = load_config(&opts)?;
	let registry = CleanupRegistry::new();
	// Covers install and the startup wait too: the server runs in its own
	// process group and never sees the terminal's Ctrl-C.
	registry.install_signal_handler();

	let db = if opts.no_install {
		Db::open_embedded(config, registry.clone()).await?
	} else {
		Db::new_embedded(config, registry.clone()).await?
	};

	if let Err(e) = db.start().await {
		cleanup(registry).await;
		return Err(e);
	}

	let config = db.configuration();
	eprintln!();
	eprintln!("{} on port {}", "database ready".green().bold(), config.port.bold());
	if !config.windows {
		eprintln!("  socket   {}", config.socket_absolute().display());
	}
	eprintln!("  data     {}", config.directories.data.path.display());
	eprintln!("  {}", "press Ctrl-C to stop".dimmed());
	eprintln!();

	// Ctrl-C is handled by the registry's signal handler, which tears the
	// server down and exits.
	wait_for_server_exit(&db).await;
	if !registry.has_run() {
		tracing::warn!("database exited on its own");
	}

	db.stop().await;
	cleanup(registry).await;
	Ok(())
}

async fn wait_for_server_exit(db: &Db) {
	match db.server() {
		Some(server) => {
			let _ = server.wait_for_exit().await;
		}
		None => std::future::pending::<()>().await,
	}
}

async fn cleanup(registry: CleanupRegistry) {
	if let Err(e) = tokio::task::spawn_blocking(move || registry.run()).await {
		tracing::error!("cleanup task failed: {}", e);
	}
}

async fn cmd_source(args: &[String]) -> Result<(), embedb::Error> {
	let (opts, rest) = parse_opts(args);
	let Some(script) = rest.first() else {
		fail("usage: embedb source <script.sql> [--database NAME] [--port PORT | --config FILE]");
	};
	let config = attach_config(&opts)?;
	// Attaches to a running instance; its directories are left untouched.
	let db = Db::new(config, CleanupRegistry::new());
	db.source_file(
		&PathBuf::from(script),
		&opts.credentials(),
		opts.database.as_deref(),
		opts.force,
	)
	.await?;
	eprintln!("{} {}", "sourced".green(), script);
	Ok(())
}

async fn cmd_dump(args: &[String]) -> Result<(), embedb::Error> {
	let (opts, rest) = parse_opts(args);
	if rest.len() < 2 {
		fail("usage: embedb dump <out> <schema...> [--xml] [--port PORT | --config FILE]");
	}
	let out = PathBuf::from(&rest[0]);
	let schemas: Vec<&str> = rest[1..].iter().map(String::as_str).collect();
	let config = attach_config(&opts)?;
	let db = Db::new(config, CleanupRegistry::new());

	let options = if opts.xml {
		DumpOptions::xml(opts.credentials())
	} else {
		DumpOptions::sql(opts.credentials())
	};
	db.dump_to_file(&out, &schemas, &options).await?;
	eprintln!("{} {}", "dumped to".green(), out.display());
	Ok(())
}

fn cmd_config(args: &[String]) {
	let (opts, _) = parse_opts(args);
	let config = match load_config(&opts) {
		Ok(config) => config,
		Err(e) => fail(&e.to_string()),
	};
	match serde_json::to_string_pretty(&config) {
		Ok(json) => println!("{}", json),
		Err(e) => fail(&format!("failed to serialize configuration: {}", e)),
	}
}
