use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use embedb::{
	CleanupRegistry, CommandFailure, Credentials, Db, DbConfigBuilder, DbState, DumpOptions, Error, Executable,
};
use embedb_exec::ProcessState;

const READY: &str = "echo 'mysqld: ready for connections.'; exec sleep 60";

fn tool(dir: &Path, name: &str, body: &str) -> PathBuf {
	use std::os::unix::fs::PermissionsExt;
	let path = dir.join(name);
	std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
	std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
	path
}

/// Configuration whose tools are shell scripts in `dir`.
fn fake_install(dir: &Path, server: &str, client: &str, dump: &str) -> DbConfigBuilder {
	let mut builder = DbConfigBuilder::new();
	builder.base_dir = Some(dir.join("base"));
	builder.executables.set(Executable::Server, tool(dir, "fake-mysqld", server));
	builder.executables.set(Executable::Client, tool(dir, "fake-mysql", client));
	builder.executables.set(Executable::Dump, tool(dir, "fake-mysqldump", dump));
	builder
		.executables
		.set(Executable::InstallDb, tool(dir, "fake-install-db", "exit 0"));
	builder
}

fn db_with(builder: DbConfigBuilder) -> (Db, CleanupRegistry) {
	let registry = CleanupRegistry::new();
	let db = Db::new(builder.build().unwrap(), registry.clone());
	(db, registry)
}

// --- Configuration ---

#[test]
fn default_dirs_follow_the_port() {
	let a = DbConfigBuilder { port: 3401, ..Default::default() }.build().unwrap();
	let b = DbConfigBuilder { port: 3402, ..Default::default() }.build().unwrap();

	assert_ne!(a.directories.data.path, b.directories.data.path);
	assert_ne!(a.directories.tmp.path, b.directories.tmp.path);
	assert!(a.directories.data.path.to_string_lossy().contains("3401"));
	assert!(b.directories.tmp.path.to_string_lossy().contains("3402"));
	assert_eq!(a.directories.lib.path, a.directories.base.path.join("libs"));
	assert!(a.delete_temp_dirs_on_shutdown);
	assert!(a.security_disabled);
}

#[test]
fn executables_default_inside_base_dir() {
	let config = DbConfigBuilder {
		port: 3403,
		base_dir: Some("/opt/mariadb".into()),
		windows: Some(false),
		..Default::default()
	}
	.build()
	.unwrap();

	assert_eq!(config.executable(Executable::Server), PathBuf::from("/opt/mariadb/bin/mariadbd"));
	assert_eq!(
		config.executable(Executable::InstallDb),
		PathBuf::from("/opt/mariadb/scripts/mariadb-install-db")
	);
	assert!(!config.directories.base.ephemeral);
}

#[test]
fn config_from_toml() {
	let builder = DbConfigBuilder::from_toml_str(
		r#"
port = 3404
args = ["--lower_case_table_names=1"]
startup_timeout_ms = 1500
delete_temp_dirs_on_shutdown = false

[executables]
server = "/usr/sbin/mariadbd"
"#,
	)
	.unwrap();
	let config = builder.build().unwrap();

	assert_eq!(config.port, 3404);
	assert_eq!(config.startup_timeout(), Duration::from_millis(1500));
	assert!(!config.delete_temp_dirs_on_shutdown);
	assert!(config.has_argument("--lower_case_table_names"));
	assert_eq!(config.executable(Executable::Server), PathBuf::from("/usr/sbin/mariadbd"));
	assert!(config.executable(Executable::Client).starts_with(&config.directories.base.path));
}

#[test]
fn config_from_file() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("embedb.toml");
	std::fs::write(&path, "port = 3405\nready_pattern = \"up and running\"\n").unwrap();

	let config = DbConfigBuilder::load(&path).unwrap().build().unwrap();
	assert_eq!(config.port, 3405);
	assert_eq!(config.ready_pattern, "up and running");

	assert!(matches!(DbConfigBuilder::load(&dir.path().join("missing.toml")), Err(Error::Config(_))));
	assert!(matches!(DbConfigBuilder::from_toml_str("port = \"x\""), Err(Error::Config(_))));
}

// --- Command lines ---

#[test]
fn server_arguments_start_with_no_defaults() {
	let dir = tempfile::tempdir().unwrap();
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.port = 3406;
	builder.args = vec!["--lower_case_table_names=1".into()];
	builder.default_character_set = Some("utf8mb4".into());
	builder.windows = Some(false);
	let config = builder.build().unwrap();

	let invocation = embedb::commands::server(&config).unwrap();
	let args = invocation.args();
	assert_eq!(args[0], "--no-defaults");
	assert_eq!(args[1], "--console");
	assert_eq!(args[2], "--skip-grant-tables");
	assert_eq!(args[3], "--max_allowed_packet=64M");
	assert!(args.iter().any(|a| a == "--port=3406"));
	assert!(args.iter().any(|a| a.starts_with("--socket=")));
	assert!(args.iter().any(|a| a.starts_with("--datadir=")));
	let user_arg = args.iter().position(|a| a == "--lower_case_table_names=1").unwrap();
	assert_eq!(args.last().unwrap(), "--character-set-server=utf8mb4");
	assert!(user_arg < args.len() - 1);
	assert!(!invocation.destroy_on_exit());
	assert_eq!(invocation.tag(), "mysqld");
	assert!(invocation.env().contains_key(config.library_env_var()));
}

#[test]
fn user_max_allowed_packet_wins() {
	let dir = tempfile::tempdir().unwrap();
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.port = 3407;
	builder.security_disabled = Some(false);
	builder.args = vec!["--max_allowed_packet=256M".into()];
	let config = builder.build().unwrap();

	let args = embedb::commands::server(&config).unwrap().args().to_vec();
	assert!(!args.iter().any(|a| a == "--max_allowed_packet=64M"));
	assert!(!args.iter().any(|a| a == "--skip-grant-tables"));
	assert_eq!(args.iter().filter(|a| a.starts_with("--max_allowed_packet")).count(), 1);
}

#[test]
fn client_and_dump_arguments() {
	let dir = tempfile::tempdir().unwrap();
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.port = 3408;
	builder.windows = Some(false);
	let config = builder.build().unwrap();

	let creds = Credentials::new("root", "secret");
	let client = embedb::commands::client(&config, b"select 1;".to_vec(), &creds, Some("app"), true).unwrap();
	let args = client.args();
	assert_eq!(args[0], "--default-character-set=utf8");
	assert_eq!(&args[1..5], ["-uroot", "-psecret", "-Dapp", "-f"]);
	assert!(args[5].starts_with("--socket="));
	assert!(client.has_stdin());

	let sink = Box::new(tokio::io::sink());
	let dump = embedb::commands::dump(&config, sink, &["a", "b"], &DumpOptions::xml(creds)).unwrap();
	let args = dump.args();
	assert_eq!(args[0], "--port=3408");
	assert!(args.iter().any(|a| a == "--xml"));
	assert!(args.iter().any(|a| a == "--lock-tables"));
	assert_eq!(&args[args.len() - 3..], ["--databases", "a", "b"]);
	assert!(dump.has_stdout_sink());
}

// --- Directories ---

#[tokio::test]
async fn prepare_twice_leaves_empty_data_dir() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(dir.path(), READY, "exit 0", "exit 0"));

	db.prepare_directories().await.unwrap();
	let data = db.directories().data.path.clone();
	std::fs::write(data.join("ibdata1"), "stale").unwrap();

	db.prepare_directories().await.unwrap();
	assert!(data.is_dir());
	assert_eq!(std::fs::read_dir(&data).unwrap().count(), 0);
	assert_eq!(db.state(), DbState::DirectoriesReady);
	assert_eq!(registry.len(), 1);

	registry.run();
	assert!(!data.exists());
	assert!(dir.path().join("base").is_dir());
}

// --- Start / stop ---

#[tokio::test]
async fn start_then_stop_twice() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(dir.path(), READY, "exit 0", "exit 0"));

	db.start().await.unwrap();
	assert!(db.is_running());
	assert_eq!(db.state(), DbState::Running);

	db.start().await.unwrap();
	assert!(matches!(db.prepare_directories().await, Err(Error::ServerRunning)));

	db.stop().await;
	assert!(!db.is_running());
	assert_eq!(db.state(), DbState::Stopped);
	db.stop().await;
	assert_eq!(db.state(), DbState::Stopped);

	registry.run();
}

#[tokio::test]
async fn restart_skips_install() {
	let dir = tempfile::tempdir().unwrap();
	let counter = dir.path().join("installs");
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.executables.set(
		Executable::InstallDb,
		tool(dir.path(), "counting-install-db", &format!("echo x >> '{}'", counter.display())),
	);
	let (db, registry) = db_with(builder);

	db.start().await.unwrap();
	db.stop().await;
	db.start().await.unwrap();
	db.stop().await;

	let installs = std::fs::read_to_string(&counter).unwrap();
	assert_eq!(installs.lines().count(), 1);
	registry.run();
}

#[tokio::test]
async fn open_embedded_never_installs() {
	let dir = tempfile::tempdir().unwrap();
	let counter = dir.path().join("installs");
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.executables.set(
		Executable::InstallDb,
		tool(dir.path(), "counting-install-db", &format!("echo x >> '{}'", counter.display())),
	);
	let registry = CleanupRegistry::new();
	let db = Db::open_embedded(builder.build().unwrap(), registry.clone()).await.unwrap();
	assert_eq!(db.state(), DbState::DirectoriesReady);

	db.start().await.unwrap();
	db.stop().await;
	assert!(!counter.exists());
	registry.run();
}

#[tokio::test]
async fn new_embedded_installs_once() {
	let dir = tempfile::tempdir().unwrap();
	let registry = CleanupRegistry::new();
	let config = fake_install(dir.path(), READY, "exit 0", "exit 0").build().unwrap();
	let db = Db::new_embedded(config, registry.clone()).await.unwrap();
	assert_eq!(db.state(), DbState::Installed);
	assert!(db.directories().data.path.is_dir());
	registry.run();
}

#[tokio::test]
async fn install_nonzero_exit_still_starts() {
	let dir = tempfile::tempdir().unwrap();
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder
		.executables
		.set(Executable::InstallDb, tool(dir.path(), "grumpy-install-db", "exit 3"));
	let (db, registry) = db_with(builder);

	db.start().await.unwrap();
	assert!(db.is_running());
	assert_eq!(db.state(), DbState::Running);

	db.stop().await;
	registry.run();
}

#[tokio::test]
async fn concurrent_starts_spawn_one_server() {
	let dir = tempfile::tempdir().unwrap();
	let counter = dir.path().join("spawns");
	let server = format!("echo x >> '{}'; {}", counter.display(), READY);
	let (db, registry) = db_with(fake_install(dir.path(), &server, "exit 0", "exit 0"));

	let (a, b) = tokio::join!(db.start(), db.start());
	a.unwrap();
	b.unwrap();
	assert!(db.is_running());

	let spawns = std::fs::read_to_string(&counter).unwrap();
	assert_eq!(spawns.lines().count(), 1);

	db.stop().await;
	registry.run();
}

#[tokio::test]
async fn unwritable_data_dir_fails_setup() {
	let dir = tempfile::tempdir().unwrap();
	let blocker = dir.path().join("blocker");
	std::fs::write(&blocker, "not a directory").unwrap();
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.data_dir = Some(blocker.join("data"));
	let (db, registry) = db_with(builder);

	match db.start().await {
		Err(Error::DirectorySetupFailed { path, .. }) => assert_eq!(path, blocker.join("data")),
		other => panic!("expected DirectorySetupFailed, got {:?}", other),
	}
	assert_eq!(db.state(), DbState::Unprepared);
	assert!(db.server().is_none());
	registry.run();
}

#[tokio::test]
async fn missing_readiness_times_out() {
	let dir = tempfile::tempdir().unwrap();
	let mut builder = fake_install(dir.path(), "echo 'starting up'; exec sleep 60", "exit 0", "exit 0");
	builder.startup_timeout_ms = Some(500);
	let (db, registry) = db_with(builder);

	let started = Instant::now();
	let result = db.start().await;
	let elapsed = started.elapsed();

	match result {
		Err(Error::StartupTimeout { timeout_ms, last_lines, .. }) => {
			assert_eq!(timeout_ms, 500);
			assert_eq!(last_lines, ["starting up"]);
		}
		other => panic!("expected StartupTimeout, got {:?}", other),
	}
	assert!(elapsed >= Duration::from_millis(500));
	assert!(elapsed < Duration::from_secs(8), "took {:?}", elapsed);
	assert!(!db.is_running());
	registry.run();
}

#[tokio::test]
async fn server_exiting_early_fails_fast() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(
		dir.path(),
		"echo '[ERROR] Can not bind to port' >&2; exit 1",
		"exit 0",
		"exit 0",
	));

	let started = Instant::now();
	let err = db.start().await.unwrap_err();
	assert!(started.elapsed() < Duration::from_secs(10));
	match err {
		Error::StartupTimeout { last_lines, .. } => {
			assert_eq!(last_lines, ["[ERROR] Can not bind to port"]);
		}
		other => panic!("expected StartupTimeout, got {:?}", other),
	}
	assert!(!db.is_running());
	registry.run();
}

#[tokio::test]
async fn missing_server_binary() {
	let dir = tempfile::tempdir().unwrap();
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.executables.set(Executable::Server, dir.path().join("no-such-mysqld"));
	let (db, registry) = db_with(builder);

	let err = db.start().await.unwrap_err();
	assert!(matches!(err, Error::Exec(embedb_exec::Error::ExecutableNotFound(_))));
	registry.run();
}

// --- Client ---

#[tokio::test]
async fn run_command_pipes_script() {
	let dir = tempfile::tempdir().unwrap();
	let received = dir.path().join("received.sql");
	let client = format!("cat > '{}'", received.display());
	let (db, registry) = db_with(fake_install(dir.path(), READY, &client, "exit 0"));

	db.run_command("create database if not exists x;", &Credentials::default(), None, false)
		.await
		.unwrap();
	assert_eq!(std::fs::read_to_string(&received).unwrap(), "create database if not exists x;");

	db.create_db("shop").await.unwrap();
	assert_eq!(
		std::fs::read_to_string(&received).unwrap(),
		"create database if not exists `shop`;"
	);
	registry.run();
}

#[tokio::test]
async fn run_command_reports_exit_code() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(dir.path(), READY, "cat > /dev/null; exit 3", "exit 0"));

	let err = db
		.run_command("select 1;", &Credentials::default(), None, false)
		.await
		.unwrap_err();
	assert!(matches!(
		err,
		Error::CommandFailed { cause: CommandFailure::ExitCode(3), .. }
	));
	registry.run();
}

#[tokio::test]
async fn source_file_reads_script() {
	let dir = tempfile::tempdir().unwrap();
	let received = dir.path().join("received.sql");
	let client = format!("cat > '{}'", received.display());
	let (db, registry) = db_with(fake_install(dir.path(), READY, &client, "exit 0"));

	let script = dir.path().join("schema.sql");
	std::fs::write(&script, "create table t (id int);\n").unwrap();
	db.source_file(&script, &Credentials::default(), Some("app"), false)
		.await
		.unwrap();
	assert_eq!(std::fs::read_to_string(&received).unwrap(), "create table t (id int);\n");

	let err = db
		.source_file(&dir.path().join("missing.sql"), &Credentials::default(), None, false)
		.await
		.unwrap_err();
	assert!(matches!(err, Error::CommandFailed { cause: CommandFailure::Io(_), .. }));
	registry.run();
}

// --- Dump ---

#[tokio::test]
async fn dump_sql_writes_file() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(dir.path(), READY, "exit 0", "echo \"-- dump $*\""));

	let out = dir.path().join("app.sql");
	db.dump_sql(&out, &["app"], Credentials::new("root", "")).await.unwrap();

	let dumped = std::fs::read_to_string(&out).unwrap();
	assert!(dumped.starts_with("-- dump --port="), "{}", dumped);
	assert!(dumped.contains("--flush-logs --lock-tables --compact -u root app"), "{}", dumped);
	assert!(!dumped.contains("--xml"));
	registry.run();
}

#[tokio::test]
async fn failing_dump_is_an_error() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(dir.path(), READY, "exit 0", "echo partial; exit 2"));

	let out = dir.path().join("app.xml");
	let err = db.dump_xml(&out, &["app"], Credentials::default()).await.unwrap_err();
	assert!(matches!(err, Error::CommandFailed { cause: CommandFailure::ExitCode(2), .. }));
	assert_eq!(std::fs::read_to_string(&out).unwrap(), "partial\n");
	registry.run();
}

#[tokio::test]
async fn dump_racing_stop_does_not_hang() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(
		dir.path(),
		READY,
		"exit 0",
		"echo '-- start'; sleep 0.5; echo '-- end'",
	));
	db.start().await.unwrap();

	let out = dir.path().join("race.sql");
	let file = tokio::fs::File::create(&out).await.unwrap();
	let dump = db
		.dump(Box::new(file), &["app"], &DumpOptions::sql(Credentials::default()))
		.unwrap();

	tokio::time::timeout(Duration::from_secs(10), async {
		tokio::join!(db.stop(), async {
			dump.wait_for_exit().await.unwrap();
		});
	})
	.await
	.expect("dump racing stop hung");

	assert!(!db.is_running());
	assert!(!dump.is_alive());
	registry.run();
}

// --- Cleanup hook ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_hook_stops_server_and_removes_dirs() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(dir.path(), READY, "exit 0", "exit 0"));
	db.start().await.unwrap();
	let server = db.server().unwrap();
	let data = db.directories().data.path.clone();
	let tmp = db.directories().tmp.path.clone();
	assert!(data.is_dir());

	let hook = registry.clone();
	tokio::task::spawn_blocking(move || hook.run()).await.unwrap();

	tokio::time::timeout(Duration::from_secs(10), server.wait_for_exit())
		.await
		.expect("server survived the cleanup hook")
		.unwrap();
	assert!(!db.is_running());
	assert!(!data.exists());
	assert!(!tmp.exists());
	assert!(dir.path().join("base").is_dir());
	assert!(registry.has_run());
}

#[tokio::test]
async fn dropping_last_handle_tears_down_promptly() {
	let dir = tempfile::tempdir().unwrap();
	let (db, registry) = db_with(fake_install(dir.path(), READY, "exit 0", "exit 0"));
	db.start().await.unwrap();
	let server = db.server().unwrap();
	let data = db.directories().data.path.clone();

	// No stop(): the hook runs from Drop on this single-threaded runtime.
	let started = Instant::now();
	drop(db);
	drop(registry);
	assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());

	assert!(!server.is_alive());
	assert!(matches!(server.state(), ProcessState::Destroyed { .. }));
	assert!(!data.exists());
}

#[tokio::test]
async fn cleanup_keeps_dirs_when_disabled() {
	let dir = tempfile::tempdir().unwrap();
	let mut builder = fake_install(dir.path(), READY, "exit 0", "exit 0");
	builder.delete_temp_dirs_on_shutdown = Some(false);
	let (db, registry) = db_with(builder);

	db.prepare_directories().await.unwrap();
	let data = db.directories().data.path.clone();
	registry.run();
	assert!(data.is_dir());
	std::fs::remove_dir_all(&data).unwrap();
	std::fs::remove_dir_all(&db.directories().tmp.path).unwrap();
}

#[tokio::test]
async fn listener_sees_client_runs() {
	use std::sync::atomic::{AtomicU32, Ordering};

	#[derive(Default)]
	struct Completions(AtomicU32);
	impl embedb_exec::ProcessListener for Completions {
		fn on_complete(&self, _exit_code: i32) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	let dir = tempfile::tempdir().unwrap();
	let listener = Arc::new(Completions::default());
	let mut builder = fake_install(dir.path(), READY, "cat > /dev/null", "exit 0");
	builder.listener = Some(listener.clone());
	let (db, registry) = db_with(builder);

	db.run("select 1;", false).await.unwrap();
	assert_eq!(listener.0.load(Ordering::SeqCst), 1);
	registry.run();
}
