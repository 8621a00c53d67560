//! # embedb
//!
//! Run a MariaDB/MySQL server distribution as an embedded database: prepare
//! its directories, install a data directory, start it and wait until it
//! accepts connections, pipe SQL scripts through the client tool, dump
//! schemas, and tear everything down when the host program exits.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use embedb::{CleanupRegistry, Db, DbConfigBuilder};
//!
//! # #[tokio::main]
//! # async fn main() -> embedb::Result<()> {
//! let registry = CleanupRegistry::new();
//! let config = DbConfigBuilder {
//!     base_dir: Some("/opt/mariadb".into()),
//!     ..Default::default()
//! }
//! .build()?;
//!
//! let db = Db::new_embedded(config, registry.clone()).await?;
//! db.start().await?;
//! db.create_db("app").await?;
//! db.stop().await;
//! registry.run();
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod commands;
pub mod config;
pub mod db;
pub mod dirs;
pub mod error;

pub use cleanup::{shutdown_signal, CleanupRegistry};
pub use commands::{Credentials, DumpOptions};
pub use config::{DbConfigBuilder, DbConfiguration, Executable, ExecutablePaths};
pub use db::{Db, DbState};
pub use dirs::{DirSpec, DirectorySet};
pub use error::{CommandFailure, Error, Result};
