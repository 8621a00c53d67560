//! # embedb-exec
//!
//! Child process toolkit for supervising external database tools.
//!
//! Build an [`Invocation`], hand it to a [`ManagedProcess`], and wait for a
//! readiness line on its console while output keeps draining in the
//! background.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use embedb_exec::{InvocationBuilder, ManagedProcess};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> embedb_exec::Result<()> {
//! let mut builder = InvocationBuilder::new("/usr/sbin/mariadbd");
//! builder.arg("--no-defaults")?.arg("--console")?.tag("mysqld")?;
//! let server = ManagedProcess::new(builder.build()?);
//!
//! let ready = server
//!     .start_and_await_console_pattern(": ready for connections.", Duration::from_secs(30))
//!     .await?;
//! if !ready {
//!     eprintln!("{}", server.last_console_lines().join("\n"));
//! }
//! server.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod invocation;
pub mod output;
pub mod process;
pub mod types;

pub use error::{Error, Result};
pub use invocation::{Invocation, InvocationBuilder, OutputSink, DEFAULT_CONSOLE_LINES};
pub use output::{ConsoleWatcher, OutputDispatcher};
pub use process::{ManagedProcess, DEFAULT_DESTROY_GRACE};
pub use types::*;
