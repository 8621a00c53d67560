use serde::{Deserialize, Serialize};

/// Lifecycle of a single [`ManagedProcess`](crate::ManagedProcess) slot.
///
/// `Created → Starting → Running → Completed | Destroyed`. A terminal state is
/// never left again; the exit code recorded there is final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessState {
	Created,
	Starting,
	Running { pid: u32 },
	Completed { exit_code: i32 },
	Destroyed { exit_code: i32 },
}

impl ProcessState {
	pub fn is_running(&self) -> bool {
		matches!(self, ProcessState::Starting | ProcessState::Running { .. })
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, ProcessState::Completed { .. } | ProcessState::Destroyed { .. })
	}

	pub fn exit_code(&self) -> Option<i32> {
		match self {
			ProcessState::Completed { exit_code } | ProcessState::Destroyed { exit_code } => {
				Some(*exit_code)
			}
			_ => None,
		}
	}
}

/// Callbacks fired once when a managed process has terminated and its output
/// has been drained.
pub trait ProcessListener: Send + Sync {
	fn on_complete(&self, _exit_code: i32) {}

	fn on_failed(&self, _exit_code: i32) {}
}

impl std::fmt::Debug for dyn ProcessListener {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("ProcessListener")
	}
}
