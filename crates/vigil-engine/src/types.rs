use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a command is launched: a shell line goes through `sh -c`, an argv list is
/// executed directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandSpec {
	Shell(String),
	Argv(Vec<String>),
}

impl CommandSpec {
	/// Program and arguments to hand to the OS.
	pub fn program_and_args(&self) -> Option<(&str, Vec<&str>)> {
		match self {
			CommandSpec::Shell(line) => Some(("sh", vec!["-c", line.as_str()])),
			CommandSpec::Argv(argv) => {
				let (program, rest) = argv.split_first()?;
				Some((program.as_str(), rest.iter().map(|a| a.as_str()).collect()))
			}
		}
	}

	pub fn is_empty(&self) -> bool {
		match self {
			CommandSpec::Shell(line) => line.trim().is_empty(),
			CommandSpec::Argv(argv) => argv.first().map_or(true, |p| p.is_empty()),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
	/// Spawned and piped by the supervisor.
	Managed,
	/// A file written by some other process; only tailed.
	External,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
	pub name: String,
	/// File name relative to the log directory.
	pub log_file: PathBuf,
	pub mode: SourceMode,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub command: Option<CommandSpec>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub color: Option<String>,
}

impl Source {
	pub fn managed(name: impl Into<String>, log_file: impl Into<PathBuf>, command: CommandSpec) -> Self {
		Self {
			name: name.into(),
			log_file: log_file.into(),
			mode: SourceMode::Managed,
			command: Some(command),
			color: None,
		}
	}

	pub fn external(name: impl Into<String>, log_file: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			log_file: log_file.into(),
			mode: SourceMode::External,
			command: None,
			color: None,
		}
	}

	pub fn with_color(mut self, color: impl Into<String>) -> Self {
		self.color = Some(color.into());
		self
	}

	pub fn is_managed(&self) -> bool {
		self.mode == SourceMode::Managed
	}
}

/// One unit of live output. Serialized as `{"process": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogDelta {
	#[serde(rename = "process")]
	pub source: String,
	#[serde(rename = "data")]
	pub text: String,
}

impl LogDelta {
	pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			source: source.into(),
			text: text.into(),
		}
	}
}

/// How a managed child ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitState {
	Code { code: i32 },
	Signal { signal: i32 },
	/// The child could not be spawned or waited on.
	Failed,
}

impl ExitState {
	pub fn from_status(status: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;
		match (status.code(), status.signal()) {
			(Some(code), _) => ExitState::Code { code },
			(None, Some(signal)) => ExitState::Signal { signal },
			(None, None) => ExitState::Failed,
		}
	}

	pub fn code(&self) -> Option<i32> {
		match self {
			ExitState::Code { code } => Some(*code),
			_ => None,
		}
	}

	/// The line appended to the source's log when the child ends.
	pub fn marker(&self) -> String {
		match self {
			ExitState::Code { code } => format!("\nProcess exited with code {}\n", code),
			ExitState::Signal { signal } => format!("\nProcess terminated by signal {}\n", signal),
			ExitState::Failed => "\nProcess exited with unknown status\n".to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningProcess {
	pub source: String,
	pub pid: u32,
	/// Set once the child has exited while its remaining output is still draining.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub exit_code: Option<i32>,
}
