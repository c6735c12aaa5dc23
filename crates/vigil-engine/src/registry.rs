use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::types::{Source, SourceMode};

/// Errors from building a [`SourceRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
	/// A source has an empty name.
	EmptyName,
	/// Two sources share a name.
	DuplicateName(String),
	/// A managed source has no command, or an empty one.
	MissingCommand(String),
	/// The log file escapes the log directory or is empty.
	InvalidLogFile { source: String, path: String },
	/// Two sources would write or tail the same file.
	DuplicateLogFile { source: String, path: String },
}

impl std::fmt::Display for RegistryError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RegistryError::EmptyName => write!(f, "source name must not be empty"),
			RegistryError::DuplicateName(name) => write!(f, "duplicate source name: {}", name),
			RegistryError::MissingCommand(name) => write!(f, "managed source {} has no command", name),
			RegistryError::InvalidLogFile { source, path } => {
				write!(f, "source {} has an invalid log file: {:?}", source, path)
			}
			RegistryError::DuplicateLogFile { source, path } => {
				write!(f, "source {} reuses log file {:?}", source, path)
			}
		}
	}
}

impl std::error::Error for RegistryError {}

/// The ordered, immutable set of log sources.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
	sources: Vec<Source>,
}

impl SourceRegistry {
	pub fn new(sources: Vec<Source>) -> Result<Self, RegistryError> {
		let mut seen = HashSet::new();
		let mut files: HashSet<PathBuf> = HashSet::new();
		for source in &sources {
			if source.name.trim().is_empty() {
				return Err(RegistryError::EmptyName);
			}
			if !seen.insert(source.name.as_str()) {
				return Err(RegistryError::DuplicateName(source.name.clone()));
			}
			if !is_plain_relative(&source.log_file) {
				return Err(RegistryError::InvalidLogFile {
					source: source.name.clone(),
					path: source.log_file.display().to_string(),
				});
			}
			if !files.insert(normalized(&source.log_file)) {
				return Err(RegistryError::DuplicateLogFile {
					source: source.name.clone(),
					path: source.log_file.display().to_string(),
				});
			}
			if source.mode == SourceMode::Managed && source.command.as_ref().map_or(true, |c| c.is_empty()) {
				return Err(RegistryError::MissingCommand(source.name.clone()));
			}
		}
		Ok(Self { sources })
	}

	pub fn sources(&self) -> &[Source] {
		&self.sources
	}

	pub fn get(&self, name: &str) -> Option<&Source> {
		self.sources.iter().find(|s| s.name == name)
	}

	pub fn managed(&self) -> impl Iterator<Item = &Source> {
		self.sources.iter().filter(|s| s.mode == SourceMode::Managed)
	}

	pub fn external(&self) -> impl Iterator<Item = &Source> {
		self.sources.iter().filter(|s| s.mode == SourceMode::External)
	}

	pub fn len(&self) -> usize {
		self.sources.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sources.is_empty()
	}
}

fn is_plain_relative(path: &Path) -> bool {
	let mut components = path.components().peekable();
	if components.peek().is_none() {
		return false;
	}
	components.all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `./a/./b.log` and `a/b.log` name the same file.
fn normalized(path: &Path) -> PathBuf {
	path.components().filter(|c| !matches!(c, Component::CurDir)).collect()
}
