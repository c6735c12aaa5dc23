use serde::Deserialize;
use std::path::{Path, PathBuf};
use vigil_engine::logs::self_source;
use vigil_engine::{CommandSpec, RegistryError, Source, SourceRegistry};

pub const CONFIG_NAMES: [&str; 2] = ["vigil-config.json", "vigil.toml"];

/// Errors that abort startup.
#[derive(Debug)]
pub enum ConfigError {
	/// No config file in any searched location.
	NotFound(Vec<PathBuf>),
	/// The file exists but could not be read.
	Read { path: PathBuf, error: std::io::Error },
	/// The file is not valid JSON/TOML for this schema.
	Parse { path: PathBuf, message: String },
	/// Parsed, but describes an unusable setup.
	Invalid(String),
	Registry(RegistryError),
}

impl std::fmt::Display for ConfigError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ConfigError::NotFound(searched) => {
				write!(f, "no config file found (searched: ")?;
				let names: Vec<String> = searched.iter().map(|p| p.display().to_string()).collect();
				write!(f, "{}); create one or pass --config", names.join(", "))
			}
			ConfigError::Read { path, error } => write!(f, "failed to read {}: {}", path.display(), error),
			ConfigError::Parse { path, message } => write!(f, "failed to parse {}: {}", path.display(), message),
			ConfigError::Invalid(message) => write!(f, "invalid config: {}", message),
			ConfigError::Registry(e) => write!(f, "invalid config: {}", e),
		}
	}
}

impl std::error::Error for ConfigError {}

impl From<RegistryError> for ConfigError {
	fn from(e: RegistryError) -> Self {
		ConfigError::Registry(e)
	}
}

// ── vigil-config.json / vigil.toml ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
	log_dir: String,
	/// Working directory for managed commands. Defaults to the config file's directory.
	root: Option<String>,
	#[serde(default)]
	processes: Vec<RawProcess>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProcess {
	name: String,
	log_file: Option<String>,
	command: Option<CommandSpec>,
	color: Option<String>,
}

impl RawProcess {
	fn into_source(self) -> Result<Source, ConfigError> {
		let source = match (self.command, self.log_file) {
			(Some(command), log_file) => {
				let log_file = log_file.unwrap_or_else(|| format!("{}.log", self.name));
				Source::managed(self.name, log_file, command)
			}
			(None, Some(log_file)) => Source::external(self.name, log_file),
			(None, None) => {
				return Err(ConfigError::Invalid(format!(
					"process '{}' needs a logFile or a command",
					self.name
				)))
			}
		};
		Ok(match self.color {
			Some(color) => source.with_color(color),
			None => source,
		})
	}
}

/// Fully resolved configuration, immutable for the process lifetime.
#[derive(Debug)]
pub struct Config {
	pub path: PathBuf,
	pub log_dir: PathBuf,
	pub root: PathBuf,
	pub registry: SourceRegistry,
}

/// `--config` if given, else the known names in the current directory, then its parent.
pub fn find_config(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
	if let Some(path) = explicit {
		if path.is_file() {
			return Ok(path.to_path_buf());
		}
		return Err(ConfigError::NotFound(vec![path.to_path_buf()]));
	}

	let cwd = std::env::current_dir().map_err(|e| ConfigError::Invalid(format!("no current directory: {}", e)))?;
	let mut searched = Vec::new();
	for dir in std::iter::once(cwd.as_path()).chain(cwd.parent()) {
		for name in CONFIG_NAMES {
			let candidate = dir.join(name);
			if candidate.is_file() {
				return Ok(candidate);
			}
			searched.push(candidate);
		}
	}
	Err(ConfigError::NotFound(searched))
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
	let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
		path: path.to_path_buf(),
		error,
	})?;
	parse(path, &content)
}

fn parse(path: &Path, content: &str) -> Result<Config, ConfigError> {
	let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
	let raw: RawConfig = if is_toml {
		toml::from_str(content).map_err(|e| ConfigError::Parse {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?
	} else {
		serde_json::from_str(content).map_err(|e| ConfigError::Parse {
			path: path.to_path_buf(),
			message: e.to_string(),
		})?
	};

	if raw.log_dir.trim().is_empty() {
		return Err(ConfigError::Invalid("logDir must not be empty".into()));
	}

	let base = path
		.parent()
		.filter(|p| !p.as_os_str().is_empty())
		.unwrap_or_else(|| Path::new("."));
	let log_dir = base.join(expand_tilde(&raw.log_dir));
	let root = match raw.root {
		Some(root) => base.join(expand_tilde(&root)),
		None => base.to_path_buf(),
	};

	// the engine's own log always comes first
	let mut sources = vec![self_source()];
	for process in raw.processes {
		sources.push(process.into_source()?);
	}
	let registry = SourceRegistry::new(sources)?;

	Ok(Config {
		path: path.to_path_buf(),
		log_dir,
		root,
		registry,
	})
}

fn expand_tilde(path: &str) -> PathBuf {
	if let Some(rest) = path.strip_prefix("~/") {
		if let Ok(home) = std::env::var("HOME") {
			return PathBuf::from(home).join(rest);
		}
	}
	PathBuf::from(path)
}
