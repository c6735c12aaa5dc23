use std::path::{Path, PathBuf};

use crate::registry::SourceRegistry;
use crate::types::Source;

/// Name of the engine's own log source.
pub const SELF_SOURCE: &str = "vigil";
pub const SELF_LOG_FILE: &str = "vigil.log";

pub fn source_log_path(log_dir: &Path, source: &Source) -> PathBuf {
	log_dir.join(&source.log_file)
}

/// The external source that carries the engine's own operational log.
pub fn self_source() -> Source {
	Source::external(SELF_SOURCE, SELF_LOG_FILE)
}

/// Full current contents of a source's backing file.
///
/// Returns `None` for an unknown source and empty text when the file does not exist
/// yet. Invalid UTF-8 is replaced, never an error.
pub async fn read_history(registry: &SourceRegistry, log_dir: &Path, name: &str) -> Option<String> {
	let source = registry.get(name)?;
	let path = source_log_path(log_dir, source);
	match tokio::fs::read(&path).await {
		Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
		Err(e) => {
			if e.kind() != std::io::ErrorKind::NotFound {
				tracing::debug!("history for {} unavailable: {}", name, e);
			}
			Some(String::new())
		}
	}
}
