use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only writer for one managed source's backing file.
///
/// Owned by that source's read loop; every write is flushed so tailers and history
/// readers see it immediately.
pub struct SourceLog {
	file: File,
	path: PathBuf,
}

impl SourceLog {
	/// Truncate-create the file, creating parent directories as needed.
	pub async fn create(path: &Path) -> std::io::Result<Self> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await?;
		}
		let file = OpenOptions::new()
			.create(true)
			.write(true)
			.truncate(true)
			.open(path)
			.await?;
		Ok(Self {
			file,
			path: path.to_path_buf(),
		})
	}

	pub async fn append(&mut self, text: &str) -> std::io::Result<()> {
		self.file.write_all(text.as_bytes()).await?;
		self.file.flush().await?;
		Ok(())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}
