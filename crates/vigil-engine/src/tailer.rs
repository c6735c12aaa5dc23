//! Polling tailer for external sources.
//!
//! Every tick compares each backing file's size with the stored cursor and reads only
//! the newly appended bytes. A file smaller than its cursor was truncated or
//! recreated, so the cursor goes back to 0.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

use crate::hub::Hub;
use crate::logs;
use crate::sanitize;
use crate::types::{LogDelta, Source};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Most bytes read from one source per tick. A larger backlog drains over later ticks.
pub const READ_CHUNK: u64 = 1024 * 1024;

struct TailTarget {
	name: String,
	path: PathBuf,
	offset: u64,
}

enum ReadOutcome {
	Unchanged,
	Missing,
	Read { bytes: Vec<u8>, from: u64 },
	Truncated,
}

pub struct Tailer {
	targets: Vec<TailTarget>,
	interval: Duration,
}

impl Tailer {
	/// Track the given sources; managed ones are skipped since their loop pushes
	/// output directly.
	pub fn new<'a>(log_dir: &Path, sources: impl IntoIterator<Item = &'a Source>) -> Self {
		let targets = sources
			.into_iter()
			.filter(|s| !s.is_managed())
			.map(|s| TailTarget {
				name: s.name.clone(),
				path: logs::source_log_path(log_dir, s),
				offset: 0,
			})
			.collect();
		Self {
			targets,
			interval: POLL_INTERVAL,
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	pub fn cursor(&self, name: &str) -> Option<u64> {
		self.targets.iter().find(|t| t.name == name).map(|t| t.offset)
	}

	/// One pass over every target. Returns the deltas found, in source order.
	pub async fn poll(&mut self) -> Vec<LogDelta> {
		let mut deltas = Vec::new();
		let budget = self.interval;

		for target in &mut self.targets {
			let outcome = match read_new(&target.path, target.offset, budget).await {
				Ok(outcome) => outcome,
				Err(e) => {
					tracing::trace!("tail {} skipped: {}", target.name, e);
					continue;
				}
			};

			match outcome {
				ReadOutcome::Unchanged | ReadOutcome::Missing => {}
				ReadOutcome::Truncated => {
					tracing::debug!("{} truncated, rereading from start", target.name);
					target.offset = 0;
				}
				ReadOutcome::Read { bytes, from } => {
					let keep = sanitize::deliverable_len(&bytes);
					target.offset = from + keep as u64;
					let text = sanitize::clean_bytes(&bytes[..keep]);
					if !text.is_empty() {
						deltas.push(LogDelta::new(target.name.clone(), text));
					}
				}
			}
		}
		deltas
	}

	/// Poll on the interval and publish through `hub` until `stop` flips to true.
	pub async fn run(mut self, hub: Arc<Hub>, mut stop: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			if *stop.borrow() {
				break;
			}
			tokio::select! {
				_ = ticker.tick() => {
					for delta in self.poll().await {
						hub.publish(&delta).await;
					}
				}
				changed = stop.changed() => {
					if changed.is_err() {
						break;
					}
				}
			}
		}
		tracing::debug!("tailer stopped");
	}
}

/// Read at most [`READ_CHUNK`] bytes from `offset`. Only the size check is bounded by
/// `budget`; a read that has started runs to completion so the cursor always advances.
async fn read_new(path: &Path, offset: u64, budget: Duration) -> std::io::Result<ReadOutcome> {
	let metadata = tokio::time::timeout(budget, tokio::fs::metadata(path))
		.await
		.map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "metadata timed out"))?;
	let size = match metadata {
		Ok(meta) => meta.len(),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
		Err(e) => return Err(e),
	};

	let from = if size < offset { 0 } else { offset };
	if size == from {
		return Ok(if from < offset { ReadOutcome::Truncated } else { ReadOutcome::Unchanged });
	}

	let mut file = tokio::fs::File::open(path).await?;
	file.seek(SeekFrom::Start(from)).await?;
	let wanted = (size - from).min(READ_CHUNK);
	let mut bytes = Vec::with_capacity(wanted as usize);
	file.take(wanted).read_to_end(&mut bytes).await?;

	// shrank between the size check and the read
	if (bytes.len() as u64) < wanted {
		return Ok(ReadOutcome::Truncated);
	}
	Ok(ReadOutcome::Read { bytes, from })
}
