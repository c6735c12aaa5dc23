use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;

use crate::hub::Hub;
use crate::logs;
use crate::output::SourceLog;
use crate::sanitize;
use crate::types::*;

/// How long a child gets between SIGTERM and SIGKILL.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Largest chunk read from a child's output in one go.
const PIPE_CHUNK: usize = 64 * 1024;

pub struct SupervisorConfig {
	pub log_dir: PathBuf,
	/// Working directory for every managed command.
	pub root: PathBuf,
	pub grace_period: Duration,
}

impl SupervisorConfig {
	pub fn new(log_dir: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
		Self {
			log_dir: log_dir.into(),
			root: root.into(),
			grace_period: SHUTDOWN_GRACE,
		}
	}
}

pub struct Supervisor {
	pub processes: Arc<RwLock<HashMap<String, ManagedProcess>>>,
	pub config: SupervisorConfig,
	hub: Arc<Hub>,
	stopping: AtomicBool,
}

/// A child in the table. It stays there after exiting until its output is drained
/// and its exit marker written; `exit_code` is set for that window.
pub struct ManagedProcess {
	pub source: String,
	pub pid: u32,
	exit: watch::Receiver<Option<ExitState>>,
	done: watch::Receiver<Option<ExitState>>,
}

impl ManagedProcess {
	pub fn exit_code(&self) -> Option<i32> {
		(*self.exit.borrow()).and_then(|state| state.code())
	}
}

/// Returned from [`Supervisor::spawn`] so callers can await the child's end.
pub struct ProcessHandle {
	pub source: String,
	pub pid: u32,
	exit: watch::Receiver<Option<ExitState>>,
}

impl ProcessHandle {
	/// Resolves once the child is reaped and its exit marker has been published.
	pub async fn wait(&mut self) -> ExitState {
		match self.exit.wait_for(|state| state.is_some()).await {
			Ok(state) => (*state).unwrap_or(ExitState::Failed),
			Err(_) => ExitState::Failed,
		}
	}
}

impl Supervisor {
	pub fn new(config: SupervisorConfig, hub: Arc<Hub>) -> Arc<Self> {
		Arc::new(Self {
			processes: Arc::new(RwLock::new(HashMap::new())),
			config,
			hub,
			stopping: AtomicBool::new(false),
		})
	}

	/// Spawn every managed source. Failures are reported in each source's own stream.
	pub async fn start_all<'a>(self: &Arc<Self>, sources: impl IntoIterator<Item = &'a Source>) -> Vec<ProcessHandle> {
		let mut handles = Vec::new();
		for source in sources.into_iter().filter(|s| s.is_managed()) {
			if let Ok(handle) = self.spawn(source).await {
				handles.push(handle);
			}
		}
		handles
	}

	pub async fn spawn(self: &Arc<Self>, source: &Source) -> Result<ProcessHandle, String> {
		let name = source.name.clone();
		let command = source
			.command
			.as_ref()
			.filter(|c| !c.is_empty())
			.ok_or_else(|| format!("{}: no command configured", name))?;

		// held until the new entry is inserted, so concurrent spawns of one source
		// cannot both pass the check, and shutdown sees every child that started
		let mut processes = self.processes.write().await;
		if self.stopping.load(Ordering::SeqCst) {
			return Err(format!("{}: supervisor is shutting down", name));
		}
		if processes.contains_key(&name) {
			return Err(format!("{}: already running", name));
		}

		let log_path = logs::source_log_path(&self.config.log_dir, source);
		let mut log = match SourceLog::create(&log_path).await {
			Ok(log) => log,
			Err(e) => {
				let detail = format!("cannot create {}: {}", log_path.display(), e);
				self.report_failure(&name, None, &detail).await;
				return Err(detail);
			}
		};

		tracing::info!("starting {}...", name);
		let (child, output) = match spawn_child(command, &self.config.root) {
			Ok(spawned) => spawned,
			Err(e) => {
				self.report_failure(&name, Some(&mut log), &e).await;
				return Err(e);
			}
		};

		let pid = child.id().unwrap_or(0);
		let (exit_tx, exit_rx) = watch::channel(None);
		let (done_tx, done_rx) = watch::channel(None);

		processes.insert(
			name.clone(),
			ManagedProcess {
				source: name.clone(),
				pid,
				exit: exit_rx,
				done: done_rx.clone(),
			},
		);
		drop(processes);

		let sup = Arc::clone(self);
		let loop_name = name.clone();
		tokio::spawn(async move {
			let output = OutputReader::new(output);
			run_source_loop(sup, loop_name, child, log, output, exit_tx, done_tx).await;
		});

		Ok(ProcessHandle {
			source: name,
			pid,
			exit: done_rx,
		})
	}

	pub async fn running(&self) -> Vec<RunningProcess> {
		let processes = self.processes.read().await;
		let mut running: Vec<RunningProcess> = processes
			.values()
			.map(|mp| RunningProcess {
				source: mp.source.clone(),
				pid: mp.pid,
				exit_code: mp.exit_code(),
			})
			.collect();
		running.sort_by(|a, b| a.source.cmp(&b.source));
		running
	}

	pub async fn is_running(&self, source: &str) -> bool {
		self.processes.read().await.contains_key(source)
	}

	/// Terminate every live child: SIGTERM, wait up to the grace period, then SIGKILL
	/// and wait for the reap. Children are torn down concurrently; a failure on one is
	/// logged and does not affect the others.
	pub async fn shutdown(&self) {
		self.stopping.store(true, Ordering::SeqCst);

		let targets: Vec<(String, u32, watch::Receiver<Option<ExitState>>)> = {
			let processes = self.processes.read().await;
			processes
				.values()
				.map(|mp| (mp.source.clone(), mp.pid, mp.done.clone()))
				.collect()
		};

		if targets.is_empty() {
			return;
		}
		tracing::info!("cleaning up {} process(es)...", targets.len());

		let grace = self.config.grace_period;
		let mut teardown = JoinSet::new();
		for (source, pid, exit) in targets {
			teardown.spawn(async move {
				let result = terminate(&source, pid, exit, grace).await;
				(source, result)
			});
		}

		while let Some(joined) = teardown.join_next().await {
			match joined {
				Ok((_, Ok(()))) => {}
				Ok((source, Err(e))) => tracing::error!("error stopping {}: {}", source, e),
				Err(e) => tracing::error!("teardown task failed: {}", e),
			}
		}
	}

	/// Append `text` to the source's file (when it has one) and publish it sanitized.
	async fn emit(&self, source: &str, log: Option<&mut SourceLog>, text: &str) {
		if let Some(log) = log {
			if let Err(e) = log.append(text).await {
				tracing::warn!("failed to write {}: {}", log.path().display(), e);
			}
		}
		let cleaned = sanitize::clean(text);
		if !cleaned.is_empty() {
			self.hub.publish(&LogDelta::new(source, cleaned)).await;
		}
	}

	async fn report_failure(&self, source: &str, log: Option<&mut SourceLog>, detail: &str) {
		let message = format!("Error running {}: {}\n", source, detail);
		tracing::error!("{}", message.trim_end());
		self.emit(source, log, &message).await;
	}
}

async fn run_source_loop(
	supervisor: Arc<Supervisor>,
	source: String,
	mut child: Child,
	mut log: SourceLog,
	mut output: OutputReader,
	exit_tx: watch::Sender<Option<ExitState>>,
	done_tx: watch::Sender<Option<ExitState>>,
) {
	// the child can exit while something it started still holds the pipe open
	let mut exit = None;
	loop {
		tokio::select! {
			chunk = output.next_chunk() => match chunk {
				Some(bytes) => {
					let text = String::from_utf8_lossy(&bytes);
					supervisor.emit(&source, Some(&mut log), &text).await;
				}
				None => break,
			},
			status = child.wait(), if exit.is_none() => {
				let state = reaped(&source, status);
				exit = Some(state);
				let _ = exit_tx.send(Some(state));
			}
		}
	}

	let exit = match exit {
		Some(state) => state,
		None => {
			let state = reaped(&source, child.wait().await);
			let _ = exit_tx.send(Some(state));
			state
		}
	};
	tracing::info!("{} ended: {}", source, exit.marker().trim());
	supervisor.emit(&source, Some(&mut log), &exit.marker()).await;

	{
		let mut processes = supervisor.processes.write().await;
		processes.remove(&source);
	}
	let _ = done_tx.send(Some(exit));
}

fn reaped(source: &str, status: std::io::Result<std::process::ExitStatus>) -> ExitState {
	match status {
		Ok(status) => ExitState::from_status(status),
		Err(e) => {
			tracing::warn!("failed to wait for {}: {}", source, e);
			ExitState::Failed
		}
	}
}

/// Spawn with stdout and stderr sharing one pipe, so the child's writes reach us in
/// the order it made them.
fn spawn_child(command: &CommandSpec, root: &Path) -> Result<(Child, pipe::Receiver), String> {
	let (program, args) = command
		.program_and_args()
		.ok_or_else(|| "empty command".to_string())?;

	let (reader, writer) = std::io::pipe().map_err(|e| format!("cannot create pipe: {}", e))?;
	let stderr = writer
		.try_clone()
		.map_err(|e| format!("cannot create pipe: {}", e))?;

	let mut cmd = Command::new(program);
	cmd.args(args)
		.current_dir(root)
		.stdin(Stdio::null())
		.stdout(writer)
		.stderr(stderr)
		.kill_on_drop(true)
		// own process group so signals reach the whole tree
		.process_group(0);

	let child = cmd.spawn().map_err(|e| e.to_string())?;
	// the child now holds the only write ends
	drop(cmd);

	let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
		.map_err(|e| format!("cannot read child output: {}", e))?;
	Ok((child, output))
}

/// Reads a child's merged output in bounded chunks. A chunk never ends inside a
/// UTF-8 character or an escape sequence; those bytes wait for the next read.
struct OutputReader {
	pipe: pipe::Receiver,
	buf: Vec<u8>,
	pending: Vec<u8>,
	closed: bool,
}

impl OutputReader {
	fn new(pipe: pipe::Receiver) -> Self {
		Self {
			pipe,
			buf: vec![0; PIPE_CHUNK],
			pending: Vec::new(),
			closed: false,
		}
	}

	/// Next chunk, or `None` once the pipe is closed and everything was handed out.
	/// Cancel-safe: nothing is consumed until a read completes.
	async fn next_chunk(&mut self) -> Option<Vec<u8>> {
		loop {
			if self.closed {
				if self.pending.is_empty() {
					return None;
				}
				return Some(std::mem::take(&mut self.pending));
			}

			match self.pipe.read(&mut self.buf).await {
				Ok(0) => self.closed = true,
				Ok(n) => {
					self.pending.extend_from_slice(&self.buf[..n]);
					let keep = sanitize::deliverable_len(&self.pending);
					if keep > 0 {
						let rest = self.pending.split_off(keep);
						return Some(std::mem::replace(&mut self.pending, rest));
					}
				}
				Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
				Err(e) => {
					tracing::debug!("output pipe failed: {}", e);
					self.closed = true;
				}
			}
		}
	}
}

async fn terminate(
	source: &str,
	pid: u32,
	mut exit: watch::Receiver<Option<ExitState>>,
	grace: Duration,
) -> Result<(), String> {
	if exit.borrow().is_some() {
		return Ok(());
	}

	tracing::info!("terminating {}...", source);
	signal_group(pid, nix::sys::signal::Signal::SIGTERM)
		.map_err(|e| format!("SIGTERM failed: {}", e))?;

	let exited = tokio::time::timeout(grace, exit.wait_for(|s| s.is_some()))
		.await
		.is_ok();
	if exited {
		return Ok(());
	}

	tracing::warn!("force killing {}...", source);
	signal_group(pid, nix::sys::signal::Signal::SIGKILL)
		.map_err(|e| format!("SIGKILL failed: {}", e))?;

	let reaped = tokio::time::timeout(grace, exit.wait_for(|s| s.is_some()))
		.await
		.is_ok();
	if reaped {
		Ok(())
	} else {
		Err(format!("not reclaimed {:?} after SIGKILL", grace))
	}
}

/// Signal the child's process group. A group that is already gone is not an error.
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), nix::Error> {
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;

	if pid == 0 {
		return Ok(());
	}
	match killpg(Pid::from_raw(pid as i32), signal) {
		Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
		Err(e) => Err(e),
	}
}
