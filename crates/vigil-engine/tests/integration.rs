use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vigil_engine::logs;
use vigil_engine::*;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> std::path::PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("vigil-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::remove_dir_all(&dir);
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn test_supervisor(name: &str) -> (Arc<Supervisor>, Arc<Hub>, std::path::PathBuf) {
	let dir = temp_dir(name);
	let hub = Hub::new();
	let sup = Supervisor::new(SupervisorConfig::new(dir.join("logs"), &dir), Arc::clone(&hub));
	(sup, hub, dir)
}

fn shell(name: &str, command: &str) -> Source {
	Source::managed(name, format!("{}.log", name), CommandSpec::Shell(command.to_string()))
}

/// Everything queued for `sub` until it stays quiet for a moment.
async fn drain(sub: &mut Subscription) -> Vec<LogDelta> {
	let mut out = Vec::new();
	while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(300), sub.recv()).await {
		out.push(serde_json::from_str(&message).unwrap());
	}
	out
}

// --- Hub ---

#[tokio::test]
async fn hub_delivers_to_every_subscriber() {
	let hub = Hub::new();
	let mut subs = Vec::new();
	for _ in 0..3 {
		subs.push(hub.register().await.unwrap());
	}

	let delta = LogDelta::new("api", "hello\n");
	assert_eq!(hub.publish(&delta).await, 3);

	for sub in &mut subs {
		let message = sub.recv().await.unwrap();
		let got: LogDelta = serde_json::from_str(&message).unwrap();
		assert_eq!(got, delta);
	}
}

#[tokio::test]
async fn hub_unregister_before_publish() {
	let hub = Hub::new();
	let a = hub.register().await.unwrap();
	let mut b = hub.register().await.unwrap();
	let mut c = hub.register().await.unwrap();

	hub.unregister(a.id).await;
	assert_eq!(hub.publish(&LogDelta::new("api", "x")).await, 2);
	assert!(b.recv().await.is_some());
	assert!(c.recv().await.is_some());
}

#[tokio::test]
async fn hub_publish_without_subscribers_is_noop() {
	let hub = Hub::new();
	assert_eq!(hub.publish(&LogDelta::new("api", "nobody")).await, 0);
	assert!(hub.is_empty().await);
}

#[tokio::test]
async fn hub_prunes_dropped_subscribers() {
	let hub = Hub::new();
	let gone = hub.register().await.unwrap();
	let mut alive = hub.register().await.unwrap();
	drop(gone);

	assert_eq!(hub.publish(&LogDelta::new("api", "x")).await, 1);
	assert_eq!(hub.len().await, 1);
	assert!(alive.recv().await.is_some());
}

#[tokio::test]
async fn hub_drops_subscriber_with_full_queue() {
	let hub = Hub::new();
	let _stalled = hub.register().await.unwrap();
	for i in 0..hub::SUBSCRIBER_QUEUE {
		assert_eq!(hub.publish(&LogDelta::new("api", i.to_string())).await, 1);
	}
	assert_eq!(hub.publish(&LogDelta::new("api", "overflow")).await, 0);
	assert!(hub.is_empty().await);
}

#[tokio::test]
async fn hub_preserves_per_source_order() {
	let hub = Hub::new();
	let mut sub = hub.register().await.unwrap();
	for i in 0..200 {
		hub.publish(&LogDelta::new("api", format!("{}\n", i))).await;
	}
	for i in 0..200 {
		let got: LogDelta = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
		assert_eq!(got.text, format!("{}\n", i));
	}
}

#[tokio::test]
async fn hub_close_rejects_and_ends_subscribers() {
	let hub = Hub::new();
	let mut sub = hub.register().await.unwrap();
	hub.close().await;

	assert!(sub.recv().await.is_none());
	assert!(hub.register().await.is_none());
	assert!(!hub.is_accepting());
}

// --- Tailer ---

#[tokio::test]
async fn tailer_picks_up_file_created_later() {
	let dir = temp_dir("tail-late");
	let sources = [Source::external("api", "api.log")];
	let mut tailer = Tailer::new(&dir, &sources);

	for _ in 0..3 {
		assert!(tailer.poll().await.is_empty());
	}
	assert_eq!(tailer.cursor("api"), Some(0));

	std::fs::write(dir.join("api.log"), "hello\n").unwrap();
	let deltas = tailer.poll().await;
	assert_eq!(deltas, vec![LogDelta::new("api", "hello\n")]);
	assert_eq!(tailer.cursor("api"), Some(6));

	assert!(tailer.poll().await.is_empty());
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tailer_deltas_concatenate_to_appended_bytes() {
	use std::io::Write;

	let dir = temp_dir("tail-concat");
	let path = dir.join("app.log");
	let sources = [Source::external("app", "app.log")];
	let mut tailer = Tailer::new(&dir, &sources);

	let crab = "🦀".as_bytes();
	let appends: Vec<Vec<u8>> = vec![
		b"first line\n".to_vec(),
		b"partial ".to_vec(),
		[b"crab ".as_slice(), &crab[..2]].concat(),
		[&crab[2..], b"\n".as_slice()].concat(),
		b"".to_vec(),
		b"last\n".to_vec(),
	];

	let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path).unwrap();
	let mut seen = String::new();
	for chunk in &appends {
		file.write_all(chunk).unwrap();
		file.flush().unwrap();
		for delta in tailer.poll().await {
			assert_eq!(delta.source, "app");
			seen.push_str(&delta.text);
		}
	}

	let expected = String::from_utf8(appends.concat()).unwrap();
	assert_eq!(seen, expected);
	assert_eq!(tailer.cursor("app"), Some(expected.len() as u64));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tailer_recovers_from_truncation() {
	let dir = temp_dir("tail-trunc");
	let path = dir.join("app.log");
	let sources = [Source::external("app", "app.log")];
	let mut tailer = Tailer::new(&dir, &sources);

	std::fs::write(&path, "a long first generation\n").unwrap();
	assert_eq!(tailer.poll().await.len(), 1);

	std::fs::write(&path, "new\n").unwrap();
	let deltas = tailer.poll().await;
	assert_eq!(deltas, vec![LogDelta::new("app", "new\n")]);
	assert_eq!(tailer.cursor("app"), Some(4));

	std::fs::write(&path, "").unwrap();
	assert!(tailer.poll().await.is_empty());
	assert_eq!(tailer.cursor("app"), Some(0));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tailer_sanitizes_and_ignores_managed_sources() {
	let dir = temp_dir("tail-clean");
	let sources = [
		Source::external("app", "app.log"),
		shell("worker", "true"),
	];
	let mut tailer = Tailer::new(&dir, &sources);
	assert_eq!(tailer.cursor("worker"), None);

	std::fs::write(dir.join("worker.log"), "not tailed\n").unwrap();
	std::fs::write(dir.join("app.log"), "\x1b[32mgreen\x1b[0m\n").unwrap();
	assert_eq!(tailer.poll().await, vec![LogDelta::new("app", "green\n")]);

	std::fs::write(dir.join("app.log"), "\x1b[32mgreen\x1b[0m\n\x1b[1m").unwrap();
	assert!(tailer.poll().await.is_empty());
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tailer_drains_large_backlog_over_several_ticks() {
	let dir = temp_dir("tail-backlog");
	let path = dir.join("big.log");
	let sources = [Source::external("big", "big.log")];
	let mut tailer = Tailer::new(&dir, &sources);

	let line = "0123456789abcdefghijklmnopqrstuvwxyz\n";
	let lines = (tailer::READ_CHUNK as usize * 4) / line.len() + 7;
	let content = line.repeat(lines);
	std::fs::write(&path, &content).unwrap();
	let total = content.len() as u64;

	let mut seen = String::new();
	let mut ticks = 0;
	while tailer.cursor("big") != Some(total) {
		ticks += 1;
		assert!(ticks <= 10, "cursor stuck at {:?}", tailer.cursor("big"));
		let before = tailer.cursor("big").unwrap();
		for delta in tailer.poll().await {
			seen.push_str(&delta.text);
		}
		let after = tailer.cursor("big").unwrap();
		assert!(after > before);
		assert!(after - before <= tailer::READ_CHUNK);
	}

	assert_eq!(ticks, 5);
	assert_eq!(seen.len(), content.len());
	assert!(seen == content);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tailer_waits_for_split_escape_sequence() {
	use std::io::Write;

	let dir = temp_dir("tail-escape");
	let path = dir.join("app.log");
	let sources = [Source::external("app", "app.log")];
	let mut tailer = Tailer::new(&dir, &sources);

	let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path).unwrap();
	file.write_all(b"red \x1b[3").unwrap();
	assert_eq!(tailer.poll().await, vec![LogDelta::new("app", "red ")]);
	assert_eq!(tailer.cursor("app"), Some(4));

	file.write_all(b"1mhot\x1b[0m\n").unwrap();
	assert_eq!(tailer.poll().await, vec![LogDelta::new("app", "hot\n")]);
	assert_eq!(tailer.cursor("app"), Some(17));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tailer_run_publishes_until_stopped() {
	let dir = temp_dir("tail-run");
	let hub = Hub::new();
	let mut sub = hub.register().await.unwrap();
	let sources = [Source::external("api", "api.log")];
	let tailer = Tailer::new(&dir, &sources).with_interval(Duration::from_millis(20));

	let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
	let task = tokio::spawn(tailer.run(Arc::clone(&hub), stop_rx));

	std::fs::write(dir.join("api.log"), "hello\n").unwrap();
	let deltas = drain(&mut sub).await;
	assert_eq!(deltas, vec![LogDelta::new("api", "hello\n")]);

	stop_tx.send(true).unwrap();
	tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Supervisor ---

#[tokio::test]
async fn supervisor_records_output_and_exit_code() {
	let (sup, hub, dir) = test_supervisor("exit-code");
	let mut sub = hub.register().await.unwrap();

	let source = shell("worker", "echo started; exit 2");
	let mut handle = sup.spawn(&source).await.unwrap();
	assert_eq!(handle.wait().await, ExitState::Code { code: 2 });
	assert!(!sup.is_running("worker").await);

	let content = std::fs::read_to_string(dir.join("logs/worker.log")).unwrap();
	assert_eq!(content, "started\n\nProcess exited with code 2\n");

	let deltas = drain(&mut sub).await;
	let exit_lines: Vec<&LogDelta> = deltas
		.iter()
		.filter(|d| d.text.contains("Process exited with code 2"))
		.collect();
	assert_eq!(exit_lines.len(), 1);
	assert_eq!(deltas[0], LogDelta::new("worker", "started\n"));
	assert!(deltas.iter().all(|d| d.source == "worker"));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn supervisor_merges_stderr_and_strips_escapes_on_broadcast() {
	let (sup, hub, dir) = test_supervisor("merge");
	let mut sub = hub.register().await.unwrap();

	let source = shell("both", "printf '\\033[31mout\\033[0m\\n'; echo err 1>&2");
	let mut handle = sup.spawn(&source).await.unwrap();
	handle.wait().await;

	let content = std::fs::read_to_string(dir.join("logs/both.log")).unwrap();
	assert_eq!(content, "\x1b[31mout\x1b[0m\nerr\n\nProcess exited with code 0\n");

	let broadcast: String = drain(&mut sub).await.into_iter().map(|d| d.text).collect();
	assert_eq!(broadcast, "out\nerr\n\nProcess exited with code 0\n");
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn supervisor_keeps_stdout_and_stderr_interleaving() {
	let (sup, hub, dir) = test_supervisor("interleave");
	let mut sub = hub.register().await.unwrap();

	let source = shell("chatty", "for i in $(seq 1 300); do echo o$i; echo e$i 1>&2; done");
	let mut handle = sup.spawn(&source).await.unwrap();
	assert_eq!(handle.wait().await.code(), Some(0));

	let mut expected = String::new();
	for i in 1..=300 {
		expected.push_str(&format!("o{}\ne{}\n", i, i));
	}
	expected.push_str("\nProcess exited with code 0\n");

	let content = std::fs::read_to_string(dir.join("logs/chatty.log")).unwrap();
	let lines: Vec<&str> = content.lines().collect();
	assert_eq!(lines[..4], ["o1", "e1", "o2", "e2"]);
	assert!(content == expected, "first lines: {:?}", &lines[..10.min(lines.len())]);

	let broadcast: String = drain(&mut sub).await.into_iter().map(|d| d.text).collect();
	assert!(broadcast == expected);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn supervisor_streams_output_without_newline() {
	let (sup, hub, dir) = test_supervisor("prompt");
	let mut sub = hub.register().await.unwrap();

	let _handle = sup.spawn(&shell("prompt", "printf 'Password: '; sleep 30")).await.unwrap();
	let message = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
	let delta: LogDelta = serde_json::from_str(&message).unwrap();
	assert_eq!(delta, LogDelta::new("prompt", "Password: "));
	assert!(drain(&mut sub).await.is_empty());
	assert!(sup.is_running("prompt").await);

	let content = std::fs::read_to_string(dir.join("logs/prompt.log")).unwrap();
	assert_eq!(content, "Password: ");

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn exit_code_is_visible_while_output_drains() {
	let (sup, _hub, dir) = test_supervisor("draining");

	// the background subshell keeps the output pipe open after sh exits
	let source = shell("parent", "(sleep 1; echo late) & exit 3");
	let mut handle = sup.spawn(&source).await.unwrap();
	tokio::time::sleep(Duration::from_millis(400)).await;

	let running = sup.running().await;
	assert_eq!(running.len(), 1);
	assert_eq!(running[0].exit_code, Some(3));

	assert_eq!(handle.wait().await, ExitState::Code { code: 3 });
	assert!(sup.running().await.is_empty());
	let content = std::fs::read_to_string(dir.join("logs/parent.log")).unwrap();
	assert_eq!(content, "late\n\nProcess exited with code 3\n");
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn supervisor_runs_in_configured_root() {
	let (sup, _hub, dir) = test_supervisor("root");
	std::fs::write(dir.join("marker.txt"), "here").unwrap();

	let source = Source::managed(
		"cat",
		"cat.log",
		CommandSpec::Argv(vec!["cat".into(), "marker.txt".into()]),
	);
	let mut handle = sup.spawn(&source).await.unwrap();
	assert_eq!(handle.wait().await.code(), Some(0));

	let content = std::fs::read_to_string(dir.join("logs/cat.log")).unwrap();
	assert!(content.starts_with("here"));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn supervisor_truncates_log_on_spawn() {
	let (sup, _hub, dir) = test_supervisor("truncate");
	std::fs::create_dir_all(dir.join("logs")).unwrap();
	std::fs::write(dir.join("logs/w.log"), "previous run\n").unwrap();

	let mut handle = sup.spawn(&shell("w", "echo fresh")).await.unwrap();
	handle.wait().await;

	let content = std::fs::read_to_string(dir.join("logs/w.log")).unwrap();
	assert!(content.starts_with("fresh\n"));
	assert!(!content.contains("previous run"));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn spawn_failure_is_reported_in_source_stream() {
	let (sup, hub, dir) = test_supervisor("spawn-fail");
	let mut sub = hub.register().await.unwrap();

	let broken = Source::managed(
		"broken",
		"broken.log",
		CommandSpec::Argv(vec!["/nonexistent/vigil-test-binary".into()]),
	);
	let fine = shell("fine", "echo ok");

	let handles = sup.start_all([&broken, &fine]).await;
	assert_eq!(handles.len(), 1);
	for mut handle in handles {
		assert_eq!(handle.wait().await.code(), Some(0));
	}

	let content = std::fs::read_to_string(dir.join("logs/broken.log")).unwrap();
	assert!(content.starts_with("Error running broken: "), "{:?}", content);

	let deltas = drain(&mut sub).await;
	let broken_deltas: Vec<&LogDelta> = deltas.iter().filter(|d| d.source == "broken").collect();
	assert_eq!(broken_deltas.len(), 1);
	assert!(broken_deltas[0].text.starts_with("Error running broken: "));
	assert!(deltas.iter().any(|d| d.source == "fine" && d.text == "ok\n"));
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn supervisor_rejects_duplicate_spawn() {
	let (sup, _hub, dir) = test_supervisor("dup");
	let source = shell("sleeper", "sleep 30");
	let _handle = sup.spawn(&source).await.unwrap();

	let err = sup.spawn(&source).await.err().unwrap();
	assert!(err.contains("already running"));

	let running = sup.running().await;
	assert_eq!(running.len(), 1);
	assert_eq!(running[0].source, "sleeper");
	assert!(running[0].pid > 0);

	sup.shutdown().await;
	assert!(sup.running().await.is_empty());
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn concurrent_spawns_start_one_child() {
	let (sup, _hub, dir) = test_supervisor("race");
	let source = shell("sleeper", "sleep 30");

	let (a, b) = tokio::join!(sup.spawn(&source), sup.spawn(&source));
	assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
	assert_eq!(sup.running().await.len(), 1);

	sup.shutdown().await;
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Shutdown ---

#[tokio::test]
async fn shutdown_terminates_cooperative_children_quickly() {
	let (sup, hub, dir) = test_supervisor("graceful");
	let coordinator = ShutdownCoordinator::new(Arc::clone(&sup), Arc::clone(&hub));

	let mut handle = sup.spawn(&shell("sleeper", "exec sleep 60")).await.unwrap();
	tokio::time::sleep(Duration::from_millis(100)).await;

	let started = Instant::now();
	coordinator.shutdown().await;
	assert!(started.elapsed() < Duration::from_secs(3));
	assert_eq!(coordinator.state(), EngineState::Terminated);
	assert_eq!(handle.wait().await, ExitState::Signal { signal: 15 });
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn shutdown_kills_children_that_ignore_sigterm() {
	let (sup, hub, dir) = test_supervisor("stubborn");
	let coordinator = ShutdownCoordinator::new(Arc::clone(&sup), Arc::clone(&hub));

	let tailer = Tailer::new(&dir.join("logs"), &[logs::self_source()]);
	coordinator
		.track(tokio::spawn(tailer.run(Arc::clone(&hub), coordinator.close_signal())))
		.await;

	let source = shell("worker", "trap '' TERM; echo ready; while true; do sleep 1; done");
	let mut handle = sup.spawn(&source).await.unwrap();
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(coordinator.state(), EngineState::Running);

	let started = Instant::now();
	coordinator.shutdown().await;
	let elapsed = started.elapsed();

	assert!(elapsed >= Duration::from_secs(5), "killed too early: {:?}", elapsed);
	assert!(elapsed < Duration::from_secs(8), "hung: {:?}", elapsed);
	assert_eq!(coordinator.state(), EngineState::Terminated);
	assert_eq!(handle.wait().await, ExitState::Signal { signal: 9 });
	assert!(hub.register().await.is_none());

	let content = std::fs::read_to_string(dir.join("logs/worker.log")).unwrap();
	assert!(content.ends_with("Process terminated by signal 9\n"), "{:?}", content);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn second_shutdown_is_a_noop() {
	let (sup, hub, dir) = test_supervisor("twice");
	let coordinator = ShutdownCoordinator::new(Arc::clone(&sup), Arc::clone(&hub));

	assert!(coordinator.trigger());
	assert!(!coordinator.trigger());
	assert_eq!(coordinator.state(), EngineState::ShuttingDown);

	let other = ShutdownCoordinator::new(sup, hub);
	other.shutdown().await;
	other.shutdown().await;
	assert_eq!(other.state(), EngineState::Terminated);
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn supervisor_refuses_spawn_after_shutdown() {
	let (sup, _hub, dir) = test_supervisor("late");
	sup.shutdown().await;
	assert!(sup.spawn(&shell("late", "true")).await.is_err());
	let _ = std::fs::remove_dir_all(&dir);
}

// --- History ---

#[tokio::test]
async fn history_reads_file_or_empty() {
	let dir = temp_dir("history");
	let registry = SourceRegistry::new(vec![
		Source::external("api", "api.log"),
		Source::external("db", "db.log"),
	])
	.unwrap();
	std::fs::write(dir.join("api.log"), "line 1\n\x1b[1mline 2\n").unwrap();

	assert_eq!(
		logs::read_history(&registry, &dir, "api").await.as_deref(),
		Some("line 1\n\x1b[1mline 2\n")
	);
	assert_eq!(logs::read_history(&registry, &dir, "db").await.as_deref(), Some(""));
	assert_eq!(logs::read_history(&registry, &dir, "missing").await, None);
	let _ = std::fs::remove_dir_all(&dir);
}
