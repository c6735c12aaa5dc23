use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log to stderr and to `log_path`, which is truncated first.
///
/// The file is the engine's own `vigil` source, so it gets plain text and one
/// unbuffered write per record; the tailer picks each record up as it lands.
pub fn init(log_path: &Path) -> std::io::Result<()> {
	let file = File::create(log_path)?;
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
	let self_log = fmt::layer()
		.with_writer(Mutex::new(file))
		.with_ansi(false)
		.with_target(false);

	tracing_subscriber::registry()
		.with(filter)
		.with(console)
		.with(self_log)
		.init();
	Ok(())
}
