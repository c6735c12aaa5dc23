mod config;
mod server;
mod telemetry;

use clap::Parser;
use owo_colors::OwoColorize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use vigil_engine::logs::{source_log_path, SELF_LOG_FILE};
use vigil_engine::{Hub, ShutdownCoordinator, SourceRegistry, Supervisor, SupervisorConfig, Tailer};

#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Live log viewer for concurrent development processes")]
struct Cli {
	/// Path to vigil-config.json or vigil.toml
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Lines kept per tab in the browser
	#[arg(long, default_value_t = 1000)]
	max_lines: usize,

	#[arg(short, long, default_value_t = 3333)]
	port: u16,

	#[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
	host: IpAddr,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let config = match config::find_config(cli.config.as_deref()).and_then(|path| config::load(&path)) {
		Ok(c) => c,
		Err(e) => fail(&e.to_string()),
	};

	if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
		fail(&format!("cannot create log directory {}: {}", config.log_dir.display(), e));
	}
	if let Err(e) = telemetry::init(&config.log_dir.join(SELF_LOG_FILE)) {
		fail(&format!("cannot open {}: {}", SELF_LOG_FILE, e));
	}

	log_startup(&config);

	let registry = Arc::new(config.registry);
	let log_dir = Arc::new(config.log_dir);

	let hub = Hub::new();
	let supervisor = Supervisor::new(SupervisorConfig::new(log_dir.as_path(), config.root), hub.clone());
	let coordinator = ShutdownCoordinator::new(supervisor.clone(), hub.clone());

	let addr = SocketAddr::new(cli.host, cli.port);
	let listener = match tokio::net::TcpListener::bind(addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind HTTP on {}: {}", addr, e);
			fail(&format!("cannot listen on {}: {}", addr, e));
		}
	};

	let tailer = Tailer::new(&log_dir, registry.sources());
	let tail_task = tokio::spawn(tailer.run(hub.clone(), coordinator.close_signal()));
	coordinator.track(tail_task).await;

	let app = server::router(server::AppState {
		registry: registry.clone(),
		hub: hub.clone(),
		supervisor: supervisor.clone(),
		log_dir: log_dir.clone(),
		max_lines: cli.max_lines,
	});
	let closed = coordinator.closed();
	let http_task = tokio::spawn(async move {
		if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(closed).await {
			tracing::error!("HTTP server error: {}", e);
		}
	});
	coordinator.track(http_task).await;
	tracing::info!("HTTP listening on {}", addr);

	print_banner(addr, &registry);

	supervisor.start_all(registry.sources()).await;
	coordinator.run_until_signal().await;
}

fn fail(message: &str) -> ! {
	eprintln!("{} {}", "error:".red().bold(), message);
	std::process::exit(1);
}

fn log_startup(config: &config::Config) {
	tracing::info!("vigil {} starting", env!("CARGO_PKG_VERSION"));
	tracing::info!("config: {}", config.path.display());
	tracing::info!("log directory: {}", config.log_dir.display());
	tracing::info!("monitoring {} sources", config.registry.len());
	for source in config.registry.sources() {
		let path = source_log_path(&config.log_dir, source);
		let mark = if path.exists() { "✅" } else { "❌" };
		let mode = if source.is_managed() { "managed" } else { "tailed" };
		tracing::info!("  {} {} ({}, {})", mark, source.name, mode, path.display());
	}
}

fn print_banner(addr: SocketAddr, registry: &SourceRegistry) {
	eprintln!();
	eprintln!("{} {}", "vigil".bold(), env!("CARGO_PKG_VERSION"));
	eprintln!("  {} http://{}", "viewer".cyan().bold(), addr);
	eprintln!();
	eprintln!("{}", "sources".cyan().bold());
	for source in registry.sources() {
		let kind = if source.is_managed() { "run" } else { "tail" };
		eprintln!("  {} {}", source.name.bold(), kind.dimmed());
	}
	eprintln!();
	eprintln!("{}", "keys".cyan().bold());
	eprintln!("  {}      switch tab", "1-9".bold());
	eprintln!("  {}   clear current tab", "Ctrl+K".bold());
	eprintln!("  {}   stop everything", "Ctrl+C".bold());
	eprintln!();
}
