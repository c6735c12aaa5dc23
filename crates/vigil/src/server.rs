use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rust_embed::RustEmbed;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use vigil_engine::{logs, Hub, SourceMode, SourceRegistry, Supervisor};

#[derive(RustEmbed)]
#[folder = "ui/"]
struct UiAssets;

#[derive(Clone)]
pub struct AppState {
	pub registry: Arc<SourceRegistry>,
	pub hub: Arc<Hub>,
	pub supervisor: Arc<Supervisor>,
	pub log_dir: Arc<PathBuf>,
	pub max_lines: usize,
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/ws", get(subscribe))
		.route("/logs/{name}", get(read_log))
		.route("/api/sources", get(list_sources))
		.fallback(static_handler)
		.layer(CorsLayer::permissive())
		.with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourcesResponse {
	max_lines: usize,
	sources: Vec<SourceInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceInfo {
	name: String,
	log_file: String,
	mode: SourceMode,
	color: Option<String>,
	running: bool,
	pid: Option<u32>,
	exit_code: Option<i32>,
}

async fn list_sources(State(state): State<AppState>) -> Json<SourcesResponse> {
	let running = state.supervisor.running().await;
	let sources = state
		.registry
		.sources()
		.iter()
		.map(|s| {
			let process = running.iter().find(|r| r.source == s.name);
			let pid = process.map(|r| r.pid);
			SourceInfo {
				name: s.name.clone(),
				log_file: s.log_file.to_string_lossy().to_string(),
				mode: s.mode,
				color: s.color.clone(),
				running: process.is_some_and(|r| r.exit_code.is_none()),
				pid,
				exit_code: process.and_then(|r| r.exit_code),
			}
		})
		.collect();
	Json(SourcesResponse {
		max_lines: state.max_lines,
		sources,
	})
}

/// Full history of one source. Accepts `name` or `name.log`.
async fn read_log(State(state): State<AppState>, Path(name): Path<String>) -> Response {
	let name = match state.registry.get(&name) {
		Some(_) => name.as_str(),
		None => name.strip_suffix(".log").unwrap_or(&name),
	};

	match logs::read_history(&state.registry, &state.log_dir, name).await {
		Some(content) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], content).into_response(),
		None => (StatusCode::NOT_FOUND, format!("unknown source: {}", name)).into_response(),
	}
}

async fn subscribe(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
	ws.on_upgrade(move |socket| handle_subscriber(socket, state.hub))
}

async fn handle_subscriber(mut socket: WebSocket, hub: Arc<Hub>) {
	let Some(mut subscription) = hub.register().await else {
		let _ = socket.send(Message::Close(None)).await;
		return;
	};

	loop {
		tokio::select! {
			outgoing = subscription.recv() => match outgoing {
				Some(message) => {
					if socket.send(Message::Text(message.to_string().into())).await.is_err() {
						break;
					}
				}
				// hub closed
				None => {
					let _ = socket.send(Message::Close(None)).await;
					break;
				}
			},
			incoming = socket.recv() => match incoming {
				Some(Ok(Message::Close(_))) | None => break,
				Some(Err(e)) => {
					tracing::warn!("websocket error: {}", e);
					break;
				}
				Some(Ok(_)) => {}
			},
		}
	}

	hub.unregister(subscription.id).await;
}

async fn static_handler(uri: Uri) -> Response {
	let path = uri.path().trim_start_matches('/');
	let path = path.strip_prefix("static/").unwrap_or(path);

	if let Some(content) = UiAssets::get(path) {
		return serve_asset(path, content);
	}

	if path.is_empty() || !path.contains('.') {
		if let Some(content) = UiAssets::get("index.html") {
			return serve_asset("index.html", content);
		}
	}

	(StatusCode::NOT_FOUND, "File not found").into_response()
}

fn serve_asset(path: &str, content: rust_embed::EmbeddedFile) -> Response {
	let mime = mime_guess::from_path(path).first_or_octet_stream();
	([(header::CONTENT_TYPE, mime.to_string())], content.data).into_response()
}
