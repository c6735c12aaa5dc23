//! # vigil-engine
//!
//! Process supervision and live log fan-out.
//!
//! Spawn managed commands or tail externally written log files, persist output to
//! one append-only file per source, strip terminal escapes, and broadcast each new
//! chunk to every connected subscriber.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use vigil_engine::{CommandSpec, Hub, Source, SourceRegistry, Supervisor, SupervisorConfig, Tailer};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = SourceRegistry::new(vec![
//!     Source::managed("web", "web.log", CommandSpec::Shell("echo hello".into())),
//!     Source::external("api", "api.log"),
//! ])
//! .unwrap();
//!
//! let hub = Hub::new();
//! let mut sub = hub.register().await.unwrap();
//!
//! let sup = Supervisor::new(SupervisorConfig::new("/tmp/vigil/logs", "/tmp"), hub.clone());
//! sup.start_all(registry.sources()).await;
//!
//! let mut tailer = Tailer::new("/tmp/vigil/logs".as_ref(), registry.sources());
//! for delta in tailer.poll().await {
//!     hub.publish(&delta).await;
//! }
//!
//! while let Some(message) = sub.recv().await {
//!     println!("{}", message);
//! }
//! # }
//! ```

pub mod hub;
pub mod logs;
pub mod output;
pub mod registry;
pub mod sanitize;
pub mod shutdown;
pub mod supervisor;
pub mod tailer;
pub mod types;

pub use hub::{Hub, SubscriberId, Subscription};
pub use registry::{RegistryError, SourceRegistry};
pub use shutdown::{EngineState, ShutdownCoordinator};
pub use supervisor::{ManagedProcess, ProcessHandle, Supervisor, SupervisorConfig};
pub use tailer::Tailer;
pub use types::*;
