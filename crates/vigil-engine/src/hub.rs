//! Live fan-out of [`LogDelta`]s to connected subscribers.
//!
//! Each subscriber owns a bounded queue. [`Hub::publish`] serializes a delta once and
//! pushes it to every queue without waiting; a queue that is closed or full marks its
//! subscriber dead and it is dropped from the set. Because pushes are synchronous and
//! queues are FIFO, deltas published in order by one source arrive in that order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use crate::types::LogDelta;

pub const SUBSCRIBER_QUEUE: usize = 1024;

pub type SubscriberId = u64;

/// The receiving half handed to a connection task.
pub struct Subscription {
	pub id: SubscriberId,
	rx: mpsc::Receiver<Arc<str>>,
}

impl Subscription {
	/// Next serialized message, or `None` once the hub dropped this subscriber.
	pub async fn recv(&mut self) -> Option<Arc<str>> {
		self.rx.recv().await
	}
}

pub struct Hub {
	subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<str>>>>,
	next_id: AtomicU64,
	accepting: AtomicBool,
}

impl Default for Hub {
	fn default() -> Self {
		Self {
			subscribers: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(1),
			accepting: AtomicBool::new(true),
		}
	}
}

impl Hub {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Add a subscriber. Returns `None` once the hub is closed.
	pub async fn register(&self) -> Option<Subscription> {
		let mut subscribers = self.subscribers.lock().await;
		// checked under the lock so close() cannot race a late registration
		if !self.accepting.load(Ordering::SeqCst) {
			return None;
		}
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
		subscribers.insert(id, tx);
		tracing::info!("client connected (total: {})", subscribers.len());
		Some(Subscription { id, rx })
	}

	pub async fn unregister(&self, id: SubscriberId) {
		let mut subscribers = self.subscribers.lock().await;
		if subscribers.remove(&id).is_some() {
			tracing::info!("client disconnected (total: {})", subscribers.len());
		}
	}

	/// Best-effort delivery of `delta` to every live subscriber. Returns how many
	/// subscribers accepted it.
	pub async fn publish(&self, delta: &LogDelta) -> usize {
		let mut subscribers = self.subscribers.lock().await;
		subscribers.retain(|_, tx| !tx.is_closed());
		if subscribers.is_empty() {
			return 0;
		}

		let message: Arc<str> = match serde_json::to_string(delta) {
			Ok(json) => json.into(),
			Err(e) => {
				tracing::error!("failed to serialize delta for {}: {}", delta.source, e);
				return 0;
			}
		};

		let mut delivered = 0;
		subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&message)) {
			Ok(()) => {
				delivered += 1;
				true
			}
			Err(TrySendError::Full(_)) => {
				tracing::warn!("dropping subscriber {}: queue full", id);
				false
			}
			Err(TrySendError::Closed(_)) => false,
		});
		delivered
	}

	pub async fn len(&self) -> usize {
		self.subscribers.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.subscribers.lock().await.is_empty()
	}

	pub fn is_accepting(&self) -> bool {
		self.accepting.load(Ordering::SeqCst)
	}

	/// Stop accepting subscribers and drop the live ones, ending their streams.
	pub async fn close(&self) {
		let mut subscribers = self.subscribers.lock().await;
		self.accepting.store(false, Ordering::SeqCst);
		let dropped = subscribers.len();
		subscribers.clear();
		if dropped > 0 {
			tracing::info!("closed {} subscriber(s)", dropped);
		}
	}
}
