//! Hot broadcast flows.
//!
//! A shared flow fans every emission out to the current subscribers, in
//! subscription order, awaiting each collector in turn. Slow subscribers
//! backpressure the emitter; failing or panicking subscribers are routed to
//! the ambient uncaught handler and do not stop the fan-out.

use std::{
	collections::BTreeMap,
	panic::AssertUnwindSafe,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, Weak,
	},
};

use futures::{future::BoxFuture, FutureExt};
use itertools::Itertools;

use super::{flow, Flow};
use crate::{ambient, channel::Channel, dispatch::panic_message, error::{cancellation_reason_of, TaskError}};

pub(crate) type SharedCollector<T> =
	Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct SharedInner<T> {
	subscribers: Mutex<BTreeMap<u64, SharedCollector<T>>>,
	next_id: AtomicU64,
}

/// Removes its collector from the shared flow on disposal (or drop).
pub struct Subscription {
	detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
	pub fn dispose(&mut self) {
		if let Some(detach) = self.detach.take() {
			detach();
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.dispose();
	}
}

pub struct SharedFlow<T> {
	inner: Arc<SharedInner<T>>,
}

impl<T> Clone for SharedFlow<T> {
	fn clone(&self) -> Self {
		Self { inner: self.inner.clone() }
	}
}

impl<T: 'static> Default for SharedFlow<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: 'static> SharedFlow<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(SharedInner {
				subscribers: Mutex::new(BTreeMap::new()),
				next_id: AtomicU64::new(0),
			}),
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.inner.subscribers.lock().unwrap().len()
	}

	pub(crate) fn subscribe_collector(&self, collector: SharedCollector<T>) -> Subscription {
		// Subscription ids are strictly increasing; the fan-out iterates them
		// in that order.
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		self.inner.subscribers.lock().unwrap().insert(id, collector);
		let inner = Arc::downgrade(&self.inner);
		Subscription {
			detach: Some(Box::new(move || {
				if let Some(inner) = Weak::upgrade(&inner) {
					inner.subscribers.lock().unwrap().remove(&id);
				}
			})),
		}
	}
}

// Awaits one collector, catching both failures and panics; anything but
// cancellation goes to the ambient uncaught handler.
pub(crate) async fn invoke_collector<T>(collector: &SharedCollector<T>, value: T) {
	match AssertUnwindSafe(collector(value)).catch_unwind().await {
		Ok(Ok(())) => (),
		Ok(Err(error)) => {
			if cancellation_reason_of(&error).is_some() {
				tracing::trace!("Subscriber went away: {error:#}");
			} else {
				let ambient = ambient::current();
				ambient::report_uncaught(ambient.scope_tag(), &error);
			}
		},
		Err(payload) => {
			let error = anyhow::anyhow!("subscriber panicked: {}", panic_message(payload));
			let ambient = ambient::current();
			ambient::report_uncaught(ambient.scope_tag(), &error);
		},
	}
}

impl<T: Clone + Send + 'static> SharedFlow<T> {
	/// Attaches a collector; the returned handle detaches it on disposal.
	/// Only emissions after the attach are observed.
	pub fn subscribe<F, Fut>(&self, collector: F) -> Subscription
	where
		F: Fn(T) -> Fut + Send + Sync + 'static,
		Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		self.subscribe_collector(Arc::new(move |value| collector(value).boxed()))
	}

	/// Delivers `value` to a snapshot of the subscribers, one after another.
	pub async fn emit(&self, value: T) {
		let subscribers =
			self.inner.subscribers.lock().unwrap().values().cloned().collect_vec();
		for collector in subscribers {
			invoke_collector(&collector, value.clone()).await;
		}
	}

	/// Bridges this hot flow into the cold-operator pipeline: the collection
	/// subscribes for its own duration and never completes on its own.
	pub fn as_flow(&self) -> Flow<T> {
		let shared = self.clone();
		flow(move |emitter| {
			let shared = shared.clone();
			async move {
				let relay = Channel::bounded(8);
				// Closing on the way out fails pending subscriber sends, so
				// the shared flow does not block on a dead collection.
				let _close_on_drop = scopeguard::guard(relay.clone(), |relay| {
					relay.close(None);
				});
				let _subscription = shared.subscribe({
					let relay = relay.clone();
					move |value| {
						let send = relay.clone();
						async move {
							send.send(value).await.map_err(|_| {
								TaskError::cancelled_because("flow collection ended").into()
							})
						}
					}
				});
				loop {
					match relay.recv().await {
						Ok(Some(value)) => emitter.emit(value).await?,
						Ok(None) => return Ok(()),
						Err(cause) => return Err(cause.into()),
					}
				}
			}
		})
	}
}
