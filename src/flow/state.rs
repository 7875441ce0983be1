//! A shared flow that retains the current value.

use std::sync::{Arc, Mutex};

use futures::FutureExt;

use super::{
	flow,
	shared::{invoke_collector, SharedCollector, SharedFlow, Subscription},
	Flow,
};
use crate::{channel::Channel, error::TaskError};

/// Hot holder of one current value. Writes are serialized, and each write
/// broadcasts through the underlying shared flow in write order; subscribers
/// are handed the current value before they attach.
pub struct StateFlow<T> {
	shared: SharedFlow<T>,
	value: Arc<Mutex<T>>,
	// Serializes set/update so emission order matches write order.
	write_serial: Arc<tokio::sync::Mutex<()>>,
}

impl<T> Clone for StateFlow<T> {
	fn clone(&self) -> Self {
		Self {
			shared: self.shared.clone(),
			value: self.value.clone(),
			write_serial: self.write_serial.clone(),
		}
	}
}

impl<T: Clone + Send + 'static> StateFlow<T> {
	pub fn new(initial: T) -> Self {
		Self {
			shared: SharedFlow::new(),
			value: Arc::new(Mutex::new(initial)),
			write_serial: Arc::new(tokio::sync::Mutex::new(())),
		}
	}

	/// A snapshot of the current value.
	pub fn value(&self) -> T {
		self.value.lock().unwrap().clone()
	}

	/// Stores `value` and broadcasts it to the subscribers.
	pub async fn set_value(&self, value: T) {
		let _serial = self.write_serial.lock().await;
		*self.value.lock().unwrap() = value.clone();
		self.shared.emit(value).await;
	}

	/// Read-modify-write under the write lock, then broadcast the new value.
	pub async fn update<F: FnOnce(&T) -> T>(&self, transform: F) -> T {
		let _serial = self.write_serial.lock().await;
		let next = {
			let mut current = self.value.lock().unwrap();
			let next = transform(&current);
			*current = next.clone();
			next
		};
		self.shared.emit(next.clone()).await;
		next
	}

	/// Delivers the current value to the collector, then attaches it.
	///
	/// A writer racing between those two steps can be observed before the
	/// initial delivery, i.e. the initial value and an immediately following
	/// emission may arrive out of order. Deliberately left as-is.
	pub async fn subscribe<F, Fut>(&self, collector: F) -> Subscription
	where
		F: Fn(T) -> Fut + Send + Sync + 'static,
		Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let collector: SharedCollector<T> = Arc::new(move |value| collector(value).boxed());
		invoke_collector(&collector, self.value()).await;
		self.shared.subscribe_collector(collector)
	}

	pub fn subscriber_count(&self) -> usize {
		self.shared.subscriber_count()
	}

	/// Bridges into the cold pipeline: replays the current value first, then
	/// every subsequent write, until the collection stops.
	pub fn as_flow(&self) -> Flow<T> {
		let state = self.clone();
		flow(move |emitter| {
			let state = state.clone();
			async move {
				let relay = Channel::bounded(8);
				let _close_on_drop = scopeguard::guard(relay.clone(), |relay| {
					relay.close(None);
				});
				let _subscription = state
					.subscribe({
						let relay = relay.clone();
						move |value| {
							let relay = relay.clone();
							async move {
								relay.send(value).await.map_err(|_| {
									TaskError::cancelled_because("flow collection ended").into()
								})
							}
						}
					})
					.await;
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
