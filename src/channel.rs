//! Closeable FIFO channels with backpressure.
//!
//! A channel is a single cloneable object rather than a split sender/receiver
//! pair, because flows hand the same channel to both ends of a pipeline.
//! Bounded senders suspend while the buffer is full; rendezvous (capacity 0)
//! senders suspend until a receiver is waiting and then hand off through a
//! one-slot buffer. Closing wakes every waiter; receivers drain whatever was
//! buffered, and a close cause is raised to the first receiver that observes
//! end-of-stream.

use std::{
	collections::VecDeque,
	sync::{Arc, Mutex},
};

use tokio::sync::Notify;

use crate::error::{CloseCause, SendError, TrySendError};

struct ChannelState<T> {
	buffer: VecDeque<T>,
	// `None` is unbounded, `Some(0)` rendezvous.
	capacity: Option<usize>,
	closed: bool,
	close_cause: Option<Arc<anyhow::Error>>,
	cause_raised: bool,
	receivers_waiting: usize,
}

impl<T> ChannelState<T> {
	fn has_send_space(&self) -> bool {
		match self.capacity {
			None => true,
			Some(0) => self.receivers_waiting > 0 && self.buffer.is_empty(),
			Some(capacity) => self.buffer.len() < capacity,
		}
	}
}

struct ChannelInner<T> {
	state: Mutex<ChannelState<T>>,
	readable: Notify,
	writable: Notify,
}

pub struct Channel<T> {
	inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
	fn clone(&self) -> Self {
		Self { inner: self.inner.clone() }
	}
}

impl<T> Channel<T> {
	fn with_capacity(capacity: Option<usize>) -> Self {
		Self {
			inner: Arc::new(ChannelInner {
				state: Mutex::new(ChannelState {
					buffer: VecDeque::new(),
					capacity,
					closed: false,
					close_cause: None,
					cause_raised: false,
					receivers_waiting: 0,
				}),
				readable: Notify::new(),
				writable: Notify::new(),
			}),
		}
	}

	pub fn unbounded() -> Self {
		Self::with_capacity(None)
	}

	pub fn bounded(capacity: usize) -> Self {
		Self::with_capacity(Some(capacity))
	}

	/// Capacity 0: every send waits for a receiver.
	pub fn rendezvous() -> Self {
		Self::with_capacity(Some(0))
	}

	/// Appends to the buffer, suspending while the channel is full (bounded)
	/// or until a receiver arrives (rendezvous). Dropping the returned future
	/// abandons the send without enqueueing. A closed channel hands the value
	/// back.
	pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
		let mut value = Some(value);
		loop {
			let writable = self.inner.writable.notified();
			tokio::pin!(writable);
			writable.as_mut().enable();
			{
				let mut state = self.inner.state.lock().unwrap();
				if state.closed {
					return Err(SendError(value.take().expect("value is present until sent")))
				}
				if state.has_send_space() {
					state.buffer.push_back(value.take().expect("value is present until sent"));
					drop(state);
					self.inner.readable.notify_waiters();
					return Ok(())
				}
			}
			writable.await;
		}
	}

	/// Non-blocking send; reports whether the value was accepted without
	/// changing state otherwise.
	pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
		let mut state = self.inner.state.lock().unwrap();
		if state.closed {
			return Err(TrySendError::Closed(value))
		}
		if !state.has_send_space() {
			return Err(TrySendError::Full(value))
		}
		state.buffer.push_back(value);
		drop(state);
		self.inner.readable.notify_waiters();
		Ok(())
	}

	/// The next value, or `Ok(None)` on a drained closed channel. A close
	/// cause is raised exactly once, to the first receiver that reaches
	/// end-of-stream; receivers after that observe a clean end.
	pub async fn recv(&self) -> Result<Option<T>, CloseCause> {
		loop {
			let readable = self.inner.readable.notified();
			tokio::pin!(readable);
			readable.as_mut().enable();
			{
				let mut state = self.inner.state.lock().unwrap();
				if let Some(value) = state.buffer.pop_front() {
					drop(state);
					self.inner.writable.notify_waiters();
					return Ok(Some(value))
				}
				if state.closed {
					if !state.cause_raised {
						if let Some(cause) = state.close_cause.clone() {
							state.cause_raised = true;
							return Err(CloseCause(cause))
						}
					}
					return Ok(None)
				}
				state.receivers_waiting += 1;
			}
			// A rendezvous sender may only proceed once a receiver waits.
			self.inner.writable.notify_waiters();
			// Keep the waiting count honest even if this future is dropped
			// mid-wait.
			let _waiting = scopeguard::guard((), |()| {
				self.inner.state.lock().unwrap().receivers_waiting -= 1;
			});
			readable.await;
		}
	}

	/// A lazy stream of the channel's values; ends when the channel is closed
	/// and drained. A close cause is yielded as the final `Err` item.
	pub fn receive_all(&self) -> impl futures::Stream<Item = Result<T, CloseCause>> + '_ {
		futures::stream::unfold((self, false), |(channel, done)| async move {
			if done {
				return None
			}
			match channel.recv().await {
				Ok(Some(value)) => Some((Ok(value), (channel, false))),
				Ok(None) => None,
				Err(cause) => Some((Err(cause), (channel, true))),
			}
		})
	}

	/// Marks the channel closed. Idempotent; reports whether this call closed
	/// it. All waiters wake: senders fail, receivers drain then terminate.
	pub fn close(&self, cause: Option<anyhow::Error>) -> bool {
		{
			let mut state = self.inner.state.lock().unwrap();
			if state.closed {
				return false
			}
			state.closed = true;
			state.close_cause = cause.map(Arc::new);
		}
		self.inner.readable.notify_waiters();
		self.inner.writable.notify_waiters();
		true
	}

	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().unwrap().closed
	}

	pub fn len(&self) -> usize {
		self.inner.state.lock().unwrap().buffer.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> Option<usize> {
		self.inner.state.lock().unwrap().capacity
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use futures::StreamExt;

	use super::*;

	#[tokio::test]
	async fn unbounded_preserves_fifo_order() {
		let channel = Channel::unbounded();
		for value in 0..5 {
			channel.send(value).await.unwrap();
		}
		channel.close(None);
		let mut received = Vec::new();
		while let Ok(Some(value)) = channel.recv().await {
			received.push(value);
		}
		assert_eq!(received, vec![0, 1, 2, 3, 4]);
	}

	#[tokio::test]
	async fn bounded_sender_suspends_until_space_frees_up() {
		let channel = Channel::bounded(1);
		channel.send(1).await.unwrap();

		let second_sent = Arc::new(AtomicBool::new(false));
		let sender = tokio::spawn({
			let channel = channel.clone();
			let second_sent = second_sent.clone();
			async move {
				channel.send(2).await.unwrap();
				second_sent.store(true, Ordering::Relaxed);
			}
		});

		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		assert!(!second_sent.load(Ordering::Relaxed));
		assert_eq!(channel.len(), 1);

		assert_eq!(channel.recv().await.unwrap(), Some(1));
		sender.await.unwrap();
		assert_eq!(channel.recv().await.unwrap(), Some(2));
	}

	#[tokio::test]
	async fn try_send_only_succeeds_with_space_on_an_open_channel() {
		let channel = Channel::bounded(1);
		channel.try_send(1).unwrap();
		assert!(matches!(channel.try_send(2), Err(TrySendError::Full(2))));
		assert_eq!(channel.len(), 1);

		channel.close(None);
		assert!(matches!(channel.try_send(3), Err(TrySendError::Closed(3))));
	}

	#[tokio::test]
	async fn rendezvous_send_waits_for_a_receiver() {
		let channel = Channel::rendezvous();
		let handed_off = Arc::new(AtomicBool::new(false));
		let sender = tokio::spawn({
			let channel = channel.clone();
			let handed_off = handed_off.clone();
			async move {
				channel.send(42).await.unwrap();
				handed_off.store(true, Ordering::Relaxed);
			}
		});

		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		assert!(!handed_off.load(Ordering::Relaxed));

		assert_eq!(channel.recv().await.unwrap(), Some(42));
		sender.await.unwrap();
		assert!(handed_off.load(Ordering::Relaxed));
	}

	#[tokio::test]
	async fn close_wakes_receivers_and_rejects_senders() {
		let channel = Channel::<u32>::bounded(1);
		let receiver = tokio::spawn({
			let channel = channel.clone();
			async move { channel.recv().await }
		});
		tokio::task::yield_now().await;
		assert!(channel.close(None));
		assert!(!channel.close(None));
		assert_eq!(receiver.await.unwrap().unwrap(), None);
		assert!(matches!(channel.send(9).await, Err(SendError(9))));
	}

	#[tokio::test]
	async fn post_close_receivers_drain_remaining_items() {
		let channel = Channel::unbounded();
		channel.send("a").await.unwrap();
		channel.send("b").await.unwrap();
		channel.close(None);

		assert_eq!(channel.recv().await.unwrap(), Some("a"));
		assert_eq!(channel.recv().await.unwrap(), Some("b"));
		assert_eq!(channel.recv().await.unwrap(), None);
	}

	#[tokio::test]
	async fn close_cause_is_raised_once_after_the_drain() {
		let channel = Channel::unbounded();
		channel.send(1).await.unwrap();
		channel.close(Some(anyhow::anyhow!("upstream exploded")));

		assert_eq!(channel.recv().await.unwrap(), Some(1));
		let cause = channel.recv().await.unwrap_err();
		assert!(cause.to_string().contains("upstream exploded"));
		// Later receivers see a clean end.
		assert_eq!(channel.recv().await.unwrap(), None);
	}

	#[tokio::test]
	async fn receive_all_yields_values_then_the_cause() {
		let channel = Channel::unbounded();
		channel.send(1).await.unwrap();
		channel.send(2).await.unwrap();
		channel.close(Some(anyhow::anyhow!("bad end")));

		let collected = channel.receive_all().collect::<Vec<_>>().await;
		assert_eq!(collected.len(), 3);
		assert_eq!(*collected[0].as_ref().unwrap(), 1);
		assert_eq!(*collected[1].as_ref().unwrap(), 2);
		assert!(collected[2].is_err());
	}
}
