//! Time-sensitive and buffering operators.
//!
//! Quiet periods, sampling ticks and retry backoffs all go through the
//! ambient time source, so these operators run in virtual time under the test
//! harness. Durations of zero degrade to a plain pass-through.

use std::{pin::pin, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};

use super::{drive, flow, pipe_into, Flow};
use crate::{ambient, channel::Channel};

impl<T: Send + 'static> Flow<T> {
	/// Emits an element only once no newer element has arrived for `quiet`;
	/// the last pending element is flushed when the upstream completes.
	pub fn debounce(&self, quiet: Duration) -> Flow<T> {
		let upstream = self.clone();
		flow(move |emitter| {
			let upstream = upstream.clone();
			async move {
				if quiet.is_zero() {
					return upstream.collect(|value| emitter.emit(value)).await
				}
				let time = ambient::current().time();
				let events = Channel::bounded(1);
				let mut pipe = pin!(pipe_into(upstream, events.clone()).fuse());
				let mut pending: Option<T> = None;
				let mut deadline: Option<Duration> = None;
				loop {
					let mut timer = pin!({
						let time = time.clone();
						async move {
							match deadline {
								Some(deadline) => {
									let now = time.now();
									if deadline > now {
										time.sleep(deadline - now).await
									}
								},
								None => futures::future::pending().await,
							}
						}
					}
					.fuse());
					let mut receive = pin!(events.recv().fuse());
					futures::select_biased! {
						received = receive => match received {
							Ok(Some(value)) => {
								pending = Some(value);
								deadline = Some(time.now() + quiet);
							},
							Ok(None) => {
								if let Some(value) = pending.take() {
									emitter.emit(value).await?;
								}
								return Ok(())
							},
							Err(cause) => return Err(cause.into()),
						},
						_ = timer => {
							deadline = None;
							if let Some(value) = pending.take() {
								emitter.emit(value).await?;
							}
						},
						_ = &mut pipe => {},
					}
				}
			}
		})
	}

	/// Emits the latest-seen element on every `period` tick; ticks with no
	/// new element are skipped.
	pub fn sample(&self, period: Duration) -> Flow<T> {
		let upstream = self.clone();
		flow(move |emitter| {
			let upstream = upstream.clone();
			async move {
				if period.is_zero() {
					return upstream.collect(|value| emitter.emit(value)).await
				}
				let time = ambient::current().time();
				let events = Channel::bounded(1);
				let mut pipe = pin!(pipe_into(upstream, events.clone()).fuse());
				let mut latest: Option<T> = None;
				let mut next_tick = time.now() + period;
				loop {
					let mut timer = pin!({
						let time = time.clone();
						async move {
							let now = time.now();
							if next_tick > now {
								time.sleep(next_tick - now).await
							}
						}
					}
					.fuse());
					let mut receive = pin!(events.recv().fuse());
					futures::select_biased! {
						received = receive => match received {
							Ok(Some(value)) => latest = Some(value),
							Ok(None) => return Ok(()),
							Err(cause) => return Err(cause.into()),
						},
						_ = timer => {
							next_tick += period;
							if let Some(value) = latest.take() {
								emitter.emit(value).await?;
							}
						},
						_ = &mut pipe => {},
					}
				}
			}
		})
	}

	/// Decouples producer and consumer with a `capacity`-slot channel; the
	/// producer runs ahead until it is full.
	pub fn buffer(&self, capacity: usize) -> Flow<T> {
		let upstream = self.clone();
		let capacity = capacity.max(1);
		flow(move |emitter| {
			let upstream = upstream.clone();
			async move {
				let buffered = Channel::bounded(capacity);
				let pipes = pipe_into(upstream, buffered.clone());
				let consumer = async {
					loop {
						match buffered.recv().await {
							Ok(Some(value)) => emitter.emit(value).await?,
							Ok(None) => return Ok(()),
							Err(cause) => return Err(cause.into()),
						}
					}
				};
				drive(consumer, pipes).await
			}
		})
	}

	/// A single-slot buffer that keeps only the latest unread value: the
	/// producer is never blocked by a slow consumer, older unread values are
	/// dropped.
	pub fn conflate(&self) -> Flow<T> {
		let upstream = self.clone();
		flow(move |emitter| {
			let upstream = upstream.clone();
			async move {
				let slot: Arc<std::sync::Mutex<Option<T>>> = Arc::new(std::sync::Mutex::new(None));
				let notify = Arc::new(tokio::sync::Notify::new());
				let mut pipe = pin!({
					let slot = slot.clone();
					let notify = notify.clone();
					async move {
						let result = upstream
							.collect(|value| {
								*slot.lock().unwrap() = Some(value);
								notify.notify_waiters();
								futures::future::ready(Ok(()))
							})
							.await;
						notify.notify_waiters();
						result
					}
				}
				.fuse());
				let mut pipe_result: Option<anyhow::Result<()>> = None;
				let mut in_flight: Option<futures::future::Fuse<BoxFuture<'_, anyhow::Result<()>>>> =
					None;
				loop {
					if in_flight.is_none() {
						if let Some(value) = slot.lock().unwrap().take() {
							in_flight = Some(emitter.emit(value).boxed().fuse());
						} else if let Some(result) = pipe_result.take() {
							return result
						}
					}
					match in_flight.as_mut() {
						Some(mut emit) => futures::select_biased! {
							result = emit => {
								result?;
								in_flight = None;
							},
							result = &mut pipe => pipe_result = Some(result),
						},
						None => {
							let mut waiting = pin!(notify.notified().fuse());
							futures::select_biased! {
								_ = waiting => {},
								result = &mut pipe => pipe_result = Some(result),
							}
						},
					}
				}
			}
		})
	}
}
