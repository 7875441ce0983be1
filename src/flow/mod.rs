//! Cold flows: lazy, restartable streams built from a producer block.
//!
//! A flow is a producer function that emits into an [`Emitter`]; nothing runs
//! until a terminal operator collects, and every collection re-invokes the
//! producer from scratch. The producer and the consumer are driven inside one
//! task: the collection engine polls the producer future and the handoff
//! channel in a single `select_biased!` loop, so early termination simply
//! drops the producer, and the enclosing task's cancellation cancels the
//! whole pipeline.

pub mod combine;
pub mod recover;
pub mod shared;
pub mod state;
pub mod timing;
pub mod transform;

use std::{ops::ControlFlow, pin::pin, sync::Arc};

use futures::{future::BoxFuture, FutureExt};

use crate::{channel::Channel, error::TaskError, settings};

pub use shared::{SharedFlow, Subscription};
pub use state::StateFlow;

type Producer<T> = Arc<dyn Fn(Emitter<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The producer's side of the handoff: `emit` applies backpressure and fails
/// once the consumer is gone, which unwinds the producer as a cancellation.
pub struct Emitter<T> {
	channel: Channel<T>,
}

impl<T> Clone for Emitter<T> {
	fn clone(&self) -> Self {
		Self { channel: self.channel.clone() }
	}
}

impl<T: Send + 'static> Emitter<T> {
	pub async fn emit(&self, value: T) -> anyhow::Result<()> {
		self.channel
			.send(value)
			.await
			.map_err(|_| TaskError::cancelled_because("flow consumer is gone").into())
	}
}

/// A cold, restartable stream of `T`.
pub struct Flow<T> {
	producer: Producer<T>,
}

// Collects `source` into `channel`, then closes it, carrying a producer
// failure across as the close cause. The send side treats a vanished receiver
// as cancellation, which unwinds the source's collection.
pub(crate) async fn pipe_into<T: Send + 'static>(source: Flow<T>, channel: Channel<T>) {
	let result = source
		.collect(|value| {
			let send = channel.send(value);
			async move {
				send.await
					.map_err(|_| TaskError::cancelled_because("pipeline stage is gone").into())
			}
		})
		.await;
	channel.close(result.err());
}

// Runs a consuming future to completion while concurrently driving the
// pipeline's internal producer tasks; the consumer finishing (or failing)
// drops the producers, cancelling them.
pub(crate) async fn drive<C, P>(consumer: C, pipes: P) -> anyhow::Result<()>
where
	C: std::future::Future<Output = anyhow::Result<()>>,
	P: std::future::Future<Output = ()>,
{
	let mut consumer = pin!(consumer.fuse());
	let mut pipes = pin!(pipes.fuse());
	loop {
		futures::select_biased! {
			result = &mut consumer => return result,
			_ = &mut pipes => {},
		}
	}
}

impl<T> Clone for Flow<T> {
	fn clone(&self) -> Self {
		Self { producer: self.producer.clone() }
	}
}

/// Builds a flow from a producer block.
pub fn flow<T, P, F>(producer: P) -> Flow<T>
where
	T: Send + 'static,
	P: Fn(Emitter<T>) -> F + Send + Sync + 'static,
	F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
	Flow { producer: Arc::new(move |emitter| producer(emitter).boxed()) }
}

/// A flow emitting the given values in order, afresh for every collector.
pub fn flow_of<T: Clone + Send + Sync + 'static>(values: impl Into<Vec<T>>) -> Flow<T> {
	let values = Arc::new(values.into());
	flow(move |emitter| {
		let values = values.clone();
		async move {
			for value in values.iter() {
				emitter.emit(value.clone()).await?;
			}
			Ok(())
		}
	})
}

pub fn empty_flow<T: Send + 'static>() -> Flow<T> {
	flow(|_emitter| async { Ok(()) })
}

impl<T: Send + 'static> Flow<T> {
	/// Collects with early-stop: the consumer returns `ControlFlow::Break` to
	/// terminate the collection, which cancels the producer by dropping it. A
	/// producer failure propagates out after buffered values are drained; a
	/// consumer failure propagates immediately.
	pub async fn try_collect<F, Fut>(&self, mut consume: F) -> anyhow::Result<()>
	where
		F: FnMut(T) -> Fut,
		Fut: std::future::Future<Output = anyhow::Result<ControlFlow<()>>>,
	{
		let channel = Channel::bounded(settings::global().flow.handoff_capacity.max(1));
		let mut producer = (self.producer)(Emitter { channel: channel.clone() }).fuse();
		let mut producer_error: Option<anyhow::Error> = None;
		loop {
			let mut receive = pin!(channel.recv().fuse());
			futures::select_biased! {
				received = receive => match received {
					Ok(Some(value)) => {
						if consume(value).await?.is_break() {
							channel.close(None);
							return Ok(())
						}
					},
					Ok(None) => return match producer_error.take() {
						Some(error) => Err(error),
						None => Ok(()),
					},
					Err(cause) => return Err(cause.into()),
				},
				result = &mut producer => {
					if let Err(error) = result {
						producer_error = Some(error);
					}
					// Close so the drain above observes end-of-stream once
					// the buffered values are consumed.
					channel.close(None);
				},
			}
		}
	}

	/// Collects every element through an async consumer.
	pub async fn collect<F, Fut>(&self, mut consume: F) -> anyhow::Result<()>
	where
		F: FnMut(T) -> Fut,
		Fut: std::future::Future<Output = anyhow::Result<()>>,
	{
		self.try_collect(|value| {
			let step = consume(value);
			async move {
				step.await?;
				Ok(ControlFlow::Continue(()))
			}
		})
		.await
	}

	/// Terminal: all elements, in emission order.
	pub async fn to_list(&self) -> anyhow::Result<Vec<T>> {
		let mut values = Vec::new();
		self.collect(|value| {
			values.push(value);
			futures::future::ready(Ok(()))
		})
		.await?;
		Ok(values)
	}

	/// Terminal: the first element, cancelling the rest of the pipeline.
	pub async fn first(&self) -> anyhow::Result<Option<T>> {
		let mut first = None;
		self.try_collect(|value| {
			first = Some(value);
			futures::future::ready(Ok(ControlFlow::Break(())))
		})
		.await?;
		Ok(first)
	}

	/// Terminal: the number of elements emitted.
	pub async fn count(&self) -> anyhow::Result<usize> {
		let mut count = 0;
		self.collect(|_value| {
			count += 1;
			futures::future::ready(Ok(()))
		})
		.await?;
		Ok(count)
	}

	/// Terminal: left fold into a final accumulator.
	pub async fn fold<A, F>(&self, init: A, mut combine: F) -> anyhow::Result<A>
	where
		A: Send,
		F: FnMut(A, T) -> A,
	{
		let mut accumulator = Some(init);
		self.collect(|value| {
			let next = combine(accumulator.take().expect("accumulator is always restored"), value);
			accumulator = Some(next);
			futures::future::ready(Ok(()))
		})
		.await?;
		Ok(accumulator.expect("accumulator is always restored"))
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn producer_runs_once_per_collection_with_no_shared_state() {
		let invocations = Arc::new(AtomicUsize::new(0));
		let source = flow({
			let invocations = invocations.clone();
			move |emitter| {
				invocations.fetch_add(1, Ordering::Relaxed);
				async move {
					// Per-collection state starts from scratch.
					for value in 0..3 {
						emitter.emit(value).await?;
					}
					Ok(())
				}
			}
		});

		assert_eq!(invocations.load(Ordering::Relaxed), 0);
		assert_eq!(source.to_list().await.unwrap(), vec![0, 1, 2]);
		assert_eq!(source.to_list().await.unwrap(), vec![0, 1, 2]);
		assert_eq!(invocations.load(Ordering::Relaxed), 2);
	}

	#[tokio::test]
	async fn producer_failure_propagates_after_the_drain() {
		let source = flow(|emitter: Emitter<u32>| async move {
			emitter.emit(1).await?;
			emitter.emit(2).await?;
			Err(anyhow::anyhow!("producer broke"))
		});

		let mut seen = Vec::new();
		let error = source
			.collect(|value| {
				seen.push(value);
				futures::future::ready(Ok(()))
			})
			.await
			.unwrap_err();
		assert_eq!(seen, vec![1, 2]);
		assert!(error.to_string().contains("producer broke"));
	}

	#[tokio::test]
	async fn early_termination_cancels_the_producer() {
		let emitted = Arc::new(AtomicUsize::new(0));
		let source = flow({
			let emitted = emitted.clone();
			move |emitter| {
				let emitted = emitted.clone();
				async move {
					for value in 0.. {
						emitter.emit(value).await?;
						emitted.fetch_add(1, Ordering::Relaxed);
					}
					Ok(())
				}
			}
		});

		assert_eq!(source.first().await.unwrap(), Some(0));
		// An unbounded producer was stopped after a handful of handoffs.
		assert!(emitted.load(Ordering::Relaxed) < 5);
	}

	#[tokio::test]
	async fn fold_and_count_agree() {
		let source = flow_of([1u64, 2, 3, 4]);
		assert_eq!(source.count().await.unwrap(), 4);
		assert_eq!(source.fold(0u64, |sum, value| sum + value).await.unwrap(), 10);
		assert_eq!(empty_flow::<u64>().count().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn consumer_failure_stops_the_collection() {
		let source = flow_of([1, 2, 3]);
		let error = source
			.collect(|value| {
				futures::future::ready(if value == 2 {
					Err(anyhow::anyhow!("consumer rejected {value}"))
				} else {
					Ok(())
				})
			})
			.await
			.unwrap_err();
		assert!(error.to_string().contains("consumer rejected 2"));
	}
}
