//! Operators joining multiple upstreams.

use std::{pin::pin, sync::Arc};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use futures_util::stream::FuturesUnordered;

use super::{drive, flow, pipe_into, Flow};
use crate::{channel::Channel, error::TaskError, settings};

impl<T: Send + 'static> Flow<T> {
	/// Pairs elements in lockstep; ends when either upstream ends.
	pub fn zip<U: Send + 'static>(&self, other: &Flow<U>) -> Flow<(T, U)> {
		let left = self.clone();
		let right = other.clone();
		flow(move |emitter| {
			let left = left.clone();
			let right = right.clone();
			async move {
				let left_channel = Channel::bounded(1);
				let right_channel = Channel::bounded(1);
				let pipes = futures::future::join(
					pipe_into(left, left_channel.clone()),
					pipe_into(right, right_channel.clone()),
				)
				.map(|_| ());
				let consumer = async {
					loop {
						let lhs = match left_channel.recv().await {
							Ok(Some(value)) => value,
							Ok(None) => return Ok(()),
							Err(cause) => return Err(cause.into()),
						};
						let rhs = match right_channel.recv().await {
							Ok(Some(value)) => value,
							Ok(None) => return Ok(()),
							Err(cause) => return Err(cause.into()),
						};
						emitter.emit((lhs, rhs)).await?;
					}
				};
				drive(consumer, pipes).await
			}
		})
	}

	/// Runs each inner flow to exhaustion before taking the next element.
	pub fn flat_map_concat<R, F>(&self, transform: F) -> Flow<R>
	where
		R: Send + 'static,
		F: Fn(T) -> Flow<R> + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let transform = Arc::new(transform);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let transform = transform.clone();
			async move {
				upstream
					.collect(|value| {
						let inner = transform(value);
						let emitter = emitter.clone();
						async move { inner.collect(|element| emitter.emit(element)).await }
					})
					.await
			}
		})
	}

	/// Concurrent flatten: up to `concurrency` inner flows run at once
	/// (configured default when `None`); their emissions interleave.
	pub fn flat_map_merge<R, F>(
		&self,
		transform: F,
		concurrency: impl Into<Option<usize>>,
	) -> Flow<R>
	where
		R: Send + 'static,
		F: Fn(T) -> Flow<R> + Send + Sync + 'static,
	{
		let inner_flows = self.map(transform);
		let concurrency = concurrency
			.into()
			.unwrap_or_else(|| settings::global().flow.flat_map_concurrency)
			.max(1);
		flow(move |emitter| {
			let inner_flows = inner_flows.clone();
			async move {
				let pending_flows = Channel::bounded(1);
				let output = Channel::bounded(1);
				let mut upstream_pipe =
					pin!(pipe_into(inner_flows, pending_flows.clone()).fuse());
				let mut running: FuturesUnordered<BoxFuture<'static, anyhow::Result<()>>> =
					FuturesUnordered::new();
				let mut exhausted = false;

				loop {
					if exhausted && running.is_empty() {
						output.close(None);
					}
					let accepting = running.len() < concurrency && !exhausted;
					let mut next_flow = pin!(async {
						if accepting {
							pending_flows.recv().await
						} else {
							futures::future::pending().await
						}
					}
					.fuse());
					let mut next_output = pin!(output.recv().fuse());
					futures::select_biased! {
						received = next_output => match received {
							Ok(Some(value)) => emitter.emit(value).await?,
							Ok(None) => return Ok(()),
							Err(cause) => return Err(cause.into()),
						},
						inner_done = running.select_next_some() => {
							if let Err(error) = inner_done {
								output.close(Some(error));
							}
						},
						received = next_flow => match received {
							Ok(Some(inner)) => {
								let output = output.clone();
								running.push(
									async move {
										inner
											.collect(|value| {
												let send = output.send(value);
												async move {
													send.await.map_err(|_| {
														TaskError::cancelled_because(
															"merge output is gone",
														)
														.into()
													})
												}
											})
											.await
									}
									.boxed(),
								);
							},
							Ok(None) => exhausted = true,
							Err(cause) => {
								output.close(Some(cause.into()));
								exhausted = true;
							},
						},
						_ = &mut upstream_pipe => {},
					}
				}
			}
		})
	}
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
	/// Emits `combine(latest_left, latest_right)` on every upstream emission
	/// once both sides produced at least one element; terminates when it
	/// observes either upstream ending.
	pub fn combine<U, R, F>(&self, other: &Flow<U>, combine: F) -> Flow<R>
	where
		U: Clone + Send + Sync + 'static,
		R: Send + 'static,
		F: Fn(&T, &U) -> R + Send + Sync + 'static,
	{
		let left = self.clone();
		let right = other.clone();
		let combine = Arc::new(combine);
		flow(move |emitter| {
			let left = left.clone();
			let right = right.clone();
			let combine = combine.clone();
			async move {
				let left_channel = Channel::bounded(1);
				let right_channel = Channel::bounded(1);
				let pipes = futures::future::join(
					pipe_into(left, left_channel.clone()),
					pipe_into(right, right_channel.clone()),
				)
				.map(|_| ());
				let consumer = async {
					let mut latest_left: Option<T> = None;
					let mut latest_right: Option<U> = None;
					loop {
						let mut recv_left = pin!(left_channel.recv().fuse());
						let mut recv_right = pin!(right_channel.recv().fuse());
						futures::select_biased! {
							received = recv_left => match received {
								Ok(Some(value)) => latest_left = Some(value),
								Ok(None) => return Ok(()),
								Err(cause) => return Err(cause.into()),
							},
							received = recv_right => match received {
								Ok(Some(value)) => latest_right = Some(value),
								Ok(None) => return Ok(()),
								Err(cause) => return Err(cause.into()),
							},
						}
						if let (Some(lhs), Some(rhs)) = (&latest_left, &latest_right) {
							emitter.emit(combine(lhs, rhs)).await?;
						}
					}
				};
				drive(consumer, pipes).await
			}
		})
	}
}

/// Interleaves emissions from all sources; within a source, order is
/// preserved, across sources it is unspecified. Ends when every source ended.
pub fn merge<T: Send + 'static>(sources: Vec<Flow<T>>) -> Flow<T> {
	let sources = Arc::new(sources);
	flow(move |emitter| {
		let sources = sources.clone();
		async move {
			let events = Channel::bounded(1);
			let pipes = {
				let events = events.clone();
				let sources = sources.as_ref().clone();
				async move {
					let mut pumps = sources
						.into_iter()
						.map(|source| {
							let events = events.clone();
							async move {
								let result = source
									.collect(|value| {
										let send = events.send(value);
										async move {
											send.await.map_err(|_| {
												TaskError::cancelled_because(
													"merge output is gone",
												)
												.into()
											})
										}
									})
									.await;
								if let Err(error) = result {
									events.close(Some(error));
								}
							}
						})
						.collect::<FuturesUnordered<_>>();
					while pumps.next().await.is_some() {}
					events.close(None);
				}
			};
			let consumer = async {
				loop {
					match events.recv().await {
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
