//! Element-wise pipeline operators.

use std::{ops::ControlFlow, sync::Arc};

use super::{flow, Flow};

impl<T: Send + 'static> Flow<T> {
	/// 1:1 transform; order and error timing are preserved.
	pub fn map<R, F>(&self, transform: F) -> Flow<R>
	where
		R: Send + 'static,
		F: Fn(T) -> R + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let transform = Arc::new(transform);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let transform = transform.clone();
			async move { upstream.collect(|value| emitter.emit(transform(value))).await }
		})
	}

	pub fn filter<F>(&self, predicate: F) -> Flow<T>
	where
		F: Fn(&T) -> bool + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let predicate = Arc::new(predicate);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let predicate = predicate.clone();
			async move {
				upstream
					.collect(|value| {
						let keep = predicate(&value);
						let emit = keep.then(|| emitter.emit(value));
						async move {
							match emit {
								Some(emit) => emit.await,
								None => Ok(()),
							}
						}
					})
					.await
			}
		})
	}

	/// Emits `init`, then every progressive accumulation.
	pub fn scan<A, F>(&self, init: A, combine: F) -> Flow<A>
	where
		A: Clone + Send + Sync + 'static,
		F: Fn(A, T) -> A + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let combine = Arc::new(combine);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let combine = combine.clone();
			let init = init.clone();
			async move {
				emitter.emit(init.clone()).await?;
				let mut accumulator = init;
				upstream
					.collect(|value| {
						accumulator = combine(accumulator.clone(), value);
						emitter.emit(accumulator.clone())
					})
					.await
			}
		})
	}

	/// At most `count` elements; the upstream is cancelled once they are
	/// through. `take(0)` is immediately empty without starting the upstream.
	pub fn take(&self, count: usize) -> Flow<T> {
		let upstream = self.clone();
		flow(move |emitter| {
			let upstream = upstream.clone();
			async move {
				if count == 0 {
					return Ok(())
				}
				let mut remaining = count;
				upstream
					.try_collect(|value| {
						remaining -= 1;
						let done = remaining == 0;
						let emit = emitter.emit(value);
						async move {
							emit.await?;
							Ok(if done { ControlFlow::Break(()) } else { ControlFlow::Continue(()) })
						}
					})
					.await
			}
		})
	}

	/// Discards the first `count` elements.
	pub fn skip(&self, count: usize) -> Flow<T> {
		let upstream = self.clone();
		flow(move |emitter| {
			let upstream = upstream.clone();
			async move {
				let mut to_skip = count;
				upstream
					.collect(|value| {
						let emit = if to_skip == 0 {
							Some(emitter.emit(value))
						} else {
							to_skip -= 1;
							None
						};
						async move {
							match emit {
								Some(emit) => emit.await,
								None => Ok(()),
							}
						}
					})
					.await
			}
		})
	}

	/// Emits while the predicate holds, then cancels the upstream.
	pub fn take_while<F>(&self, predicate: F) -> Flow<T>
	where
		F: Fn(&T) -> bool + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let predicate = Arc::new(predicate);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let predicate = predicate.clone();
			async move {
				upstream
					.try_collect(|value| {
						let emit = predicate(&value).then(|| emitter.emit(value));
						async move {
							match emit {
								Some(emit) => {
									emit.await?;
									Ok(ControlFlow::Continue(()))
								},
								None => Ok(ControlFlow::Break(())),
							}
						}
					})
					.await
			}
		})
	}

	/// Discards elements while the predicate holds, then emits everything.
	pub fn skip_while<F>(&self, predicate: F) -> Flow<T>
	where
		F: Fn(&T) -> bool + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let predicate = Arc::new(predicate);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let predicate = predicate.clone();
			async move {
				let mut skipping = true;
				upstream
					.collect(|value| {
						if skipping && !predicate(&value) {
							skipping = false;
						}
						let emit = (!skipping).then(|| emitter.emit(value));
						async move {
							match emit {
								Some(emit) => emit.await,
								None => Ok(()),
							}
						}
					})
					.await
			}
		})
	}
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Flow<T> {
	/// Drops elements equal to their predecessor; the first element always
	/// goes through.
	pub fn distinct_until_changed(&self) -> Flow<T> {
		let upstream = self.clone();
		flow(move |emitter| {
			let upstream = upstream.clone();
			async move {
				let mut previous: Option<T> = None;
				upstream
					.collect(|value| {
						let changed = previous.as_ref() != Some(&value);
						if changed {
							previous = Some(value.clone());
						}
						let emit = changed.then(|| emitter.emit(value));
						async move {
							match emit {
								Some(emit) => emit.await,
								None => Ok(()),
							}
						}
					})
					.await
			}
		})
	}
}
