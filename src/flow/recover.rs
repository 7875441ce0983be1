//! Failure recovery and lifecycle side-effect operators.

use std::{sync::Arc, time::Duration};

use rand::Rng;

use super::{flow, Flow};
use crate::{error::cancellation_reason_of, time::delay};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10 * 60);

// Exponential backoff with jitter; at least half of the computed delay is
// always applied so retries never become a hot loop.
fn backoff_delay(attempt: u32) -> Duration {
	let capped = std::cmp::min(
		RETRY_MAX_DELAY,
		RETRY_BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
	);
	let half = capped / 2;
	half + rand::thread_rng().gen_range(Duration::default()..half)
}

impl<T: Send + 'static> Flow<T> {
	/// Catches an upstream failure and continues with the flow the handler
	/// builds from it. Cancellation is not caught.
	pub fn catch<F>(&self, handler: F) -> Flow<T>
	where
		F: Fn(&anyhow::Error) -> Flow<T> + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let handler = Arc::new(handler);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let handler = handler.clone();
			async move {
				match upstream.collect(|value| emitter.emit(value)).await {
					Ok(()) => Ok(()),
					Err(error) if cancellation_reason_of(&error).is_some() => Err(error),
					Err(error) => {
						let fallback = handler(&error);
						fallback.collect(|value| emitter.emit(value)).await
					},
				}
			}
		})
	}

	/// Restarts a failed upstream up to `attempts - 1` additional times with
	/// exponential backoff (100 ms, 200 ms, ...) plus jitter. Elements
	/// emitted by failed attempts are not retracted.
	pub fn retry(&self, attempts: u32) -> Flow<T> {
		self.retry_when(
			move |_error, attempt| attempt < attempts,
			|attempt| backoff_delay(attempt),
		)
	}

	/// Restarts a failed upstream while `should_retry(error, attempt)` holds,
	/// waiting `delay_for(attempt)` of ambient time between attempts.
	/// `attempt` counts completed failed attempts, starting at 1.
	pub fn retry_when<P, D>(&self, should_retry: P, delay_for: D) -> Flow<T>
	where
		P: Fn(&anyhow::Error, u32) -> bool + Send + Sync + 'static,
		D: Fn(u32) -> Duration + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let should_retry = Arc::new(should_retry);
		let delay_for = Arc::new(delay_for);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let should_retry = should_retry.clone();
			let delay_for = delay_for.clone();
			async move {
				let mut attempt: u32 = 0;
				loop {
					match upstream.collect(|value| emitter.emit(value)).await {
						Ok(()) => return Ok(()),
						Err(error) if cancellation_reason_of(&error).is_some() =>
							return Err(error),
						Err(error) => {
							attempt += 1;
							if !should_retry(&error, attempt) {
								return Err(error)
							}
							let pause = delay_for(attempt);
							tracing::debug!(
								"Flow attempt {attempt} failed: {error:#}. Retrying in {}ms",
								pause.as_millis()
							);
							delay(pause).await;
						},
					}
				}
			}
		})
	}

	/// Runs a side-effect before the first element of every collection.
	pub fn on_start<F>(&self, action: F) -> Flow<T>
	where
		F: Fn() + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let action = Arc::new(action);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let action = action.clone();
			async move {
				action();
				upstream.collect(|value| emitter.emit(value)).await
			}
		})
	}

	/// Observes every element on its way through.
	pub fn on_each<F>(&self, action: F) -> Flow<T>
	where
		F: Fn(&T) + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let action = Arc::new(action);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let action = action.clone();
			async move {
				upstream
					.collect(|value| {
						action(&value);
						emitter.emit(value)
					})
					.await
			}
		})
	}

	/// Runs a side-effect when the collection terminates, receiving the
	/// terminating error if there was one. An abandoned collection (the
	/// consumer stopped early) reports no error.
	pub fn on_completion<F>(&self, action: F) -> Flow<T>
	where
		F: Fn(Option<&anyhow::Error>) + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let action = Arc::new(action);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let action = action.clone();
			async move {
				let guard = scopeguard::guard(action, |action| action(None));
				let result = upstream.collect(|value| emitter.emit(value)).await;
				let action = scopeguard::ScopeGuard::into_inner(guard);
				action(result.as_ref().err());
				result
			}
		})
	}

	/// Runs a side-effect when the upstream completes without emitting.
	pub fn on_empty<F>(&self, action: F) -> Flow<T>
	where
		F: Fn() + Send + Sync + 'static,
	{
		let upstream = self.clone();
		let action = Arc::new(action);
		flow(move |emitter| {
			let upstream = upstream.clone();
			let action = action.clone();
			async move {
				let mut emitted = false;
				upstream
					.collect(|value| {
						emitted = true;
						emitter.emit(value)
					})
					.await?;
				if !emitted {
					action();
				}
				Ok(())
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use crate::flow::{empty_flow, flow_of, Emitter};

	use super::*;

	fn failing_after<T: Clone + Send + Sync + 'static>(
		values: Vec<T>,
		failures: Arc<AtomicUsize>,
	) -> Flow<T> {
		let values = Arc::new(values);
		flow(move |emitter: Emitter<T>| {
			let values = values.clone();
			let failures = failures.clone();
			async move {
				for value in values.iter() {
					emitter.emit(value.clone()).await?;
				}
				failures.fetch_add(1, Ordering::Relaxed);
				Err(anyhow::anyhow!("flaky upstream"))
			}
		})
	}

	#[tokio::test]
	async fn catch_switches_to_the_fallback_flow() {
		let source = failing_after(vec![1, 2], Arc::new(AtomicUsize::new(0)))
			.catch(|error| {
				assert!(error.to_string().contains("flaky upstream"));
				flow_of(vec![99])
			});
		assert_eq!(source.to_list().await.unwrap(), vec![1, 2, 99]);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_gives_up_after_the_attempt_budget() {
		let failures = Arc::new(AtomicUsize::new(0));
		let source = failing_after(vec![7], failures.clone()).retry(3);
		let error = source.to_list().await.unwrap_err();
		assert!(error.to_string().contains("flaky upstream"));
		assert_eq!(failures.load(Ordering::Relaxed), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_when_controls_both_predicate_and_backoff() {
		let failures = Arc::new(AtomicUsize::new(0));
		let delays = Arc::new(std::sync::Mutex::new(Vec::new()));
		let source = failing_after(vec![1], failures.clone()).retry_when(
			|_error, attempt| attempt < 2,
			{
				let delays = delays.clone();
				move |attempt| {
					let pause = Duration::from_millis(u64::from(attempt) * 10);
					delays.lock().unwrap().push(pause);
					pause
				}
			},
		);
		source.to_list().await.unwrap_err();
		assert_eq!(failures.load(Ordering::Relaxed), 2);
		assert_eq!(*delays.lock().unwrap(), vec![Duration::from_millis(10)]);
	}

	#[tokio::test]
	async fn lifecycle_operators_observe_the_collection() {
		let starts = Arc::new(AtomicUsize::new(0));
		let seen = Arc::new(AtomicUsize::new(0));
		let completions = Arc::new(AtomicUsize::new(0));

		let source = flow_of([1u32, 2, 3])
			.on_start({
				let starts = starts.clone();
				move || {
					starts.fetch_add(1, Ordering::Relaxed);
				}
			})
			.on_each({
				let seen = seen.clone();
				move |_value| {
					seen.fetch_add(1, Ordering::Relaxed);
				}
			})
			.on_completion({
				let completions = completions.clone();
				move |error| {
					assert!(error.is_none());
					completions.fetch_add(1, Ordering::Relaxed);
				}
			});

		assert_eq!(source.to_list().await.unwrap(), vec![1, 2, 3]);
		assert_eq!(source.to_list().await.unwrap(), vec![1, 2, 3]);
		assert_eq!(starts.load(Ordering::Relaxed), 2);
		assert_eq!(seen.load(Ordering::Relaxed), 6);
		assert_eq!(completions.load(Ordering::Relaxed), 2);
	}

	#[tokio::test]
	async fn on_completion_reports_the_terminating_error() {
		let observed = Arc::new(std::sync::Mutex::new(None));
		let source = failing_after(vec![1], Arc::new(AtomicUsize::new(0))).on_completion({
			let observed = observed.clone();
			move |error| {
				*observed.lock().unwrap() = error.map(|error| error.to_string());
			}
		});
		source.to_list().await.unwrap_err();
		assert!(observed.lock().unwrap().as_deref().unwrap().contains("flaky upstream"));
	}

	#[tokio::test]
	async fn on_empty_fires_only_for_empty_upstreams() {
		let fired = Arc::new(AtomicUsize::new(0));
		let action = {
			let fired = fired.clone();
			move || {
				fired.fetch_add(1, Ordering::Relaxed);
			}
		};
		empty_flow::<u32>().on_empty(action.clone()).to_list().await.unwrap();
		flow_of([1u32]).on_empty(action).to_list().await.unwrap();
		assert_eq!(fired.load(Ordering::Relaxed), 1);
	}
}
