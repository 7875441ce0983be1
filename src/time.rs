//! The ambient time source.
//!
//! All waiting in this crate funnels through the [`TimeSource`] of the
//! ambient context, so the virtual-time harness can stand in for the real
//! clock without the waiting code changing. The default source is a
//! monotonic real clock over `tokio::time`.

use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use futures::{future::BoxFuture, FutureExt};
use lazy_static::lazy_static;

use crate::{ambient, error::TaskError, job::CancellationSignal};

pub trait TimeSource: Send + Sync {
	/// Monotonic time since the source's epoch.
	fn now(&self) -> Duration;

	fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

lazy_static! {
	static ref REAL_EPOCH: Instant = Instant::now();
}

/// Monotonic wall clock; sleeps are real.
pub struct RealTimeSource;

impl TimeSource for RealTimeSource {
	fn now(&self) -> Duration {
		REAL_EPOCH.elapsed()
	}

	fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
		tokio::time::sleep(duration).boxed()
	}
}

/// Monotonic time as measured by the ambient source.
pub fn now() -> Duration {
	ambient::current().time().now()
}

/// Suspends for `duration` of ambient time. A zero duration resolves within
/// the current virtual step, or with at most one reschedule on the real
/// clock.
pub async fn delay(duration: Duration) {
	let source = ambient::current().time();
	source.sleep(duration).await
}

/// As [`delay`], but resumes early with a cancellation error when `cancel`
/// fires.
pub async fn delay_cancellable(
	duration: Duration,
	cancel: &CancellationSignal,
) -> Result<(), TaskError> {
	tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(TaskError::Cancelled(cancel.reason())),
		_ = delay(duration) => Ok(()),
	}
}

/// Races `fut` against an ambient-time delay. When the delay wins the future
/// is dropped, which cancels it, and `TaskError::Timeout` is raised.
pub async fn with_timeout<F: std::future::Future>(
	duration: Duration,
	fut: F,
) -> Result<F::Output, TaskError> {
	tokio::select! {
		biased;
		output = fut => Ok(output),
		_ = delay(duration) => Err(TaskError::Timeout(duration)),
	}
}

/// A fixed-period ticker over the ambient time source. Ticks are scheduled
/// from the previous deadline, not from when the caller got around to
/// awaiting, so the period does not drift with consumer latency.
pub struct Ticker {
	time: Arc<dyn TimeSource>,
	period: Duration,
	next_deadline: Duration,
}

/// Creates a [`Ticker`]; with `yield_immediately` the first tick resolves
/// without waiting.
pub fn make_periodic_tick(period: Duration, yield_immediately: bool) -> Ticker {
	let time = ambient::current().time();
	let now = time.now();
	let next_deadline = if yield_immediately { now } else { now + period };
	Ticker { time, period, next_deadline }
}

impl Ticker {
	pub async fn tick(&mut self) {
		let now = self.time.now();
		if let Some(remaining) = self.next_deadline.checked_sub(now) {
			if !remaining.is_zero() {
				self.time.sleep(remaining).await;
			}
		}
		self.next_deadline += self.period;
	}
}
