//! A scope wired to the virtual clock and the deterministic dispatcher.

use std::{sync::Arc, time::Duration};

use crate::{scope::Scope, settings};

use super::{clock::VirtualClock, dispatcher::TestDispatcher};

/// Drives jobs in virtual time: launched work runs deterministically on the
/// test thread, `delay` suspends on the virtual clock, and the test decides
/// when time moves.
pub struct TestScope {
	scope: Scope,
	clock: VirtualClock,
	dispatcher: TestDispatcher,
	strict: bool,
	settings: Arc<settings::RuntimeSettings>,
}

impl Default for TestScope {
	fn default() -> Self {
		Self::new()
	}
}

impl TestScope {
	pub fn new() -> Self {
		Self::build(false)
	}

	/// As [`new`](Self::new), but the stuck detector fails the test instead
	/// of force-advancing past it.
	pub fn strict() -> Self {
		Self::build(true)
	}

	fn build(strict: bool) -> Self {
		let clock = VirtualClock::new();
		let dispatcher = TestDispatcher::new();
		let scope = Scope::with_time_source(
			"test",
			Arc::new(dispatcher.clone()),
			Arc::new(clock.clone()),
		);
		Self { scope, clock, dispatcher, strict, settings: settings::global() }
	}

	pub fn scope(&self) -> &Scope {
		&self.scope
	}

	pub fn clock(&self) -> &VirtualClock {
		&self.clock
	}

	pub fn dispatcher(&self) -> &TestDispatcher {
		&self.dispatcher
	}

	/// Advances the virtual clock by `duration`, running every task each
	/// intermediate wake-up unblocks before moving further.
	pub fn advance_time_by(&self, duration: Duration) {
		let target = self.clock.now() + duration;
		self.dispatcher.pump();
		while self.clock.advance_one_due(target) {
			self.dispatcher.pump();
		}
		self.clock.set_now(target);
		self.dispatcher.pump();
	}

	/// No active jobs and nothing queued for execution.
	pub fn is_idle(&self) -> bool {
		self.scope.active_job_count() == 0 && self.dispatcher.is_empty()
	}

	/// Advances virtual time in small steps until the scope goes idle or
	/// `timeout` of real wall-clock time has elapsed; reports whether idle
	/// was reached. When nothing makes progress for many iterations the
	/// detector force-advances the clock with a diagnostic (or fails the
	/// test in strict mode) to get past unreachable futures.
	pub fn run_until_idle(&self, timeout: Duration) -> bool {
		let started = std::time::Instant::now();
		let step = Duration::from_millis(self.settings.harness.idle_poll_step_millis);
		let force_advance = Duration::from_millis(self.settings.harness.stuck_force_advance_millis);
		let mut stale_iterations: u32 = 0;
		let mut last_progress = self.progress_fingerprint();
		while !self.is_idle() {
			if started.elapsed() > timeout {
				return false
			}
			self.advance_time_by(step);
			let progress = self.progress_fingerprint();
			if progress != last_progress {
				last_progress = progress;
				stale_iterations = 0;
				continue
			}
			stale_iterations += 1;
			if stale_iterations >= self.settings.harness.stuck_iterations {
				if self.strict {
					panic!(
						"virtual scheduler made no progress for {stale_iterations} iterations \
						 with {} jobs still active",
						self.scope.active_job_count()
					);
				}
				tracing::warn!(
					"Virtual scheduler made no progress for {stale_iterations} iterations; \
					 force-advancing by {}ms. This can mask a job waiting on an unreachable \
					 future.",
					force_advance.as_millis()
				);
				self.advance_time_by(force_advance);
				stale_iterations = 0;
			}
		}
		true
	}

	fn progress_fingerprint(&self) -> (usize, u64) {
		(self.scope.active_job_count(), self.clock.timers_fired())
	}

	/// Cancels the scope and discards queued work.
	pub fn dispose(&self) {
		if !self.scope.is_disposed() {
			self.scope.dispose();
		}
		self.dispatcher.clear();
	}
}

impl Drop for TestScope {
	fn drop(&mut self) {
		self.dispose();
	}
}
