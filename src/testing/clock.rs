//! The virtual time controller.
//!
//! Holds a `now` cursor starting at zero and a priority queue of registered
//! sleeps ordered by deadline, with insertion order breaking ties. Advancing
//! pops due entries one at a time, moving `now` to each deadline before
//! waking its sleeper, so the woken task observes the time it slept until.

use std::{
	cmp::Reverse,
	collections::BinaryHeap,
	future::Future,
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	task::{Context, Poll, Waker},
	time::Duration,
};

use futures::{future::BoxFuture, FutureExt};

use crate::time::TimeSource;

struct TimerState {
	fired: AtomicBool,
	waker: Mutex<Option<Waker>>,
}

struct QueuedTimer {
	when: Duration,
	seq: u64,
	timer: Arc<TimerState>,
}

impl PartialEq for QueuedTimer {
	fn eq(&self, other: &Self) -> bool {
		(self.when, self.seq) == (other.when, other.seq)
	}
}

impl Eq for QueuedTimer {}

impl PartialOrd for QueuedTimer {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for QueuedTimer {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.when, self.seq).cmp(&(other.when, other.seq))
	}
}

struct ClockState {
	now: Duration,
	next_seq: u64,
	queue: BinaryHeap<Reverse<QueuedTimer>>,
	fired_count: u64,
}

/// A deterministic [`TimeSource`]: time only moves when the test advances it.
#[derive(Clone)]
pub struct VirtualClock {
	state: Arc<Mutex<ClockState>>,
}

impl Default for VirtualClock {
	fn default() -> Self {
		Self::new()
	}
}

impl VirtualClock {
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(ClockState {
				now: Duration::ZERO,
				next_seq: 0,
				queue: BinaryHeap::new(),
				fired_count: 0,
			})),
		}
	}

	/// Total sleeps woken so far; the harness uses this as its progress
	/// signal.
	pub fn timers_fired(&self) -> u64 {
		self.state.lock().unwrap().fired_count
	}

	/// Fires the single earliest sleep due at or before `target`, moving
	/// `now` to its deadline. Reports whether anything was due.
	pub fn advance_one_due(&self, target: Duration) -> bool {
		let woken = {
			let mut state = self.state.lock().unwrap();
			match state.queue.peek() {
				Some(Reverse(next)) if next.when <= target => {
					let Reverse(entry) = state.queue.pop().expect("peeked entry is present");
					state.now = state.now.max(entry.when);
					state.fired_count += 1;
					entry.timer.fired.store(true, Ordering::Release);
					let waker = entry.timer.waker.lock().unwrap().take();
					waker
				},
				_ => return false,
			}
		};
		if let Some(waker) = woken {
			waker.wake();
		}
		true
	}

	/// Moves `now` forward without firing anything; no-op when `target` is in
	/// the past.
	pub fn set_now(&self, target: Duration) {
		let mut state = self.state.lock().unwrap();
		state.now = state.now.max(target);
	}

	/// Fires everything due up to `target` in (deadline, insertion) order,
	/// then pins `now` to `target`.
	pub fn advance_to(&self, target: Duration) {
		while self.advance_one_due(target) {}
		self.set_now(target);
	}

	pub fn advance_by(&self, duration: Duration) {
		self.advance_to(self.now() + duration);
	}

	pub fn now(&self) -> Duration {
		self.state.lock().unwrap().now
	}
}

impl TimeSource for VirtualClock {
	fn now(&self) -> Duration {
		VirtualClock::now(self)
	}

	fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
		let deadline = self.now() + duration;
		VirtualSleep { clock: self.clone(), deadline, timer: None }.boxed()
	}
}

struct VirtualSleep {
	clock: VirtualClock,
	deadline: Duration,
	timer: Option<Arc<TimerState>>,
}

impl Future for VirtualSleep {
	type Output = ();

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		let this = &mut *self;
		if let Some(timer) = &this.timer {
			if timer.fired.load(Ordering::Acquire) {
				return Poll::Ready(())
			}
			*timer.waker.lock().unwrap() = Some(cx.waker().clone());
			// The clock may have fired between the check and the waker store.
			if timer.fired.load(Ordering::Acquire) {
				return Poll::Ready(())
			}
			return Poll::Pending
		}
		let mut state = this.clock.state.lock().unwrap();
		// A deadline at or before `now` resolves within the current step.
		if this.deadline <= state.now {
			return Poll::Ready(())
		}
		let timer = Arc::new(TimerState {
			fired: AtomicBool::new(false),
			waker: Mutex::new(Some(cx.waker().clone())),
		});
		let seq = state.next_seq;
		state.next_seq += 1;
		state.queue.push(Reverse(QueuedTimer {
			when: this.deadline,
			seq,
			timer: timer.clone(),
		}));
		drop(state);
		this.timer = Some(timer);
		Poll::Pending
	}
}
