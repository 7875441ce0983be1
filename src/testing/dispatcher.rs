//! The deterministic test dispatcher.
//!
//! Work is queued into a FIFO and drained on the test thread: dispatching
//! from outside a drain runs the new work immediately and keeps draining
//! until the queue is empty; dispatching from inside one only enqueues. A
//! task that suspends parks until something wakes it, at which point it is
//! re-enqueued and picked up by the next drain. The result: the first task
//! runs to its first suspension point, later tasks run in insertion order.

use std::{
	collections::VecDeque,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, Weak,
	},
	task::{Context, Poll},
};

use futures::task::{waker_ref, ArcWake};

use crate::{
	dispatch::{panic_message, Dispatch, DispatchHandle, DispatchedWork},
	error::TaskError,
	job::CancellationSignal,
};

struct QueueInner {
	queue: Mutex<VecDeque<Arc<QueuedTask>>>,
	pumping: AtomicBool,
}

struct QueuedTask {
	future: Mutex<Option<DispatchedWork>>,
	queued: AtomicBool,
	started: AtomicBool,
	cancel: CancellationSignal,
	done: Mutex<Option<tokio::sync::oneshot::Sender<Result<(), TaskError>>>>,
	owner: Weak<QueueInner>,
}

impl QueuedTask {
	fn resolve(&self, result: Result<(), TaskError>) {
		if let Some(done) = self.done.lock().unwrap().take() {
			let _ = done.send(result);
		}
	}
}

impl ArcWake for QueuedTask {
	fn wake_by_ref(task: &Arc<Self>) {
		if task.queued.swap(true, Ordering::AcqRel) {
			return
		}
		if let Some(owner) = task.owner.upgrade() {
			owner.queue.lock().unwrap().push_back(task.clone());
		}
	}
}

#[derive(Clone)]
pub struct TestDispatcher {
	inner: Arc<QueueInner>,
}

impl Default for TestDispatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl TestDispatcher {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(QueueInner {
				queue: Mutex::new(VecDeque::new()),
				pumping: AtomicBool::new(false),
			}),
		}
	}

	/// True when no task is queued for execution. Suspended tasks waiting on
	/// timers or channels do not count; they surface through the scope's
	/// active-job counter instead.
	pub fn is_empty(&self) -> bool {
		self.inner.queue.lock().unwrap().is_empty()
	}

	pub fn pending_tasks(&self) -> usize {
		self.inner.queue.lock().unwrap().len()
	}

	/// Discards everything still queued; part of harness disposal.
	pub fn clear(&self) {
		self.inner.queue.lock().unwrap().clear();
	}

	/// Drains the FIFO until it is empty. Reentrant calls (from inside a
	/// running task) are no-ops; the active drain picks the new work up.
	pub fn pump(&self) {
		if self.inner.pumping.swap(true, Ordering::AcqRel) {
			return
		}
		let _reset = scopeguard::guard(self.inner.clone(), |inner| {
			inner.pumping.store(false, Ordering::Release);
		});
		loop {
			let task = self.inner.queue.lock().unwrap().pop_front();
			let Some(task) = task else { break };
			task.queued.store(false, Ordering::Release);
			let Some(mut future) = task.future.lock().unwrap().take() else { continue };

			if !task.started.load(Ordering::Acquire) && task.cancel.is_cancelled() {
				task.resolve(Err(TaskError::Cancelled(task.cancel.reason())));
				continue
			}
			task.started.store(true, Ordering::Release);

			let waker = waker_ref(&task);
			let mut context = Context::from_waker(&waker);
			match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut context))) {
				Ok(Poll::Ready(())) => task.resolve(Ok(())),
				Ok(Poll::Pending) => {
					*task.future.lock().unwrap() = Some(future);
				},
				Err(payload) => task.resolve(Err(TaskError::failed(anyhow::anyhow!(
					"dispatched work panicked: {}",
					panic_message(payload)
				)))),
			}
		}
	}
}

impl Dispatch for TestDispatcher {
	fn dispatch(&self, work: DispatchedWork, cancel: CancellationSignal) -> DispatchHandle {
		let (done, handle) = DispatchHandle::new();
		let task = Arc::new(QueuedTask {
			future: Mutex::new(Some(work)),
			queued: AtomicBool::new(true),
			started: AtomicBool::new(false),
			cancel,
			done: Mutex::new(Some(done)),
			owner: Arc::downgrade(&self.inner),
		});
		self.inner.queue.lock().unwrap().push_back(task);
		self.pump();
		handle
	}

	fn label(&self) -> &'static str {
		"test"
	}
}

#[cfg(test)]
mod tests {
	use futures::FutureExt;

	use super::*;

	#[test]
	fn work_runs_synchronously_at_dispatch() {
		let dispatcher = TestDispatcher::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		for index in 0..3 {
			let log = log.clone();
			dispatcher.dispatch(
				async move {
					log.lock().unwrap().push(index);
				}
				.boxed(),
				CancellationSignal::new(),
			);
		}
		assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
		assert!(dispatcher.is_empty());
	}

	#[test]
	fn dispatch_from_inside_a_drain_only_enqueues() {
		let dispatcher = TestDispatcher::new();
		let log = Arc::new(Mutex::new(Vec::new()));
		{
			let dispatcher_inner = dispatcher.clone();
			let log = log.clone();
			dispatcher.dispatch(
				async move {
					log.lock().unwrap().push("outer-before");
					let inner_log = log.clone();
					dispatcher_inner.dispatch(
						async move {
							inner_log.lock().unwrap().push("inner");
						}
						.boxed(),
						CancellationSignal::new(),
					);
					// The inner task must not have run inline.
					log.lock().unwrap().push("outer-after");
				}
				.boxed(),
				CancellationSignal::new(),
			);
		}
		assert_eq!(*log.lock().unwrap(), vec!["outer-before", "outer-after", "inner"]);
	}

	#[test]
	fn woken_tasks_resume_on_the_next_pump() {
		let dispatcher = TestDispatcher::new();
		let gate = Arc::new(tokio::sync::Notify::new());
		let finished = Arc::new(AtomicBool::new(false));
		dispatcher.dispatch(
			{
				let gate = gate.clone();
				let finished = finished.clone();
				async move {
					gate.notified().await;
					finished.store(true, Ordering::Relaxed);
				}
				.boxed()
			},
			CancellationSignal::new(),
		);
		assert!(!finished.load(Ordering::Relaxed));
		assert!(dispatcher.is_empty());

		gate.notify_waiters();
		assert!(!dispatcher.is_empty());
		dispatcher.pump();
		assert!(finished.load(Ordering::Relaxed));
	}

	#[test]
	fn cancelled_before_first_run_never_executes() {
		let dispatcher = TestDispatcher::new();
		// Occupy the pump so the next dispatch stays queued.
		let ran = Arc::new(AtomicBool::new(false));
		let cancel = CancellationSignal::new();
		{
			let dispatcher_inner = dispatcher.clone();
			let ran = ran.clone();
			let cancel_inner = cancel.clone();
			dispatcher.dispatch(
				async move {
					dispatcher_inner.dispatch(
						{
							let ran = ran.clone();
							async move {
								ran.store(true, Ordering::Relaxed);
							}
							.boxed()
						},
						cancel_inner.clone(),
					);
					cancel_inner.cancel(Some("before it started"));
				}
				.boxed(),
				CancellationSignal::new(),
			);
		}
		assert!(!ran.load(Ordering::Relaxed));
	}
}
