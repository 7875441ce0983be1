//! Dispatchers decide where a unit of work executes.
//!
//! A dispatcher only chooses the execution site; job lifecycle stays with the
//! scope layer. Two guarantees bind every variant: work eventually runs
//! unless its cancellation signal fired before execution began (in which case
//! the handle resolves cancelled without running it), and a panic inside the
//! work propagates through the handle rather than being swallowed.

use std::{
	any::Any,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::Mutex,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};

use crate::{error::TaskError, job::CancellationSignal};

pub type DispatchedWork = BoxFuture<'static, ()>;

/// Resolves when the dispatched work finished, was skipped due to
/// cancellation, or panicked.
pub struct DispatchHandle {
	receiver: oneshot::Receiver<Result<(), TaskError>>,
}

impl DispatchHandle {
	pub(crate) fn new() -> (oneshot::Sender<Result<(), TaskError>>, Self) {
		let (sender, receiver) = oneshot::channel();
		(sender, Self { receiver })
	}

	pub(crate) fn resolved(result: Result<(), TaskError>) -> Self {
		let (sender, handle) = Self::new();
		let _ = sender.send(result);
		handle
	}

	pub async fn join(self) -> Result<(), TaskError> {
		self.receiver.await.unwrap_or_else(|_recv_error| {
			Err(TaskError::Dispatch("worker dropped the task without reporting".into()))
		})
	}
}

pub trait Dispatch: Send + Sync {
	fn dispatch(&self, work: DispatchedWork, cancel: CancellationSignal) -> DispatchHandle;

	/// Appears in logs and thread names.
	fn label(&self) -> &'static str;
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

fn skip_if_cancelled(cancel: &CancellationSignal) -> Option<Result<(), TaskError>> {
	cancel.is_cancelled().then(|| Err(TaskError::Cancelled(cancel.reason())))
}

/// Default dispatcher: the ambient tokio worker pool. Balanced CPU work.
#[derive(Clone, Copy, Debug, Default)]
pub struct PooledDispatcher;

impl Dispatch for PooledDispatcher {
	fn dispatch(&self, work: DispatchedWork, cancel: CancellationSignal) -> DispatchHandle {
		let (sender, handle) = DispatchHandle::new();
		tokio::spawn(async move {
			if let Some(skipped) = skip_if_cancelled(&cancel) {
				let _ = sender.send(skipped);
				return
			}
			let result = AssertUnwindSafe(work)
				.catch_unwind()
				.await
				.map_err(|payload| TaskError::failed(anyhow::anyhow!(
					"dispatched work panicked: {}",
					panic_message(payload)
				)));
			let _ = sender.send(result);
		});
		handle
	}

	fn label(&self) -> &'static str {
		"pooled"
	}
}

/// Places work on tokio's blocking pool, which is sized for long-blocking
/// waits; the work is driven by a runtime handle captured at dispatch time.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoDispatcher;

impl Dispatch for IoDispatcher {
	fn dispatch(&self, work: DispatchedWork, cancel: CancellationSignal) -> DispatchHandle {
		let (sender, handle) = DispatchHandle::new();
		let runtime = tokio::runtime::Handle::current();
		tokio::task::spawn_blocking(move || {
			if let Some(skipped) = skip_if_cancelled(&cancel) {
				let _ = sender.send(skipped);
				return
			}
			let result = catch_unwind(AssertUnwindSafe(|| runtime.block_on(work))).map_err(
				|payload| {
					TaskError::failed(anyhow::anyhow!(
						"dispatched work panicked: {}",
						panic_message(payload)
					))
				},
			);
			let _ = sender.send(result);
		});
		handle
	}

	fn label(&self) -> &'static str {
		"io"
	}
}

struct SingleThreadItem {
	work: DispatchedWork,
	cancel: CancellationSignal,
	done: oneshot::Sender<Result<(), TaskError>>,
}

/// One dedicated OS thread draining a FIFO; items run strictly one after
/// another. Useful for sequential critical sections and "main"-like contexts.
pub struct SingleThreadDispatcher {
	label: &'static str,
	sender: Mutex<Option<mpsc::UnboundedSender<SingleThreadItem>>>,
	worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SingleThreadDispatcher {
	pub fn new(label: &'static str) -> Self {
		let (sender, mut receiver) = mpsc::unbounded_channel::<SingleThreadItem>();
		let worker = std::thread::Builder::new()
			.name(format!("taskflow-{label}"))
			.spawn(move || {
				let runtime = tokio::runtime::Builder::new_current_thread()
					.enable_all()
					.build()
					.expect("failed to build single-thread dispatcher runtime");
				runtime.block_on(async move {
					while let Some(item) = receiver.recv().await {
						if let Some(skipped) = skip_if_cancelled(&item.cancel) {
							let _ = item.done.send(skipped);
							continue
						}
						let result = AssertUnwindSafe(item.work)
							.catch_unwind()
							.await
							.map_err(|payload| {
								TaskError::failed(anyhow::anyhow!(
									"dispatched work panicked: {}",
									panic_message(payload)
								))
							});
						let _ = item.done.send(result);
					}
				});
			})
			.expect("failed to spawn single-thread dispatcher worker");
		Self { label, sender: Mutex::new(Some(sender)), worker: Mutex::new(Some(worker)) }
	}

	/// Closes the work channel and waits for the worker to drain what was
	/// already queued and exit. The worker is held by an explicit thread
	/// handle, so a worker that died is noticed here rather than vanishing.
	pub fn dispose(&self) {
		drop(self.sender.lock().unwrap().take());
		if let Some(worker) = self.worker.lock().unwrap().take() {
			if worker.join().is_err() {
				tracing::error!("Single-thread dispatcher '{}' worker panicked", self.label);
			}
		}
	}
}

impl Dispatch for SingleThreadDispatcher {
	fn dispatch(&self, work: DispatchedWork, cancel: CancellationSignal) -> DispatchHandle {
		let sender = self.sender.lock().unwrap();
		let Some(sender) = sender.as_ref() else {
			return DispatchHandle::resolved(Err(TaskError::Dispatch(
				format!("single-thread dispatcher '{}' is disposed", self.label).into(),
			)))
		};
		let (done, handle) = DispatchHandle::new();
		if sender.send(SingleThreadItem { work, cancel, done }).is_err() {
			return DispatchHandle::resolved(Err(TaskError::Dispatch(
				format!("single-thread dispatcher '{}' worker is gone", self.label).into(),
			)))
		}
		handle
	}

	fn label(&self) -> &'static str {
		self.label
	}
}

impl Drop for SingleThreadDispatcher {
	fn drop(&mut self) {
		self.dispose();
	}
}

/// Runs the work on the caller thread, to completion, at dispatch time.
/// Requires a multi-thread tokio runtime (uses `block_in_place`); outside any
/// runtime it falls back to a plain executor.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

impl Dispatch for InlineDispatcher {
	fn dispatch(&self, work: DispatchedWork, cancel: CancellationSignal) -> DispatchHandle {
		if let Some(skipped) = skip_if_cancelled(&cancel) {
			return DispatchHandle::resolved(skipped)
		}
		let result = catch_unwind(AssertUnwindSafe(|| {
			match tokio::runtime::Handle::try_current() {
				Ok(runtime)
					if runtime.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread =>
					tokio::task::block_in_place(|| runtime.block_on(work)),
				// On a current-thread runtime there is no worker to park, so
				// drive the future directly.
				_ => futures::executor::block_on(work),
			}
		}))
		.map_err(|payload| {
			TaskError::failed(anyhow::anyhow!(
				"dispatched work panicked: {}",
				panic_message(payload)
			))
		});
		DispatchHandle::resolved(result)
	}

	fn label(&self) -> &'static str {
		"inline"
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	};

	use super::*;

	#[tokio::test]
	async fn pooled_runs_work_and_reports_through_the_handle() {
		let ran = Arc::new(AtomicBool::new(false));
		let handle = PooledDispatcher.dispatch(
			{
				let ran = ran.clone();
				async move {
					ran.store(true, Ordering::Relaxed);
				}
				.boxed()
			},
			CancellationSignal::new(),
		);
		handle.join().await.unwrap();
		assert!(ran.load(Ordering::Relaxed));
	}

	#[tokio::test]
	async fn cancelled_before_start_never_runs() {
		let cancel = CancellationSignal::new();
		cancel.cancel(Some("too late"));
		let ran = Arc::new(AtomicBool::new(false));
		let handle = PooledDispatcher.dispatch(
			{
				let ran = ran.clone();
				async move {
					ran.store(true, Ordering::Relaxed);
				}
				.boxed()
			},
			cancel,
		);
		assert!(matches!(handle.join().await, Err(TaskError::Cancelled(_))));
		assert!(!ran.load(Ordering::Relaxed));
	}

	#[tokio::test]
	async fn panics_propagate_through_the_handle() {
		let handle = PooledDispatcher
			.dispatch(async { panic!("worker bug") }.boxed(), CancellationSignal::new());
		match handle.join().await {
			Err(TaskError::Failed(error)) => assert!(error.to_string().contains("worker bug")),
			other => panic!("expected a failure, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn io_dispatcher_tolerates_blocking_work() {
		let ran = Arc::new(AtomicBool::new(false));
		let handle = IoDispatcher.dispatch(
			{
				let ran = ran.clone();
				async move {
					// Blocking here must not stall the async workers.
					std::thread::sleep(std::time::Duration::from_millis(20));
					ran.store(true, Ordering::Relaxed);
				}
				.boxed()
			},
			CancellationSignal::new(),
		);
		handle.join().await.unwrap();
		assert!(ran.load(Ordering::Relaxed));
	}

	#[tokio::test]
	async fn single_thread_dispatcher_is_fifo_and_sequential() {
		let dispatcher = SingleThreadDispatcher::new("test");
		let log = Arc::new(Mutex::new(Vec::new()));
		let running = Arc::new(AtomicUsize::new(0));

		let handles = (0..4)
			.map(|index| {
				let log = log.clone();
				let running = running.clone();
				dispatcher.dispatch(
					async move {
						assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
						tokio::task::yield_now().await;
						log.lock().unwrap().push(index);
						running.fetch_sub(1, Ordering::SeqCst);
					}
					.boxed(),
					CancellationSignal::new(),
				)
			})
			.collect::<Vec<_>>();

		for handle in handles {
			handle.join().await.unwrap();
		}
		assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
	}

	#[tokio::test]
	async fn disposed_single_thread_dispatcher_rejects_work() {
		let dispatcher = SingleThreadDispatcher::new("disposed");
		dispatcher.dispose();
		let handle = dispatcher.dispatch(async {}.boxed(), CancellationSignal::new());
		assert!(matches!(handle.join().await, Err(TaskError::Dispatch(_))));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn inline_dispatcher_runs_before_dispatch_returns() {
		let ran = Arc::new(AtomicBool::new(false));
		let handle = InlineDispatcher.dispatch(
			{
				let ran = ran.clone();
				async move {
					ran.store(true, Ordering::Relaxed);
				}
				.boxed()
			},
			CancellationSignal::new(),
		);
		assert!(ran.load(Ordering::Relaxed));
		handle.join().await.unwrap();
	}
}
