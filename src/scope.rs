//! Scopes bind a root job to a dispatcher and launch work into the tree.
//!
//! Every launch wraps the user block in the same translation envelope: a
//! normal return marks the child `Completed`, a cancellation error marks it
//! `Cancelled` without surfacing anywhere, and any other failure (including a
//! panic) marks it `Faulted` and is routed to the ambient uncaught handler.
//! The dispatcher only picks the execution site; the job owns lifecycle.

use std::{
	panic::AssertUnwindSafe,
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use itertools::Itertools;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::{
	ambient::{self, Ambient, ScopeTag},
	dispatch::{panic_message, Dispatch, DispatchedWork},
	error::{cancellation_reason_of, TaskError},
	job::{CancellationSignal, Job, JobPolicy},
	time::{with_timeout, TimeSource},
};

/// Handed to every launched block: the block's own job and its cooperative
/// cancellation signal.
#[derive(Clone)]
pub struct TaskContext {
	pub job: Job,
	pub cancel: CancellationSignal,
}

impl TaskContext {
	pub fn ensure_active(&self) -> Result<(), TaskError> {
		self.job.ensure_active()
	}

	pub async fn cancelled(&self) {
		self.cancel.cancelled().await
	}
}

/// Internal scope lifecycle notifications, consumed by the test harness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeEvent {
	JobStarted { job_id: u64 },
	JobCompleted { job_id: u64 },
}

type EventHook = Box<dyn Fn(ScopeEvent) + Send + Sync>;

struct ScopeInner {
	job: Job,
	dispatcher: Arc<dyn Dispatch>,
	ambient: Arc<Ambient>,
	tag: ScopeTag,
	disposed: AtomicBool,
	active_jobs: AtomicUsize,
	event_hooks: Mutex<Vec<EventHook>>,
}

impl ScopeInner {
	fn fire_event(&self, event: ScopeEvent) {
		let hooks = self.event_hooks.lock().unwrap();
		for hook in hooks.iter() {
			hook(event);
		}
	}
}

/// A root job plus a dispatcher. Scopes are cloneable handles; disposal
/// cancels the root job and makes further launches a programmer error.
#[derive(Clone)]
pub struct Scope {
	inner: Arc<ScopeInner>,
}

// Cancels the job if the dispatched work is dropped without running to
// completion (e.g. a dispatcher rejected or abandoned it), so no job is left
// dangling in `Active`.
struct CompletionGuard {
	job: Job,
}

impl Drop for CompletionGuard {
	fn drop(&mut self) {
		if self.job.is_active() {
			self.job.cancel(Some("task was dropped before completion"));
		}
	}
}

impl Scope {
	pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
		Self::build(None, JobPolicy::Default, dispatcher, None)
	}

	pub fn named(name: &str, dispatcher: Arc<dyn Dispatch>) -> Self {
		Self::build(Some(name), JobPolicy::Default, dispatcher, None)
	}

	/// A scope whose root observes child failures without cancelling the
	/// siblings.
	pub fn supervisor(name: &str, dispatcher: Arc<dyn Dispatch>) -> Self {
		Self::build(Some(name), JobPolicy::Supervisor, dispatcher, None)
	}

	pub(crate) fn with_time_source(
		name: &str,
		dispatcher: Arc<dyn Dispatch>,
		time: Arc<dyn TimeSource>,
	) -> Self {
		Self::build(Some(name), JobPolicy::Default, dispatcher, Some(time))
	}

	fn build(
		name: Option<&str>,
		policy: JobPolicy,
		dispatcher: Arc<dyn Dispatch>,
		time: Option<Arc<dyn TimeSource>>,
	) -> Self {
		let tag = ScopeTag { name: name.map(Arc::from), id: ambient::next_scope_id() };
		let time = time.unwrap_or_else(|| ambient::current().time());
		let ambient = Arc::new(Ambient::new(time, Some(tag.clone())));
		Self {
			inner: Arc::new(ScopeInner {
				job: Job::new(policy),
				dispatcher,
				ambient,
				tag,
				disposed: AtomicBool::new(false),
				active_jobs: AtomicUsize::new(0),
				event_hooks: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn job(&self) -> &Job {
		&self.inner.job
	}

	pub fn dispatcher(&self) -> Arc<dyn Dispatch> {
		self.inner.dispatcher.clone()
	}

	pub fn tag(&self) -> &ScopeTag {
		&self.inner.tag
	}

	pub fn is_disposed(&self) -> bool {
		self.inner.disposed.load(Ordering::Acquire)
	}

	pub fn active_job_count(&self) -> usize {
		self.inner.active_jobs.load(Ordering::Acquire)
	}

	/// Registers a hook observing job start/completion; exists for the
	/// virtual-time harness.
	pub fn on_job_event(&self, hook: impl Fn(ScopeEvent) + Send + Sync + 'static) {
		self.inner.event_hooks.lock().unwrap().push(Box::new(hook));
	}

	/// Launches a fire-and-forget child job on the scope's dispatcher.
	pub fn spawn<B>(&self, block: B) -> Job
	where
		B: FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
	{
		let deferred = self.launch_on(self.inner.dispatcher.clone(), block, false);
		deferred.job().clone()
	}

	/// Launches a result-bearing child job and returns its handle.
	pub fn spawn_with_handle<T, B>(&self, block: B) -> Deferred<T>
	where
		T: Send + 'static,
		B: FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<T>> + Send + 'static,
	{
		self.launch_on(self.inner.dispatcher.clone(), block, false)
	}

	/// As [`spawn_with_handle`](Self::spawn_with_handle), but nothing is
	/// dispatched (and the job is not counted active) until
	/// [`Deferred::start`] or the first await.
	pub fn spawn_lazy<T, B>(&self, block: B) -> Deferred<T>
	where
		T: Send + 'static,
		B: FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<T>> + Send + 'static,
	{
		self.launch_on(self.inner.dispatcher.clone(), block, true)
	}

	/// Runs `block` as a transient child job on the named dispatcher and
	/// suspends the caller until it finishes. The body executes under that
	/// dispatcher and nowhere else.
	pub async fn with_dispatcher<T, B>(
		&self,
		dispatcher: Arc<dyn Dispatch>,
		block: B,
	) -> Result<T, TaskError>
	where
		T: Send + 'static,
		B: FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<T>> + Send + 'static,
	{
		let mut deferred = self.launch_on(dispatcher, block, false);
		deferred.await_result().await
	}

	/// Cancels the scope's root job and, through it, every child.
	pub fn cancel(&self, reason: Option<&str>) {
		self.inner.job.cancel(reason);
	}

	/// Waits for every current child to reach a terminal state. With a
	/// timeout, reports whether all of them made it in time.
	pub async fn join_all(&self, timeout: Option<Duration>) -> bool {
		let waits = self
			.inner
			.job
			.children()
			.into_iter()
			.map(|child| async move {
				let _ = child.join().await;
			})
			.collect_vec();
		let all = futures::future::join_all(waits);
		match timeout {
			None => {
				all.await;
				true
			},
			Some(timeout) => with_timeout(timeout, all).await.is_ok(),
		}
	}

	/// Cancels the root job and marks the scope unusable; further launches
	/// panic.
	pub fn dispose(&self) {
		if self.inner.disposed.swap(true, Ordering::AcqRel) {
			return
		}
		tracing::debug!("Scope {} disposed", self.inner.tag);
		self.inner.job.cancel(Some("scope disposed"));
	}

	fn launch_on<T, B>(&self, dispatcher: Arc<dyn Dispatch>, block: B, lazy: bool) -> Deferred<T>
	where
		T: Send + 'static,
		B: FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<T>> + Send + 'static,
	{
		assert!(!self.is_disposed(), "scope {} used after dispose", self.inner.tag);

		let child = self.inner.job.child(JobPolicy::Default);
		let cancel = child.cancellation_signal();
		let job_id = child.id();
		let (result_tx, result_rx) = oneshot::channel::<Result<T, TaskError>>();

		let fut = block(TaskContext { job: child.clone(), cancel: cancel.clone() });

		let envelope = {
			let job = child.clone();
			let tag = self.inner.tag.clone();
			async move {
				match AssertUnwindSafe(fut).catch_unwind().await {
					Ok(Ok(value)) => {
						job.mark_completed();
						let _ = result_tx.send(Ok(value));
					},
					Ok(Err(error)) => match cancellation_reason_of(&error) {
						Some(reason) => {
							job.cancel(reason.as_deref());
							let _ = result_tx.send(Err(TaskError::Cancelled(reason)));
						},
						None => {
							let error = Arc::new(error);
							job.mark_faulted(error.clone());
							ambient::report_uncaught(Some(&tag), &error);
							let _ = result_tx.send(Err(TaskError::Failed(error)));
						},
					},
					Err(payload) => {
						let error = Arc::new(anyhow::anyhow!(
							"job panicked: {}",
							panic_message(payload)
						));
						job.mark_faulted(error.clone());
						ambient::report_uncaught(Some(&tag), &error);
						let _ = result_tx.send(Err(TaskError::Failed(error)));
					},
				}
			}
		};

		let span = tracing::info_span!("job", scope = %self.inner.tag, id = job_id);
		let wrapped = ambient::scoped(self.inner.ambient.clone(), envelope.instrument(span));
		let guard = CompletionGuard { job: child.clone() };
		let work: DispatchedWork = Box::pin(async move {
			let _guard = guard;
			wrapped.await
		});

		let dispatch_once = {
			let scope = self.inner.clone();
			let job = child.clone();
			move || {
				scope.active_jobs.fetch_add(1, Ordering::AcqRel);
				scope.fire_event(ScopeEvent::JobStarted { job_id });
				job.invoke_on_completion({
					let scope = scope.clone();
					move |_| {
						scope.active_jobs.fetch_sub(1, Ordering::AcqRel);
						scope.fire_event(ScopeEvent::JobCompleted { job_id });
					}
				});
				let _handle = dispatcher.dispatch(work, cancel);
			}
		};

		let deferred = Deferred {
			job: child,
			result: Some(result_rx),
			start: Mutex::new(Some(Box::new(dispatch_once))),
		};
		if !lazy {
			deferred.start();
		}
		deferred
	}
}

/// A future-like handle for a result-bearing launched job.
pub struct Deferred<T> {
	job: Job,
	// `None` once the result has been taken; re-polling a consumed oneshot
	// receiver is a panic, not an error.
	result: Option<oneshot::Receiver<Result<T, TaskError>>>,
	start: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T> Deferred<T> {
	pub fn job(&self) -> &Job {
		&self.job
	}

	/// Triggers the first dispatch of a lazy deferred; repeat calls are
	/// no-ops. Reports whether this call started it.
	pub fn start(&self) -> bool {
		match self.start.lock().unwrap().take() {
			Some(dispatch) => {
				dispatch();
				true
			},
			None => false,
		}
	}

	/// Suspends until the result is available; failure and cancellation
	/// re-raise. The value can be taken once: a later await reports the job's
	/// terminal outcome instead.
	pub async fn await_result(&mut self) -> Result<T, TaskError> {
		self.start();
		if self.result.is_none() {
			return Err(self.terminal_error())
		}
		let outcome = self.result.as_mut().expect("checked above").await;
		self.result = None;
		match outcome {
			Ok(result) => result,
			Err(_sender_gone) => Err(self.terminal_error()),
		}
	}

	/// As [`await_result`](Self::await_result) with a deadline in ambient
	/// time.
	pub async fn await_timeout(&mut self, timeout: Duration) -> Result<T, TaskError> {
		match with_timeout(timeout, self.await_result()).await {
			Ok(result) => result,
			Err(timed_out) => Err(timed_out),
		}
	}

	/// Non-blocking; only yields the value if it is already available.
	pub fn try_get_result(&mut self) -> Option<Result<T, TaskError>> {
		let Some(mut receiver) = self.result.take() else {
			return Some(Err(self.terminal_error()))
		};
		match receiver.try_recv() {
			Ok(result) => Some(result),
			Err(oneshot::error::TryRecvError::Empty) => {
				self.result = Some(receiver);
				None
			},
			Err(oneshot::error::TryRecvError::Closed) => Some(Err(self.terminal_error())),
		}
	}

	/// Peeks at the failure without consuming anything.
	pub fn get_exception(&self) -> Option<Arc<anyhow::Error>> {
		self.job.failure()
	}

	pub fn cancel(&self, reason: Option<&str>) {
		self.job.cancel(reason);
	}

	fn terminal_error(&self) -> TaskError {
		match self.job.outcome().map(crate::job::JobOutcome::into_result) {
			Some(Err(error)) => error,
			_ => TaskError::Dispatch("deferred result already consumed".into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;

	use crate::{dispatch::{PooledDispatcher, SingleThreadDispatcher}, job::JobState};

	use super::*;

	fn pooled_scope(name: &str) -> Scope {
		Scope::named(name, Arc::new(PooledDispatcher))
	}

	#[tokio::test]
	async fn spawned_block_completes_its_job() {
		let scope = pooled_scope("spawn");
		let job = scope.spawn(|_ctx| async { Ok(()) }.boxed());
		job.join().await.unwrap();
		assert_eq!(job.state(), JobState::Completed);
	}

	#[tokio::test]
	async fn handles_carry_results() {
		let scope = pooled_scope("handles");
		let mut deferred =
			scope.spawn_with_handle(|_ctx| async { Ok::<_, anyhow::Error>(21 * 2) }.boxed());
		assert_eq!(deferred.await_result().await.unwrap(), 42);
	}

	#[tokio::test]
	async fn failure_faults_the_job_and_cancels_the_scope() {
		let scope = pooled_scope("failure");

		let stuck = scope.spawn(|ctx| {
			async move {
				ctx.cancel.cancelled().await;
				Err(TaskError::Cancelled(ctx.cancel.reason()).into())
			}
			.boxed()
		});

		let mut failing = scope
			.spawn_with_handle::<u32, _>(|_ctx| async { Err(anyhow::anyhow!("it broke")) }.boxed());

		match failing.await_result().await {
			Err(TaskError::Failed(error)) => assert!(error.to_string().contains("it broke")),
			other => panic!("expected failure, got {other:?}"),
		}
		assert!(failing.get_exception().is_some());

		// Default policy: the failure takes the scope root and the sibling.
		let _ = stuck.join().await;
		assert!(scope.job().is_faulted());
		assert_eq!(stuck.state(), JobState::Cancelled);
	}

	#[tokio::test]
	async fn cancellation_errors_are_not_failures() {
		let scope = pooled_scope("cancellation");
		let job = scope.spawn(|_ctx| {
			async { Err(anyhow::Error::new(TaskError::cancelled_because("done early"))) }.boxed()
		});
		assert!(matches!(job.join().await, Err(TaskError::Cancelled(_))));
		assert_eq!(job.state(), JobState::Cancelled);
		assert!(job.failure().is_none());
		// Cancellation does not take the scope down as a fault.
		assert!(!scope.job().is_faulted());
	}

	#[tokio::test]
	async fn supervisor_scope_contains_failures() {
		let scope = Scope::supervisor("supervisor", Arc::new(PooledDispatcher));

		let healthy = scope.spawn(|ctx| {
			async move {
				ctx.cancel.cancelled().await;
				Err(TaskError::Cancelled(ctx.cancel.reason()).into())
			}
			.boxed()
		});
		let failing = scope.spawn(|_ctx| async { Err(anyhow::anyhow!("isolated")) }.boxed());

		let _ = failing.join().await;
		assert!(failing.is_faulted());
		assert!(scope.job().is_active());
		assert!(healthy.is_active());

		scope.cancel(Some("test over"));
		let _ = healthy.join().await;
	}

	#[tokio::test]
	async fn scope_cancellation_is_observed_cooperatively() {
		let scope = pooled_scope("cancel");
		let observed = Arc::new(AtomicBool::new(false));
		let job = scope.spawn({
			let observed = observed.clone();
			|ctx| {
				async move {
					ctx.cancel.cancelled().await;
					observed.store(true, Ordering::Relaxed);
					Err(TaskError::Cancelled(ctx.cancel.reason()).into())
				}
				.boxed()
			}
		});

		scope.cancel(Some("shutting down"));
		let _ = job.join().await;
		assert!(observed.load(Ordering::Relaxed));
		assert_eq!(job.state(), JobState::Cancelled);
	}

	#[tokio::test]
	async fn lazy_deferred_dispatches_on_start() {
		let scope = pooled_scope("lazy");
		let ran = Arc::new(AtomicBool::new(false));
		let mut deferred = scope.spawn_lazy({
			let ran = ran.clone();
			|_ctx| {
				async move {
					ran.store(true, Ordering::Relaxed);
					Ok::<_, anyhow::Error>(1)
				}
				.boxed()
			}
		});

		tokio::task::yield_now().await;
		assert!(!ran.load(Ordering::Relaxed));
		assert_eq!(scope.active_job_count(), 0);

		assert!(deferred.start());
		assert!(!deferred.start());
		assert_eq!(deferred.await_result().await.unwrap(), 1);
		assert!(ran.load(Ordering::Relaxed));
	}

	#[tokio::test]
	async fn with_dispatcher_runs_the_body_elsewhere_and_joins_it() {
		let scope = pooled_scope("with-dispatcher");
		let single = Arc::new(SingleThreadDispatcher::new("ctx"));
		let value = scope
			.with_dispatcher(single.clone(), |_ctx| {
				async move { Ok::<_, anyhow::Error>(std::thread::current().name().map(str::to_string)) }
					.boxed()
			})
			.await
			.unwrap();
		assert_eq!(value.as_deref(), Some("taskflow-ctx"));
		// The transient child is already terminal.
		assert!(scope.job().children().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn join_all_reports_timeouts() {
		let scope = pooled_scope("join-all");
		scope.spawn(|_ctx| {
			async {
				crate::time::delay(Duration::from_secs(3600)).await;
				Ok(())
			}
			.boxed()
		});
		assert!(!scope.join_all(Some(Duration::from_millis(50))).await);
		scope.cancel(None);
		assert!(scope.join_all(None).await);
	}

	#[tokio::test]
	async fn job_events_track_the_active_counter() {
		let scope = pooled_scope("events");
		let events = Arc::new(Mutex::new(Vec::new()));
		scope.on_job_event({
			let events = events.clone();
			move |event| events.lock().unwrap().push(event)
		});

		let job = scope.spawn(|_ctx| async { Ok(()) }.boxed());
		job.join().await.unwrap();
		while scope.active_job_count() > 0 {
			tokio::task::yield_now().await;
		}

		let events = events.lock().unwrap();
		assert_eq!(events.len(), 2);
		assert!(matches!(events[0], ScopeEvent::JobStarted { .. }));
		assert!(matches!(events[1], ScopeEvent::JobCompleted { .. }));
	}

	#[tokio::test]
	#[should_panic(expected = "used after dispose")]
	async fn using_a_disposed_scope_is_a_programmer_error() {
		let scope = pooled_scope("disposed");
		scope.dispose();
		let _ = scope.spawn(|_ctx| async { Ok(()) }.boxed());
	}
}
