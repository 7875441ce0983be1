//! The job tree: nodes of the cancellation hierarchy.
//!
//! A job is created `Active` and makes exactly one transition to a terminal
//! state (`Completed`, `Cancelled` or `Faulted`), realized as a single atomic
//! compare-and-swap on a state word. Only the winner of that CAS performs the
//! side effects: firing the cancellation signal, cancelling children,
//! notifying the parent and completing the completion signal.
//!
//! Cancellation flows down the tree, completion flows up. The default parent
//! policy treats one child's cancellation or failure as the whole scope's:
//! the parent cancels itself (and so the siblings). A supervisor job observes
//! child failures without propagating them.

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicU32, AtomicU64, Ordering},
		Arc, Mutex, Weak,
	},
	time::Duration,
};

use crate::{ambient, error::TaskError, time::with_timeout};

/// A cooperative cancellation token. Subordinate code polls
/// [`is_cancelled`](Self::is_cancelled) or awaits
/// [`cancelled`](Self::cancelled); nothing is preempted.
#[derive(Clone)]
pub struct CancellationSignal {
	inner: Arc<CancellationInner>,
}

struct CancellationInner {
	fired: tokio::sync::watch::Sender<bool>,
	reason: Mutex<Option<Arc<str>>>,
}

impl CancellationSignal {
	pub fn new() -> Self {
		let (fired, _) = tokio::sync::watch::channel(false);
		Self { inner: Arc::new(CancellationInner { fired, reason: Mutex::new(None) }) }
	}

	/// Idempotent; the first reason wins.
	pub fn cancel(&self, reason: Option<&str>) {
		{
			let mut stored = self.inner.reason.lock().unwrap();
			if *self.inner.fired.borrow() {
				return
			}
			if stored.is_none() {
				*stored = reason.map(Arc::from);
			}
		}
		self.inner.fired.send_replace(true);
	}

	pub fn is_cancelled(&self) -> bool {
		*self.inner.fired.borrow()
	}

	pub fn reason(&self) -> Option<Arc<str>> {
		self.inner.reason.lock().unwrap().clone()
	}

	/// Resolves once the signal has fired; immediately if it already has.
	pub async fn cancelled(&self) {
		let mut receiver = self.inner.fired.subscribe();
		// The sender lives as long as `self`, so this cannot error.
		let _ = receiver.wait_for(|fired| *fired).await;
	}
}

impl Default for CancellationSignal {
	fn default() -> Self {
		Self::new()
	}
}

/// How a job reacts to its children's cancellation and failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JobPolicy {
	/// A child's cancellation or failure cancels the parent, and through it
	/// the siblings.
	#[default]
	Default,
	/// Children fail in isolation; failures are routed to the ambient
	/// uncaught handler only.
	Supervisor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
	Active,
	Completed,
	Cancelled,
	Faulted,
}

const STATE_ACTIVE: u32 = 0;
const STATE_COMPLETED: u32 = 1;
const STATE_CANCELLED: u32 = 2;
const STATE_FAULTED: u32 = 3;

fn state_from_word(word: u32) -> JobState {
	match word {
		STATE_ACTIVE => JobState::Active,
		STATE_COMPLETED => JobState::Completed,
		STATE_CANCELLED => JobState::Cancelled,
		STATE_FAULTED => JobState::Faulted,
		_ => unreachable!("invalid job state word"),
	}
}

/// The terminal outcome of a job, broadcast exactly once on the completion
/// signal.
#[derive(Clone, Debug)]
pub enum JobOutcome {
	Completed,
	Cancelled(Option<Arc<str>>),
	Faulted(Arc<anyhow::Error>),
}

impl JobOutcome {
	pub fn into_result(self) -> Result<(), TaskError> {
		match self {
			JobOutcome::Completed => Ok(()),
			JobOutcome::Cancelled(reason) => Err(TaskError::Cancelled(reason)),
			JobOutcome::Faulted(error) => Err(TaskError::Failed(error)),
		}
	}
}

// One-shot broadcast of the outcome to every joiner. `Pending` receivers are
// cloned per joiner; once signalled the stored value is handed out directly.
struct OutcomeSignaller {
	sender: async_broadcast::Sender<JobOutcome>,
}

impl OutcomeSignaller {
	fn signal(self, outcome: JobOutcome) {
		assert!(matches!(
			self.sender.try_broadcast(outcome),
			Ok(None) | Err(async_broadcast::TrySendError::Closed(_))
		));
	}
}

#[derive(Clone)]
enum OutcomeSignal {
	Pending(async_broadcast::Receiver<JobOutcome>),
	Signalled(JobOutcome),
}

impl OutcomeSignal {
	fn new() -> (OutcomeSignaller, Self) {
		let (sender, receiver) = async_broadcast::broadcast(1);
		(OutcomeSignaller { sender }, Self::Pending(receiver))
	}

	async fn wait(self) -> JobOutcome {
		match self {
			OutcomeSignal::Pending(mut receiver) => match receiver.recv().await {
				Ok(outcome) => outcome,
				Err(_err) => futures::future::pending().await,
			},
			OutcomeSignal::Signalled(outcome) => outcome,
		}
	}
}

type CompletionHandler = Box<dyn FnOnce(&JobOutcome) + Send>;

struct CompletionState {
	signal: OutcomeSignal,
	signaller: Option<OutcomeSignaller>,
	handlers: Vec<CompletionHandler>,
}

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

struct JobInner {
	id: u64,
	policy: JobPolicy,
	parent: Option<Arc<JobInner>>,
	state: AtomicU32,
	children: Mutex<Vec<Weak<JobInner>>>,
	cancel_signal: CancellationSignal,
	failure: Mutex<Option<Arc<anyhow::Error>>>,
	completion: Mutex<CompletionState>,
}

/// A cloneable handle to a node in the cancellation tree.
#[derive(Clone)]
pub struct Job {
	inner: Arc<JobInner>,
}

impl std::fmt::Debug for Job {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Job")
			.field("id", &self.inner.id)
			.field("state", &self.state())
			.field("policy", &self.inner.policy)
			.finish()
	}
}

impl Job {
	pub fn new(policy: JobPolicy) -> Self {
		Self { inner: new_inner(policy, None) }
	}

	pub fn supervisor() -> Self {
		Self::new(JobPolicy::Supervisor)
	}

	/// Creates a child attached to this job. Attachment happens here, before
	/// any user code of the child runs, so a parent cancelled during
	/// attachment is observed: the child comes back already cancelled.
	pub fn child(&self, policy: JobPolicy) -> Job {
		let child = Job { inner: new_inner(policy, Some(self.inner.clone())) };
		self.inner.children.lock().unwrap().push(Arc::downgrade(&child.inner));
		match self.state() {
			JobState::Active => (),
			JobState::Cancelled | JobState::Faulted =>
				cancel_inner(&child.inner, Some(Arc::from("parent job is terminal"))),
			// A completed parent still admits late children; they are only
			// bound for cancellation purposes.
			JobState::Completed => (),
		}
		child
	}

	pub fn id(&self) -> u64 {
		self.inner.id
	}

	pub fn policy(&self) -> JobPolicy {
		self.inner.policy
	}

	pub fn state(&self) -> JobState {
		state_from_word(self.inner.state.load(Ordering::Acquire))
	}

	pub fn is_active(&self) -> bool {
		self.state() == JobState::Active
	}

	pub fn is_terminal(&self) -> bool {
		!self.is_active()
	}

	pub fn is_cancelled(&self) -> bool {
		self.state() == JobState::Cancelled
	}

	pub fn is_completed(&self) -> bool {
		self.state() == JobState::Completed
	}

	pub fn is_faulted(&self) -> bool {
		self.state() == JobState::Faulted
	}

	/// The cooperative cancellation token subordinate code of this job polls
	/// or awaits.
	pub fn cancellation_signal(&self) -> CancellationSignal {
		self.inner.cancel_signal.clone()
	}

	pub fn cancellation_reason(&self) -> Option<Arc<str>> {
		self.inner.cancel_signal.reason()
	}

	pub fn failure(&self) -> Option<Arc<anyhow::Error>> {
		self.inner.failure.lock().unwrap().clone()
	}

	/// The terminal outcome, if the job has reached one.
	pub fn outcome(&self) -> Option<JobOutcome> {
		match &self.inner.completion.lock().unwrap().signal {
			OutcomeSignal::Signalled(outcome) => Some(outcome.clone()),
			OutcomeSignal::Pending(_) => None,
		}
	}

	/// Attempts `Active -> Cancelled`. A no-op on a terminal job; idempotent;
	/// the first reason wins. Cancellation recurses into the children and, by
	/// default policy, propagates to the parent.
	pub fn cancel(&self, reason: Option<&str>) {
		cancel_inner(&self.inner, reason.map(Arc::from));
	}

	/// `Active -> Completed`. Called by the scheduling layer when the user
	/// block returns normally.
	pub fn mark_completed(&self) {
		let this = &self.inner;
		if !try_transition(this, STATE_COMPLETED) {
			return
		}
		tracing::trace!("Job {} completed", this.id);
		detach_from_parent(this);
		finish(this, JobOutcome::Completed);
	}

	/// `Active -> Faulted`. Captures the first failure; later failures are
	/// dropped. Cancels the children and notifies the parent, which under the
	/// default policy faults too and so cancels the siblings.
	pub fn mark_faulted(&self, error: Arc<anyhow::Error>) {
		mark_faulted_inner(&self.inner, error);
	}

	/// Fails with a cancellation error if the job is no longer active.
	pub fn ensure_active(&self) -> Result<(), TaskError> {
		match self.state() {
			JobState::Active => Ok(()),
			_ => Err(TaskError::Cancelled(self.cancellation_reason())),
		}
	}

	/// Suspends until the job reaches a terminal state, reporting that
	/// outcome: a cancelled or faulted job fails the join the same way.
	pub async fn join(&self) -> Result<(), TaskError> {
		let signal = self.inner.completion.lock().unwrap().signal.clone();
		signal.wait().await.into_result()
	}

	/// As [`join`](Self::join), but a caller-side cancellation fails the join
	/// without affecting the job.
	pub async fn join_cancellable(&self, cancel: &CancellationSignal) -> Result<(), TaskError> {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(TaskError::Cancelled(cancel.reason())),
			outcome = self.join() => outcome,
		}
	}

	/// As [`join`](Self::join) with a deadline measured in ambient time;
	/// reaching it reports `TaskError::Timeout`.
	pub async fn join_timeout(&self, timeout: Duration) -> Result<(), TaskError> {
		match with_timeout(timeout, self.join()).await {
			Ok(outcome) => outcome,
			Err(timed_out) => Err(timed_out),
		}
	}

	/// Registers a one-shot completion callback. On an already-terminal job
	/// the handler runs immediately. Handler panics are swallowed.
	pub fn invoke_on_completion(&self, handler: impl FnOnce(&JobOutcome) + Send + 'static) {
		let outcome = {
			let mut completion = self.inner.completion.lock().unwrap();
			match &completion.signal {
				OutcomeSignal::Signalled(outcome) => outcome.clone(),
				OutcomeSignal::Pending(_) => {
					completion.handlers.push(Box::new(handler));
					return
				},
			}
		};
		run_handler(self.inner.id, Box::new(handler), &outcome);
	}

	/// A stable snapshot of the currently attached children.
	pub fn children(&self) -> Vec<Job> {
		snapshot_children(&self.inner).into_iter().map(|inner| Job { inner }).collect()
	}

	/// Suspends the caller until the cancellation signal fires; convenience
	/// over [`cancellation_signal`](Self::cancellation_signal).
	pub async fn cancelled(&self) {
		self.inner.cancel_signal.cancelled().await
	}

	pub(crate) fn same_job(&self, other: &Job) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

fn new_inner(policy: JobPolicy, parent: Option<Arc<JobInner>>) -> Arc<JobInner> {
	let (signaller, signal) = OutcomeSignal::new();
	Arc::new(JobInner {
		id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
		policy,
		parent,
		state: AtomicU32::new(STATE_ACTIVE),
		children: Mutex::new(Vec::new()),
		cancel_signal: CancellationSignal::new(),
		failure: Mutex::new(None),
		completion: Mutex::new(CompletionState {
			signal,
			signaller: Some(signaller),
			handlers: Vec::new(),
		}),
	})
}

fn try_transition(this: &Arc<JobInner>, to: u32) -> bool {
	this.state
		.compare_exchange(STATE_ACTIVE, to, Ordering::AcqRel, Ordering::Acquire)
		.is_ok()
}

fn snapshot_children(this: &Arc<JobInner>) -> Vec<Arc<JobInner>> {
	this.children.lock().unwrap().iter().filter_map(Weak::upgrade).collect()
}

fn detach_from_parent(this: &Arc<JobInner>) {
	if let Some(parent) = &this.parent {
		parent
			.children
			.lock()
			.unwrap()
			.retain(|child| child.upgrade().is_some_and(|child| !Arc::ptr_eq(&child, this)));
	}
}

fn cancel_inner(this: &Arc<JobInner>, reason: Option<Arc<str>>) {
	if !try_transition(this, STATE_CANCELLED) {
		return
	}
	tracing::trace!("Job {} cancelled{}", this.id, match &reason {
		Some(reason) => format!(": {reason}"),
		None => String::new(),
	});
	this.cancel_signal.cancel(reason.as_deref());
	for child in snapshot_children(this) {
		cancel_inner(&child, Some(Arc::from(format!("parent job {} was cancelled", this.id))));
	}
	if let Some(parent) = &this.parent {
		detach_from_parent(this);
		handle_child_cancellation(parent, this);
	}
	finish(this, JobOutcome::Cancelled(reason));
}

fn mark_faulted_inner(this: &Arc<JobInner>, error: Arc<anyhow::Error>) {
	if !try_transition(this, STATE_FAULTED) {
		return
	}
	tracing::debug!("Job {} faulted: {:#}", this.id, error);
	*this.failure.lock().unwrap() = Some(error.clone());
	this.cancel_signal.cancel(Some("job failed"));
	for child in snapshot_children(this) {
		cancel_inner(&child, Some(Arc::from(format!("parent job {} failed", this.id))));
	}
	if let Some(parent) = &this.parent {
		detach_from_parent(this);
		handle_child_exception(parent, &error);
	}
	finish(this, JobOutcome::Faulted(error));
}

// Default parent protocol: one child's cancellation takes the whole scope
// with it. A supervisor observes and moves on.
fn handle_child_cancellation(parent: &Arc<JobInner>, child: &Arc<JobInner>) {
	match parent.policy {
		JobPolicy::Default => cancel_inner(
			parent,
			Some(Arc::from(format!("child job {} was cancelled", child.id))),
		),
		JobPolicy::Supervisor => {
			tracing::debug!(
				"Supervisor job {} observed cancellation of child {}",
				parent.id,
				child.id
			);
		},
	}
}

fn handle_child_exception(parent: &Arc<JobInner>, error: &Arc<anyhow::Error>) {
	match parent.policy {
		JobPolicy::Default => mark_faulted_inner(parent, error.clone()),
		JobPolicy::Supervisor => {
			let ambient = ambient::current();
			ambient::report_uncaught(ambient.scope_tag(), error);
		},
	}
}

fn finish(this: &Arc<JobInner>, outcome: JobOutcome) {
	let (signaller, handlers) = {
		let mut completion = this.completion.lock().unwrap();
		completion.signal = OutcomeSignal::Signalled(outcome.clone());
		(completion.signaller.take(), std::mem::take(&mut completion.handlers))
	};
	if let Some(signaller) = signaller {
		signaller.signal(outcome.clone());
	}
	for handler in handlers {
		run_handler(this.id, handler, &outcome);
	}
}

fn run_handler(job_id: u64, handler: CompletionHandler, outcome: &JobOutcome) {
	if catch_unwind(AssertUnwindSafe(|| handler(outcome))).is_err() {
		tracing::warn!("Completion handler of job {job_id} panicked; swallowed");
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	#[test]
	fn exactly_one_terminal_transition() {
		let job = Job::new(JobPolicy::Default);
		assert!(job.is_active());

		job.cancel(Some("first"));
		assert_eq!(job.state(), JobState::Cancelled);
		assert_eq!(job.cancellation_reason().as_deref(), Some("first"));

		// Idempotent, first reason retained, completion cannot overwrite.
		job.cancel(Some("second"));
		job.mark_completed();
		job.mark_faulted(Arc::new(anyhow::anyhow!("late failure")));
		assert_eq!(job.state(), JobState::Cancelled);
		assert_eq!(job.cancellation_reason().as_deref(), Some("first"));
		assert!(job.failure().is_none());
	}

	#[test]
	fn cancel_after_completed_is_a_no_op() {
		let job = Job::new(JobPolicy::Default);
		job.mark_completed();
		job.cancel(Some("too late"));
		assert_eq!(job.state(), JobState::Completed);
	}

	#[test]
	fn cancellation_recurses_into_children_and_notifies_the_parent() {
		let parent = Job::new(JobPolicy::Default);
		let child_a = parent.child(JobPolicy::Default);
		let child_b = parent.child(JobPolicy::Default);
		let grandchild = child_a.child(JobPolicy::Default);

		parent.cancel(Some("shutting down"));

		assert!(parent.is_cancelled());
		assert!(child_a.is_cancelled());
		assert!(child_b.is_cancelled());
		assert!(grandchild.is_cancelled());
		assert!(child_a.cancellation_signal().is_cancelled());
	}

	#[test]
	fn child_cancellation_propagates_upward_by_default() {
		let parent = Job::new(JobPolicy::Default);
		let child = parent.child(JobPolicy::Default);
		let sibling = parent.child(JobPolicy::Default);

		child.cancel(None);

		assert!(parent.is_cancelled());
		assert!(sibling.is_cancelled());
	}

	#[test]
	fn child_failure_faults_the_parent_and_cancels_siblings() {
		let parent = Job::new(JobPolicy::Default);
		let child = parent.child(JobPolicy::Default);
		let sibling = parent.child(JobPolicy::Default);

		child.mark_faulted(Arc::new(anyhow::anyhow!("it broke")));

		assert!(child.is_faulted());
		assert!(parent.is_faulted());
		assert!(parent.failure().unwrap().to_string().contains("it broke"));
		assert!(sibling.is_cancelled());
	}

	#[test]
	fn supervisor_children_fail_in_isolation() {
		let supervisor = Job::supervisor();
		let child = supervisor.child(JobPolicy::Default);
		let sibling = supervisor.child(JobPolicy::Default);

		child.mark_faulted(Arc::new(anyhow::anyhow!("contained")));

		assert!(child.is_faulted());
		assert!(supervisor.is_active());
		assert!(sibling.is_active());

		sibling.cancel(None);
		assert!(supervisor.is_active());
	}

	#[test]
	fn child_attached_to_a_cancelled_parent_is_born_cancelled() {
		let parent = Job::new(JobPolicy::Default);
		parent.cancel(None);
		let child = parent.child(JobPolicy::Default);
		assert!(child.is_cancelled());
	}

	#[test]
	fn completed_children_are_detached() {
		let parent = Job::new(JobPolicy::Default);
		let child = parent.child(JobPolicy::Default);
		assert_eq!(parent.children().len(), 1);
		child.mark_completed();
		assert!(parent.children().is_empty());
		assert!(parent.is_active());
	}

	#[test]
	fn completion_handlers_fire_exactly_once_and_swallow_panics() {
		let job = Job::new(JobPolicy::Default);
		let fired = Arc::new(AtomicUsize::new(0));

		job.invoke_on_completion(|_| panic!("handler bug"));
		job.invoke_on_completion({
			let fired = fired.clone();
			move |outcome| {
				assert!(matches!(outcome, JobOutcome::Completed));
				fired.fetch_add(1, Ordering::Relaxed);
			}
		});

		job.mark_completed();
		assert_eq!(fired.load(Ordering::Relaxed), 1);

		// Registered after the terminal transition: runs immediately.
		job.invoke_on_completion({
			let fired = fired.clone();
			move |_| {
				fired.fetch_add(1, Ordering::Relaxed);
			}
		});
		assert_eq!(fired.load(Ordering::Relaxed), 2);
	}

	#[tokio::test]
	async fn join_reports_the_job_outcome() {
		let job = Job::new(JobPolicy::Default);
		let joiner = tokio::spawn({
			let job = job.clone();
			async move { job.join().await }
		});
		tokio::task::yield_now().await;
		job.mark_faulted(Arc::new(anyhow::anyhow!("died")));
		assert!(matches!(joiner.await.unwrap(), Err(TaskError::Failed(_))));

		// Join on an already-terminal job returns immediately.
		assert!(matches!(job.join().await, Err(TaskError::Failed(_))));
	}

	#[tokio::test]
	async fn join_is_cancellable_without_affecting_the_job() {
		let job = Job::new(JobPolicy::Default);
		let cancel = CancellationSignal::new();
		cancel.cancel(Some("caller gave up"));
		assert!(matches!(job.join_cancellable(&cancel).await, Err(TaskError::Cancelled(_))));
		assert!(job.is_active());
	}

	#[tokio::test(start_paused = true)]
	async fn join_timeout_distinguishes_timeout_from_outcome() {
		let job = Job::new(JobPolicy::Default);
		assert!(matches!(
			job.join_timeout(Duration::from_millis(10)).await,
			Err(TaskError::Timeout(_))
		));
		job.mark_completed();
		assert!(job.join_timeout(Duration::from_millis(10)).await.is_ok());
	}

	#[test]
	fn ensure_active_reports_cancellation() {
		let job = Job::new(JobPolicy::Default);
		assert!(job.ensure_active().is_ok());
		job.cancel(Some("stop"));
		assert!(matches!(
			job.ensure_active(),
			Err(TaskError::Cancelled(Some(reason))) if &*reason == "stop"
		));
	}
}
