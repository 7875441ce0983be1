//! Ambient state carried across suspension points.
//!
//! Every job envelope runs inside a task-local [`Ambient`] value holding the
//! time source, the scope tag used by the logging span, and the typed
//! task-local map. Code that runs outside any scope falls back to the
//! process-wide defaults. The uncaught-exception handler chain is
//! process-scoped with a scoped install/uninstall pair.

use std::{
	any::{Any, TypeId},
	collections::HashMap,
	future::Future,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

use lazy_static::lazy_static;

use crate::time::{RealTimeSource, TimeSource};

tokio::task_local! {
	static CURRENT: Arc<Ambient>;
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_scope_id() -> u64 {
	NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Human-readable identification of the scope a failure came from, handed to
/// uncaught-exception handlers and the logging span.
#[derive(Debug, Clone)]
pub struct ScopeTag {
	pub name: Option<Arc<str>>,
	pub id: u64,
}

impl std::fmt::Display for ScopeTag {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.name {
			Some(name) => write!(f, "{name}#{}", self.id),
			None => write!(f, "scope#{}", self.id),
		}
	}
}

type LocalMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// The per-task ambient context. Immutable once built; deriving a modified
/// context rebinds the task local for a subtree of the computation.
pub struct Ambient {
	time: Arc<dyn TimeSource>,
	scope_tag: Option<ScopeTag>,
	locals: LocalMap,
}

impl Ambient {
	pub(crate) fn new(time: Arc<dyn TimeSource>, scope_tag: Option<ScopeTag>) -> Self {
		Self { time, scope_tag, locals: HashMap::new() }
	}

	pub fn time(&self) -> Arc<dyn TimeSource> {
		self.time.clone()
	}

	pub fn scope_tag(&self) -> Option<&ScopeTag> {
		self.scope_tag.as_ref()
	}

	fn derived_with_local<T: Send + Sync + 'static>(&self, value: T) -> Self {
		let mut locals = self.locals.clone();
		locals.insert(TypeId::of::<T>(), Arc::new(value));
		Self { time: self.time.clone(), scope_tag: self.scope_tag.clone(), locals }
	}
}

lazy_static! {
	static ref DEFAULT_AMBIENT: Arc<Ambient> =
		Arc::new(Ambient::new(Arc::new(RealTimeSource), None));
}

/// The ambient context of the current task, or the process defaults when
/// called outside any scope-launched task.
pub fn current() -> Arc<Ambient> {
	CURRENT.try_with(Arc::clone).unwrap_or_else(|_| DEFAULT_AMBIENT.clone())
}

/// Runs `fut` with `ambient` installed as the task-local context. Applied by
/// scopes around every dispatched envelope, so the context survives dispatcher
/// hops.
pub(crate) async fn scoped<F: Future>(ambient: Arc<Ambient>, fut: F) -> F::Output {
	CURRENT.scope(ambient, fut).await
}

/// Runs `fut` with a typed task-local value visible (via [`local`]) to the
/// whole descendant computation, including jobs it launches.
pub async fn with_local<T: Send + Sync + 'static, F: Future>(value: T, fut: F) -> F::Output {
	let derived = Arc::new(current().derived_with_local(value));
	CURRENT.scope(derived, fut).await
}

/// Reads a typed task-local value set by an enclosing [`with_local`].
pub fn local<T: Send + Sync + 'static>() -> Option<Arc<T>> {
	let ambient = current();
	let value = ambient.locals.get(&TypeId::of::<T>())?.clone();
	value.downcast::<T>().ok()
}

type UncaughtHandler = Arc<dyn Fn(Option<&ScopeTag>, &anyhow::Error) + Send + Sync>;

lazy_static! {
	static ref UNCAUGHT_HANDLERS: Mutex<Vec<(u64, UncaughtHandler)>> = Mutex::new(Vec::new());
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(0);

/// Uninstalls its handler on drop.
pub struct HandlerGuard {
	id: u64,
}

impl Drop for HandlerGuard {
	fn drop(&mut self) {
		UNCAUGHT_HANDLERS.lock().unwrap().retain(|(id, _)| *id != self.id);
	}
}

/// Installs an uncaught-exception handler for the lifetime of the returned
/// guard. Handlers form a chain; all installed handlers see every uncaught
/// failure, in installation order.
pub fn install_uncaught_handler(
	handler: impl Fn(Option<&ScopeTag>, &anyhow::Error) + Send + Sync + 'static,
) -> HandlerGuard {
	let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
	UNCAUGHT_HANDLERS.lock().unwrap().push((id, Arc::new(handler)));
	HandlerGuard { id }
}

/// Routes a failure to the handler chain. Handler panics are swallowed; with
/// no handlers installed the failure is logged.
pub fn report_uncaught(scope_tag: Option<&ScopeTag>, error: &anyhow::Error) {
	let handlers = {
		let guard = UNCAUGHT_HANDLERS.lock().unwrap();
		guard.iter().map(|(_, handler)| handler.clone()).collect::<Vec<_>>()
	};
	if handlers.is_empty() {
		match scope_tag {
			Some(tag) => tracing::error!("Uncaught failure in {tag}: {error:#}"),
			None => tracing::error!("Uncaught failure: {error:#}"),
		}
		return;
	}
	for handler in handlers {
		if catch_unwind(AssertUnwindSafe(|| handler(scope_tag, error))).is_err() {
			tracing::warn!("Uncaught-failure handler panicked, continuing with the chain");
		}
	}
}
