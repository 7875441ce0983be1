//! Structured concurrency on top of tokio: a tree of cancellable jobs,
//! pluggable dispatchers, result-bearing deferred handles, closeable
//! channels, and a cold/hot reactive-flow layer — plus a virtual-time harness
//! that drives all of it deterministically in tests.
//!
//! The shape of an application: build a [`Scope`](scope::Scope) over a
//! dispatcher, `spawn` work into it, and let cancellation flow down the job
//! tree while completion flows up. Failures surface through the ambient
//! uncaught handler unless a supervisor scope contains them.

pub mod ambient;
pub mod channel;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod job;
pub mod scope;
pub mod settings;
#[macro_use]
pub mod testing;
pub mod time;

pub use channel::Channel;
pub use dispatch::{
	Dispatch, DispatchHandle, InlineDispatcher, IoDispatcher, PooledDispatcher,
	SingleThreadDispatcher,
};
pub use error::TaskError;
pub use flow::{empty_flow, flow, flow_of, Flow, SharedFlow, StateFlow};
pub use job::{CancellationSignal, Job, JobOutcome, JobPolicy, JobState};
pub use scope::{Deferred, Scope, TaskContext};
pub use settings::RuntimeSettings;
pub use testing::TestScope;
pub use time::{delay, make_periodic_tick, with_timeout, TimeSource};
