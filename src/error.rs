use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// The outcome-level error reported by jobs, joins, deferred awaits and
/// dispatcher handles.
///
/// Cancellation is a distinct variant rather than a failure: the launch
/// envelope treats a `Cancelled` error returned from a user block as a
/// cooperative end-of-work and does not surface it to the uncaught handler.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
	#[error("cancelled{}", reason_suffix(.0))]
	Cancelled(Option<Arc<str>>),
	#[error("failed: {0}")]
	Failed(Arc<anyhow::Error>),
	#[error("timed out after {0:?}")]
	Timeout(Duration),
	#[error("dispatcher error: {0}")]
	Dispatch(Arc<str>),
}

fn reason_suffix(reason: &Option<Arc<str>>) -> String {
	match reason {
		Some(reason) => format!(": {reason}"),
		None => String::new(),
	}
}

impl TaskError {
	pub fn cancelled() -> Self {
		Self::Cancelled(None)
	}

	pub fn cancelled_because(reason: impl Into<Arc<str>>) -> Self {
		Self::Cancelled(Some(reason.into()))
	}

	pub fn failed(error: anyhow::Error) -> Self {
		Self::Failed(Arc::new(error))
	}

	pub fn is_cancellation(&self) -> bool {
		matches!(self, Self::Cancelled(_))
	}
}

/// Classifies an error returned from a user block. Cancellation travels
/// through `anyhow` as a `TaskError::Cancelled` at any depth of the context
/// chain.
pub fn cancellation_reason_of(error: &anyhow::Error) -> Option<Option<Arc<str>>> {
	error.chain().find_map(|cause| match cause.downcast_ref::<TaskError>() {
		Some(TaskError::Cancelled(reason)) => Some(reason.clone()),
		_ => None,
	})
}

/// Sending on a closed channel hands the rejected value back.
pub struct SendError<T>(pub T);

impl<T> std::fmt::Debug for SendError<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SendError").finish_non_exhaustive()
	}
}

impl<T> std::fmt::Display for SendError<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "channel closed")
	}
}

impl<T> std::error::Error for SendError<T> {}

pub enum TrySendError<T> {
	Full(T),
	Closed(T),
}

impl<T> TrySendError<T> {
	pub fn into_inner(self) -> T {
		match self {
			Self::Full(value) | Self::Closed(value) => value,
		}
	}
}

impl<T> std::fmt::Debug for TrySendError<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Full(_) => write!(f, "Full(..)"),
			Self::Closed(_) => write!(f, "Closed(..)"),
		}
	}
}

impl<T> std::fmt::Display for TrySendError<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Full(_) => write!(f, "channel full"),
			Self::Closed(_) => write!(f, "channel closed"),
		}
	}
}

impl<T> std::error::Error for TrySendError<T> {}

/// The failure cause a channel was closed with, raised to the first receiver
/// that observes end-of-stream.
#[derive(Error, Debug, Clone)]
#[error("channel closed: {0}")]
pub struct CloseCause(pub Arc<anyhow::Error>);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cancellation_is_detected_through_an_anyhow_chain() {
		let bare = anyhow::Error::new(TaskError::cancelled_because("scope shut down"));
		assert_eq!(cancellation_reason_of(&bare), Some(Some(Arc::from("scope shut down"))));

		let wrapped = bare.context("while waiting for the channel");
		assert_eq!(cancellation_reason_of(&wrapped), Some(Some(Arc::from("scope shut down"))));

		let unrelated = anyhow::anyhow!("disk on fire");
		assert_eq!(cancellation_reason_of(&unrelated), None);
	}

	#[test]
	fn failure_variants_render_their_cause() {
		let error = TaskError::failed(anyhow::anyhow!("boom"));
		assert!(error.to_string().contains("boom"));
		assert!(!error.is_cancellation());
		assert!(TaskError::cancelled().is_cancellation());
	}
}
