//! Deterministic testing support: the virtual clock, the FIFO test
//! dispatcher, the [`TestScope`] harness and a few assertion macros.

pub mod clock;
pub mod dispatcher;
pub mod scope;

pub use clock::VirtualClock;
pub use dispatcher::TestDispatcher;
pub use scope::TestScope;

#[macro_export]
macro_rules! assert_ok {
	($result:expr) => {
		match $result {
			Ok(value) => value,
			Err(error) => panic!("expected Ok, got Err: {:?}", error),
		}
	};
}

#[macro_export]
macro_rules! assert_err {
	($result:expr) => {
		match $result {
			Ok(_) => panic!("expected Err, got Ok"),
			Err(error) => error,
		}
	};
}

/// Awaits the future and asserts that it panics. Test-only.
#[macro_export]
macro_rules! assert_future_panics {
	($future:expr) => {
		assert!(
			futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe($future))
				.await
				.is_err(),
			"expected the future to panic"
		)
	};
}

#[cfg(test)]
pub(crate) fn init_test_logger() {
	use tracing_subscriber::EnvFilter;
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

#[cfg(test)]
mod tests {
	use super::init_test_logger;

	#[tokio::test]
	async fn assertion_macros_cover_both_arms() {
		init_test_logger();

		let ok: Result<u32, String> = Ok(7);
		assert_eq!(assert_ok!(ok), 7);

		let err: Result<u32, String> = Err("nope".to_string());
		assert_eq!(assert_err!(err), "nope");

		assert_future_panics!(async { panic!("expected") });
	}
}
