//! Runtime tuning knobs.
//!
//! Everything has a compiled-in default; a settings file and
//! `TASKFLOW_`-prefixed environment variables can override them. Installed
//! settings are read by the flow engine and the virtual-time harness.

use std::sync::{Arc, RwLock};

use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowSettings {
	/// Capacity of the producer/consumer handoff channel inside every flow
	/// collection.
	pub handoff_capacity: usize,
	/// Default concurrency bound for `flat_map_merge` when the caller does
	/// not pass one.
	pub flat_map_concurrency: usize,
}

impl Default for FlowSettings {
	fn default() -> Self {
		Self { handoff_capacity: 1, flat_map_concurrency: 16 }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSettings {
	/// Virtual-time step used by `run_until_idle`.
	pub idle_poll_step_millis: u64,
	/// Iterations without progress before the stuck detector kicks in.
	pub stuck_iterations: u32,
	/// How far the stuck detector force-advances virtual time.
	pub stuck_force_advance_millis: u64,
}

impl Default for HarnessSettings {
	fn default() -> Self {
		Self { idle_poll_step_millis: 10, stuck_iterations: 100, stuck_force_advance_millis: 100 }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
	pub flow: FlowSettings,
	pub harness: HarnessSettings,
}

impl RuntimeSettings {
	/// Merges an optional settings file with `TASKFLOW_`-prefixed environment
	/// variables (e.g. `TASKFLOW_FLOW__HANDOFF_CAPACITY=4`) on top of the
	/// defaults.
	pub fn load(file: Option<&str>) -> Result<Self, ConfigError> {
		let mut builder = Config::builder();
		if let Some(file) = file {
			builder = builder.add_source(File::with_name(file));
		}
		builder
			.add_source(Environment::with_prefix("TASKFLOW").separator("__"))
			.build()?
			.try_deserialize()
	}

	/// Makes these settings the process-wide ones.
	pub fn install(self) {
		*GLOBAL.write().unwrap() = Arc::new(self);
	}
}

lazy_static! {
	static ref GLOBAL: RwLock<Arc<RuntimeSettings>> =
		RwLock::new(Arc::new(RuntimeSettings::default()));
}

pub(crate) fn global() -> Arc<RuntimeSettings> {
	GLOBAL.read().unwrap().clone()
}
