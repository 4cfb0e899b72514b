use std::time::Duration;

use serde::Deserialize;
use soapflow_core::PhaseOrder;

/// Engine-level configuration.
///
/// Controls the phase layout of every chain, the bounded wait of
/// asynchronous calls, and dispatch admission limits. Deserializable so a
/// deployment loader can supply it; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifier stamped on every message context this engine processes.
    pub engine_id: String,
    /// Global phase order per direction.
    pub phase_order: PhaseOrder,
    /// Interval between completion checks of an asynchronous call.
    pub async_poll_interval_ms: u64,
    /// Number of checks before an asynchronous call is abandoned.
    pub async_max_checks: u32,
    /// Deadline applied by the dispatch pipeline when a context sets none.
    pub default_dispatch_timeout_ms: u64,
    /// Maximum number of concurrent dispatches before load shedding.
    pub max_concurrent_dispatches: u32,
}

impl EngineConfig {
    /// Total time an asynchronous call may stay unanswered.
    #[must_use]
    pub fn async_wait_bound(&self) -> Duration {
        self.async_poll_interval() * self.async_max_checks
    }

    #[must_use]
    pub fn async_poll_interval(&self) -> Duration {
        Duration::from_millis(self.async_poll_interval_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: "soapflow".to_string(),
            phase_order: PhaseOrder::default(),
            async_poll_interval_ms: 1_000,
            async_max_checks: 10,
            default_dispatch_timeout_ms: 30_000,
            max_concurrent_dispatches: 1000,
        }
    }
}
