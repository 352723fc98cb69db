//! Operation observability
//!
//! Clients report every completed operation through a hook instead of
//! logging inline, so embedders can ship records to their own telemetry.
//! The default hook forwards to `tracing`.

use std::time::Duration;

/// One completed cache operation, as seen at the client surface.
#[derive(Debug)]
pub struct OpRecord<'a> {
    /// Client kind, e.g. `"single"` or `"sharded"`.
    pub client: &'a str,
    /// Operation name, e.g. `"get"` or `"commit"`.
    pub action: &'a str,
    /// Affected key, or a comma-joined list for multi-key operations.
    pub keys: &'a str,
    pub success: bool,
    pub elapsed: Duration,
}

pub trait ObservabilityHook: Send + Sync {
    fn record(&self, op: &OpRecord<'_>);
}

/// Default hook: emits one `tracing` event per operation.
#[derive(Debug, Default)]
pub struct TracingHook;

impl ObservabilityHook for TracingHook {
    fn record(&self, op: &OpRecord<'_>) {
        if op.success {
            tracing::debug!(
                client = op.client,
                action = op.action,
                keys = op.keys,
                elapsed_ms = op.elapsed.as_millis() as u64,
                "cache op"
            );
        } else {
            tracing::warn!(
                client = op.client,
                action = op.action,
                keys = op.keys,
                elapsed_ms = op.elapsed.as_millis() as u64,
                "cache op failed"
            );
        }
    }
}

/// Discards every record. Handy in tests.
#[derive(Debug, Default)]
pub struct NullHook;

impl ObservabilityHook for NullHook {
    fn record(&self, _op: &OpRecord<'_>) {}
}
