//! Fire-and-forget search telemetry.
//!
//! [`TelemetrySink::record`] is synchronous and returns immediately. It
//! never blocks, retries, or reports failure to the caller; write errors
//! are only logged.

use std::sync::Arc;
use tracing::warn;

use town_hub_core::models::SearchTelemetry;
use town_hub_core::store::Store;

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: SearchTelemetry);
}

/// Writes events to the store's `search_telemetry` table from a spawned task.
pub struct StoreTelemetry {
    store: Arc<dyn Store>,
}

impl StoreTelemetry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl TelemetrySink for StoreTelemetry {
    fn record(&self, event: SearchTelemetry) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(town = %event.town_id, "no async runtime; search telemetry dropped");
            return;
        };
        let store = self.store.clone();
        handle.spawn(async move {
            if let Err(e) = store.record_telemetry(&event).await {
                warn!(town = %event.town_id, error = %e, "failed to record search telemetry");
            }
        });
    }
}

/// Discards every event.
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: SearchTelemetry) {}
}
