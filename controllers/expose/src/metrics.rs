//! Progress counters.
//!
//! Counters are owned by the controller and threaded through the pipeline
//! explicitly; there is no global registry. With no exposition endpoint in
//! this binary, the totals are reported through a log line at shutdown.

use prometheus::{IntCounter, Registry};
use tracing::info;

/// Counters for pipeline progress and failures.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Keys enqueued by the event router
    pub queued: IntCounter,
    /// Reconciles that converged successfully
    pub converges: IntCounter,
    /// Keys requeued with backoff after a transient failure
    pub retries: IntCounter,
    /// Keys dropped: terminal errors, exhausted retries, malformed events
    pub drops: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("queued", &self.queued.get())
            .field("converges", &self.converges.get())
            .field("retries", &self.retries.get())
            .field("drops", &self.drops.get())
            .finish()
    }
}

impl Metrics {
    /// Creates and registers the counter set.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let queued = IntCounter::new("expose_keys_queued_total", "Keys enqueued by the event router")?;
        let converges = IntCounter::new("expose_converges_total", "Successful reconcile passes")?;
        let retries = IntCounter::new("expose_retries_total", "Keys requeued after transient failure")?;
        let drops = IntCounter::new("expose_drops_total", "Keys dropped without convergence")?;
        registry.register(Box::new(queued.clone()))?;
        registry.register(Box::new(converges.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(drops.clone()))?;
        Ok(Self {
            registry,
            queued,
            converges,
            retries,
            drops,
        })
    }

    /// The registry holding these counters.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Logs the current totals.
    pub fn report(&self) {
        info!(
            queued = self.queued.get(),
            converges = self.converges.get(),
            retries = self.retries.get(),
            drops = self.drops.get(),
            "pipeline totals"
        );
    }
}
