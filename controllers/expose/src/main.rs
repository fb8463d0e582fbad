//! Expose Controller
//!
//! Watches Deployments and keeps a matching Service alive for each one:
//! same name and namespace, selector equal to the Deployment's pod
//! template labels, port 80. When a Deployment disappears its Service is
//! removed.
//!
//! Pipeline: change feed -> event router -> retry queue -> worker pool ->
//! reconciler -> cluster API.

mod backoff;
mod cluster;
mod controller;
mod error;
mod metrics;
mod queue;
mod reconciler;
mod router;
mod test_utils;
mod watcher;

use crate::controller::{Config, Controller};
use crate::error::ControllerError;
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting Expose Controller");

    // Load configuration from environment variables
    let namespace = env::var("WATCH_NAMESPACE").ok();
    let workers = match env::var("RECONCILE_WORKERS") {
        Ok(v) => v.parse::<usize>().map_err(|_| {
            ControllerError::InvalidConfig(format!(
                "RECONCILE_WORKERS must be a positive integer, got {v:?}"
            ))
        })?,
        Err(_) => 2,
    };
    if workers == 0 {
        return Err(ControllerError::InvalidConfig(
            "RECONCILE_WORKERS must be at least 1".to_string(),
        ));
    }

    info!("Configuration:");
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", workers);

    // Initialize and run controller
    let controller = Controller::new(Config { namespace, workers }).await?;
    controller.run().await?;

    Ok(())
}
