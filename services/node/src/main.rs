//! bidmesh node
//!
//! Runs a requester and a compute node in one process.
//!
//! ## Architecture
//!
//! - **Requester**: accepts jobs, asks the selection policy, drives job state
//! - **Compute node**: bids on shards against its capacity, runs them in
//!   containers and publishes results into the local content store
//! - **Housekeeping**: cancels jobs that outlived their execution timeout
//! - **Cleanup**: removes every container this node created on shutdown

use std::sync::Arc;

use anyhow::Result;
use bidmesh_node::{connect_runtime, open_store, Node, NodeConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        store = ?config.store,
        runtime = ?config.runtime,
        "Starting bidmesh node"
    );

    let store = open_store(&config)?;
    let runtime = connect_runtime(&config).await?;
    let submit_job = config.submit_job.clone();
    let mut node = Node::build(config, runtime, store).await?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = node.spawn_workers(shutdown_rx);
    let node = Arc::new(node);

    match submit_job {
        Some(path) => {
            let job = tokio::spawn({
                let node = Arc::clone(&node);
                async move { node.run_job_file(&path).await }
            });
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                }
                result = job => {
                    match result {
                        Ok(Ok(state)) => info!(
                            job_id = %state.job_id,
                            state = %state.state,
                            reason = ?state.reason,
                            "Job finished"
                        ),
                        Ok(Err(e)) => error!(error = %e, "Job failed"),
                        Err(e) => error!(error = %e, "Job task panicked"),
                    }
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task panicked");
        }
    }

    let failed = node.shutdown().await;
    if failed > 0 {
        warn!(failed, "Some cleanup steps failed");
    }

    info!("Node shutdown complete");
    Ok(())
}
