use std::sync::Arc;

use anyhow::Context;

use fundflow_core::SystemClock;
use fundflow_infra::config::WorkerConfig;
use fundflow_worker::{Storage, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fundflow_observability::init();

    let config = WorkerConfig::from_env().context("failed to load worker configuration")?;
    let storage = Storage::connect(&config).await.context("failed to open storage")?;
    let worker = Worker::build(config, &storage, Arc::new(SystemClock)).context("failed to build worker")?;

    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}
