use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod coordinator;
mod ipc;
mod registry;
mod scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;

    // Logs go to stderr; RUST_LOG wins over the configured filter.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    info!(
        socket = %config.socket_path.display(),
        tick_interval_ms = config.tick_interval_ms,
        "ticktrack starting"
    );

    let listener = ipc::server::bind(&config.socket_path)?;
    let (coordinator, coordinator_task) = coordinator::spawn(config.coordinator_settings());

    tokio::select! {
        res = ipc::server::serve(listener, coordinator.clone()) => {
            if let Err(e) = res {
                error!("IPC server failed: {:?}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    // Timer state is volatile; nothing to persist.
    let _ = coordinator.shutdown();
    if let Err(e) = coordinator_task.await {
        error!("Coordinator task failed: {}", e);
    }
    let _ = std::fs::remove_file(&config.socket_path);

    Ok(())
}
