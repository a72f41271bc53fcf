use tracing::error;

use coreclaw::core::runtime::{Core, CoreConfig};

#[tokio::main]
async fn main() {
    coreclaw::logging::init();

    let core = match Core::start(CoreConfig::from_env()).await {
        Ok(core) => core,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    core.shutdown().await;
}
