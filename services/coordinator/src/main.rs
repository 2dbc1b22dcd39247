use anyhow::Result;
use tokio::signal;
use tracing::info;

use federation_core::{init_tracing, load_config};

mod federation;

use federation::FederationModule;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config("coordinator-service")?;
    init_tracing("coordinator-service", &cfg.log_level)?;
    info!(service = %cfg.service_name, min_participants = cfg.round.min_participants, method = ?cfg.round.method, "config_loaded");

    let module = FederationModule::new(&cfg)?;
    info!("coordinator ready");

    signal::ctrl_c().await?;
    module.shutdown().await?;
    info!("shutdown");
    Ok(())
}
