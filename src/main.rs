use error_chain::ChainedError;
use log::{error, info};
use vmoperator::{config::EngineConfig, errors::*, manager::Manager};

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = libmain().await {
        error!("{}", e.display_chain());
        std::process::exit(1);
    }
}

async fn libmain() -> Result<()> {
    let config = EngineConfig::load()?;
    info!("starting vmoperator with {:?}", config);

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = kube::Client::try_default().await?;

    let (_manager, drainer) = Manager::new(client, config).await?;
    drainer.await;
    Ok(())
}
