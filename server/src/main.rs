use std::sync::Arc;

use relay_core::signer::LocalSigner;
use relay_server::{chains::ConfiguredChainService, config, queue::manager::QueueManager};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "relay_server=debug,relay_executors=debug,relay_queue=debug".into()
        }),
    );

    match config.server.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let chains = Arc::new(ConfiguredChainService::from_configs(&config.chains)?);
    tracing::info!(chain_ids = ?chains.chain_ids(), "Chains configured");

    let signer = LocalSigner::from_private_keys(&config.signer.private_keys)?;
    tracing::info!(wallets = signer.addresses().count(), "Signer initialized");

    let redis_client = relay_queue::redis::Client::open(config.redis.url.as_str())?;

    // an embedding API layer builds `RelayRouter::new(chains, queue_manager.services.clone())`
    let queue_manager = QueueManager::new(redis_client, &config, chains, Arc::new(signer)).await?;
    tracing::info!("Queue manager initialized");

    let all_workers = queue_manager.start_workers(&config.queue);

    match queue_manager.get_stats().await {
        Ok(stats) => tracing::info!(?stats, "Relay engine ready"),
        Err(e) => tracing::warn!(error = %e, "Relay engine ready, queue stats unavailable"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Shutdown signal received");

    if let Err(e) = all_workers.shutdown().await {
        tracing::error!("Error during coordinated shutdown: {}", e);
    } else {
        tracing::info!("All workers shut down successfully");
    }

    Ok(())
}
