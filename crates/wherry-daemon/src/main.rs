use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wherry_config::ConfigManager;
use wherry_core::SyncLimits;
use wherry_provider::{OAuthCredentialProvider, RestMailProvider, Throttle};
use wherry_storage::Store;
use wherry_sync::{SchedulerConfig, SyncEngine, SyncScheduler};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_manager = ConfigManager::new().context("initialize config manager")?;
    let config = config_manager.load().context("load config")?;

    let db_path = config_manager.data_dir().join(&config.database.file_name);
    let store = Store::connect(&db_path).await.context("open mail store")?;

    let throttle = Arc::new(Throttle::new(Duration::from_millis(
        config.sync.provider_min_interval_ms,
    )));
    let provider = Arc::new(RestMailProvider::new(
        config.provider.api_base_url.clone(),
        throttle,
    ));
    let credentials = Arc::new(
        OAuthCredentialProvider::new(
            config.provider.client_id.clone(),
            &config.provider.token_url,
        )
        .context("build credential provider")?,
    );

    let engine = Arc::new(SyncEngine::new(store.clone(), provider, credentials));
    let scheduler = Arc::new(SyncScheduler::new(
        store,
        engine,
        SchedulerConfig {
            discovery_interval: Duration::from_secs(config.sync.discovery_interval_secs),
            dispatch_interval: Duration::from_secs(config.sync.dispatch_interval_secs),
            worker_count: config.sync.worker_count,
            dispatch_batch_size: config.sync.dispatch_batch_size,
            limits: SyncLimits {
                max_new: config.sync.max_new_per_run,
                batch_size: config.sync.page_size,
                max_batches: config.sync.max_pages_per_run,
            },
        },
    ));

    let loops = Arc::clone(&scheduler).start();
    tracing::info!(config = %config_manager.config_path().display(), "wherryd running");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down, letting in-flight batches finish");
    scheduler.shutdown();

    for handle in loops {
        let _ = handle.await;
    }

    Ok(())
}
