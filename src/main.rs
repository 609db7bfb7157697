use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

use tts_relay_core::bans::BanSet;
use tts_relay_core::config::TtsRelayConfig;
use tts_relay_core::db;
use tts_relay_core::dictionary_cache::DictionaryCache;
use tts_relay_core::event_router::EventRouter;
use tts_relay_core::metrics::MetricsSampler;
use tts_relay_core::queue::QueueCore;
use tts_relay_core::session::SessionManager;
use tts_relay_core::tts_client::TtsClient;

mod gateway_stub;

const DICTIONARY_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(600);
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = TtsRelayConfig::load()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format.as_str() {
        "json" => {
            fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt().with_env_filter(filter).init();
        }
    }

    tracing::info!("starting tts-relay v{}", env!("CARGO_PKG_VERSION"));

    let pool = db::init_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("database connected, migrations applied");

    let config = Arc::new(RwLock::new(config));

    let queue = QueueCore::new();

    let dict = DictionaryCache::new(pool.clone());
    dict.refresh_global().await;
    tokio::spawn(dict.clone().refresh_loop(DICTIONARY_REFRESH_INTERVAL));

    let bans = BanSet::load_from_storage(&pool).await?;
    let tts = Arc::new(TtsClient::new(config.clone()));

    let metrics_sampler = MetricsSampler::new();
    tokio::spawn(metrics_sampler.clone().run(METRICS_SAMPLE_INTERVAL));

    let session = SessionManager::new(
        pool.clone(),
        Arc::new(gateway_stub::UnconnectedVoiceTransport),
        queue.clone(),
        dict.clone(),
        tts.clone(),
        metrics_sampler.clone(),
        Arc::new(gateway_stub::NullResolverProvider),
        Arc::new(gateway_stub::NullNotificationSink),
        config.clone(),
    );

    session.load_autojoin_configs().await?;
    session.startup_recover().await;
    tokio::spawn(session.clone().sync_loop(RECONCILE_INTERVAL));

    let _router = EventRouter::new(queue.clone(), session.clone(), bans.clone(), Arc::new(gateway_stub::NullAckSink));

    tracing::info!("tts-relay core ready; awaiting a gateway adapter to drive it");
    shutdown_signal().await;
    tracing::info!("tts-relay shutting down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    tracing::info!("shutdown signal received");
}
