use quotr::check::CheckCoordinator;
use quotr::clock::SystemClock;
use quotr::config::loader::load_config;
use quotr::config::watcher::watch_policy_file;
use quotr::config::{AppConfig, DistributedBackend, PolicySourceKind};
use quotr::events::{EventPublisher, KafkaEventPublisher, TracingEventPublisher};
use quotr::limiter::{DistributedBucketStore, InMemoryBucketStore, LocalBucketEngine};
use quotr::policy::{FilePolicySource, HttpPolicySource, PolicyCache, PolicySource, PolicySyncer};
use quotr::redis::{create_redis_pool, RedisBucketStore};
use quotr::{start_server, AppState, QuotaError};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MARKER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotr=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quota Service Starting...");

    let config = load_config()?;

    let policies = Arc::new(PolicyCache::new());
    start_policy_sync(&config, Arc::clone(&policies)).await?;

    let max_buckets = NonZeroUsize::new(config.local.max_buckets).ok_or_else(|| {
        QuotaError::ConfigurationError("max_buckets must be greater than 0".to_string())
    })?;
    let local = Arc::new(LocalBucketEngine::new(max_buckets));

    let distributed = build_distributed_store(&config).await?;
    let publisher = build_publisher(&config)?;

    let coordinator = CheckCoordinator::new(
        policies,
        local,
        distributed,
        publisher,
        Arc::new(SystemClock),
    )
    .with_store_timeout(config.redis.command_timeout())
    .with_replay_ttl(config.redis.idempotency_ttl());
    let coordinator = Arc::new(coordinator);

    let purged = Arc::clone(&coordinator);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MARKER_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            purged.purge_replays();
        }
    });

    let state = AppState { coordinator };

    start_server(config.server.clone(), state).await?;

    Ok(())
}

/// Load policies once before serving, then keep them in sync in the background.
async fn start_policy_sync(config: &AppConfig, cache: Arc<PolicyCache>) -> quotr::Result<()> {
    let source: Arc<dyn PolicySource> = match config.policy.source {
        PolicySourceKind::Http => Arc::new(HttpPolicySource::new(
            &config.policy.control_plane_url,
            config.policy.fetch_timeout(),
        )?),
        PolicySourceKind::File => Arc::new(FilePolicySource::new(config.policy.file.clone())),
    };

    let syncer = Arc::new(PolicySyncer::new(
        source,
        cache,
        config.policy.sync_interval(),
        config.policy.fetch_timeout(),
    ));

    match syncer.sync_once().await {
        Ok(count) => tracing::info!("Initial policy sync loaded {} policies", count),
        Err(e) => tracing::warn!("Initial policy sync failed, starting with no policies: {}", e),
    }

    if config.policy.source == PolicySourceKind::File && config.policy.watch_file {
        let path = config.policy.file.clone();
        let trigger = syncer.trigger();
        tokio::spawn(async move {
            if let Err(e) = watch_policy_file(path, trigger).await {
                tracing::error!("Policy file watcher stopped: {}", e);
            }
        });
    }

    tokio::spawn(Arc::clone(&syncer).run());
    Ok(())
}

async fn build_distributed_store(config: &AppConfig) -> quotr::Result<Arc<dyn DistributedBucketStore>> {
    match config.backend {
        DistributedBackend::Redis => {
            let pool = create_redis_pool(&config.redis).await?;
            let store = RedisBucketStore::new(pool, config.redis.idempotency_ttl()).await?;
            Ok(Arc::new(store))
        }
        DistributedBackend::Memory => {
            let store = Arc::new(InMemoryBucketStore::new(config.redis.idempotency_ttl()));
            let purged = Arc::clone(&store);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MARKER_PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    purged.purge_expired(chrono::Utc::now().timestamp_millis());
                }
            });
            Ok(store)
        }
    }
}

fn build_publisher(config: &AppConfig) -> quotr::Result<Arc<dyn EventPublisher>> {
    match &config.events.brokers {
        Some(brokers) => Ok(Arc::new(KafkaEventPublisher::from_config(&config.events, brokers)?)),
        None => Ok(Arc::new(TracingEventPublisher)),
    }
}
