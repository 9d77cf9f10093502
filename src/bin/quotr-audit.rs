use quotr::audit::{AuditConsumer, AuditIngestor, AuditStore, SqliteAuditStore};
use quotr::config::loader::load_audit_config;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotr=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quota Audit Service Starting...");

    let config = load_audit_config()?;

    let store = SqliteAuditStore::connect(&config.database_url).await?;
    tracing::info!("Audit records on startup: {}", store.count().await?);
    let ingestor = Arc::new(AuditIngestor::new(Arc::new(store.clone())));

    let mut handles = Vec::with_capacity(config.consumers);
    for index in 0..config.consumers {
        let consumer = AuditConsumer::new(&config, Arc::clone(&ingestor), index)?;
        handles.push(tokio::spawn(consumer.run()));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down audit consumers");

    for handle in handles {
        handle.abort();
    }
    store.close().await;

    Ok(())
}
