use std::sync::Arc;

use anyhow::Result;
use pv_ingest::{
    config::AppConfig,
    ingest::Ingestor,
    metrics_server, observability,
    store::PostgresStore,
    upload,
};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr);
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;

    let ingestor = Arc::new(Ingestor::new(PostgresStore::new(pool), &cfg.ingest));
    let app = upload::router(ingestor, cfg.upload.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&cfg.upload.bind_addr).await?;
    tracing::info!(addr = %cfg.upload.bind_addr, "upload server listening");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
