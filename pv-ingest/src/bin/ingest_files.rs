use anyhow::{bail, Result};
use pv_ingest::{
    config::AppConfig,
    ingest::{IngestStatus, Ingestor},
    observability,
    store::PostgresStore,
};
use sqlx::postgres::PgPoolOptions;
use std::env;

/// Backfill CLI: ingests logger export files straight from disk, one file at
/// a time, through the same orchestrator the upload endpoint uses.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: ingest_files <export_file>...");
    }

    // Load configuration (can point PV_INGEST_CONFIG to a backfill-specific file).
    let cfg = AppConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.uri)
        .await?;

    let ingestor = Ingestor::new(PostgresStore::new(pool), &cfg.ingest);

    let mut failed = 0usize;
    for path in &args[1..] {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(file = %path, error = %e, "failed to read file");
                failed += 1;
                continue;
            }
        };

        let result = ingestor.ingest_file(path, data).await;
        println!(
            "{path}: {:?} (parser: {}, processed: {}, inserted: {}, skipped: {}{})",
            result.status,
            result.parser.as_deref().unwrap_or("-"),
            result.records_processed,
            result.records_inserted,
            result.records_skipped,
            result
                .error
                .as_deref()
                .map(|e| format!(", error: {e}"))
                .unwrap_or_default(),
        );
        if result.status == IngestStatus::Failed {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{failed} file(s) failed to ingest");
    }
    Ok(())
}
