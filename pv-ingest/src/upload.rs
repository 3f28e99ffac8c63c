//! HTTP upload boundary: a multipart batch of logger export files plus an
//! optional logger-type hint. The hint is prefixed onto each filename so
//! filename-based detection can use it. Individual file failures are
//! recorded per file and never fail the batch response.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::ingest::{FileIngestResult, IngestStatus, Ingestor};
use crate::store::MeasurementStore;

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub logger_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadSummary {
    pub files_received: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub results: Vec<FileIngestResult>,
}

pub fn router<S: MeasurementStore + 'static>(
    ingestor: Arc<Ingestor<S>>,
    max_body_bytes: usize,
) -> Router {
    Router::new()
        .route("/ingest/files", post(ingest_files::<S>))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(ingestor)
}

async fn ingest_files<S: MeasurementStore + 'static>(
    State(ingestor): State<Arc<Ingestor<S>>>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<UploadSummary>, StatusCode> {
    metrics::counter!("upload_requests_total").increment(1);

    let mut results: Vec<FileIngestResult> = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable multipart request");
                return Err(StatusCode::BAD_REQUEST);
            }
        };

        let original = field
            .file_name()
            .or_else(|| field.name())
            .unwrap_or("upload.bin")
            .to_string();
        let filename = match params.logger_type.as_deref() {
            Some(hint) if !hint.is_empty() => format!("{hint}_{original}"),
            _ => original.clone(),
        };

        match field.bytes().await {
            Ok(data) => {
                results.push(ingestor.ingest_file(&filename, data.to_vec()).await);
            }
            Err(e) => {
                tracing::warn!(file = %original, error = %e, "failed to read upload part");
                results.push(FileIngestResult::failed(
                    &filename,
                    format!("failed to read upload part: {e}"),
                ));
            }
        }
    }

    let summary = UploadSummary {
        files_received: results.len(),
        files_completed: results
            .iter()
            .filter(|r| r.status == IngestStatus::Completed)
            .count(),
        files_failed: results
            .iter()
            .filter(|r| r.status == IngestStatus::Failed)
            .count(),
        files_skipped: results
            .iter()
            .filter(|r| r.status == IngestStatus::SystemFileSkipped)
            .count(),
        results,
    };

    Ok(Json(summary))
}
