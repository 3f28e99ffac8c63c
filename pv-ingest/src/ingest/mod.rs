//! Ingestion orchestrator: parser registry, format detection, streaming
//! batch upsert and per-file result accounting.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use pv_client::domain::UnifiedMeasurement;
use serde::Serialize;

use crate::config::IngestConfig;
use crate::parse::{
    EavCsvParser, EpochCsvParser, EuroCsvParser, FormatParser, MessungParser, ParseError,
    SectionCsvParser, SolarDbParser, StringGlobalParser, XmlExportParser,
    DETECTION_SNIPPET_BYTES,
};
use crate::store::MeasurementStore;

/// OS artifacts that show up in uploads and must never reach a parser.
const SYSTEM_FILE_NAMES: [&str; 3] = ["thumbs.db", "desktop.ini", "__macosx"];

/// Ordered parser registry. Registration order is part of the contract:
/// parsers with narrow signatures (binary magic, unique section markers) run
/// before the loose filename/content matchers, and the headerless EAV
/// fallback always runs last.
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn FormatParser>>,
}

impl ParserRegistry {
    pub fn with_default_parsers() -> Self {
        Self {
            parsers: vec![
                Arc::new(SolarDbParser::new()),
                Arc::new(XmlExportParser),
                Arc::new(MessungParser),
                Arc::new(SectionCsvParser),
                Arc::new(StringGlobalParser),
                Arc::new(EpochCsvParser),
                Arc::new(EuroCsvParser),
                Arc::new(EavCsvParser),
            ],
        }
    }

    pub fn from_parsers(parsers: Vec<Arc<dyn FormatParser>>) -> Self {
        Self { parsers }
    }

    /// First registered parser claiming the file wins.
    pub fn detect(&self, filename: &str, snippet: &[u8]) -> Option<Arc<dyn FormatParser>> {
        self.parsers
            .iter()
            .find(|p| p.can_handle(filename, snippet))
            .cloned()
    }

    pub fn supported_formats(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_default_parsers()
    }
}

/// True for filenames that are OS metadata artifacts rather than data files.
pub fn is_system_file(filename: &str) -> bool {
    let base = crate::parse::base_name(filename);
    base.starts_with('.')
        || SYSTEM_FILE_NAMES
            .iter()
            .any(|n| base.eq_ignore_ascii_case(n))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Completed,
    SystemFileSkipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileIngestResult {
    pub file_name: String,
    pub parser: Option<String>,
    pub status: IngestStatus,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_skipped: u64,
    /// File-level error, when the whole file failed.
    pub error: Option<String>,
    /// Bounded list of row-level error strings.
    pub row_errors: Vec<String>,
    pub duration_ms: u128,
}

impl FileIngestResult {
    fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            parser: None,
            status: IngestStatus::Failed,
            records_processed: 0,
            records_inserted: 0,
            records_skipped: 0,
            error: None,
            row_errors: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == IngestStatus::Completed
    }

    /// Result for a file that failed before reaching the orchestrator
    /// (e.g. its upload part could not be read).
    pub fn failed(file_name: &str, error: impl Into<String>) -> Self {
        let mut result = Self::new(file_name);
        result.error = Some(error.into());
        result
    }
}

pub struct Ingestor<S> {
    registry: ParserRegistry,
    store: S,
    batch_size: usize,
    max_row_errors: usize,
}

impl<S: MeasurementStore> Ingestor<S> {
    pub fn new(store: S, cfg: &IngestConfig) -> Self {
        Self::with_registry(store, ParserRegistry::with_default_parsers(), cfg)
    }

    pub fn with_registry(store: S, registry: ParserRegistry, cfg: &IngestConfig) -> Self {
        Self {
            registry,
            store,
            batch_size: cfg.batch_size.max(1),
            max_row_errors: cfg.max_row_errors,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Ingests one uploaded file: detection, streaming parse, batched upsert.
    /// Never panics or propagates an error; everything lands in the result.
    pub async fn ingest_file(&self, filename: &str, data: Vec<u8>) -> FileIngestResult {
        let started = Instant::now();
        let mut result = FileIngestResult::new(filename);

        if is_system_file(filename) {
            tracing::debug!(file = filename, "skipping system file");
            result.status = IngestStatus::SystemFileSkipped;
            result.duration_ms = started.elapsed().as_millis();
            return result;
        }

        let snippet = &data[..data.len().min(DETECTION_SNIPPET_BYTES)];
        let Some(parser) = self.registry.detect(filename, snippet) else {
            result.error = Some(format!(
                "no parser matched '{}'; supported formats: {}",
                filename,
                self.registry.supported_formats().join(", ")
            ));
            metrics::counter!("ingest_files_failed_total").increment(1);
            result.duration_ms = started.elapsed().as_millis();
            return result;
        };
        result.parser = Some(parser.name().to_string());
        tracing::info!(file = filename, parser = parser.name(), "ingesting file");

        let mut stream = parser.parse(filename, data);
        let mut batch: Vec<UnifiedMeasurement> = Vec::with_capacity(self.batch_size);
        let mut file_error: Option<String> = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(m) => {
                    result.records_processed += 1;
                    batch.push(m);
                    if batch.len() >= self.batch_size {
                        if let Err(e) = self.flush(&mut batch, &mut result).await {
                            file_error = Some(e);
                            break;
                        }
                    }
                }
                Err(ParseError::Row(msg)) => {
                    result.records_skipped += 1;
                    if result.row_errors.len() < self.max_row_errors {
                        result.row_errors.push(msg);
                    }
                }
                Err(ParseError::File(msg)) => {
                    file_error = Some(format!("{}: {}", parser.name(), msg));
                    break;
                }
            }
        }

        if file_error.is_none() && !batch.is_empty() {
            if let Err(e) = self.flush(&mut batch, &mut result).await {
                file_error = Some(e);
            }
        }

        result.status = if file_error.is_some() {
            result.error = file_error;
            IngestStatus::Failed
        } else if result.records_inserted == 0 {
            result.error = Some(format!(
                "{}: file produced no ingestible records",
                parser.name()
            ));
            IngestStatus::Failed
        } else {
            IngestStatus::Completed
        };
        result.duration_ms = started.elapsed().as_millis();

        match result.status {
            IngestStatus::Completed => {
                metrics::counter!("ingest_files_completed_total").increment(1);
            }
            _ => {
                metrics::counter!("ingest_files_failed_total").increment(1);
            }
        }
        metrics::histogram!("ingest_file_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            file = filename,
            status = ?result.status,
            processed = result.records_processed,
            inserted = result.records_inserted,
            skipped = result.records_skipped,
            "file ingest finished"
        );

        result
    }

    /// Flushes the current batch through the upsert contract. Rows already
    /// written by earlier batches stay committed even if this one fails.
    async fn flush(
        &self,
        batch: &mut Vec<UnifiedMeasurement>,
        result: &mut FileIngestResult,
    ) -> Result<(), String> {
        match self.store.upsert(batch).await {
            Ok(written) => {
                result.records_inserted += written;
                metrics::counter!("ingest_records_inserted_total").increment(written);
                batch.clear();
                Ok(())
            }
            Err(e) => {
                metrics::counter!("ingest_upsert_errors_total").increment(1);
                Err(e.to_string())
            }
        }
    }
}
