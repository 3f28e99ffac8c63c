//! Vendor-format detection and parsing.
//!
//! One parser per vendor export format, all behind [`FormatParser`]. Each
//! parser owns its detection heuristics, line/record grammar, timestamp
//! convention and field-semantics table; the shared pieces (numeric grammar,
//! field-name normalization, timestamp grammars) live in the sibling
//! modules.

pub mod eav_csv;
pub mod epoch_csv;
pub mod euro_csv;
pub mod fields;
pub mod messung;
pub mod section_csv;
pub mod solar_db;
pub mod string_global;
pub mod timestamp;
pub mod value;
pub mod xml_export;

use std::pin::Pin;

use futures::Stream;
use pv_client::domain::UnifiedMeasurement;

pub use eav_csv::EavCsvParser;
pub use epoch_csv::EpochCsvParser;
pub use euro_csv::EuroCsvParser;
pub use messung::MessungParser;
pub use section_csv::SectionCsvParser;
pub use solar_db::SolarDbParser;
pub use string_global::StringGlobalParser;
pub use xml_export::XmlExportParser;

/// How many bytes of file content `can_handle` gets to look at.
pub const DETECTION_SNIPPET_BYTES: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    /// One row could not be transformed. The stream continues; the
    /// orchestrator counts the skip.
    #[error("row error: {0}")]
    Row(String),
    /// The file as a whole is unusable (bad magic bytes, missing mandatory
    /// section, zero valid rows). Ends the stream.
    #[error("file error: {0}")]
    File(String),
}

impl ParseError {
    pub fn row(msg: impl Into<String>) -> Self {
        ParseError::Row(msg.into())
    }

    pub fn file(msg: impl Into<String>) -> Self {
        ParseError::File(msg.into())
    }
}

/// Lazy, pull-based sequence of canonical records. `Err(Row)` items mark
/// skipped rows; an `Err(File)` item terminates the file.
pub type MeasurementStream =
    Pin<Box<dyn Stream<Item = Result<UnifiedMeasurement, ParseError>> + Send>>;

pub trait FormatParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Cheap, non-destructive detection on the filename and a content
    /// snippet of at most [`DETECTION_SNIPPET_BYTES`]. Must never panic.
    fn can_handle(&self, filename: &str, snippet: &[u8]) -> bool;

    /// Streams canonical records out of the file bytes. Malformed rows are
    /// yielded as `ParseError::Row` and parsing continues; a fundamentally
    /// unparsable file (or zero valid rows overall) ends with
    /// `ParseError::File`.
    fn parse(&self, filename: &str, data: Vec<u8>) -> MeasurementStream;
}

/// Strips any directory path from an upload filename; detection patterns all
/// work on the bare name.
pub fn base_name(filename: &str) -> &str {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
}
