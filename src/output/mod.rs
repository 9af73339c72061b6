//! Data output writers

use crate::Record;

pub mod csv;
pub mod path;

pub use path::{OutputPaths, ResumeDecision};

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    Csv(String),

    /// A record's columns differ from the file's header
    #[error("record {row} does not match header: missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        /// Index of the offending record within its page
        row: usize,
        /// Header columns absent from the record
        missing: Vec<String>,
        /// Record columns absent from the header
        unexpected: Vec<String>,
    },

    /// Buffer flush error
    #[error("flush error: {0}")]
    Flush(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Generic output writer trait
pub trait OutputWriter {
    /// Flush any buffered data to disk
    fn flush(&mut self) -> OutputResult<()>;

    /// Close the writer and finalize output
    fn close(self) -> OutputResult<()>;
}

/// Writer for pages of dataset records
pub trait RecordsWriter: OutputWriter {
    /// Write a whole page; returns the number of data rows written
    ///
    /// Either the whole page is written or none of it is.
    fn write_page(&mut self, records: &[Record]) -> OutputResult<usize>;

    /// Data rows written so far, including rows found when resuming
    fn rows_written(&self) -> u64;
}
