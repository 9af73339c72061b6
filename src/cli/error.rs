//! CLI error types and conversions

use crate::downloader::DownloadError;
use crate::fetcher::FetcherError;
use crate::output::OutputError;
use crate::runlog::RunLogError;
use crate::storage::StorageError;
use crate::worklist::WorkListError;

/// Run-level CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Work list could not be used
    #[error("work list error: {0}")]
    WorkListError(#[from] WorkListError),

    /// Download error
    #[error("download error: {0}")]
    DownloadError(#[from] DownloadError),

    /// Fetcher error
    #[error("fetcher error: {0}")]
    FetcherError(#[from] FetcherError),

    /// Output error
    #[error("output error: {0}")]
    OutputError(#[from] OutputError),

    /// Run log error
    #[error("run log error: {0}")]
    RunLogError(#[from] RunLogError),

    /// Blob store error
    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
