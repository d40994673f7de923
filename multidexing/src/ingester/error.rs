use thiserror::Error;

use crate::sources::SourceError;
use crate::RepoError;

/// Failures that stop a chain's fetcher
#[derive(Debug, Error)]
pub enum IngesterError {
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last_error: SourceError,
    },
    #[error("malformed source data: {0}")]
    Malformed(String),
    /// Every recorded block was reorged away
    #[error("reorg reaches below block {lowest_recorded_block}, outside the recorded window")]
    ReorgBeyondWindow { lowest_recorded_block: u64 },
    #[error(transparent)]
    Repo(#[from] RepoError),
}
