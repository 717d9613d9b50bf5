//! Error taxonomy for the scrape pipeline. Transport,
//! decode and persistence errors carry enough context to log and
//! count without aborting whatever they occurred inside; cycle-fatal
//! and configuration errors are the only variants that stop a cycle
//! or the process outright.

use crate::types::BookSlug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("transport error fetching from {book}: {source}")]
    Transport {
        book: BookSlug,
        #[source]
        source: reqwest::Error,
    },

    #[error("decode error for {book} record {raw}: {source}")]
    Decode {
        book: BookSlug,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("cycle aborted: {0}")]
    CycleFatal(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ScrapeError {
    pub fn is_fatal_to_cycle(&self) -> bool {
        matches!(self, ScrapeError::CycleFatal(_) | ScrapeError::Persistence(_))
    }
}

/// Result of one `(event, book)` fetch attempt — isolated so a
/// transient failure on one book never aborts the other books.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Ok(T),
    Err(ScrapeError),
}

impl<T> FetchOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            FetchOutcome::Ok(v) => Some(v),
            FetchOutcome::Err(_) => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, FetchOutcome::Ok(_))
    }
}
