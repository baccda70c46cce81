//! Error taxonomy shared by the segment store, the catalog and the engine.
//!
//! Fetch failures are not represented here: they come back from
//! [`PageSource`](crate::source::PageSource) as [`anyhow::Error`] and are
//! treated as transient by the engine.

use thiserror::Error;

use crate::source::FeedId;

#[derive(Debug, Error)]
pub enum Error {
    /// The persisted segment list for a feed could not be decoded.
    ///
    /// Always surfaced to the caller of `load`; the row is never reset to empty.
    #[error("malformed segments for feed {feed_id}: {source}")]
    MalformedSegments {
        feed_id: FeedId,
        #[source]
        source: serde_json::Error,
    },

    /// A current-segment operation ran before `insert_empty_current`.
    #[error("segment set for feed {0} has no current segment")]
    NoCurrentSegment(FeedId),

    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
