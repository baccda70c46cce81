//! The audio catalog collaborator and the per-item classifier.
//!
//! The catalog itself is storage owned elsewhere; the engine only needs a
//! keyed upsert that tells it whether a record was already known. The SQLite
//! implementation lives in [`crate::db`].

mod classify;
mod record;

pub use classify::{classify_and_ingest, ContentKind};
pub use record::AudioRecord;

#[cfg(test)]
pub(crate) use record::tests::make_record;

use async_trait::async_trait;

use crate::error::Result;
use crate::source::{FeedId, MessageId};

/// Outcome of [`Catalog::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// The record as stored after the call.
    pub record: AudioRecord,
    /// A record with the same key was already catalogued.
    pub existed: bool,
    /// The stored record changed (always true for inserts).
    pub updated: bool,
}

impl Upserted {
    pub fn is_new(&self) -> bool {
        !self.existed
    }
}

/// Keyed storage of audio records.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Insert `record`, or refresh the mutable transfer fields of the existing
    /// record with the same `(feed_id, message_id)` when `record` is newer.
    async fn upsert(&self, record: &AudioRecord) -> Result<Upserted>;

    async fn get(&self, feed_id: FeedId, message_id: MessageId) -> Result<Option<AudioRecord>>;
}

#[cfg(test)]
pub(crate) use tests::MemoryCatalog;
