//! Durable load/persist of [`SegmentSet`]s with no-op write suppression.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{SegmentRow, SegmentSet};
use crate::error::Result;
use crate::source::FeedId;

/// Key-based access to segment rows, one row per feed.
#[async_trait]
pub trait SegmentRepo: Send + Sync {
    async fn fetch(&self, feed_id: FeedId) -> Result<Option<SegmentRow>>;

    /// Insert or replace the row for `row.feed_id`.
    async fn upsert(&self, row: &SegmentRow) -> Result<()>;
}

/// Segment persistence for one or more feeds.
pub struct SegmentStore<R> {
    repo: Arc<R>,
}

impl<R> Clone for SegmentStore<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: SegmentRepo> SegmentStore<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Load the set for `feed_id`, or an empty one named `title` if no row
    /// exists yet.
    pub async fn load(&self, feed_id: FeedId, title: &str) -> Result<SegmentSet> {
        match self.repo.fetch(feed_id).await? {
            Some(row) => SegmentSet::from_row(row),
            None => Ok(SegmentSet::empty(feed_id, title)),
        }
    }

    /// Write `set` if it differs from what was last loaded or written.
    ///
    /// Returns whether a write happened.
    pub async fn persist(&self, set: &mut SegmentSet) -> Result<bool> {
        if !set.has_pending_changes() {
            return Ok(false);
        }
        let row = set.to_row();
        self.repo.upsert(&row).await?;
        set.mark_persisted();
        debug!(feed_id = set.feed_id, segments = %row.segments, "Persisted segments");
        Ok(true)
    }
}
