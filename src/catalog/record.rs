//! The audio record stored in the catalog.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::source::{FeedId, MessageId};

/// One catalogued audio message, keyed by `(feed_id, message_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRecord {
    pub feed_id: FeedId,
    pub message_id: MessageId,
    pub date: DateTime<Utc>,

    /// Remote file id.
    pub file_id: i64,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub file_name: Option<String>,
    /// Seconds.
    pub duration: u32,
    pub mime_type: Option<String>,

    // Mutable transfer state; the only fields an upsert may change.
    pub size: i64,
    pub local_path: Option<String>,
    pub downloaded: bool,
}

impl AudioRecord {
    /// Title, falling back to the file name.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.file_name.as_deref())
            .unwrap_or("(untitled)")
    }

    /// Whether this observation carries materially newer transfer state than
    /// `existing`.
    pub fn is_newer_than(&self, existing: &AudioRecord) -> bool {
        let newly_downloaded = self.downloaded && !existing.downloaded;
        let grew = self.size > existing.size;
        let moved = self
            .local_path
            .as_deref()
            .is_some_and(|p| !p.is_empty() && existing.local_path.as_deref() != Some(p));
        newly_downloaded || grew || moved
    }
}

// Newest first: by date, then by message id.
impl Ord for AudioRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .date
            .cmp(&self.date)
            .then_with(|| other.message_id.cmp(&self.message_id))
            .then_with(|| self.feed_id.cmp(&other.feed_id))
    }
}

impl PartialOrd for AudioRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
