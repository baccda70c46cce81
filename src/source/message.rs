//! The message record every page source produces.
//!
//! `Message` mirrors what the remote service hands back for one chat message.
//! Every field is optional: pages legitimately contain
//! half-populated or foreign records, and it is the classifier
//! ([`crate::catalog::classify`]) that decides whether an item is usable.
//!
//! ## Ordering
//!
//! `Message` implements [`Ord`] **newest-first** by message id; items without
//! an id sort last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Numeric id of a remote chat feed.
pub type FeedId = i64;

/// Numeric id of a message inside a feed. Ids grow with time.
pub type MessageId = i64;

/// Reserved id meaning "top of the timeline": no message is newer.
pub const LAST_MESSAGE_ID: MessageId = i64::MAX;

/// One message as delivered by a [`PageSource`](super::PageSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: Option<MessageId>,

    #[serde(default)]
    pub feed_id: Option<FeedId>,

    /// Send time, unix seconds on the wire.
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub content: Option<Content>,
}

/// Message payload, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Audio(AudioContent),
    Text {
        #[serde(default)]
        text: String,
    },
    Photo,
    Video,
    Document,
    VoiceNote,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioContent {
    pub title: Option<String>,
    pub performer: Option<String>,
    pub file_name: Option<String>,
    /// Seconds.
    pub duration: Option<u32>,
    pub mime_type: Option<String>,
    pub file: Option<RemoteFile>,
}

/// Transfer state of the file attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteFile {
    pub id: Option<i64>,
    pub size: Option<i64>,
    pub local_path: Option<String>,
    pub is_uploading_completed: bool,
    pub is_downloading_completed: bool,
}

// ---------------------------------------------------------------------------
// Ordering: newest first
// ---------------------------------------------------------------------------

impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        // `other` first gives descending ids; `None < Some(_)` sinks id-less
        // items to the end.
        other.id.cmp(&self.id)
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
