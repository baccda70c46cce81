//! Covered message-id ranges, per feed.
//!
//! A [`SegmentSet`] is an ordered list of inclusive `[start, end]` id ranges.
//! Index 0 is the *current* segment, the one the running pagination extends;
//! every other index is a finalized range that was fully ingested by an earlier
//! run. Bounds are numeric (`start <= end`), so `start` is the oldest covered id
//! and `end` the newest.
//!
//! Pagination walks backward in time, so the current segment grows downward:
//! its `end` is set once from the first item of a run and its `start` is the
//! frontier. Walking down, the first bound of a finalized segment the frontier
//! can touch is that segment's `end`, its *entry* bound.
//!
//! Everything in this module is pure in-memory state; persistence lives in
//! [`store`].

mod store;

pub use store::{SegmentRepo, SegmentStore};

#[cfg(test)]
pub(crate) use store::tests::MemoryRepo;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::source::{FeedId, MessageId};

/// Inclusive range of message ids, serialized as a `[start, end]` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(MessageId, MessageId)", into = "(MessageId, MessageId)")]
pub struct Segment {
    pub start: MessageId,
    pub end: MessageId,
}

impl Segment {
    pub fn new(start: MessageId, end: MessageId) -> Self {
        Self { start, end }
    }

    /// `[0, 0]` marks a current segment that has not seen any item yet.
    pub fn is_unset(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn bound(&self, bound: Bound) -> MessageId {
        match bound {
            Bound::Start => self.start,
            Bound::End => self.end,
        }
    }

    pub fn contains(&self, other: &Segment) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two ranges share an id or sit next to each other.
    pub fn touches(&self, other: &Segment) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

impl From<(MessageId, MessageId)> for Segment {
    fn from((start, end): (MessageId, MessageId)) -> Self {
        Self { start, end }
    }
}

impl From<Segment> for (MessageId, MessageId) {
    fn from(segment: Segment) -> Self {
        (segment.start, segment.end)
    }
}

/// Which side of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

/// Persisted shape of one feed's segment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRow {
    pub feed_id: FeedId,
    pub title: String,
    pub original_title: String,
    /// JSON list of `[start, end]` pairs, current segment first.
    pub segments: String,
}

/// The covered ranges of one feed plus the snapshot used for change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSet {
    pub feed_id: FeedId,
    pub title: String,
    pub original_title: String,
    segments: Vec<Segment>,
    /// Serialized form as of the last load or successful persist.
    snapshot: String,
}

impl SegmentSet {
    /// A set with no segments at all, as synthesized for a feed without a row.
    pub fn empty(feed_id: FeedId, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            feed_id,
            original_title: title.clone(),
            title,
            segments: Vec::new(),
            snapshot: "[]".to_string(),
        }
    }

    /// Decode a stored row. Malformed JSON is an error, never an empty set.
    pub fn from_row(row: SegmentRow) -> Result<Self> {
        let segments: Vec<Segment> =
            serde_json::from_str(&row.segments).map_err(|source| Error::MalformedSegments {
                feed_id: row.feed_id,
                source,
            })?;
        let mut set = Self {
            feed_id: row.feed_id,
            title: row.title,
            original_title: row.original_title,
            segments,
            snapshot: String::new(),
        };
        set.snapshot = set.serialized();
        Ok(set)
    }

    pub fn to_row(&self) -> SegmentRow {
        SegmentRow {
            feed_id: self.feed_id,
            title: self.title.clone(),
            original_title: self.original_title.clone(),
            segments: self.serialized(),
        }
    }

    /// Canonical JSON form, e.g. `[[951,1000],[500,800]]`.
    pub fn serialized(&self) -> String {
        // A Vec of integer pairs always serializes.
        serde_json::to_string(&self.canonical()).unwrap_or_else(|_| "[]".to_string())
    }

    /// The segments as they are persisted. A range nested inside another one
    /// is absorbed by the outer range, which takes the earlier list position,
    /// so index 0 keeps pointing at the range holding the frontier.
    fn canonical(&self) -> Vec<Segment> {
        let mut out: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for &segment in &self.segments {
            if segment.is_unset() {
                out.push(segment);
                continue;
            }
            if out.iter().any(|kept| !kept.is_unset() && kept.contains(&segment)) {
                continue;
            }
            match out.iter().position(|kept| !kept.is_unset() && segment.contains(kept)) {
                Some(first) => {
                    out[first] = segment;
                    let mut index = first + 1;
                    while index < out.len() {
                        if !out[index].is_unset() && segment.contains(&out[index]) {
                            out.remove(index);
                        } else {
                            index += 1;
                        }
                    }
                }
                None => out.push(segment),
            }
        }
        out
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Finalized segments, i.e. everything but index 0.
    pub fn finalized(&self) -> &[Segment] {
        self.segments.get(1..).unwrap_or_default()
    }

    /// A bound of the current segment, or 0 when there are no segments.
    pub fn current(&self, bound: Bound) -> MessageId {
        self.segments.first().map_or(0, |s| s.bound(bound))
    }

    pub fn set_current(&mut self, bound: Bound, value: MessageId) -> Result<()> {
        let current = self
            .segments
            .first_mut()
            .ok_or(Error::NoCurrentSegment(self.feed_id))?;
        match bound {
            Bound::Start => current.start = value,
            Bound::End => current.end = value,
        }
        Ok(())
    }

    /// Prepend a fresh `[0, 0]` current segment. Called once per run; the
    /// previous current segment becomes finalized history.
    pub fn insert_empty_current(&mut self) {
        self.segments.insert(0, Segment::default());
    }

    /// Find `message_id` on a bound of a finalized segment.
    ///
    /// Returns `(index, bound)` of the first segment in list order carrying the
    /// id. Each segment is checked on its entry bound (`end`) first.
    pub fn search(&self, message_id: MessageId) -> Option<(usize, Bound)> {
        self.segments
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(index, segment)| {
                if segment.end == message_id {
                    Some((index, Bound::End))
                } else if segment.start == message_id {
                    Some((index, Bound::Start))
                } else {
                    None
                }
            })
    }

    /// Merge the current segment into the finalized segment whose entry bound
    /// is `message_id`.
    ///
    /// A match on the other bound is left alone: the frontier only reaches a
    /// segment's `start` after walking through its interior, and that case is
    /// not treated as contiguous. Returns whether a merge happened.
    pub fn join_current_with(&mut self, message_id: MessageId) -> bool {
        let Some((index, Bound::End)) = self.search(message_id) else {
            return false;
        };
        let known = self.segments.remove(index);
        let current = &mut self.segments[0];
        if current.is_unset() {
            *current = known;
        } else {
            current.start = current.start.min(known.start);
            current.end = current.end.max(known.end);
        }
        true
    }

    pub fn has_pending_changes(&self) -> bool {
        self.serialized() != self.snapshot
    }

    /// Record the current contents as persisted.
    pub fn mark_persisted(&mut self) {
        self.snapshot = self.serialized();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
