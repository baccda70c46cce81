use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tracing::info;

use crate::catalog::AudioRecord;
use crate::poll::{PageSignal, PollMsg};
use crate::source::{FeedId, MessageId};

/// How many recently catalogued records the console keeps around.
pub const RECENT_CAPACITY: usize = 200;

/// What a feed's engine was last reported doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Starting,
    Fetching { cursor: MessageId },
    Waiting { cursor: MessageId, next_in: Duration },
    Resting { delay: Duration },
    Stopped,
    Error(String),
}

impl FeedStatus {
    pub fn describe(&self) -> String {
        match self {
            FeedStatus::Starting => "starting".into(),
            FeedStatus::Fetching { cursor: 0 } => "probing newest message".into(),
            FeedStatus::Fetching { cursor } => format!("fetching before {cursor}"),
            FeedStatus::Waiting { cursor, next_in } => {
                format!("next page before {cursor} in {}s", next_in.as_secs())
            }
            FeedStatus::Resting { delay } => format!("caught up, re-probing in {}s", delay.as_secs()),
            FeedStatus::Stopped => "stopped".into(),
            FeedStatus::Error(e) => format!("error: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedView {
    pub title: String,
    pub status: FeedStatus,
    /// New records catalogued since the process started.
    pub new_items: usize,
    pub last_signal: Option<PageSignal>,
}

pub struct App {
    /// De-duplicated, newest-first records, capped at [`RECENT_CAPACITY`].
    pub recent: Vec<AudioRecord>,
    seen: HashSet<(FeedId, MessageId)>,
    pub feeds: BTreeMap<FeedId, FeedView>,
    /// Whether the operator has requested to quit.
    pub quit: bool,
}

impl App {
    pub fn new() -> Self {
        Self {
            recent: Vec::new(),
            seen: HashSet::new(),
            feeds: BTreeMap::new(),
            quit: false,
        }
    }

    pub fn track(&mut self, feed_id: FeedId, title: impl Into<String>) {
        let title = title.into();
        self.feeds
            .entry(feed_id)
            .and_modify(|view| view.status = FeedStatus::Starting)
            .or_insert(FeedView {
                title,
                status: FeedStatus::Starting,
                new_items: 0,
                last_signal: None,
            });
    }

    #[cfg(test)]
    pub fn status_of(&self, feed_id: FeedId) -> Option<&FeedStatus> {
        self.feeds.get(&feed_id).map(|view| &view.status)
    }

    /// Fold one engine message into the console state.
    pub fn apply(&mut self, msg: PollMsg) {
        let feed_id = msg.feed_id();
        match msg {
            PollMsg::Fetching { cursor, .. } => self.set_status(feed_id, FeedStatus::Fetching { cursor }),
            PollMsg::Items { items, .. } => {
                let added = self.merge_items(items);
                if let Some(view) = self.feeds.get_mut(&feed_id) {
                    view.new_items += added;
                }
                if added > 0 {
                    info!(feed_id, added, "New audio catalogued");
                }
            }
            PollMsg::Page {
                signal,
                cursor,
                next_in,
                ..
            } => {
                self.set_status(feed_id, FeedStatus::Waiting { cursor, next_in });
                if let Some(view) = self.feeds.get_mut(&feed_id) {
                    view.last_signal = Some(signal);
                }
            }
            PollMsg::Resting { delay, .. } => self.set_status(feed_id, FeedStatus::Resting { delay }),
            PollMsg::Error { error, .. } => self.set_status(feed_id, FeedStatus::Error(error)),
            PollMsg::Ended { .. } => self.set_status(feed_id, FeedStatus::Stopped),
        }
    }

    fn set_status(&mut self, feed_id: FeedId, status: FeedStatus) {
        match self.feeds.get_mut(&feed_id) {
            Some(view) => view.status = status,
            None => {
                self.feeds.insert(
                    feed_id,
                    FeedView {
                        title: format!("feed {feed_id}"),
                        status,
                        new_items: 0,
                        last_signal: None,
                    },
                );
            }
        }
    }

    /// Merge records into the recent cache, de-duplicate, and re-sort.
    ///
    /// Returns how many were not already cached.
    pub fn merge_items(&mut self, new_items: Vec<AudioRecord>) -> usize {
        let mut added = 0;
        for item in new_items {
            if self.seen.insert((item.feed_id, item.message_id)) {
                self.recent.push(item);
                added += 1;
            }
        }
        self.recent.sort();
        if self.recent.len() > RECENT_CAPACITY {
            for evicted in self.recent.drain(RECENT_CAPACITY..) {
                self.seen.remove(&(evicted.feed_id, evicted.message_id));
            }
        }
        added
    }

    pub fn status_lines(&self) -> Vec<String> {
        self.feeds
            .iter()
            .map(|(feed_id, view)| {
                format!(
                    "{feed_id} {:?}: {} ({} new)",
                    view.title,
                    view.status.describe(),
                    view.new_items
                )
            })
            .collect()
    }

    pub fn log_status(&self) {
        for line in self.status_lines() {
            info!("{line}");
        }
        if let Some(latest) = self.recent.first() {
            info!(
                feed_id = latest.feed_id,
                message_id = latest.message_id,
                "Latest: {}",
                latest.display_title()
            );
        }
    }
}
