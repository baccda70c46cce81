//! Page requests: the network round trip and what comes back from it.
//!
//! The engine never awaits the remote service inline. [`spawn_fetch`] runs
//! the request as its own task and posts a [`PageResponse`] back on the
//! engine's channel, tagged with the request's generation so the engine can
//! drop answers it no longer wants (restarted or stopped meanwhile).

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::source::{FeedId, Message, MessageId, PageSource};

/// How a page ended, as decided by the engine while walking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
    /// Items were walked, none of them known.
    PageLoaded,
    /// The source had nothing older than the cursor.
    AllHistoryLoaded,
    /// The walk stopped on an id sitting on a finalized segment bound.
    ReachedKnownSegment(MessageId),
}

impl PageSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageSignal::PageLoaded => "page-loaded",
            PageSignal::AllHistoryLoaded => "all-history-loaded",
            PageSignal::ReachedKnownSegment(_) => "reached-known-segment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub feed_id: FeedId,
    /// Fetch messages older than this id; 0 for the newest.
    pub cursor: MessageId,
    pub limit: u32,
    pub generation: u64,
}

#[derive(Debug)]
pub struct PageResponse {
    pub request: PageRequest,
    pub result: anyhow::Result<Vec<Message>>,
}

/// What the walk over one page observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    /// Cursor the page was requested with.
    pub cursor: MessageId,
    /// First (newest) id walked, 0 if none.
    pub first_id: MessageId,
    /// Last (oldest) id walked, 0 if none. This is the page's cursor.
    pub last_id: MessageId,
    pub visited: usize,
}

impl PageState {
    pub fn new(cursor: MessageId) -> Self {
        Self {
            cursor,
            first_id: 0,
            last_id: 0,
            visited: 0,
        }
    }

    pub fn observe(&mut self, id: MessageId) {
        if self.visited == 0 {
            self.first_id = id;
        }
        self.last_id = id;
        self.visited += 1;
    }
}

/// Run `request` against `source` in the background and send the answer to
/// `responses`.
pub fn spawn_fetch<S>(
    source: Arc<S>,
    request: PageRequest,
    responses: mpsc::UnboundedSender<PageResponse>,
) where
    S: PageSource + ?Sized + 'static,
{
    tokio::spawn(async move {
        let result = source
            .fetch_page(request.feed_id, request.cursor, 0, request.limit)
            .await;
        if responses.send(PageResponse { request, result }).is_err() {
            // Engine gone; nothing to deliver to.
            debug!(feed_id = request.feed_id, "Dropped page response for closed engine");
        }
    });
}

/// Order a raw page newest-first, keep only ids strictly below a non-zero
/// `cursor` and drop duplicate ids.
///
/// Items without an id are kept (at the end) so the classifier can account
/// for them.
pub fn prepare_page(mut messages: Vec<Message>, cursor: MessageId) -> Vec<Message> {
    messages.retain(|m| match m.id {
        Some(id) => cursor == 0 || id < cursor,
        None => true,
    });
    messages.sort();
    messages.dedup_by(|a, b| a.id.is_some() && a.id == b.id);
    messages
}
