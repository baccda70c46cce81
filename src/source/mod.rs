//! Page source abstraction layer.
//!
//! This module defines the [`PageSource`] trait (the paginated history fetch
//! the engine consumes) and the common [`Message`] type. Concrete sources live
//! in sub-modules (currently only [`http`]).
//!
//! ## For contributors: adding a new source
//!
//! 1. Create a new file in this directory (e.g. `mtproto.rs`).
//! 2. Define a struct holding the client state and implement [`PageSource`].
//! 3. Add `mod mtproto;` below and re-export your struct.
//! 4. Construct it in `main.rs` instead of [`HttpSource`].
//!
//! Sources know nothing about segments or the catalog; the engine does all of
//! that on top of plain pages.

mod http;
mod message;

pub use http::HttpSource;
pub use message::{AudioContent, Content, FeedId, Message, MessageId, LAST_MESSAGE_ID};

#[cfg(test)]
pub use message::RemoteFile;

use anyhow::Result;
use async_trait::async_trait;

/// Paginated access to a feed's message history.
///
/// ## Contract
///
/// `fetch_page(feed, from, offset, limit)` returns up to `limit` messages
/// older than `from`, newest first. `from == 0` means "start at the newest
/// message". An empty page means no more history exists below `from`.
///
/// Errors are transient from the caller's point of view: the engine simply
/// tries again on its next scheduled page.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Human-readable label used in logs.
    fn name(&self) -> &str;

    async fn fetch_page(
        &self,
        feed_id: FeedId,
        from_message_id: MessageId,
        offset: i32,
        limit: u32,
    ) -> Result<Vec<Message>>;
}
