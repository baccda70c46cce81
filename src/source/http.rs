//! JSON-over-HTTP page source.
//!
//! Talks to a bridge process that fronts the messaging client and exposes
//! chat history as
//!
//! ```text
//! GET {base_url}/feeds/{feed_id}/messages?from_message_id=X&offset=O&limit=N
//! -> { "messages": [ { "id": .., "feed_id": .., "date": .., "content": {..} }, .. ] }
//! ```
//!
//! Use it as a template when wiring a native client instead.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{FeedId, Message, MessageId, PageSource};

#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    messages: Vec<Message>,
}

/// A page source backed by the HTTP bridge.
pub struct HttpSource {
    /// Bridge root, without trailing slash.
    pub base_url: String,
    /// Short name used in logs.
    pub label: String,
    client: reqwest::Client,
}

impl HttpSource {
    /// Create a new HTTP source.
    ///
    /// # Arguments
    ///
    /// * `base_url`: bridge root (e.g. `http://127.0.0.1:8088`).
    /// * `label`: short name shown in logs for this source.
    /// * `timeout`: per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        label: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedmirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            label: label.into(),
            client,
        })
    }

    /// URL of the history endpoint for `feed_id`.
    pub fn page_url(&self, feed_id: FeedId) -> String {
        format!("{}/feeds/{}/messages", self.base_url, feed_id)
    }

    /// Parse an already-fetched response body into messages.
    ///
    /// Pure (no I/O) so tests can exercise decoding without a server.
    pub fn parse_page(body: &str) -> Result<Vec<Message>> {
        let page: PageBody = serde_json::from_str(body).context("decoding page body")?;
        Ok(page.messages)
    }
}

#[async_trait]
impl PageSource for HttpSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn fetch_page(
        &self,
        feed_id: FeedId,
        from_message_id: MessageId,
        offset: i32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let body = self
            .client
            .get(self.page_url(feed_id))
            .query(&[
                ("from_message_id", from_message_id.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Self::parse_page(&body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
