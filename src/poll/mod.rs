//! Background feed pagination.
//!
//! Each active feed gets its own [`Engine`] running as a tokio task. Engines
//! report progress to the main loop over one shared [`mpsc`] channel of
//! [`PollMsg`]s and take [`Command`]s from their [`EngineHandle`].
//!
//! ## For contributors
//!
//! Engines never share state with each other or with the main loop; the only
//! things crossing task boundaries are the messages below. The [`Poller`]
//! owns the handles and is the one place that creates or retires engines.

mod engine;
mod pager;
mod timer;

pub use pager::PageSignal;

use engine::{Command, Engine};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{AudioRecord, Catalog};
use crate::config::{FeedConfig, Pacing};
use crate::segments::{SegmentRepo, SegmentStore};
use crate::source::{FeedId, MessageId, PageSource};

/// Messages sent from engine tasks to the main loop.
#[derive(Debug)]
pub enum PollMsg {
    /// A page request went out.
    Fetching { feed_id: FeedId, cursor: MessageId },
    /// Audio records seen for the first time.
    Items {
        feed_id: FeedId,
        items: Vec<AudioRecord>,
    },
    /// A page was settled and the next one is scheduled.
    Page {
        feed_id: FeedId,
        signal: PageSignal,
        cursor: MessageId,
        next_in: Duration,
    },
    /// The run is over; the feed is re-probed after `delay`.
    Resting { feed_id: FeedId, delay: Duration },
    /// A fetch or storage operation failed.
    Error { feed_id: FeedId, error: String },
    /// The engine was stopped.
    Ended { feed_id: FeedId },
}

impl PollMsg {
    pub fn feed_id(&self) -> FeedId {
        match self {
            PollMsg::Fetching { feed_id, .. }
            | PollMsg::Items { feed_id, .. }
            | PollMsg::Page { feed_id, .. }
            | PollMsg::Resting { feed_id, .. }
            | PollMsg::Error { feed_id, .. }
            | PollMsg::Ended { feed_id } => *feed_id,
        }
    }
}

/// Command side of a running engine task.
pub struct EngineHandle {
    feed_id: FeedId,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn feed_id(&self) -> FeedId {
        self.feed_id
    }

    /// Returns `false` if the engine task has already exited.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Stop the engine and wait for its task to finish.
    pub async fn shutdown(self) {
        let Self {
            feed_id,
            commands,
            task,
        } = self;
        let _ = commands.send(Command::Stop);
        drop(commands);
        if let Err(e) = task.await {
            warn!(feed_id, error = %e, "Engine task did not exit cleanly");
        }
    }
}

/// Spawn an engine for `feed`. It starts its first run immediately.
pub fn spawn_engine<S, R, C>(
    feed: FeedConfig,
    source: Arc<S>,
    store: SegmentStore<R>,
    catalog: Arc<C>,
    pacing: Pacing,
    events: mpsc::UnboundedSender<PollMsg>,
) -> EngineHandle
where
    S: PageSource + 'static,
    R: SegmentRepo + 'static,
    C: Catalog + 'static,
{
    let feed_id = feed.id;
    let (commands, rx) = mpsc::unbounded_channel();
    let engine = Engine::new(feed, source, store, catalog, pacing, events);
    let task = tokio::spawn(engine.run(rx));
    EngineHandle {
        feed_id,
        commands,
        task,
    }
}

/// Owner of every running engine.
pub struct Poller<S, R, C> {
    source: Arc<S>,
    store: SegmentStore<R>,
    catalog: Arc<C>,
    pacing: Pacing,
    events: mpsc::UnboundedSender<PollMsg>,
    engines: BTreeMap<FeedId, EngineHandle>,
}

impl<S, R, C> Poller<S, R, C>
where
    S: PageSource + 'static,
    R: SegmentRepo + 'static,
    C: Catalog + 'static,
{
    /// Create a poller and the receiver its engines report to.
    pub fn new(
        source: Arc<S>,
        store: SegmentStore<R>,
        catalog: Arc<C>,
        pacing: Pacing,
    ) -> (Self, mpsc::UnboundedReceiver<PollMsg>) {
        let (events, rx) = mpsc::unbounded_channel();
        let poller = Self {
            source,
            store,
            catalog,
            pacing,
            events,
            engines: BTreeMap::new(),
        };
        (poller, rx)
    }

    /// Start paginating `feed`. Returns `false` if it is already active, in
    /// which case its engine begins a new run from the top.
    pub fn activate(&mut self, feed: FeedConfig) -> bool {
        if let Some(handle) = self.engines.get(&feed.id) {
            debug!(feed_id = feed.id, "Feed already active, restarting run");
            handle.send(Command::Start);
            return false;
        }
        info!(feed_id = feed.id, title = %feed.title, "Activating feed");
        let handle = spawn_engine(
            feed,
            Arc::clone(&self.source),
            self.store.clone(),
            Arc::clone(&self.catalog),
            self.pacing,
            self.events.clone(),
        );
        self.engines.insert(handle.feed_id(), handle);
        true
    }

    /// Stop and forget the engine for `feed_id`. Returns `false` if the feed
    /// was not active.
    pub async fn deactivate(&mut self, feed_id: FeedId) -> bool {
        match self.engines.remove(&feed_id) {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Fire the pending wakeup of one feed, or of every feed for `None`.
    ///
    /// Returns how many engines were asked.
    pub fn fetch_now(&self, feed_id: Option<FeedId>) -> usize {
        self.engines
            .values()
            .filter(|h| feed_id.map_or(true, |id| h.feed_id() == id))
            .filter(|h| h.send(Command::FetchNow))
            .count()
    }

    #[cfg(test)]
    pub fn is_active(&self, feed_id: FeedId) -> bool {
        self.engines.contains_key(&feed_id)
    }

    #[cfg(test)]
    pub fn active(&self) -> impl Iterator<Item = FeedId> + '_ {
        self.engines.keys().copied()
    }

    /// Stop every engine and wait for all tasks to exit.
    pub async fn stop_all(&mut self) {
        let engines = std::mem::take(&mut self.engines);
        for (_, handle) in engines {
            handle.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
