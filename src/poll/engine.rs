//! The per-feed pagination engine.
//!
//! One [`Engine`] walks one feed's history backward, page by page:
//!
//! ```text
//!  start() ──► probe page (limit 1, cursor 0)
//!                  │
//!                  ▼
//!          walk items newest-first ──► known segment bound? ──► REACHED_KNOWN_SEGMENT
//!                  │                                            (merge, maybe rest)
//!                  ▼
//!            PAGE_LOADED (extend current)        empty page ──► ALL_HISTORY_LOADED
//!                  │                                            (rest, re-probe later)
//!                  ▼
//!       persist ─► arm timer (short, then medium) ─► next page
//! ```
//!
//! All state lives in the engine task; page fetches run as separate tasks and
//! post their answers back (see [`super::pager`]), so nothing here needs a lock.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::pager::{self, PageRequest, PageResponse, PageSignal, PageState};
use super::timer::Timer;
use super::PollMsg;
use crate::catalog::{classify_and_ingest, AudioRecord, Catalog, ContentKind};
use crate::config::{FeedConfig, Pacing};
use crate::error::{Error, Result};
use crate::segments::{Bound, SegmentRepo, SegmentSet, SegmentStore};
use crate::source::{Message, MessageId, PageSource, LAST_MESSAGE_ID};

/// Size of the first request of every run.
const PROBE_LIMIT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Fetching,
    AwaitingNext,
    /// Terminal for this engine instance.
    Stopped,
}

/// What the timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// Begin a new run from the top of the timeline.
    Restart,
    /// Fetch the page older than the given cursor.
    FetchPage(MessageId),
}

/// Requests from the engine's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    FetchNow,
    Stop,
}

pub struct Engine<S, R, C> {
    feed: FeedConfig,
    source: Arc<S>,
    store: SegmentStore<R>,
    catalog: Arc<C>,
    pacing: Pacing,
    events: mpsc::UnboundedSender<PollMsg>,
    responses_tx: mpsc::UnboundedSender<PageResponse>,
    responses: mpsc::UnboundedReceiver<PageResponse>,

    state: EngineState,
    timer: Timer<Wakeup>,
    segments: Option<SegmentSet>,
    /// Cursor recorded at the previous page completion of this run.
    last_msg_id_seen: MessageId,
    /// Pages scheduled this run, saturating at the short-delay budget.
    pages_this_run: u32,
    /// Set once a run has walked down to the start of the history.
    has_reached_end: bool,
    /// Bumped on every request and on stop; older responses are stale.
    generation: u64,
    fresh: Vec<AudioRecord>,
}

impl<S, R, C> Engine<S, R, C>
where
    S: PageSource + 'static,
    R: SegmentRepo,
    C: Catalog,
{
    pub fn new(
        feed: FeedConfig,
        source: Arc<S>,
        store: SegmentStore<R>,
        catalog: Arc<C>,
        pacing: Pacing,
        events: mpsc::UnboundedSender<PollMsg>,
    ) -> Self {
        let (responses_tx, responses) = mpsc::unbounded_channel();
        Self {
            feed,
            source,
            store,
            catalog,
            pacing,
            events,
            responses_tx,
            responses,
            state: EngineState::Idle,
            timer: Timer::new(),
            segments: None,
            last_msg_id_seen: 0,
            pages_this_run: 0,
            has_reached_end: false,
            generation: 0,
            fresh: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[cfg(test)]
    pub fn segments(&self) -> Option<&SegmentSet> {
        self.segments.as_ref()
    }

    #[cfg(test)]
    pub fn has_reached_end(&self) -> bool {
        self.has_reached_end
    }

    #[cfg(test)]
    pub fn timer(&self) -> &Timer<Wakeup> {
        &self.timer
    }

    /// Drive the engine until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.start_or_report().await;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(response) = self.responses.recv() => self.handle_response(response).await,
                wakeup = self.timer.expired() => self.dispatch(wakeup).await,
            }
        }
        self.stop();
        debug!(feed_id = self.feed.id, "Engine exited");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start_or_report().await,
            Command::FetchNow => {
                if !self.fetch_now().await {
                    debug!(feed_id = self.feed.id, state = ?self.state, "Nothing scheduled to fetch now");
                }
            }
            Command::Stop => self.stop(),
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Begin a run: reload segments, open a fresh current segment and probe
    /// the newest message. No-op once stopped.
    pub async fn start(&mut self) -> Result<()> {
        if self.state == EngineState::Stopped {
            debug!(feed_id = self.feed.id, "Ignoring start on stopped engine");
            return Ok(());
        }
        self.timer.cancel();
        self.last_msg_id_seen = 0;
        self.pages_this_run = 0;

        let mut set = self.store.load(self.feed.id, &self.feed.title).await?;
        set.insert_empty_current();
        info!(
            feed_id = self.feed.id,
            known_segments = set.finalized().len(),
            "Starting pagination run"
        );
        self.segments = Some(set);
        self.issue_fetch(0, PROBE_LIMIT);
        Ok(())
    }

    /// Start a run. Malformed stored segments park the feed until an operator
    /// starts it again; any other failure is retried after the long delay.
    pub(crate) async fn start_or_report(&mut self) {
        let Err(e) = self.start().await else {
            return;
        };
        error!(feed_id = self.feed.id, error = %e, "Could not start pagination");
        self.report(PollMsg::Error {
            feed_id: self.feed.id,
            error: e.to_string(),
        });
        match e {
            Error::MalformedSegments { .. } => self.state = EngineState::Idle,
            _ => self.rest(),
        }
    }

    /// Fire the armed timer immediately. Returns whether anything was armed.
    pub async fn fetch_now(&mut self) -> bool {
        let Some(wakeup) = self.timer.fire_now() else {
            return false;
        };
        info!(feed_id = self.feed.id, ?wakeup, "Fetching now");
        self.dispatch(wakeup).await;
        true
    }

    /// Cancel pending work and ignore anything still in flight. Sticky.
    pub fn stop(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }
        self.timer.cancel();
        self.generation += 1;
        self.state = EngineState::Stopped;
        info!(feed_id = self.feed.id, "Pagination stopped");
        self.report(PollMsg::Ended {
            feed_id: self.feed.id,
        });
    }

    async fn dispatch(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Restart => self.start_or_report().await,
            Wakeup::FetchPage(cursor) => self.issue_fetch(cursor, self.pacing.page_size),
        }
    }

    fn issue_fetch(&mut self, cursor: MessageId, limit: u32) {
        self.generation += 1;
        let request = PageRequest {
            feed_id: self.feed.id,
            cursor,
            limit,
            generation: self.generation,
        };
        self.state = EngineState::Fetching;
        debug!(feed_id = self.feed.id, cursor, limit, source = self.source.name(), "Requesting page");
        self.report(PollMsg::Fetching {
            feed_id: self.feed.id,
            cursor,
        });
        pager::spawn_fetch(Arc::clone(&self.source), request, self.responses_tx.clone());
    }

    // -- page handling -------------------------------------------------------

    pub(crate) async fn handle_response(&mut self, response: PageResponse) {
        let PageResponse { request, result } = response;
        if self.state == EngineState::Stopped || request.generation != self.generation {
            debug!(feed_id = self.feed.id, cursor = request.cursor, "Ignoring stale page");
            return;
        }

        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                warn!(feed_id = self.feed.id, cursor = request.cursor, error = %e, "Page fetch failed");
                self.report(PollMsg::Error {
                    feed_id: self.feed.id,
                    error: format!("{e:#}"),
                });
                // The next scheduled attempt is the retry.
                let wakeup = if request.cursor == 0 {
                    Wakeup::Restart
                } else {
                    Wakeup::FetchPage(request.cursor)
                };
                let delay = self.next_delay();
                self.schedule(delay, wakeup);
                return;
            }
        };

        let page = pager::prepare_page(messages, request.cursor);
        if let Err(e) = self.process_page(request, &page).await {
            error!(feed_id = self.feed.id, cursor = request.cursor, error = %e, "Page processing failed");
            self.report(PollMsg::Error {
                feed_id: self.feed.id,
                error: e.to_string(),
            });
            self.rest();
        }
    }

    /// Walk `page` item by item, then settle the page.
    pub(crate) async fn process_page(&mut self, request: PageRequest, page: &[Message]) -> Result<()> {
        let mut state = PageState::new(request.cursor);
        let mut signal = if page.is_empty() {
            PageSignal::AllHistoryLoaded
        } else {
            PageSignal::PageLoaded
        };

        for message in page {
            if let ControlFlow::Break(id) = self.on_item(message).await {
                signal = PageSignal::ReachedKnownSegment(id);
                break;
            }
            if let Some(id) = message.id {
                state.observe(id);
            }
        }

        if !self.fresh.is_empty() {
            let items = std::mem::take(&mut self.fresh);
            self.report(PollMsg::Items {
                feed_id: self.feed.id,
                items,
            });
        }
        self.on_page_done(state, signal).await
    }

    /// Visit one item. Breaks with the item's id when it sits on a bound of
    /// a finalized segment; otherwise classifies and ingests it.
    async fn on_item(&mut self, message: &Message) -> ControlFlow<MessageId> {
        if let Some(id) = message.id {
            let known = self.segments.as_ref().and_then(|set| set.search(id));
            if known.is_some() {
                return ControlFlow::Break(id);
            }
        }

        match classify_and_ingest(self.catalog.as_ref(), message).await {
            Ok((_, Some(upserted))) if upserted.is_new() => self.fresh.push(upserted.record),
            Ok((_, Some(upserted))) => {
                trace!(feed_id = self.feed.id, message_id = upserted.record.message_id, "Re-observed audio");
            }
            Ok((ContentKind::None, None)) => {
                trace!(feed_id = self.feed.id, message_id = message.id, "Skipping malformed item");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(feed_id = self.feed.id, message_id = message.id, error = %e, "Catalog upsert failed");
            }
        }
        ControlFlow::Continue(())
    }

    /// Settle a walked page: update the current segment, persist, and decide
    /// what happens next.
    pub(crate) async fn on_page_done(&mut self, page: PageState, signal: PageSignal) -> Result<()> {
        let cursor = match signal {
            PageSignal::AllHistoryLoaded => {
                self.caught_up(page, signal);
                return Ok(());
            }
            PageSignal::PageLoaded => {
                let last = page.last_id;
                if last == 0 || last == self.last_msg_id_seen || last == LAST_MESSAGE_ID {
                    self.caught_up(page, signal);
                    return Ok(());
                }
                self.last_msg_id_seen = last;
                self.extend_current(&page)?;
                self.current_set()?.current(Bound::Start)
            }
            PageSignal::ReachedKnownSegment(id) => {
                self.extend_current(&page)?;
                let merged = self.merge_into_known(id)?;
                if self.has_reached_end || merged == LAST_MESSAGE_ID {
                    info!(feed_id = self.feed.id, cursor = merged, "Reached known history that is already complete");
                    self.persist().await?;
                    self.rest();
                    return Ok(());
                }
                self.last_msg_id_seen = merged;
                merged
            }
        };

        self.persist().await?;

        if cursor == page.cursor {
            warn!(feed_id = self.feed.id, cursor, "Cursor did not advance, halting this run");
            self.rest();
            return Ok(());
        }

        let delay = self.next_delay();
        debug!(
            feed_id = self.feed.id,
            signal = signal.as_str(),
            cursor,
            visited = page.visited,
            delay_s = delay.as_secs(),
            "Page done"
        );
        self.report(PollMsg::Page {
            feed_id: self.feed.id,
            signal,
            cursor,
            next_in: delay,
        });
        self.schedule(delay, Wakeup::FetchPage(cursor));
        Ok(())
    }

    /// Grow the current segment down to the oldest item of `page`; the first
    /// page of a run also fixes its top.
    fn extend_current(&mut self, page: &PageState) -> Result<()> {
        if page.visited == 0 {
            return Ok(());
        }
        let set = self.current_set()?;
        if set.current(Bound::End) == 0 {
            set.set_current(Bound::End, page.first_id)?;
        }
        set.set_current(Bound::Start, page.last_id)
    }

    /// Move the frontier onto the finalized segment carrying `id` and merge
    /// with it when `id` is its entry bound. Returns the new cursor.
    fn merge_into_known(&mut self, id: MessageId) -> Result<MessageId> {
        let feed_id = self.feed.id;
        let set = self.current_set()?;
        let Some((index, bound)) = set.search(id) else {
            return Ok(set.current(Bound::Start));
        };
        let known = set.segments()[index];
        set.set_current(Bound::Start, known.start)?;
        if set.current(Bound::End) == 0 {
            set.set_current(Bound::End, known.end)?;
        }
        let merged = set.join_current_with(id);
        debug!(feed_id, id, ?bound, merged, "Reached known segment");
        Ok(set.current(Bound::Start))
    }

    fn caught_up(&mut self, page: PageState, signal: PageSignal) {
        self.has_reached_end = true;
        info!(
            feed_id = self.feed.id,
            signal = signal.as_str(),
            cursor = page.last_id,
            "History caught up"
        );
        self.rest();
    }

    // -- persistence and pacing ----------------------------------------------

    async fn persist(&mut self) -> Result<()> {
        let Some(set) = self.segments.as_mut() else {
            return Err(Error::NoCurrentSegment(self.feed.id));
        };
        if self.store.persist(set).await? {
            // Pick up whatever else changed the row meanwhile.
            self.segments = Some(self.store.load(self.feed.id, &self.feed.title).await?);
        }
        Ok(())
    }

    fn current_set(&mut self) -> Result<&mut SegmentSet> {
        self.segments
            .as_mut()
            .ok_or(Error::NoCurrentSegment(self.feed.id))
    }

    /// Short delay for the first pages of a run, medium afterwards.
    fn next_delay(&mut self) -> Duration {
        if self.pages_this_run < self.pacing.short_page_budget {
            self.pages_this_run += 1;
            self.pacing.short
        } else {
            self.pacing.medium
        }
    }

    fn schedule(&mut self, delay: Duration, wakeup: Wakeup) {
        self.timer.arm(delay, wakeup);
        self.state = EngineState::AwaitingNext;
    }

    /// Re-probe from the top after the long delay.
    fn rest(&mut self) {
        self.schedule(self.pacing.long, Wakeup::Restart);
        self.report(PollMsg::Resting {
            feed_id: self.feed.id,
            delay: self.pacing.long,
        });
    }

    fn report(&self, msg: PollMsg) {
        // A closed channel only means nobody is listening any more.
        let _ = self.events.send(msg);
    }

    #[cfg(test)]
    pub(crate) async fn next_response(&mut self) -> Option<PageResponse> {
        self.responses.recv().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use crate::catalog::MemoryCatalog;
    use crate::segments::{MemoryRepo, Segment};
    use crate::source::{AudioContent, Content, FeedId, RemoteFile};

    pub(crate) const FEED: FeedId = -100;

    pub(crate) fn audio(id: MessageId) -> Message {
        Message {
            id: Some(id),
            feed_id: Some(FEED),
            date: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(id)),
            content: Some(Content::Audio(AudioContent {
                title: Some(format!("Track {id}")),
                performer: None,
                file_name: None,
                duration: Some(120),
                mime_type: Some("audio/ogg".into()),
                file: Some(RemoteFile {
                    id: Some(id),
                    size: Some(100),
                    local_path: None,
                    is_uploading_completed: true,
                    is_downloading_completed: false,
                }),
            })),
        }
    }

    /// A chat held in memory, served newest-first like the real service.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        messages: Mutex<Vec<MessageId>>,
        requests: Mutex<Vec<(MessageId, u32)>>,
        failures: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn with_range(ids: std::ops::RangeInclusive<MessageId>) -> Self {
            let source = Self::default();
            source.messages.lock().unwrap().extend(ids);
            source
        }

        pub fn post(&self, ids: std::ops::RangeInclusive<MessageId>) {
            self.messages.lock().unwrap().extend(ids);
        }

        pub fn fail_next(&self, n: usize) {
            self.failures.store(n, Ordering::SeqCst);
        }

        pub fn cursors(&self) -> Vec<MessageId> {
            self.requests.lock().unwrap().iter().map(|(c, _)| *c).collect()
        }

        pub fn requests(&self) -> Vec<(MessageId, u32)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_page(
            &self,
            _feed_id: FeedId,
            from_message_id: MessageId,
            _offset: i32,
            limit: u32,
        ) -> anyhow::Result<Vec<Message>> {
            self.requests.lock().unwrap().push((from_message_id, limit));
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("connection reset");
            }
            let mut ids: Vec<MessageId> = self
                .messages
                .lock()
                .unwrap()
                .iter()
                .copied()
                .filter(|id| from_message_id == 0 || *id < from_message_id)
                .collect();
            ids.sort_unstable_by(|a, b| b.cmp(a));
            Ok(ids.into_iter().take(limit as usize).map(audio).collect())
        }
    }

    pub(crate) fn pacing() -> Pacing {
        Pacing {
            short: Duration::from_secs(5),
            medium: Duration::from_secs(20),
            long: Duration::from_secs(120),
            short_page_budget: 3,
            page_size: 50,
        }
    }

    pub(crate) fn feed() -> FeedConfig {
        FeedConfig {
            id: FEED,
            title: "Test feed".into(),
            enabled: true,
        }
    }

    type TestEngine = Engine<ScriptedSource, MemoryRepo, MemoryCatalog>;

    struct Harness {
        engine: TestEngine,
        source: Arc<ScriptedSource>,
        repo: Arc<MemoryRepo>,
        events: mpsc::UnboundedReceiver<PollMsg>,
    }

    fn harness(source: ScriptedSource, repo: MemoryRepo) -> Harness {
        let source = Arc::new(source);
        let repo = Arc::new(repo);
        let (tx, events) = mpsc::unbounded_channel();
        let engine = Engine::new(
            feed(),
            Arc::clone(&source),
            SegmentStore::new(Arc::clone(&repo)),
            Arc::new(MemoryCatalog::default()),
            pacing(),
            tx,
        );
        Harness {
            engine,
            source,
            repo,
            events,
        }
    }

    impl Harness {
        /// Deliver responses and skip page delays until the engine rests.
        async fn drive(&mut self) {
            loop {
                let response = self.engine.next_response().await.unwrap();
                self.engine.handle_response(response).await;
                match self.engine.timer().payload() {
                    Some(Wakeup::FetchPage(_)) => {
                        assert!(self.engine.fetch_now().await);
                    }
                    _ => break,
                }
            }
        }

        fn drain(&mut self) -> Vec<PollMsg> {
            let mut out = Vec::new();
            while let Ok(msg) = self.events.try_recv() {
                out.push(msg);
            }
            out
        }

        fn segment_pairs(&self) -> Vec<(MessageId, MessageId)> {
            self.engine
                .segments()
                .unwrap()
                .segments()
                .iter()
                .map(|s| (s.start, s.end))
                .collect()
        }

        fn stored(&self) -> Option<String> {
            self.repo
                .rows
                .lock()
                .unwrap()
                .get(&FEED)
                .map(|row| row.segments.clone())
        }
    }

    fn new_items(msgs: &[PollMsg]) -> usize {
        msgs.iter()
            .map(|m| match m {
                PollMsg::Items { items, .. } => items.len(),
                _ => 0,
            })
            .sum()
    }

    fn delays(msgs: &[PollMsg]) -> Vec<u64> {
        msgs.iter()
            .filter_map(|m| match m {
                PollMsg::Page { next_in, .. } => Some(next_in.as_secs()),
                _ => None,
            })
            .collect()
    }

    fn assert_disjoint(segments: &[Segment]) {
        for (i, a) in segments.iter().enumerate() {
            for b in &segments[i + 1..] {
                assert!(!a.touches(b), "{a:?} and {b:?} overlap or are adjacent");
            }
        }
    }

    fn assert_no_repeated_cursor(cursors: &[MessageId]) {
        for pair in cursors.windows(2) {
            assert_ne!(pair[0], pair[1], "two consecutive fetches with cursor {}", pair[0]);
        }
    }

    // -- first page ----------------------------------------------------------

    #[tokio::test]
    async fn first_page_sets_both_bounds_and_schedules_short_delay() {
        let mut h = harness(ScriptedSource::default(), MemoryRepo::default());
        h.engine.start().await.unwrap();

        let request = PageRequest {
            feed_id: FEED,
            cursor: 0,
            limit: 50,
            generation: 1,
        };
        let page: Vec<Message> = (951..=1000).rev().map(audio).collect();
        h.engine.process_page(request, &page).await.unwrap();

        assert_eq!(h.segment_pairs(), vec![(951, 1000)]);
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::FetchPage(951)));
        assert_eq!(h.engine.state(), EngineState::AwaitingNext);
        assert_eq!(delays(&h.drain()), vec![5]);
        assert_eq!(h.stored().as_deref(), Some("[[951,1000]]"));
    }

    #[tokio::test]
    async fn probe_uses_limit_one_then_page_size() {
        let mut h = harness(ScriptedSource::with_range(1..=10), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.drive().await;

        assert_eq!(h.source.requests(), vec![(0, 1), (10, 50), (1, 50)]);
    }

    // -- full walks ----------------------------------------------------------

    #[tokio::test]
    async fn walks_whole_history_then_rests() {
        let mut h = harness(ScriptedSource::with_range(1..=120), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.drive().await;

        assert_eq!(h.source.cursors(), vec![0, 120, 70, 20, 1]);
        assert_no_repeated_cursor(&h.source.cursors());
        assert_eq!(h.segment_pairs(), vec![(1, 120)]);
        assert_eq!(h.stored().as_deref(), Some("[[1,120]]"));
        assert!(h.engine.has_reached_end());
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));

        let msgs = h.drain();
        assert_eq!(new_items(&msgs), 120);
        // Budget of three short pages, then medium.
        assert_eq!(delays(&msgs), vec![5, 5, 5, 20]);
        assert!(matches!(msgs.last(), Some(PollMsg::Resting { delay, .. }) if delay.as_secs() == 120));
    }

    #[tokio::test]
    async fn resumes_from_stored_segments_without_rescanning() {
        let repo = MemoryRepo::default();
        repo.put_raw(FEED, "[[1,120]]");
        let mut h = harness(ScriptedSource::with_range(1..=130), repo);

        h.engine.start().await.unwrap();
        h.drive().await;

        // Probe, one page that runs into [1,120], then below 1.
        assert_eq!(h.source.cursors(), vec![0, 130, 1]);
        assert_eq!(h.segment_pairs(), vec![(1, 130)]);
        assert_eq!(h.stored().as_deref(), Some("[[1,130]]"));
        assert_eq!(new_items(&h.drain()), 10);
        assert_disjoint(h.engine.segments().unwrap().segments());
    }

    #[tokio::test]
    async fn new_messages_after_caught_up_merge_and_rest() {
        let mut h = harness(ScriptedSource::with_range(1..=120), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.drive().await;
        h.drain();

        h.source.post(121..=130);
        assert!(h.engine.fetch_now().await);
        h.drive().await;

        assert_eq!(h.segment_pairs(), vec![(1, 130)]);
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));
        assert_eq!(h.stored().as_deref(), Some("[[1,130]]"));
        assert_eq!(new_items(&h.drain()), 10);
        assert_no_repeated_cursor(&h.source.cursors());
    }

    #[tokio::test]
    async fn repeated_top_ups_keep_one_stored_segment() {
        let mut h = harness(ScriptedSource::with_range(1..=120), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.drive().await;
        h.drain();

        for id in 121..=123 {
            h.source.post(id..=id);
            assert!(h.engine.fetch_now().await);
            h.drive().await;
            assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));
        }
        assert_eq!(h.stored().as_deref(), Some("[[1,123]]"));
        assert_eq!(new_items(&h.drain()), 3);

        h.engine.start().await.unwrap();
        let set = h.engine.segments().unwrap();
        assert_eq!(set.finalized(), &[Segment::new(1, 123)]);
        assert_disjoint(set.finalized());
    }

    #[tokio::test]
    async fn reobserved_items_are_not_reported() {
        let mut h = harness(ScriptedSource::with_range(1..=5), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.drive().await;
        assert_eq!(new_items(&h.drain()), 5);

        // Lose the segment row; the catalog still knows every item.
        h.repo.rows.lock().unwrap().clear();
        assert!(h.engine.fetch_now().await);
        h.drive().await;

        assert_eq!(new_items(&h.drain()), 0);
        assert_eq!(h.segment_pairs(), vec![(1, 5)]);
    }

    // -- terminal conditions -------------------------------------------------

    #[tokio::test]
    async fn empty_feed_rests_without_writing() {
        let mut h = harness(ScriptedSource::default(), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.drive().await;

        assert_eq!(h.segment_pairs(), vec![(0, 0)]);
        assert_eq!(h.repo.writes(), 0);
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));
        assert!(h.engine.has_reached_end());
    }

    #[tokio::test]
    async fn cursor_equal_to_previous_page_is_caught_up() {
        let mut h = harness(ScriptedSource::default(), MemoryRepo::default());
        h.engine.start().await.unwrap();

        let mut page = PageState::new(0);
        page.observe(60);
        page.observe(50);
        h.engine.on_page_done(page, PageSignal::PageLoaded).await.unwrap();
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::FetchPage(50)));

        let mut again = PageState::new(40);
        again.observe(50);
        h.engine.on_page_done(again, PageSignal::PageLoaded).await.unwrap();

        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));
        assert!(h.engine.has_reached_end());
    }

    #[tokio::test]
    async fn sentinel_cursor_is_caught_up() {
        let mut h = harness(ScriptedSource::default(), MemoryRepo::default());
        h.engine.start().await.unwrap();

        let mut page = PageState::new(0);
        page.observe(LAST_MESSAGE_ID);
        h.engine.on_page_done(page, PageSignal::PageLoaded).await.unwrap();

        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));
        assert_eq!(h.segment_pairs(), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn non_advancing_cursor_is_not_fetched_again() {
        let mut h = harness(ScriptedSource::default(), MemoryRepo::default());
        h.engine.start().await.unwrap();

        let mut page = PageState::new(500);
        page.observe(600);
        page.observe(500);
        h.engine.on_page_done(page, PageSignal::PageLoaded).await.unwrap();

        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));
        assert!(!h.engine.has_reached_end());
    }

    // -- known segments ------------------------------------------------------

    #[tokio::test]
    async fn walking_into_entry_bound_merges() {
        let repo = MemoryRepo::default();
        repo.put_raw(FEED, "[[800,1000]]");
        let mut h = harness(ScriptedSource::default(), repo);
        h.engine.start().await.unwrap();

        let request = PageRequest {
            feed_id: FEED,
            cursor: 1201,
            limit: 50,
            generation: 1,
        };
        let page: Vec<Message> = (990..=1200).rev().step_by(10).map(audio).collect();
        h.engine.process_page(request, &page).await.unwrap();

        assert_eq!(h.segment_pairs(), vec![(800, 1200)]);
        let msgs = h.drain();
        assert!(msgs.iter().any(|m| matches!(
            m,
            PollMsg::Page { signal: PageSignal::ReachedKnownSegment(1000), cursor: 800, .. }
        )));
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::FetchPage(800)));
        // 1200..1010 are new; 1000 stops the walk.
        assert_eq!(new_items(&msgs), 20);
    }

    #[tokio::test]
    async fn walking_onto_start_bound_stores_the_outer_segment() {
        let repo = MemoryRepo::default();
        repo.put_raw(FEED, "[[800,1000]]");
        let mut h = harness(ScriptedSource::default(), repo);
        h.engine.start().await.unwrap();

        // 1000 is gone upstream; the walk enters the segment's interior.
        let request = PageRequest {
            feed_id: FEED,
            cursor: 1000,
            limit: 50,
            generation: 1,
        };
        let page = vec![audio(999), audio(900), audio(800), audio(700)];
        h.engine.process_page(request, &page).await.unwrap();

        // The current range ends up nested in the known one; only the outer
        // range is written, and the reload makes it the current segment.
        assert_eq!(h.stored().as_deref(), Some("[[800,1000]]"));
        assert_eq!(h.segment_pairs(), vec![(800, 1000)]);
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::FetchPage(800)));

        h.engine.start().await.unwrap();
        assert_disjoint(h.engine.segments().unwrap().finalized());
    }

    #[tokio::test]
    async fn probe_hitting_known_top_merges_immediately() {
        let repo = MemoryRepo::default();
        repo.put_raw(FEED, "[[1,50]]");
        let mut h = harness(ScriptedSource::with_range(1..=50), repo);
        h.engine.start().await.unwrap();
        h.drive().await;

        assert_eq!(h.source.cursors(), vec![0, 1]);
        assert_eq!(h.segment_pairs(), vec![(1, 50)]);
        assert_eq!(new_items(&h.drain()), 0);
    }

    // -- timer, stop, failures -----------------------------------------------

    #[tokio::test]
    async fn fetch_now_fires_long_delay_once() {
        let mut h = harness(ScriptedSource::default(), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.drive().await;
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));

        assert!(h.engine.fetch_now().await);
        assert!(!h.engine.timer().is_armed());
        assert_eq!(h.engine.state(), EngineState::Fetching);
        assert!(!h.engine.fetch_now().await);
    }

    #[tokio::test]
    async fn stop_ignores_in_flight_page_and_sticks() {
        let mut h = harness(ScriptedSource::with_range(1..=10), MemoryRepo::default());
        h.engine.start().await.unwrap();
        h.engine.stop();

        let response = h.engine.next_response().await.unwrap();
        h.engine.handle_response(response).await;

        assert_eq!(h.engine.state(), EngineState::Stopped);
        assert_eq!(h.segment_pairs(), vec![(0, 0)]);
        assert!(!h.engine.timer().is_armed());

        h.engine.start().await.unwrap();
        assert_eq!(h.engine.state(), EngineState::Stopped);
        assert_eq!(h.source.cursors(), vec![0]);
        assert!(h.drain().iter().any(|m| matches!(m, PollMsg::Ended { .. })));
    }

    #[tokio::test]
    async fn failed_fetch_retries_same_cursor_at_normal_cadence() {
        let mut h = harness(ScriptedSource::with_range(1..=60), MemoryRepo::default());
        h.engine.start().await.unwrap();
        let response = h.engine.next_response().await.unwrap();
        h.engine.handle_response(response).await;
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::FetchPage(60)));

        h.source.fail_next(1);
        assert!(h.engine.fetch_now().await);
        let response = h.engine.next_response().await.unwrap();
        h.engine.handle_response(response).await;
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::FetchPage(60)));
        assert!(h.drain().iter().any(|m| matches!(m, PollMsg::Error { .. })));

        assert!(h.engine.fetch_now().await);
        h.drive().await;
        assert_eq!(h.segment_pairs(), vec![(1, 60)]);
    }

    #[tokio::test]
    async fn sqlite_backed_run_persists_and_resumes() {
        use crate::db::{memory_pool, SqliteCatalog, SqliteSegmentRepo};

        let pool = memory_pool().await;
        let source = Arc::new(ScriptedSource::with_range(1..=60));
        let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
        let store = SegmentStore::new(Arc::new(SqliteSegmentRepo::new(pool.clone())));
        let (tx, _events) = mpsc::unbounded_channel();
        let mut engine = Engine::new(
            feed(),
            Arc::clone(&source),
            store.clone(),
            Arc::clone(&catalog),
            pacing(),
            tx,
        );

        engine.start().await.unwrap();
        loop {
            let response = engine.next_response().await.unwrap();
            engine.handle_response(response).await;
            if !matches!(engine.timer().payload(), Some(Wakeup::FetchPage(_))) {
                break;
            }
            engine.fetch_now().await;
        }

        assert_eq!(catalog.count(FEED).await.unwrap(), 60);
        let stored = store.load(FEED, "ignored").await.unwrap();
        assert_eq!(stored.segments(), &[Segment::new(1, 60)]);
        assert_eq!(stored.title, "Test feed");
    }

    #[tokio::test]
    async fn malformed_segments_abort_start() {
        let repo = MemoryRepo::default();
        repo.put_raw(FEED, "{oops");
        let mut h = harness(ScriptedSource::with_range(1..=3), repo);

        assert!(matches!(
            h.engine.start().await,
            Err(Error::MalformedSegments { .. })
        ));
        assert!(h.source.cursors().is_empty());

        h.engine.start_or_report().await;
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(!h.engine.timer().is_armed());
        assert!(h.drain().iter().any(|m| matches!(m, PollMsg::Error { .. })));
    }

    #[tokio::test]
    async fn storage_failure_on_start_retries_after_long_delay() {
        let repo = MemoryRepo::default();
        repo.fail_next_fetches(1);
        let mut h = harness(ScriptedSource::with_range(1..=3), repo);

        h.engine.start_or_report().await;
        assert_eq!(h.engine.timer().payload(), Some(&Wakeup::Restart));
        assert!(h.source.cursors().is_empty());
        let msgs = h.drain();
        assert!(msgs.iter().any(|m| matches!(m, PollMsg::Error { .. })));
        assert!(matches!(msgs.last(), Some(PollMsg::Resting { delay, .. }) if delay.as_secs() == 120));

        assert!(h.engine.fetch_now().await);
        h.drive().await;
        assert_eq!(h.segment_pairs(), vec![(1, 3)]);
        assert_eq!(h.stored().as_deref(), Some("[[1,3]]"));
    }
}
