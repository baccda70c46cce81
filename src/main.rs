//! feedmirror: incrementally mirrors the audio messages of chat feeds into a
//! local SQLite catalog, resuming where it left off.
//!
//! ## Architecture overview
//!
//! ```text
//! ┌───────────┐ fetch_page ┌───────────┐  PollMsg   ┌──────────┐
//! │ source/   │ ◄───────── │  poll/    │ ─────────► │  app.rs  │
//! │ (bridge)  │            │ (engines) │ (channel)  │ (status) │
//! └───────────┘            └───────────┘            └──────────┘
//!                           │        │                   ▲
//!                  load/    │        │ upsert            │ handle_line()
//!                  persist  ▼        ▼                   │
//!                  ┌───────────┐ ┌───────────┐     ┌──────────┐
//!                  │ segments/ │ │ catalog/  │     │ input.rs │
//!                  └───────────┘ └───────────┘     └──────────┘
//!                         └── db/ (SQLite) ──┘
//! ```
//!
//! * **`source/`**: the `PageSource` trait, the message model and the HTTP
//!   bridge client.
//! * **`segments/`**: covered id ranges per feed and their persistence.
//! * **`catalog/`**: item classification and the audio catalog port.
//! * **`poll/`**: one pagination engine task per feed, plus the `Poller`
//!   that owns them.
//! * **`db/`**: SQLite pool, schema and the adapters for both ports.
//! * **`app`** / **`input`**: operator console state and stdin commands.
//! * **`main`**: wires everything together and runs the event loop.

mod app;
mod catalog;
mod config;
mod db;
mod error;
mod input;
mod logging;
mod poll;
mod segments;
mod source;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use app::App;
use config::Config;
use db::{SqliteCatalog, SqliteSegmentRepo};
use input::Control;
use poll::Poller;
use segments::SegmentStore;
use source::HttpSource;

type MirrorPoller = Poller<HttpSource, SqliteSegmentRepo, SqliteCatalog>;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // -- configuration and logging -------------------------------------------
    let config_path = config::pick_config_path();
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    logging::init_logging(&config.log_level);
    info!(
        config = %config_path.display(),
        feeds = config.feeds.len(),
        "Starting feedmirror"
    );

    // -- storage -------------------------------------------------------------
    let pool = db::open(&config.database_path).await?;
    db::migrate(&pool).await?;

    // -- engines -------------------------------------------------------------
    let source = Arc::new(HttpSource::new(
        config.source.base_url.as_str(),
        config.source.label.as_str(),
        config.source.timeout,
    )?);
    let store = SegmentStore::new(Arc::new(SqliteSegmentRepo::new(pool.clone())));
    let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
    let (mut poller, mut rx) = Poller::new(source, store, catalog, config.pacing);

    let mut app = App::new();
    for feed in config.enabled_feeds() {
        app.track(feed.id, feed.title.as_str());
        poller.activate(feed.clone());
    }

    // -- main event loop -----------------------------------------------------
    // Each iteration handles one of:
    //   1. a message from an engine,
    //   2. a console line (until stdin closes),
    //   3. Ctrl-C.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    info!("{}", input::HELP);

    loop {
        tokio::select! {
            Some(msg) = rx.recv() => app.apply(msg),
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some(control) = input::handle_line(&mut app, &line) {
                        run_control(&mut poller, &mut app, &config, control).await;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, engines keep running");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Reading stdin failed, console disabled");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                app.quit = true;
            }
        }

        if app.quit {
            break;
        }
    }

    poller.stop_all().await;
    app.log_status();
    pool.close().await;
    Ok(())
}

async fn run_control(poller: &mut MirrorPoller, app: &mut App, config: &Config, control: Control) {
    match control {
        Control::FetchNow(feed_id) => {
            let asked = poller.fetch_now(feed_id);
            info!(asked, "Fetch now");
        }
        Control::Stop(feed_id) => {
            if !poller.deactivate(feed_id).await {
                warn!(feed_id, "Feed is not active");
            }
        }
        Control::Start(feed_id) => match config.feed(feed_id) {
            Some(feed) if poller.activate(feed.clone()) => app.track(feed.id, feed.title.as_str()),
            Some(_) => info!(feed_id, "Feed already active, run restarted"),
            None => warn!(feed_id, "Unknown feed, add it to the config first"),
        },
        Control::Help => info!("{}", input::HELP),
        Control::Unknown(line) => warn!(%line, "Unknown command. {}", input::HELP),
        Control::Status | Control::Quit => {}
    }
}
