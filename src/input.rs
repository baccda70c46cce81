//! Operator console input.
//!
//! Maps lines typed on stdin to [`Control`] actions. Adding a command is a
//! single match arm in [`parse_line`].
//!
//! ## For contributors
//!
//! To add a new command:
//!
//! 1. Add a [`Control`] variant for it.
//! 2. Add a match arm in [`parse_line`].
//! 3. Handle the variant in `main.rs`.
//! 4. Update [`HELP`].

use crate::app::App;
use crate::source::FeedId;

pub const HELP: &str = "commands: now [feed] | stop <feed> | start <feed> | status | quit";

/// Something the main loop should do in response to operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Fire pending wakeups now, for one feed or all of them.
    FetchNow(Option<FeedId>),
    Stop(FeedId),
    Start(FeedId),
    Status,
    Quit,
    Help,
    Unknown(String),
}

/// Parse one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Control> {
    let mut words = line.split_whitespace();
    let command = words.next()?;
    let arg = words.next();

    let control = match (command.to_ascii_lowercase().as_str(), arg) {
        ("now", None) => Control::FetchNow(None),
        ("now", Some(feed)) => match feed.parse() {
            Ok(id) => Control::FetchNow(Some(id)),
            Err(_) => Control::Unknown(line.trim().to_string()),
        },
        ("stop", Some(feed)) => feed_arg(feed, Control::Stop, line),
        ("start", Some(feed)) => feed_arg(feed, Control::Start, line),
        ("status", None) => Control::Status,
        ("quit" | "q" | "exit", None) => Control::Quit,
        ("help" | "?", None) => Control::Help,
        _ => Control::Unknown(line.trim().to_string()),
    };
    Some(control)
}

fn feed_arg(arg: &str, make: fn(FeedId) -> Control, line: &str) -> Control {
    arg.parse()
        .map(make)
        .unwrap_or_else(|_| Control::Unknown(line.trim().to_string()))
}

/// Parse a line and apply whatever only touches [`App`] state.
///
/// Everything else is handed back to the caller.
pub fn handle_line(app: &mut App, line: &str) -> Option<Control> {
    match parse_line(line)? {
        Control::Quit => {
            app.quit = true;
            None
        }
        Control::Status => {
            app.log_status();
            None
        }
        other => Some(other),
    }
}
