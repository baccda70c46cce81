//! Single-slot delayed wakeup.
//!
//! A [`Timer`] holds at most one armed payload. Arming replaces whatever was
//! pending, [`Timer::fire_now`] hands the payload out early, and
//! [`Timer::expired`] resolves once the deadline passes. The payload is plain
//! data (the engine's next step) rather than a boxed closure, so the owner
//! dispatches it itself.

use std::future;
use std::time::Duration;

use tokio::time::{self, Instant};

#[derive(Debug)]
struct Armed<T> {
    deadline: Instant,
    payload: T,
}

#[derive(Debug)]
pub struct Timer<T> {
    slot: Option<Armed<T>>,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `payload` after `delay`, dropping any pending payload.
    ///
    /// Returns whether a pending payload was replaced.
    pub fn arm(&mut self, delay: Duration, payload: T) -> bool {
        let replaced = self.slot.is_some();
        self.slot = Some(Armed {
            deadline: Instant::now() + delay,
            payload,
        });
        replaced
    }

    /// Drop the pending payload. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.slot.take().is_some()
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.slot.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.slot.as_ref().map(|armed| armed.deadline)
    }

    #[cfg(test)]
    pub fn payload(&self) -> Option<&T> {
        self.slot.as_ref().map(|armed| &armed.payload)
    }

    /// Take the pending payload without waiting; the slot is empty afterwards.
    pub fn fire_now(&mut self) -> Option<T> {
        self.slot.take().map(|armed| armed.payload)
    }

    /// Wait for the deadline and take the payload.
    ///
    /// Never resolves while nothing is armed. Cancel safe: dropping the future
    /// before the deadline leaves the slot untouched.
    pub async fn expired(&mut self) -> T {
        let Some(deadline) = self.deadline() else {
            return future::pending().await;
        };
        time::sleep_until(deadline).await;
        match self.slot.take() {
            Some(armed) => armed.payload,
            None => future::pending().await,
        }
    }
}
