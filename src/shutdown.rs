// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use std::{thread, time::Duration};

/// Outcome of closing a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Shutdown {
    /// All transfer buffers have been returned.
    Graceful,

    /// The transport did not return all buffers in time.
    ///
    /// The pending buffers stay with the transport and are not reclaimed.
    TimedOut { pending: usize },
}

impl Shutdown {
    #[must_use]
    pub const fn is_graceful(self) -> bool {
        matches!(self, Self::Graceful)
    }
}

/// Poll until nothing is pending or the retry budget is exhausted.
///
/// `poll` returns the number of pending items. It is invoked at most
/// `retries + 1` times with a sleep of `interval` in between. Locks must
/// not be held by `poll` when returning.
pub(crate) fn wait_until_drained(
    retries: u32,
    interval: Duration,
    mut poll: impl FnMut() -> usize,
) -> Shutdown {
    let mut pending = poll();
    for _ in 0..retries {
        if pending == 0 {
            return Shutdown::Graceful;
        }
        thread::sleep(interval);
        pending = poll();
    }
    if pending == 0 {
        return Shutdown::Graceful;
    }
    log::warn!(
        "{pending} SYSX transfer(s) still pending after {retries} retries, giving up"
    );
    Shutdown::TimedOut { pending }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn nothing_pending() {
        let mut polls = 0;
        let shutdown = wait_until_drained(100, Duration::from_secs(1), || {
            polls += 1;
            0
        });
        assert_eq!(Shutdown::Graceful, shutdown);
        assert_eq!(1, polls);
    }

    #[test]
    fn drained_while_waiting() {
        let mut pending = 3;
        let shutdown = wait_until_drained(10, Duration::from_millis(1), || {
            pending -= 1;
            pending
        });
        assert_eq!(Shutdown::Graceful, shutdown);
        assert_eq!(0, pending);
    }

    #[test]
    fn give_up_after_retries() {
        let mut polls = 0;
        let started = Instant::now();
        let shutdown = wait_until_drained(5, Duration::from_millis(2), || {
            polls += 1;
            2
        });
        assert_eq!(Shutdown::TimedOut { pending: 2 }, shutdown);
        assert_eq!(6, polls);
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
