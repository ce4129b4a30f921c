// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{Error, MidiInput, MidiOutput, Result};

/// Upper bound for the reaction time when aborting a [`PumpThread`].
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// A channel that handles transport events when pumped.
pub trait Pump: Send + Sync {
    /// Wait up to `timeout` for transport events and handle them.
    fn pump_timeout(&self, timeout: Duration) -> Result<usize>;
}

impl Pump for MidiInput {
    fn pump_timeout(&self, timeout: Duration) -> Result<usize> {
        MidiInput::pump_timeout(self, timeout)
    }
}

impl Pump for MidiOutput {
    fn pump_timeout(&self, timeout: Duration) -> Result<usize> {
        MidiOutput::pump_timeout(self, timeout)
    }
}

/// Dedicated thread that pumps the events of a channel.
///
/// Keeps inbound SYSX buffers armed and recycles outbound SYSX buffers
/// while the application does not read or write. The thread exits when
/// aborted or when the channel has been closed.
#[derive(Debug)]
pub struct PumpThread {
    abort: Arc<AtomicBool>,
    os_thread: std::thread::JoinHandle<()>,
}

impl PumpThread {
    #[must_use]
    pub fn spawn<P>(channel: Arc<P>, interval: Duration) -> Self
    where
        P: Pump + ?Sized + 'static,
    {
        let abort = Arc::new(AtomicBool::new(false));
        let os_thread = std::thread::spawn({
            let abort = Arc::clone(&abort);
            move || {
                log::info!("Entering pump thread");
                while !abort.load(Ordering::Acquire) {
                    match channel.pump_timeout(interval) {
                        Ok(count) => {
                            if count > 0 {
                                log::trace!("Handled {count} transport event(s)");
                            }
                        }
                        Err(Error::Closed) => {
                            log::info!("Channel closed");
                            break;
                        }
                        Err(err) => {
                            log::warn!("Failed to pump transport events: {err}");
                            std::thread::sleep(interval);
                        }
                    }
                }
                log::info!("Exiting pump thread");
            }
        });
        Self { abort, os_thread }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.os_thread.is_finished()
    }

    pub fn abort_and_join(self) -> anyhow::Result<()> {
        let Self { abort, os_thread } = self;
        abort.store(true, Ordering::Release);
        os_thread
            .join()
            .map_err(|err| anyhow::anyhow!("Pump thread panicked: {err:?}"))
    }
}
