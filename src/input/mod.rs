// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Receiving MIDI messages

use std::{fmt, time::Duration};

use parking_lot::Mutex;

use crate::{
    shutdown::wait_until_drained,
    transport::{event_queue, BoxedInputPort, DeviceSelector, EventReceiver, Transport},
    ChannelConfig, Error, Result, Shutdown,
};

mod defragmenter;
pub use self::defragmenter::{InputDefragmenter, InputStats};

#[cfg(test)]
mod tests;

struct Session {
    device_name: String,
    port: BoxedInputPort,
    events: EventReceiver,
    defragmenter: InputDefragmenter,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_name", &self.device_name)
            .field("defragmenter", &self.defragmenter)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn open<T>(transport: &T, device_name: &str, config: &ChannelConfig) -> Result<Self>
    where
        T: Transport + ?Sized,
    {
        let selector = DeviceSelector::from_name(device_name);
        if selector == DeviceSelector::Disabled {
            return Err(Error::NoDeviceSelected);
        }
        let (sender, events) = event_queue(config.event_queue_capacity);
        let port = transport
            .open_input(&selector, sender)
            .map_err(|err| Error::from_open_error(err, device_name))?;
        let mut session = Self {
            device_name: device_name.to_owned(),
            port,
            events,
            defragmenter: InputDefragmenter::new(config),
        };
        if let Err(err) = session.start() {
            log::warn!("Failed to start input \"{device_name}\": {err}");
            let shutdown = session.shutdown(config);
            log::debug!("Closed input \"{device_name}\": {shutdown:?}");
            return Err(err);
        }
        log::info!("Opened input \"{device_name}\"");
        Ok(session)
    }

    fn start(&mut self) -> Result<()> {
        self.defragmenter.activate(self.port.as_mut())?;
        self.port.start()?;
        Ok(())
    }

    /// Handle all pending events.
    fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Some(event) = self.events.try_recv() {
            self.defragmenter.handle_event(event, self.port.as_mut());
            count += 1;
        }
        count
    }

    /// Stop the input and return all buffers.
    fn halt(&mut self) {
        if let Err(err) = self.port.stop() {
            log::warn!("Failed to stop input \"{}\": {err}", self.device_name);
        }
        self.defragmenter.deactivate();
        // Make room for the returned buffers
        self.pump();
        if let Err(err) = self.port.reset() {
            log::warn!("Failed to reset input \"{}\": {err}", self.device_name);
        }
    }

    fn shutdown(mut self, config: &ChannelConfig) -> Shutdown {
        self.halt();
        let shutdown = wait_until_drained(config.shutdown_retries, config.shutdown_interval, || {
            self.pump();
            self.defragmenter.in_flight()
        });
        self.defragmenter.release_completed();
        if let Err(err) = self.port.close() {
            log::warn!("Failed to close input \"{}\": {err}", self.device_name);
        }
        shutdown
    }
}

/// An open MIDI input device.
///
/// All operations take `&self` and the input can be shared with
/// a [`PumpThread`](crate::PumpThread). Operations fail with
/// [`Error::Closed`] after the input has been closed.
pub struct MidiInput {
    config: ChannelConfig,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for MidiInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiInput")
            .field("config", &self.config)
            .field("session", &self.session.try_lock())
            .finish()
    }
}

impl MidiInput {
    /// Open an input device by name.
    ///
    /// See [`DeviceSelector::from_name()`] for reserved names.
    pub fn open<T>(transport: &T, device_name: &str, config: ChannelConfig) -> Result<Self>
    where
        T: Transport + ?Sized,
    {
        config.validate()?;
        let session = Session::open(transport, device_name, &config)?;
        Ok(Self {
            config,
            session: Mutex::new(Some(session)),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.lock().is_some()
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let mut session = self.session.lock();
        let session = session.as_mut().ok_or(Error::Closed)?;
        Ok(f(session))
    }

    /// Name of the device.
    pub fn device_name(&self) -> Result<String> {
        self.with_session(|session| session.device_name.clone())
    }

    pub fn stats(&self) -> Result<InputStats> {
        self.with_session(|session| session.defragmenter.stats())
    }

    /// Handle all pending transport events.
    ///
    /// Returns the number of events that have been handled.
    pub fn pump(&self) -> Result<usize> {
        self.with_session(Session::pump)
    }

    /// Wait up to `timeout` for transport events and handle them.
    ///
    /// The input is not locked while waiting.
    pub fn pump_timeout(&self, timeout: Duration) -> Result<usize> {
        let (count, events) = self.with_session(|session| {
            let count = session.pump();
            (count, (count == 0).then(|| session.events.clone()))
        })?;
        let Some(events) = events else {
            return Ok(count);
        };
        if !events.wait_ready(timeout) {
            return Ok(0);
        }
        self.with_session(Session::pump)
    }

    /// Read the next message.
    ///
    /// Returns the number of bytes copied into `out` or 0 if no complete
    /// message has been received. Longer messages are truncated to
    /// `out.len()` bytes.
    pub fn get_message(&self, out: &mut [u8]) -> Result<usize> {
        self.with_session(|session| {
            session.pump();
            session.defragmenter.get_message(out)
        })
    }

    /// Read the next byte without framing.
    pub fn get_byte(&self) -> Result<Option<u8>> {
        self.with_session(|session| {
            session.pump();
            session.defragmenter.get_byte()
        })
    }

    /// Read up to `out.len()` bytes without framing.
    pub fn get_bytes(&self, out: &mut [u8]) -> Result<usize> {
        self.with_session(|session| {
            session.pump();
            session.defragmenter.get_bytes(out)
        })
    }

    /// Discard all received data and restart the device.
    ///
    /// All SYSX buffers are returned by the transport and armed again.
    pub fn reset(&self) -> Result<Shutdown> {
        self.with_session(Session::halt)?;
        let shutdown = wait_until_drained(
            self.config.shutdown_retries,
            self.config.shutdown_interval,
            || {
                self.with_session(|session| {
                    session.pump();
                    session.defragmenter.in_flight()
                })
                .unwrap_or_default()
            },
        );
        self.with_session(|session| {
            session.defragmenter.release_completed();
            session.defragmenter.clear();
            session.start()
        })??;
        log::debug!("Reset input: {shutdown:?}");
        Ok(shutdown)
    }

    /// Close the device.
    ///
    /// Waits a bounded amount of time for the transport to return all
    /// SYSX buffers. Closing a closed input does nothing.
    pub fn close(&self) -> Shutdown {
        let Some(session) = self.session.lock().take() else {
            return Shutdown::Graceful;
        };
        let device_name = session.device_name.clone();
        let shutdown = session.shutdown(&self.config);
        log::info!("Closed input \"{device_name}\": {shutdown:?}");
        shutdown
    }

    /// Close the device and open another one with the same configuration.
    ///
    /// The input remains closed if opening fails.
    pub fn reopen<T>(&self, transport: &T, device_name: &str) -> Result<Shutdown>
    where
        T: Transport + ?Sized,
    {
        let shutdown = self.close();
        let session = Session::open(transport, device_name, &self.config)?;
        *self.session.lock() = Some(session);
        Ok(shutdown)
    }
}

impl Drop for MidiInput {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            log::debug!("Closing input \"{}\" on drop", session.device_name);
            let shutdown = session.shutdown(&self.config);
            if !shutdown.is_graceful() {
                log::warn!("Input closed on drop: {shutdown:?}");
            }
        }
    }
}
