// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Sending MIDI messages

use std::{fmt, time::Duration};

use parking_lot::Mutex;

use crate::{
    message::SYSTEM_EXCLUSIVE,
    shutdown::wait_until_drained,
    transport::{
        event_queue, BoxedOutputPort, DeviceSelector, EventReceiver, SubmitError, Transport,
        TransportEvent,
    },
    BufferOverrun, ChannelConfig, CorrelationToken, Error, MalformedMessage, MalformedReason,
    Result, ShortMessage, Shutdown, SysxPool,
};

mod framer;
pub use self::framer::{Frame, OutputFramer};


/// Outcome of sending a byte stream.
#[derive(Debug, Default)]
pub struct PutBytes {
    /// Number of bytes that have been sent as part of valid messages
    pub accepted: usize,

    /// Malformed messages that have been skipped, followed by the
    /// error that stopped sending, if any
    pub errors: Vec<Error>,
}

impl PutBytes {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Session {
    device_name: String,
    port: BoxedOutputPort,
    events: EventReceiver,
    pool: SysxPool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_name", &self.device_name)
            .field("pool", &self.pool)
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
            .open_output(&selector, sender)
            .map_err(|err| Error::from_open_error(err, device_name))?;
        log::info!("Opened output \"{device_name}\"");
        Ok(Self {
            device_name: device_name.to_owned(),
            port,
            events,
            pool: SysxPool::new(config.sysx_buffer_count, config.max_sysx_size),
        })
    }

    fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Some(event) = self.events.try_recv() {
            self.handle_event(event);
            count += 1;
        }
        count
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LongDataCompleted { token, buf, len } => {
                log::trace!("Sent {len} byte(s) of SYSX data");
                self.on_returned(token, buf, len);
            }
            TransportEvent::LongDataError { token, buf } => {
                log::warn!("SYSX buffer {token} returned with an error");
                self.on_returned(token, buf, 0);
            }
            TransportEvent::ShortDataReceived { packed } => {
                log::debug!("Ignoring short data 0x{packed:08x} received on output");
            }
            TransportEvent::Error { code } => {
                log::error!("Output error {code}");
            }
            TransportEvent::Opened => {
                log::debug!("Output opened");
            }
            TransportEvent::Closed => {
                log::debug!("Output closed");
            }
        }
    }

    fn on_returned(&mut self, token: CorrelationToken, buf: Vec<u8>, len: usize) {
        if let Err((err, _buf)) = self.pool.complete(token, buf, len) {
            log::warn!("Received completion for {err}");
            return;
        }
        if let Err(err) = self.port.unprepare(token) {
            log::warn!("Failed to unprepare SYSX buffer {token}: {err}");
        }
        if let Err(err) = self.pool.release(token) {
            log::error!("Failed to release SYSX buffer: {err}");
        }
    }

    fn send_short(&mut self, message: ShortMessage) -> Result<()> {
        log::trace!("Sending short message {:02x?}", message.as_bytes());
        self.port.send_short(message.pack())?;
        Ok(())
    }

    fn send_sysx(&mut self, sysx: &[u8]) -> Result<()> {
        let (token, mut buf) = self.pool.acquire()?;
        buf.truncate(sysx.len());
        buf.copy_from_slice(sysx);
        if let Err(err) = self.port.prepare(token, &mut buf) {
            if let Err(err) = self.pool.abort(token, buf) {
                log::error!("{err}");
            }
            return Err(err.into());
        }
        log::trace!("Sending {len} byte(s) of SYSX data", len = sysx.len());
        match self.port.submit_long(token, buf, sysx.len()) {
            Ok(()) => {
                if let Err(err) = self.pool.submitted(token) {
                    log::error!("{err}");
                }
                Ok(())
            }
            Err(SubmitError { err, buf }) => {
                if let Err(err) = self.port.unprepare(token) {
                    log::warn!("Failed to unprepare SYSX buffer {token}: {err}");
                }
                if let Err(err) = self.pool.abort(token, buf) {
                    log::error!("{err}");
                }
                Err(err.into())
            }
        }
    }

    fn put_message(&mut self, bytes: &[u8]) -> Result<usize> {
        self.pump();
        let max_sysx_size = self.pool.buffer_size();
        if bytes.first() == Some(&SYSTEM_EXCLUSIVE) && bytes.len() > max_sysx_size {
            return Err(BufferOverrun {
                requested: bytes.len(),
                free: max_sysx_size,
            }
            .into());
        }
        let mut framer = OutputFramer::new(bytes, max_sysx_size);
        let frame = match framer.next() {
            None => return Ok(0),
            Some(frame) => frame?,
        };
        let offset = framer.position();
        if let Some(&byte) = bytes.get(offset) {
            return Err(MalformedMessage {
                offset,
                byte,
                reason: MalformedReason::ExcessData,
            }
            .into());
        }
        match frame {
            Frame::Short(message) => self.send_short(message)?,
            Frame::Sysx(sysx) => self.send_sysx(sysx)?,
        }
        Ok(bytes.len())
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> PutBytes {
        self.pump();
        let mut put_bytes = PutBytes::default();
        let mut framer = OutputFramer::new(bytes, self.pool.buffer_size());
        let mut start = 0;
        while let Some(frame) = framer.next() {
            let sent = match frame {
                Ok(Frame::Short(message)) => self.send_short(message),
                Ok(Frame::Sysx(sysx)) => self.send_sysx(sysx),
                Err(err) => {
                    log::warn!("Skipping {err}");
                    put_bytes.errors.push(err.into());
                    start = framer.position();
                    continue;
                }
            };
            if let Err(err) = sent {
                log::warn!(
                    "Stopped sending after {accepted} byte(s): {err}",
                    accepted = put_bytes.accepted
                );
                put_bytes.errors.push(err);
                break;
            }
            put_bytes.accepted += framer.position() - start;
            start = framer.position();
        }
        put_bytes
    }

    /// Return all pending buffers.
    fn halt(&mut self) -> Result<()> {
        // Make room for the returned buffers
        self.pump();
        self.port.reset()?;
        Ok(())
    }

    fn shutdown(mut self, config: &ChannelConfig) -> Shutdown {
        if let Err(err) = self.halt() {
            log::warn!("Failed to reset output \"{}\": {err}", self.device_name);
        }
        let shutdown = wait_until_drained(config.shutdown_retries, config.shutdown_interval, || {
            self.pump();
            self.pool.in_flight()
        });
        if let Err(err) = self.port.close() {
            log::warn!("Failed to close output \"{}\": {err}", self.device_name);
        }
        shutdown
    }
}

/// An open MIDI output device.
///
/// Like [`MidiInput`](crate::MidiInput) all operations take `&self`.
pub struct MidiOutput {
    config: ChannelConfig,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for MidiOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiOutput")
            .field("config", &self.config)
            .field("session", &self.session.try_lock())
            .finish()
    }
}

impl MidiOutput {
    /// Open an output device by name.
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

    pub fn device_name(&self) -> Result<String> {
        self.with_session(|session| session.device_name.clone())
    }

    /// Number of SYSX messages that are still being sent.
    pub fn pending_sysx(&self) -> Result<usize> {
        self.with_session(|session| {
            session.pump();
            session.pool.in_flight()
        })
    }

    pub fn pump(&self) -> Result<usize> {
        self.with_session(Session::pump)
    }

    /// Wait up to `timeout` for transport events and handle them.
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

    /// Send a single complete message.
    ///
    /// SYSX messages are sent asynchronously and fail with
    /// [`Error::PoolExhausted`] if too many of them are still pending.
    /// Returns the number of bytes sent.
    pub fn put_message(&self, message: &[u8]) -> Result<usize> {
        self.with_session(|session| session.put_message(message))?
    }

    /// Send a single raw byte as a short message.
    pub fn put_byte(&self, byte: u8) -> Result<()> {
        self.with_session(|session| {
            log::trace!("Sending raw byte 0x{byte:02x}");
            session.port.send_short(u32::from(byte))
        })??;
        Ok(())
    }

    /// Split a byte stream into messages and send them.
    ///
    /// Malformed messages are skipped. Sending stops at the first
    /// message that could not be sent.
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<PutBytes> {
        self.with_session(|session| session.put_bytes(bytes))
    }

    /// Abort all pending SYSX messages and turn off all notes.
    pub fn reset(&self) -> Result<Shutdown> {
        self.with_session(Session::halt)??;
        let shutdown = wait_until_drained(
            self.config.shutdown_retries,
            self.config.shutdown_interval,
            || {
                self.with_session(|session| {
                    session.pump();
                    session.pool.in_flight()
                })
                .unwrap_or_default()
            },
        );
        log::debug!("Reset output: {shutdown:?}");
        Ok(shutdown)
    }

    /// Close the device.
    ///
    /// Waits a bounded amount of time for pending SYSX messages.
    pub fn close(&self) -> Shutdown {
        let Some(session) = self.session.lock().take() else {
            return Shutdown::Graceful;
        };
        let device_name = session.device_name.clone();
        let shutdown = session.shutdown(&self.config);
        log::info!("Closed output \"{device_name}\": {shutdown:?}");
        shutdown
    }

    /// Close the device and open another one with the same configuration.
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

impl Drop for MidiOutput {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            log::debug!("Closing output \"{}\" on drop", session.device_name);
            let shutdown = session.shutdown(&self.config);
            if !shutdown.is_graceful() {
                log::warn!("Output closed on drop: {shutdown:?}");
            }
        }
    }
}
