// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Interface to the physical MIDI transport
//!
//! Transports deliver all asynchronous events through an [`EventSender`]
//! instead of calling into the channel state from their own thread.

use std::{borrow::Cow, time::Duration};

use crossbeam_channel::{Receiver, Select, SendTimeoutError, Sender, TrySendError};
use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::CorrelationToken;

pub mod memory;

#[cfg(feature = "midir")]
pub mod midir;

/// Reserved names that do not select any device.
const DISABLED_DEVICE_NAMES: &[&str] = &["", "(None)", "(なし)"];

/// Reserved names that select the default device of the transport.
const DEFAULT_DEVICE_NAMES: &[&str] = &["Default", "デフォルト", "MIDI Mapper", "MIDI マッパー"];

/// Upper bound for delivering completion events into a full queue.
///
/// Completions carry buffers that would otherwise be lost.
const COMPLETION_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSelector {
    /// Open nothing
    Disabled,
    /// The transport's default device
    Default,
    Named(String),
}

impl DeviceSelector {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if DISABLED_DEVICE_NAMES.contains(&name) {
            Self::Disabled
        } else if DEFAULT_DEVICE_NAMES.contains(&name) {
            Self::Default
        } else {
            Self::Named(name.to_owned())
        }
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("(None)"),
            Self::Default => f.write_str("Default"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Transport primitives as named in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransportCall {
    Open,
    SendShort,
    Prepare,
    Unprepare,
    SubmitLong,
    Start,
    Stop,
    Reset,
    Close,
}

/// A transport primitive has failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed with reason {code}: {msg}")]
pub struct TransportError {
    pub call: TransportCall,
    /// Numeric reason as reported by the transport
    pub code: u32,
    pub msg: Cow<'static, str>,
}

impl TransportError {
    /// Reason code for transports that do not report numeric reasons.
    pub const UNSPECIFIED: u32 = u32::MAX;

    #[must_use]
    pub fn new(call: TransportCall, code: u32, msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            call,
            code,
            msg: msg.into(),
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Submitting a buffer has failed.
///
/// The buffer is handed back to the caller.
#[derive(Debug, Error)]
#[error("{err}")]
pub struct SubmitError {
    pub err: TransportError,
    pub buf: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("device not found")]
    NotFound,

    #[error("device busy")]
    Busy,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Asynchronous notification from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    Opened,

    Closed,

    /// A complete short message
    ///
    /// Packed into 4 bytes with the status byte in the least
    /// significant byte.
    ShortDataReceived { packed: u32 },

    /// A submitted buffer has been returned.
    ///
    /// For inputs `len` is the number of bytes that have been recorded
    /// into the buffer. For outputs the buffer has been sent. Buffers are
    /// also returned with `len` 0 when the port is reset.
    LongDataCompleted {
        token: CorrelationToken,
        buf: Vec<u8>,
        len: usize,
    },

    /// A submitted buffer has been returned with incomplete or invalid
    /// contents.
    LongDataError {
        token: CorrelationToken,
        buf: Vec<u8>,
    },

    Error { code: u32 },
}

impl TransportEvent {
    /// Events that carry lent buffers.
    const fn returns_buffer(&self) -> bool {
        matches!(
            self,
            Self::LongDataCompleted { .. } | Self::LongDataError { .. }
        )
    }
}

/// Producer half of the bounded event queue.
///
/// Handed to the transport when opening a port. Cloneable for transports
/// that deliver events from multiple threads.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<TransportEvent>,
}

impl EventSender {
    /// Deliver an event.
    ///
    /// Never blocks for short data that is dropped if the queue is full.
    /// Completion events are delivered with a bounded timeout.
    ///
    /// Returns `false` if the event has been dropped, e.g. after the
    /// receiving channel has been closed.
    pub fn send(&self, event: TransportEvent) -> bool {
        if event.returns_buffer() {
            return match self.tx.send_timeout(event, COMPLETION_SEND_TIMEOUT) {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(event)) => {
                    log::warn!("Dropping transport event after timeout: {event:?}");
                    false
                }
                Err(SendTimeoutError::Disconnected(event)) => {
                    log::debug!("Dropping transport event after disconnect: {event:?}");
                    false
                }
            };
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                log::warn!("Event queue full, dropping transport event {event:?}");
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                log::debug!("Dropping transport event after disconnect: {event:?}");
                false
            }
        }
    }

    /// Deliver a short message.
    pub fn send_short(&self, packed: u32) -> bool {
        self.send(TransportEvent::ShortDataReceived { packed })
    }
}

/// Consumer half of the bounded event queue.
#[derive(Debug, Clone)]
pub(crate) struct EventReceiver {
    rx: Receiver<TransportEvent>,
}

impl EventReceiver {
    pub(crate) fn try_recv(&self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait until an event is available without receiving it.
    ///
    /// Events must only be received while holding the channel state
    /// to keep them in order.
    pub(crate) fn wait_ready(&self, timeout: Duration) -> bool {
        let mut select = Select::new();
        select.recv(&self.rx);
        select.ready_timeout(timeout).is_ok()
    }
}

pub(crate) fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (EventSender { tx }, EventReceiver { rx })
}

/// Primitives shared by input and output ports for long buffers.
///
/// Buffers are passed by value and returned through
/// [`TransportEvent::LongDataCompleted`] or [`TransportEvent::LongDataError`].
pub trait LongBufferPort: Send {
    /// Prepare a buffer before its submission.
    fn prepare(&mut self, _token: CorrelationToken, _buf: &mut [u8]) -> TransportResult<()> {
        Ok(())
    }

    /// Release transport resources after a buffer has been returned.
    fn unprepare(&mut self, _token: CorrelationToken) -> TransportResult<()> {
        Ok(())
    }

    /// Submit a prepared buffer.
    ///
    /// For inputs the buffer is armed for receiving data, `len` is ignored.
    /// For outputs the first `len` bytes are sent.
    fn submit_long(
        &mut self,
        token: CorrelationToken,
        buf: Vec<u8>,
        len: usize,
    ) -> Result<(), SubmitError>;

    /// Return all submitted buffers and silence the device.
    fn reset(&mut self) -> TransportResult<()>;

    fn close(&mut self) -> TransportResult<()>;
}

pub trait InputPort: LongBufferPort {
    fn start(&mut self) -> TransportResult<()>;

    fn stop(&mut self) -> TransportResult<()>;
}

pub trait OutputPort: LongBufferPort {
    /// Send a packed short message.
    fn send_short(&mut self, packed: u32) -> TransportResult<()>;
}

pub type BoxedInputPort = Box<dyn InputPort + Send + 'static>;

pub type BoxedOutputPort = Box<dyn OutputPort + Send + 'static>;

pub trait Transport {
    fn open_input(
        &self,
        device: &DeviceSelector,
        events: EventSender,
    ) -> Result<BoxedInputPort, OpenError>;

    fn open_output(
        &self,
        device: &DeviceSelector,
        events: EventSender,
    ) -> Result<BoxedOutputPort, OpenError>;

    /// Names of the available input devices.
    fn input_device_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Names of the available output devices.
    fn output_device_names(&self) -> Vec<String> {
        Vec::new()
    }
}
