// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! MIDI message classification
//!
//! Maps status bytes onto the number of bytes that make up a message.
//! Data bytes without an explicit status byte inherit their length from
//! the currently active running status.

use strum::{Display, EnumIter, IntoStaticStr};


pub const SYSTEM_EXCLUSIVE: u8 = 0xf0;

pub const END_OF_EXCLUSIVE: u8 = 0xf7;

/// Number of bytes that constitute a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLength {
    /// Fixed number of bytes
    ///
    /// For an explicit status byte the length includes the status byte.
    /// For a data byte under running status the length counts only the
    /// data bytes, the status byte is implied.
    Fixed(u8),

    /// System-Exclusive
    ///
    /// Terminated by [`END_OF_EXCLUSIVE`] or a caller-supplied maximum.
    OpenEnded,

    /// Undefined status byte or data byte without running status
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum MessageClass {
    /// Note on/off, aftertouch, control change, program change,
    /// channel pressure, pitch bend
    ChannelVoice,
    SystemCommon,
    SystemRealTime,
    SystemExclusive,
    EndOfExclusive,
    /// Data byte in the range 0x00..=0x7f
    Data,
    /// 0xf4 and 0xf5
    Undefined,
}

impl MessageClass {
    #[must_use]
    pub const fn of(byte: u8) -> Self {
        match byte {
            0x00..=0x7f => Self::Data,
            0x80..=0xef => Self::ChannelVoice,
            SYSTEM_EXCLUSIVE => Self::SystemExclusive,
            0xf1..=0xf3 | 0xf6 => Self::SystemCommon,
            0xf4 | 0xf5 => Self::Undefined,
            END_OF_EXCLUSIVE => Self::EndOfExclusive,
            0xf8..=0xff => Self::SystemRealTime,
        }
    }
}

#[must_use]
pub const fn is_status_byte(byte: u8) -> bool {
    byte >= 0x80
}

#[must_use]
pub const fn is_real_time(byte: u8) -> bool {
    byte >= 0xf8
}

/// Length of a message that starts with an explicit status byte.
#[must_use]
pub const fn status_length(status: u8) -> MessageLength {
    match status {
        0x80..=0xbf | 0xe0..=0xef | 0xf2 => MessageLength::Fixed(3),
        0xc0..=0xdf | 0xf1 | 0xf3 => MessageLength::Fixed(2),
        0xf6 | 0xf8..=0xff => MessageLength::Fixed(1),
        SYSTEM_EXCLUSIVE => MessageLength::OpenEnded,
        _ => MessageLength::Invalid,
    }
}

/// Classify the first byte of a message.
///
/// Explicit status bytes are classified on their own. Data bytes inherit
/// their length from `running_status`: 1 data byte for program change and
/// channel pressure, 2 data bytes for all other channel voice messages.
#[must_use]
pub const fn classify(byte: u8, running_status: Option<u8>) -> MessageLength {
    if is_status_byte(byte) {
        return status_length(byte);
    }
    match running_status {
        Some(0xc0..=0xdf) => MessageLength::Fixed(1),
        Some(0x80..=0xbf | 0xe0..=0xef) => MessageLength::Fixed(2),
        _ => MessageLength::Invalid,
    }
}

/// Track the running status after a status byte has been sent or received.
///
/// Channel voice messages establish the running status, System-Exclusive
/// and system common messages cancel it, real-time messages leave it as is.
pub fn update_running_status(running_status: &mut Option<u8>, status: u8) {
    match MessageClass::of(status) {
        MessageClass::ChannelVoice => *running_status = Some(status),
        MessageClass::SystemExclusive
        | MessageClass::EndOfExclusive
        | MessageClass::SystemCommon
        | MessageClass::Undefined => *running_status = None,
        MessageClass::SystemRealTime | MessageClass::Data => (),
    }
}

/// A complete message of 1 to 3 bytes that is not System-Exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortMessage {
    bytes: [u8; 3],
    len: u8,
}

impl ShortMessage {
    /// Create a message from its bytes.
    ///
    /// Returns `None` if the first byte is not a status byte of a short
    /// message or if the number of bytes does not match the status.
    #[must_use]
    pub fn new(bytes: &[u8]) -> Option<Self> {
        let (&status, data) = bytes.split_first()?;
        let MessageLength::Fixed(len) = status_length(status) else {
            return None;
        };
        if bytes.len() != usize::from(len) || data.iter().copied().any(is_status_byte) {
            return None;
        }
        Some(Self::from_parts(status, data))
    }

    /// Create a message from a status byte and its data bytes
    /// without validation.
    ///
    /// Superfluous data bytes are ignored.
    #[must_use]
    pub(crate) fn from_parts(status: u8, data: &[u8]) -> Self {
        let mut bytes = [status, 0, 0];
        let data_len = data.len().min(2);
        bytes[1..=data_len].copy_from_slice(&data[..data_len]);
        Self {
            bytes,
            len: [1, 2, 3][data_len],
        }
    }

    /// Decode a packed message as delivered by the transport.
    ///
    /// The status byte occupies the least significant byte.
    #[must_use]
    pub fn from_packed(packed: u32) -> Option<Self> {
        let [status, data1, data2, _] = packed.to_le_bytes();
        let MessageLength::Fixed(len) = status_length(status) else {
            return None;
        };
        let data = [data1, data2];
        let data = &data[..usize::from(len) - 1];
        if data.iter().copied().any(is_status_byte) {
            return None;
        }
        Some(Self::from_parts(status, data))
    }

    /// Encode the message for the transport.
    ///
    /// Unused bytes are zero.
    #[must_use]
    pub fn pack(&self) -> u32 {
        self.as_bytes()
            .iter()
            .rev()
            .fold(0, |packed, &byte| (packed << 8) | u32::from(byte))
    }

    #[must_use]
    pub const fn status(&self) -> u8 {
        self.bytes[0]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    #[must_use]
    pub fn class(&self) -> MessageClass {
        MessageClass::of(self.status())
    }

    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.len as usize
    }
}

impl AsRef<[u8]> for ShortMessage {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
