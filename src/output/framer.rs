// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use crate::{
    message::{
        classify, is_real_time, is_status_byte, update_running_status, MessageLength,
        END_OF_EXCLUSIVE,
    },
    MalformedMessage, MalformedReason, ShortMessage,
};

/// A single message of a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Short(ShortMessage),
    /// System-Exclusive message or fragment
    Sysx(&'a [u8]),
}

/// Splits a byte stream into messages that can be sent individually.
///
/// Data bytes that rely on running status are expanded into complete
/// messages. The running status only applies within the scanned stream.
///
/// Malformed input is reported once per occurrence before the scanner
/// resumes at the next status byte.
#[derive(Debug, Clone)]
pub struct OutputFramer<'a> {
    bytes: &'a [u8],
    pos: usize,
    max_sysx_size: usize,
    running_status: Option<u8>,
    sysx_continues: bool,
}

impl<'a> OutputFramer<'a> {
    /// # Panics
    ///
    /// Panics if `max_sysx_size` is 0.
    #[must_use]
    pub fn new(bytes: &'a [u8], max_sysx_size: usize) -> Self {
        assert!(max_sysx_size > 0);
        Self {
            bytes,
            pos: 0,
            max_sysx_size,
            running_status: None,
            sysx_continues: false,
        }
    }

    /// Number of bytes that have been scanned.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    fn malformed(&mut self, offset: usize, reason: MalformedReason) -> MalformedMessage {
        let byte = self.bytes[offset];
        // Resynchronize at the next status byte
        self.pos = self.bytes[offset + 1..]
            .iter()
            .position(|&byte| is_status_byte(byte))
            .map_or(self.bytes.len(), |skipped| offset + 1 + skipped);
        log::debug!(
            "Skipped {skipped} byte(s) of a malformed message",
            skipped = self.pos - offset
        );
        MalformedMessage {
            offset,
            byte,
            reason,
        }
    }

    fn next_sysx(&mut self, start: usize) -> Frame<'a> {
        let begin = self.pos;
        let limit = self.bytes.len().min(begin + self.max_sysx_size);
        let mut end = limit;
        self.sysx_continues = limit < self.bytes.len();
        for offset in begin + start..limit {
            let byte = self.bytes[offset];
            if !is_status_byte(byte) {
                continue;
            }
            if byte == END_OF_EXCLUSIVE {
                end = offset + 1;
                self.sysx_continues = false;
            } else {
                end = offset;
                self.sysx_continues = is_real_time(byte);
            }
            break;
        }
        self.pos = end;
        Frame::Sysx(&self.bytes[begin..end])
    }

    fn next_short(
        &mut self,
        status: u8,
        data_start: usize,
        data_len: usize,
    ) -> Result<Frame<'a>, MalformedMessage> {
        let available = self.bytes.len() - data_start;
        let scanned = &self.bytes[data_start..data_start + data_len.min(available)];
        if let Some(index) = scanned.iter().position(|&byte| is_status_byte(byte)) {
            let offset = data_start + index;
            let byte = self.bytes[offset];
            self.pos = offset;
            return Err(MalformedMessage {
                offset,
                byte,
                reason: MalformedReason::Truncated,
            });
        }
        if scanned.len() < data_len {
            let offset = self.bytes.len() - 1;
            self.pos = self.bytes.len();
            return Err(MalformedMessage {
                offset,
                byte: self.bytes[offset],
                reason: MalformedReason::Truncated,
            });
        }
        self.pos = data_start + data_len;
        Ok(Frame::Short(ShortMessage::from_parts(status, scanned)))
    }
}

impl<'a> Iterator for OutputFramer<'a> {
    type Item = Result<Frame<'a>, MalformedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.pos;
        let first = *self.bytes.get(offset)?;
        if self.sysx_continues && (!is_status_byte(first) || first == END_OF_EXCLUSIVE) {
            return Some(Ok(self.next_sysx(0)));
        }
        if is_status_byte(first) && !is_real_time(first) {
            self.sysx_continues = false;
        }
        let running_status = self.running_status;
        let item = match classify(first, running_status) {
            MessageLength::Fixed(len) => {
                let len = usize::from(len);
                if is_status_byte(first) {
                    update_running_status(&mut self.running_status, first);
                    self.next_short(first, offset + 1, len - 1)
                } else {
                    match running_status {
                        Some(status) => self.next_short(status, offset, len),
                        None => Err(self.malformed(offset, MalformedReason::MissingRunningStatus)),
                    }
                }
            }
            MessageLength::OpenEnded => {
                update_running_status(&mut self.running_status, first);
                Ok(self.next_sysx(1))
            }
            MessageLength::Invalid => {
                let reason = if is_status_byte(first) {
                    update_running_status(&mut self.running_status, first);
                    MalformedReason::UndefinedStatus
                } else {
                    MalformedReason::MissingRunningStatus
                };
                Err(self.malformed(offset, reason))
            }
        };
        Some(item)
    }
}
