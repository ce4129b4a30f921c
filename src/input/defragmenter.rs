// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use crate::{
    message::{
        classify, is_real_time, is_status_byte, update_running_status, MessageLength,
        END_OF_EXCLUSIVE,
    },
    transport::{InputPort, SubmitError, TransportError, TransportEvent},
    ChannelConfig, CorrelationToken, RingBuffer, ShortMessage, SlotState, SysxPool,
};

/// Counters of an input channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    pub short_messages: u64,
    /// Completed SYSX buffers that carried data
    pub sysx_buffers: u64,
    /// Invalid short events and bytes skipped while reading
    pub malformed: u64,
    /// SYSX buffers returned with invalid contents
    pub sysx_errors: u64,
    /// Completions for unknown or stale buffers
    pub stale_completions: u64,
    pub transport_errors: u64,
    /// Incoming bytes that have been discarded because the ring
    /// buffer was full
    pub overrun_bytes: usize,
}

/// Reassembles the messages delivered by the transport into a
/// byte stream and extracts them again one by one.
#[derive(Debug)]
pub struct InputDefragmenter {
    ring: RingBuffer,
    pool: SysxPool,
    max_sysx_size: usize,
    running_status: Option<u8>,
    /// The last message that has been read was a SYSX fragment
    sysx_continues: bool,
    /// Re-arm returned buffers
    active: bool,
    stats: InputStats,
}

fn append(ring: &mut RingBuffer, stats: &mut InputStats, bytes: &[u8]) {
    if let Err(err) = ring.write(bytes) {
        log::warn!("Discarding input: {err}");
        stats.overrun_bytes += bytes.len();
    }
}

impl InputDefragmenter {
    #[must_use]
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            ring: RingBuffer::new(config.ring_buffer_size),
            pool: SysxPool::new(config.sysx_buffer_count, config.max_sysx_size),
            max_sysx_size: config.max_sysx_size,
            running_status: None,
            sysx_continues: false,
            active: false,
            stats: InputStats::default(),
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub const fn stats(&self) -> InputStats {
        self.stats
    }

    #[must_use]
    pub const fn running_status(&self) -> Option<u8> {
        self.running_status
    }

    /// Number of buffered bytes.
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// SYSX buffers that are lent to the transport.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    #[must_use]
    pub fn pool(&self) -> &SysxPool {
        &self.pool
    }

    /// Arm all idle buffers and start re-arming returned buffers.
    ///
    /// Returns the number of buffers that have been armed.
    pub fn activate<P>(&mut self, port: &mut P) -> Result<usize, TransportError>
    where
        P: InputPort + ?Sized,
    {
        self.active = true;
        let mut armed = 0;
        while let Ok((token, buf)) = self.pool.acquire() {
            self.submit(token, buf, port)?;
            armed += 1;
        }
        log::debug!("Armed {armed} SYSX buffer(s)");
        Ok(armed)
    }

    /// Stop re-arming buffers.
    ///
    /// Buffers that are returned afterwards are kept until they are
    /// released by [`Self::release_completed()`].
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Discard all buffered input and the running status.
    pub fn clear(&mut self) {
        self.ring.clear();
        self.running_status = None;
        self.sysx_continues = false;
    }

    /// Release the returned buffers of an inactive input.
    ///
    /// Returned buffers have already been unprepared.
    pub fn release_completed(&mut self) {
        debug_assert!(!self.active);
        let tokens = self.pool.tokens(SlotState::Completed).collect::<Vec<_>>();
        for token in tokens {
            if let Err(err) = self.pool.release(token) {
                log::error!("Failed to release SYSX buffer: {err}");
            }
        }
    }

    pub fn handle_event<P>(&mut self, event: TransportEvent, port: &mut P)
    where
        P: InputPort + ?Sized,
    {
        match event {
            TransportEvent::ShortDataReceived { packed } => {
                if let Some(message) = ShortMessage::from_packed(packed) {
                    log::trace!("Received short message {:02x?}", message.as_bytes());
                    self.stats.short_messages += 1;
                    append(&mut self.ring, &mut self.stats, message.as_bytes());
                } else {
                    log::warn!("Discarding malformed short message 0x{packed:08x}");
                    self.stats.malformed += 1;
                }
            }
            TransportEvent::LongDataCompleted { token, buf, len } => {
                self.on_long_data(token, buf, len, port);
            }
            TransportEvent::LongDataError { token, buf } => {
                log::warn!("SYSX buffer {token} returned with invalid contents");
                self.stats.sysx_errors += 1;
                self.on_long_data(token, buf, 0, port);
            }
            TransportEvent::Error { code } => {
                log::error!("Input error {code}");
                self.stats.transport_errors += 1;
            }
            TransportEvent::Opened => {
                log::debug!("Input opened");
            }
            TransportEvent::Closed => {
                log::debug!("Input closed");
            }
        }
    }

    fn on_long_data<P>(&mut self, token: CorrelationToken, buf: Vec<u8>, len: usize, port: &mut P)
    where
        P: InputPort + ?Sized,
    {
        if let Err((err, buf)) = self.pool.complete(token, buf, len) {
            log::warn!("Received completion for {err}");
            self.stats.stale_completions += 1;
            let len = len.min(buf.len()).min(self.max_sysx_size);
            if len > 0 {
                append(&mut self.ring, &mut self.stats, &buf[..len]);
            }
            return;
        }
        if let Err(err) = port.unprepare(token) {
            log::warn!("Failed to unprepare SYSX buffer {token}: {err}");
        }
        if let Some(data) = self.pool.data(token).filter(|data| !data.is_empty()) {
            log::trace!("Received {len} byte(s) of SYSX data", len = data.len());
            self.stats.sysx_buffers += 1;
            append(&mut self.ring, &mut self.stats, data);
        }
        if !self.active {
            return;
        }
        match self.pool.rearm(token) {
            Ok((token, buf)) => {
                if let Err(err) = self.submit(token, buf, port) {
                    log::error!("Failed to re-arm SYSX buffer: {err}");
                    self.stats.transport_errors += 1;
                }
            }
            Err(err) => {
                log::error!("Failed to re-arm SYSX buffer: {err}");
            }
        }
    }

    fn submit<P>(
        &mut self,
        token: CorrelationToken,
        mut buf: Vec<u8>,
        port: &mut P,
    ) -> Result<(), TransportError>
    where
        P: InputPort + ?Sized,
    {
        let result = match port.prepare(token, &mut buf) {
            Ok(()) => port.submit_long(token, buf, 0).map_err(|SubmitError { err, buf }| {
                if let Err(err) = port.unprepare(token) {
                    log::warn!("Failed to unprepare SYSX buffer {token}: {err}");
                }
                (err, buf)
            }),
            Err(err) => Err((err, buf)),
        };
        match result {
            Ok(()) => {
                if let Err(err) = self.pool.submitted(token) {
                    log::error!("{err}");
                }
                Ok(())
            }
            Err((err, buf)) => {
                if let Err(err) = self.pool.abort(token, buf) {
                    log::error!("{err}");
                }
                Err(err)
            }
        }
    }

    /// Read the next message.
    ///
    /// Copies the message into `out` and returns the number of bytes
    /// copied. Messages that do not fit into `out` are truncated, the
    /// remaining bytes are discarded. Returns 0 if no complete message
    /// is available.
    ///
    /// Data bytes that follow a channel voice message without a status
    /// byte of their own are returned without a status byte.
    pub fn get_message(&mut self, out: &mut [u8]) -> usize {
        loop {
            let Some(first) = self.ring.peek_first_status_byte() else {
                return 0;
            };
            if self.sysx_continues && (!is_status_byte(first) || first == END_OF_EXCLUSIVE) {
                return self.take_sysx(0, out);
            }
            match classify(first, self.running_status) {
                MessageLength::Fixed(len) => {
                    let len = usize::from(len);
                    let data_start = if is_status_byte(first) {
                        update_running_status(&mut self.running_status, first);
                        if !is_real_time(first) {
                            self.sysx_continues = false;
                        }
                        1
                    } else {
                        0
                    };
                    if let Some(offset) = (data_start..len)
                        .find(|&offset| self.ring.peek(offset).is_some_and(is_status_byte))
                    {
                        log::debug!("Skipping {offset} byte(s) of a truncated message");
                        self.ring.skip(offset);
                        self.stats.malformed += 1;
                        continue;
                    }
                    if self.ring.len() < len {
                        return 0;
                    }
                    return self.take(len, out);
                }
                MessageLength::OpenEnded => {
                    update_running_status(&mut self.running_status, first);
                    return self.take_sysx(1, out);
                }
                MessageLength::Invalid => {
                    log::debug!("Skipping invalid byte 0x{first:02x}");
                    if is_status_byte(first) {
                        update_running_status(&mut self.running_status, first);
                        self.sysx_continues = false;
                    }
                    self.ring.skip(1);
                    self.stats.malformed += 1;
                }
            }
        }
    }

    /// Read a SYSX run that starts at the read cursor.
    ///
    /// Data bytes are scanned from `start`. The run ends after 0xf7 or
    /// before any other status byte. Unterminated runs are only read
    /// once the maximum SYSX size is reached.
    fn take_sysx(&mut self, start: usize, out: &mut [u8]) -> usize {
        let limit = self.ring.len().min(self.max_sysx_size);
        for offset in start..limit {
            let Some(byte) = self.ring.peek(offset) else {
                break;
            };
            if !is_status_byte(byte) {
                continue;
            }
            if byte == END_OF_EXCLUSIVE {
                self.sysx_continues = false;
                return self.take(offset + 1, out);
            }
            // Real-time messages may be interleaved with SYSX data
            self.sysx_continues = is_real_time(byte);
            return self.take(offset, out);
        }
        if self.ring.len() < self.max_sysx_size {
            return 0;
        }
        self.sysx_continues = true;
        self.take(self.max_sysx_size, out)
    }

    fn take(&mut self, len: usize, out: &mut [u8]) -> usize {
        let copy_len = len.min(out.len());
        let copied = self.ring.copy_to(&mut out[..copy_len]);
        debug_assert_eq!(copied, copy_len);
        self.ring.skip(len);
        if copied < len {
            log::debug!("Truncated message of {len} byte(s) to {copied} byte(s)");
        }
        copied
    }

    /// Read a single byte without framing.
    pub fn get_byte(&mut self) -> Option<u8> {
        let byte = self.ring.peek(0)?;
        self.ring.skip(1);
        Some(byte)
    }

    /// Read up to `out.len()` bytes without framing.
    pub fn get_bytes(&mut self, out: &mut [u8]) -> usize {
        self.ring.read(out)
    }
}
