// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Fixed-capacity circular byte buffer

use thiserror::Error;

/// The incoming data did not fit into the free space.
///
/// Nothing has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer overrun: {requested} byte(s) requested, {free} byte(s) free")]
pub struct BufferOverrun {
    pub requested: usize,
    pub free: usize,
}

/// Circular byte buffer with independent read and write cursors.
///
/// The fill level is tracked explicitly, i.e. equal cursors either
/// mean empty or full and the whole capacity is usable.
///
/// Overflow policy: Writes that exceed the free space are rejected as
/// a whole. Buffered data is never overwritten.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    read: usize,
    write: usize,
    len: usize,
}

impl RingBuffer {
    /// Allocate a new, empty buffer.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            storage: vec![0; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            len: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of buffered bytes that are available for reading.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.len = 0;
    }

    /// Append bytes at the write cursor.
    ///
    /// Either all or none of the bytes are written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferOverrun> {
        let free = self.free();
        if bytes.len() > free {
            return Err(BufferOverrun {
                requested: bytes.len(),
                free,
            });
        }
        let capacity = self.capacity();
        // The first span extends up to the end of the storage, the second
        // span (if any) continues at the start.
        let first_len = bytes.len().min(capacity - self.write);
        let (first, second) = bytes.split_at(first_len);
        self.storage[self.write..self.write + first_len].copy_from_slice(first);
        self.storage[..second.len()].copy_from_slice(second);
        self.write = (self.write + bytes.len()) % capacity;
        self.len += bytes.len();
        Ok(())
    }

    /// Copy up to `out.len()` bytes from the read cursor and consume them.
    ///
    /// Returns the number of bytes copied. 0 means that no data is buffered.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let copied = self.copy_to(out);
        self.skip(copied);
        copied
    }

    /// Copy up to `out.len()` bytes from the read cursor without consuming them.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        let first_len = count.min(self.capacity() - self.read);
        let (first, second) = out[..count].split_at_mut(first_len);
        first.copy_from_slice(&self.storage[self.read..self.read + first_len]);
        second.copy_from_slice(&self.storage[..second.len()]);
        count
    }

    /// The byte at the read cursor.
    ///
    /// This is the status byte of the next message, unless the message
    /// depends on running status.
    #[must_use]
    pub fn peek_first_status_byte(&self) -> Option<u8> {
        self.peek(0)
    }

    /// The byte at `offset` bytes past the read cursor.
    #[must_use]
    pub fn peek(&self, offset: usize) -> Option<u8> {
        (offset < self.len).then(|| self.storage[(self.read + offset) % self.capacity()])
    }

    /// Consume up to `count` bytes without copying them.
    ///
    /// Returns the number of bytes consumed.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.len);
        self.read = (self.read + count) % self.capacity();
        self.len -= count;
        count
    }
}
