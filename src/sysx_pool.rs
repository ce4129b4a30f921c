// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

//! Pool of pre-allocated System-Exclusive transfer buffers
//!
//! Each slot owns a buffer that is lent to the transport while a transfer
//! is in flight and returned with the completion event. Slots are addressed
//! by [`CorrelationToken`]s that encode both the slot index and a generation
//! counter. The generation changes whenever a slot is handed out again, which
//! allows to detect stale completion events.

use strum::{Display, EnumIter, IntoStaticStr};
use thiserror::Error;

/// All slots are in use.
///
/// A transient condition, the request may be retried after some
/// transfers have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all {capacity} SYSX buffer(s) are in use")]
pub struct PoolExhausted {
    pub capacity: usize,
}

/// A token does not refer to a slot in the expected state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stale or unknown SYSX buffer token {token} (expected {expected})")]
pub struct UnexpectedToken {
    pub token: CorrelationToken,
    pub expected: SlotState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
pub enum SlotState {
    /// Available for acquisition
    Idle,
    /// Acquired, the buffer is lent to the caller for filling and preparation
    Prepared,
    /// Submitted, the buffer is lent to the transport
    Submitted,
    /// Returned from the transport, the buffer is back in the slot
    Completed,
}

/// Maps completion events back to pool slots.
///
/// Opaque for transports that only have to hand it back unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{index}#{generation}")]
pub struct CorrelationToken {
    index: u16,
    generation: u32,
}

impl CorrelationToken {
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Encode the token into a single integer, e.g. for passing it
    /// through the user data of a transport API.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 16) | self.index as u64
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u16,
            generation: (bits >> 16) as u32,
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    generation: u32,
    /// `None` while lent out
    buf: Option<Vec<u8>>,
    /// Number of valid bytes in `buf` after completion
    len: usize,
}

#[derive(Debug)]
pub struct SysxPool {
    slots: Vec<Slot>,
    buffer_size: usize,
}

impl SysxPool {
    /// Pre-allocate `capacity` slots with `buffer_size` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds the addressable number of slots.
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        assert!(capacity <= usize::from(u16::MAX));
        let slots = (0..capacity)
            .map(|_| Slot {
                state: SlotState::Idle,
                generation: 0,
                buf: Some(vec![0; buffer_size]),
                len: 0,
            })
            .collect();
        Self {
            slots,
            buffer_size,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of slots in the given state.
    #[must_use]
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Number of buffers that are currently lent to the transport.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.count(SlotState::Submitted)
    }

    /// Number of buffers that have been lent out, either to the caller
    /// or to the transport.
    #[must_use]
    pub fn lent(&self) -> usize {
        self.slots.iter().filter(|slot| slot.buf.is_none()).count()
    }

    /// Tokens of all slots in the given state.
    pub fn tokens(&self, state: SlotState) -> impl Iterator<Item = CorrelationToken> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(move |(_, slot)| slot.state == state)
            .map(|(index, slot)| token(index, slot))
    }

    /// Acquire an idle slot.
    ///
    /// The slot becomes [`SlotState::Prepared`] and its buffer is lent to the
    /// caller. The buffer has to be passed back with either [`Self::abort()`]
    /// or, after submission, [`Self::complete()`].
    pub fn acquire(&mut self) -> Result<(CorrelationToken, Vec<u8>), PoolExhausted> {
        let capacity = self.capacity();
        let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Idle)
        else {
            return Err(PoolExhausted { capacity });
        };
        Ok(self.lend(index))
    }

    /// Lend the buffer of a completed slot again for another transfer.
    pub fn rearm(
        &mut self,
        token: CorrelationToken,
    ) -> Result<(CorrelationToken, Vec<u8>), UnexpectedToken> {
        let index = self.index_of(token, SlotState::Completed)?;
        Ok(self.lend(index))
    }

    /// Mark a prepared slot as submitted to the transport.
    pub fn submitted(&mut self, token: CorrelationToken) -> Result<(), UnexpectedToken> {
        let index = self.index_of(token, SlotState::Prepared)?;
        self.slots[index].state = SlotState::Submitted;
        Ok(())
    }

    /// Return the buffer of a prepared slot that could not be submitted.
    pub fn abort(&mut self, token: CorrelationToken, buf: Vec<u8>) -> Result<(), UnexpectedToken> {
        let index = self.index_of(token, SlotState::Prepared)?;
        let slot = &mut self.slots[index];
        slot.buf = Some(buf);
        slot.len = 0;
        slot.state = SlotState::Idle;
        Ok(())
    }

    /// Take back the buffer of a submitted slot after the transport has
    /// signaled completion.
    ///
    /// `len` is the number of valid bytes in `buf`. On error the buffer
    /// is returned.
    pub fn complete(
        &mut self,
        token: CorrelationToken,
        buf: Vec<u8>,
        len: usize,
    ) -> Result<(), (UnexpectedToken, Vec<u8>)> {
        let index = match self.index_of(token, SlotState::Submitted) {
            Ok(index) => index,
            Err(err) => return Err((err, buf)),
        };
        let slot = &mut self.slots[index];
        slot.len = len.min(buf.len());
        slot.buf = Some(buf);
        slot.state = SlotState::Completed;
        Ok(())
    }

    /// Make a completed slot available again.
    pub fn release(&mut self, token: CorrelationToken) -> Result<(), UnexpectedToken> {
        let index = self.index_of(token, SlotState::Completed)?;
        let slot = &mut self.slots[index];
        slot.len = 0;
        slot.state = SlotState::Idle;
        Ok(())
    }

    /// The valid bytes of a completed slot.
    #[must_use]
    pub fn data(&self, token: CorrelationToken) -> Option<&[u8]> {
        let index = self.index_of(token, SlotState::Completed).ok()?;
        let slot = &self.slots[index];
        slot.buf.as_deref().map(|buf| &buf[..slot.len])
    }

    fn lend(&mut self, index: usize) -> (CorrelationToken, Vec<u8>) {
        let slot = &mut self.slots[index];
        debug_assert!(matches!(
            slot.state,
            SlotState::Idle | SlotState::Completed
        ));
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Prepared;
        slot.len = 0;
        let mut buf = slot.buf.take().unwrap_or_default();
        // A buffer may have been shrunk while it was lent out
        buf.resize(self.buffer_size, 0);
        (token(index, slot), buf)
    }

    fn index_of(
        &self,
        token: CorrelationToken,
        expected: SlotState,
    ) -> Result<usize, UnexpectedToken> {
        let index = token.index();
        match self.slots.get(index) {
            Some(slot) if slot.generation == token.generation && slot.state == expected => {
                Ok(index)
            }
            _ => Err(UnexpectedToken { token, expected }),
        }
    }
}

#[expect(clippy::cast_possible_truncation)]
const fn token(index: usize, slot: &Slot) -> CorrelationToken {
    CorrelationToken {
        index: index as u16,
        generation: slot.generation,
    }
}
