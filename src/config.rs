// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_RING_BUFFER_SIZE: usize = 4096;

pub const DEFAULT_SYSX_BUFFER_COUNT: usize = 4;

pub const DEFAULT_MAX_SYSX_SIZE: usize = 1024;

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

pub const DEFAULT_SHUTDOWN_RETRIES: u32 = 100;

pub const DEFAULT_SHUTDOWN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must not be 0")]
    Zero { name: &'static str },

    #[error("ring buffer of {ring_buffer_size} byte(s) cannot hold a SYSX message of {max_sysx_size} byte(s)")]
    RingBufferTooSmall {
        ring_buffer_size: usize,
        max_sysx_size: usize,
    },

    #[error("{sysx_buffer_count} SYSX buffer(s) exceed the maximum of {max}")]
    TooManySysxBuffers { sysx_buffer_count: usize, max: usize },

    #[error("event queue of {event_queue_capacity} event(s) cannot hold the completions of {sysx_buffer_count} SYSX buffer(s)")]
    EventQueueTooSmall {
        event_queue_capacity: usize,
        sysx_buffer_count: usize,
    },
}

/// Sizing of a MIDI channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Capacity of the input ring buffer in bytes
    ///
    /// Unused by outputs.
    pub ring_buffer_size: usize,

    /// Number of pre-allocated SYSX transfer buffers
    pub sysx_buffer_count: usize,

    /// Size of each SYSX transfer buffer in bytes
    pub max_sysx_size: usize,

    /// Capacity of the queue for transport events
    pub event_queue_capacity: usize,

    /// Number of polls while waiting for pending transfers on close
    pub shutdown_retries: u32,

    /// Sleep interval between polls while waiting on close
    pub shutdown_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            sysx_buffer_count: DEFAULT_SYSX_BUFFER_COUNT,
            max_sysx_size: DEFAULT_MAX_SYSX_SIZE,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            shutdown_retries: DEFAULT_SHUTDOWN_RETRIES,
            shutdown_interval: DEFAULT_SHUTDOWN_INTERVAL,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub const fn with_ring_buffer_size(mut self, ring_buffer_size: usize) -> Self {
        self.ring_buffer_size = ring_buffer_size;
        self
    }

    #[must_use]
    pub const fn with_sysx_buffers(mut self, count: usize, max_sysx_size: usize) -> Self {
        self.sysx_buffer_count = count;
        self.max_sysx_size = max_sysx_size;
        self
    }

    #[must_use]
    pub const fn with_event_queue_capacity(mut self, event_queue_capacity: usize) -> Self {
        self.event_queue_capacity = event_queue_capacity;
        self
    }

    #[must_use]
    pub const fn with_shutdown_budget(mut self, retries: u32, interval: Duration) -> Self {
        self.shutdown_retries = retries;
        self.shutdown_interval = interval;
        self
    }

    /// Upper bound for the time spent waiting on close.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_interval * self.shutdown_retries
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("ring buffer size", self.ring_buffer_size),
            ("SYSX buffer count", self.sysx_buffer_count),
            ("maximum SYSX size", self.max_sysx_size),
            ("event queue capacity", self.event_queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if self.ring_buffer_size < self.max_sysx_size {
            return Err(ConfigError::RingBufferTooSmall {
                ring_buffer_size: self.ring_buffer_size,
                max_sysx_size: self.max_sysx_size,
            });
        }
        // A reset returns all buffers at once while the queue might
        // already hold another event
        if self.event_queue_capacity <= self.sysx_buffer_count {
            return Err(ConfigError::EventQueueTooSmall {
                event_queue_capacity: self.event_queue_capacity,
                sysx_buffer_count: self.sysx_buffer_count,
            });
        }
        let max = usize::from(u16::MAX);
        if self.sysx_buffer_count > max {
            return Err(ConfigError::TooManySysxBuffers {
                sysx_buffer_count: self.sysx_buffer_count,
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ChannelConfig::default();
        assert_eq!(Ok(()), config.validate());
        assert_eq!(Duration::from_secs(1), config.shutdown_timeout());
    }

    #[test]
    fn reject_zero_sizes() {
        assert_eq!(
            Err(ConfigError::Zero {
                name: "SYSX buffer count"
            }),
            ChannelConfig::default().with_sysx_buffers(0, 256).validate()
        );
        assert!(matches!(
            ChannelConfig::default()
                .with_event_queue_capacity(0)
                .validate(),
            Err(ConfigError::Zero { .. })
        ));
    }

    #[test]
    fn ring_buffer_must_hold_a_sysx_message() {
        let config = ChannelConfig::default()
            .with_ring_buffer_size(512)
            .with_sysx_buffers(2, 1024);
        assert_eq!(
            Err(ConfigError::RingBufferTooSmall {
                ring_buffer_size: 512,
                max_sysx_size: 1024,
            }),
            config.validate()
        );
        assert_eq!(Ok(()), config.with_ring_buffer_size(1024).validate());
    }

    #[test]
    fn event_queue_must_exceed_sysx_buffer_count() {
        let config = ChannelConfig::default()
            .with_sysx_buffers(8, 256)
            .with_event_queue_capacity(8);
        assert_eq!(
            Err(ConfigError::EventQueueTooSmall {
                event_queue_capacity: 8,
                sysx_buffer_count: 8,
            }),
            config.validate()
        );
        assert_eq!(Ok(()), config.with_event_queue_capacity(9).validate());
    }
}
