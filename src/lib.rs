// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = include_str!("../README.md")]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(unreachable_pub)]
#![warn(unsafe_code)]
#![warn(clippy::pedantic)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(rustdoc::broken_intra_doc_links)]
// Repetitions of module/type names occur frequently when using many
// modules for keeping the size of the source files handy. Often
// types have the same name as their parent module.
#![allow(clippy::module_name_repetitions)]
// Repeating the type name in `..Default::default()` expressions
// is not needed since the context is obvious.
#![allow(clippy::default_trait_access)]

mod config;
pub use self::config::{
    ChannelConfig, ConfigError, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_MAX_SYSX_SIZE,
    DEFAULT_RING_BUFFER_SIZE, DEFAULT_SHUTDOWN_INTERVAL, DEFAULT_SHUTDOWN_RETRIES,
    DEFAULT_SYSX_BUFFER_COUNT,
};

mod error;
pub use self::error::{Error, MalformedMessage, MalformedReason, Result};

pub mod input;
pub use self::input::{InputDefragmenter, InputStats, MidiInput};

pub mod message;
pub use self::message::{MessageClass, MessageLength, ShortMessage};

pub mod output;
pub use self::output::{Frame, MidiOutput, OutputFramer, PutBytes};

mod ring_buffer;
pub use self::ring_buffer::{BufferOverrun, RingBuffer};

mod shutdown;
pub use self::shutdown::Shutdown;

mod sysx_pool;
pub use self::sysx_pool::{CorrelationToken, PoolExhausted, SlotState, SysxPool, UnexpectedToken};

mod thread;
pub use self::thread::{Pump, PumpThread, DEFAULT_PUMP_INTERVAL};

pub mod transport;
pub use self::transport::{DeviceSelector, Transport, TransportEvent};
