// SPDX-FileCopyrightText: The midiio authors
// SPDX-License-Identifier: MPL-2.0

use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::{
    config::ConfigError,
    transport::{OpenError, TransportError},
    BufferOverrun, PoolExhausted,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum MalformedReason {
    /// 0xf4, 0xf5 or a stray 0xf7
    UndefinedStatus,
    /// Data byte without an active running status
    MissingRunningStatus,
    /// The stream ended or a status byte occurred before all data bytes
    Truncated,
    /// Data bytes after a complete message
    ExcessData,
}

/// A byte sequence that does not form a valid message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed message at offset {offset}: {reason} (0x{byte:02x})")]
pub struct MalformedMessage {
    /// Offset of the offending byte in the scanned stream
    pub offset: usize,
    pub byte: u8,
    pub reason: MalformedReason,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no device selected")]
    NoDeviceSelected,

    #[error("device \"{name}\" not found")]
    DeviceNotFound { name: String },

    #[error("device \"{name}\" is busy")]
    DeviceBusy { name: String },

    #[error(transparent)]
    TransportCallFailed(#[from] TransportError),

    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),

    #[error(transparent)]
    MalformedMessage(#[from] MalformedMessage),

    #[error(transparent)]
    BufferOverrun(#[from] BufferOverrun),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("channel closed")]
    Closed,
}

impl Error {
    pub(crate) fn from_open_error(err: OpenError, name: &str) -> Self {
        match err {
            OpenError::NotFound => Self::DeviceNotFound {
                name: name.to_owned(),
            },
            OpenError::Busy => Self::DeviceBusy {
                name: name.to_owned(),
            },
            OpenError::Transport(err) => Self::TransportCallFailed(err),
        }
    }

    /// Transient conditions that may succeed when retried later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::BufferOverrun(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
