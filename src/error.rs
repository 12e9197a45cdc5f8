//! Arena errors.
//!
//! Every failure is returned from the call that detected it. Nothing is
//! retried or repaired internally.

use std::io;

use thiserror::Error;

/// Result type for arena operations.
pub type Result<T> = std::result::Result<T, ArenaError>;

/// Coarse error code, one per failure family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// Zero size, bad alignment, null or out-of-range pointer, bad config
    InvalidArgument = 0,
    /// No sub-arena has enough contiguous room
    OutOfMemory = 1,
    /// A header that should be live was not
    Corruption = 2,
    /// Backing memory could not be acquired
    System = 3,
}

/// Why a header was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionReason {
    /// The header carries the freed sentinel (double free)
    AlreadyFreed,
    /// The header carries neither sentinel (overrun or wild pointer)
    BadMagic,
    /// The recorded sub-arena id does not exist
    UnknownSubArena,
    /// The block does not lie inside its recorded sub-arena
    OutOfBounds,
    /// The recorded size class is not a valid class
    BadSizeClass,
    /// A free list revisits a block
    FreeListCycle,
    /// A free-list entry belongs to a different sub-arena or class
    ForeignBlock,
}

impl std::fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CorruptionReason::AlreadyFreed => "block already freed",
            CorruptionReason::BadMagic => "header magic is not a known sentinel",
            CorruptionReason::UnknownSubArena => "header names an unknown sub-arena",
            CorruptionReason::OutOfBounds => "block lies outside its sub-arena",
            CorruptionReason::BadSizeClass => "header carries an invalid size class",
            CorruptionReason::FreeListCycle => "free list contains a cycle",
            CorruptionReason::ForeignBlock => "free list contains a foreign block",
        };
        f.write_str(text)
    }
}

/// Errors that can occur during arena operations.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    /// The configuration could not be parsed or failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// No sub-arena could satisfy the request.
    #[error("arena {arena_id} out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize, arena_id: u32 },

    /// A block header failed validation.
    #[error("corruption at offset {offset}: {reason}")]
    Corruption { offset: u32, reason: CorruptionReason },

    /// Backing memory acquisition or release failed.
    #[error("system error: {source}")]
    System {
        #[from]
        source: io::Error,
    },
}

impl ArenaError {
    /// Creates an invalid-argument error.
    pub const fn invalid(reason: &'static str) -> Self {
        Self::InvalidArgument { reason }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub const fn corruption(offset: u32, reason: CorruptionReason) -> Self {
        Self::Corruption { offset, reason }
    }

    /// The error code this error belongs to.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::InvalidConfig { .. } => ErrorKind::InvalidArgument,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::Corruption { .. } => ErrorKind::Corruption,
            Self::System { .. } => ErrorKind::System,
        }
    }

    /// Returns true if the caller can recover (e.g. spill elsewhere).
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Returns true if this should stop the enclosing task.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

impl From<toml::de::Error> for ArenaError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}
