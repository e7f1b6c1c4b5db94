//! Transport error taxonomy
//!
//! Raw controller status is decoded once, by the adapter or the dispatcher,
//! into these types. Nothing above that layer looks at status bits again.

use core::fmt;

/// `host_init` failures; no partial state survives them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The adapter cannot provide the requested transfer mode
    UnsupportedMode,
    /// The controller did not respond to probing or reset
    AdapterUnavailable,
}

/// Clock programming failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    /// The "clock stable" bit never asserted within the retry cap
    NotStable,
}

/// Per-request failures of commands and data phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The command asked for a response format the engine cannot decode
    UnsupportedResponse,
    /// A bounded wait ran out
    Timeout,
    /// CRC mismatch on the command or data line
    Crc,
    /// Receive FIFO overflowed
    FifoOverrun,
    /// Transmit FIFO ran dry
    FifoUnderrun,
    /// All words moved but the controller never reported completion
    Incomplete,
    /// Request issued in a state that forbids it (clock off, busy direction)
    OrderingViolation,
    /// A command argument or descriptor field is out of range
    InvalidArgument,
}

/// DMA setup failures; the data engine falls back to the FIFO path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// The channel for this direction is already in use
    ChannelBusy,
    /// The adapter cannot DMA this descriptor (alignment, size, no engine)
    Unsupported,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedMode => f.write_str("transfer mode not supported by adapter"),
            Self::AdapterUnavailable => f.write_str("bus controller unavailable"),
        }
    }
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStable => f.write_str("bus clock did not stabilise"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::UnsupportedResponse => "unsupported response kind",
            Self::Timeout => "timed out",
            Self::Crc => "CRC error",
            Self::FifoOverrun => "FIFO overrun",
            Self::FifoUnderrun => "FIFO underrun",
            Self::Incomplete => "transfer incomplete",
            Self::OrderingViolation => "request out of order",
            Self::InvalidArgument => "invalid argument",
        };
        f.write_str(msg)
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelBusy => f.write_str("DMA channel busy"),
            Self::Unsupported => f.write_str("DMA not possible for this transfer"),
        }
    }
}
