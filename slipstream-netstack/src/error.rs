//! Error types for the Slipstream network stack

use std::io;
use thiserror::Error;

/// Result type alias for netstack operations
pub type Result<T> = std::result::Result<T, NetStackError>;

/// Main error type for the packet engine and its collaborators
#[derive(Error, Debug)]
pub enum NetStackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Flow error: {0}")]
    Flow(String),

    #[error("Session error: {0}")]
    Session(#[from] slipstream_core::Error),

    #[error("DNS upstream timed out")]
    DnsTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("TUN device not ready")]
    DeviceNotReady,

    #[error("Engine stopped")]
    EngineStopped,
}
