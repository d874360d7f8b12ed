//! Error types for tun-nat
//!
//! Errors are grouped by subsystem. The packet pump never propagates
//! packet-level errors upwards: they are counted, logged at trace level and
//! the packet is dropped. Only listener and device failures reach the
//! engine's error sink.

use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Top-level error type for tun-nat
#[derive(Debug, Error)]
pub enum NatError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or unsupported packet
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Session table errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// TUN device errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Stub listener errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// UDP write-back and pull socket errors
    #[error("UDP error: {0}")]
    Udp(#[from] UdpError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NatError {
    /// Check if this error is recoverable (the engine keeps running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Packet(_) => true,
            Self::Session(e) => e.is_recoverable(),
            Self::Device(e) => e.is_recoverable(),
            Self::Listener(e) => e.is_recoverable(),
            Self::Udp(e) => e.is_recoverable(),
            Self::Io(e) => is_transient_io(e),
        }
    }

    /// True when the error only signals an orderly shutdown
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Self::Device(DeviceError::Closed)
                | Self::Listener(ListenerError::Closed)
                | Self::Udp(UdpError::Closed | UdpError::WriteBack(DeviceError::Closed))
        )
    }
}

/// I/O error kinds that only affect a single operation
pub(crate) fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Packet parsing and rewriting errors
///
/// Every variant maps to a silent drop in the pump.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the header it claims to hold
    #[error("Truncated {layer} header: {len} bytes")]
    Truncated { layer: &'static str, len: usize },

    /// Length or offset fields disagree with the buffer
    #[error("Malformed {layer} header: {reason}")]
    Malformed {
        layer: &'static str,
        reason: &'static str,
    },

    /// IP version nibble is neither 4 nor 6
    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    /// Checksum did not verify
    #[error("Bad {0} checksum")]
    BadChecksum(&'static str),

    /// Fragmented datagrams are never reassembled
    #[error("Fragmented packet")]
    Fragmented,

    /// An address of the wrong family was written into a header
    #[error("Address family mismatch: {0}")]
    FamilyMismatch(IpAddr),

    /// Synthesized packet would exceed the 16-bit total length
    #[error("Packet too large: {0} bytes")]
    TooLarge(usize),
}

/// Session table errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Every session port in the range is in use
    #[error("Session ports exhausted ({in_use} in use)")]
    Exhausted { in_use: usize },

    /// Reply or accepted connection names a port with no session
    #[error("No session for port {0}")]
    UnknownPort(u16),

    /// Non-SYN segment for a flow that has no session
    #[error("No session for {0}")]
    NoSession(String),

    /// Segment addressed to the portal from somewhere other than the listener
    #[error("Stray segment to portal from {0}")]
    Stray(SocketAddr),

    /// IPv6 packet while IPv6 is disabled
    #[error("IPv6 disabled")]
    Ipv6Disabled,
}

impl SessionError {
    /// Only exhaustion is worth surfacing; the rest are ordinary drops
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// TUN device errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Failed to open or configure the device
    #[error("Failed to open TUN device {name}: {reason}")]
    Open { name: String, reason: String },

    /// Read or write on the device failed
    #[error("Device I/O error: {0}")]
    Io(#[from] io::Error),

    /// Device was closed
    #[error("Device closed")]
    Closed,
}

impl DeviceError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Open { .. } | Self::Closed => false,
            Self::Io(e) => is_transient_io(e),
        }
    }
}

/// Stub listener errors
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to create or bind the listener socket
    #[error("Failed to bind listener on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Accept failed with a non-transient error
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),

    /// Accepted connection did not come from a known session
    #[error("Rejected connection from {peer}: {reason}")]
    Rejected { peer: SocketAddr, reason: String },

    /// Listener closed during shutdown
    #[error("Listener closed")]
    Closed,

    /// The accept loop died earlier, so no new connection can be redirected
    #[error("TCP redirector stopped after a listener failure")]
    Stopped,
}

impl ListenerError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::Closed | Self::Stopped => false,
            Self::Accept(e) => is_transient_io(e),
            Self::Rejected { .. } => true,
        }
    }
}

/// UDP write-back and pull socket errors
#[derive(Debug, Error)]
pub enum UdpError {
    /// Reply source and client are of different address families
    #[error("Reply source {source_addr} does not match client family {client}")]
    FamilyMismatch {
        source_addr: SocketAddr,
        client: SocketAddr,
    },

    /// Reply payload does not fit in a single datagram
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Failed to write the reply to the device
    #[error("Write-back failed: {0}")]
    WriteBack(#[from] DeviceError),

    /// Pull socket closed
    #[error("UDP socket closed")]
    Closed,
}

impl UdpError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::FamilyMismatch { .. } | Self::PayloadTooLarge(_) => true,
            Self::WriteBack(e) => e.is_recoverable(),
            Self::Closed => false,
        }
    }
}

/// Result type alias for tun-nat operations
pub type Result<T> = std::result::Result<T, NatError>;
