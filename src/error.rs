//! Error types for tunnat
//!
//! This module defines the error hierarchy for the tunneling engine.
//! Errors are categorized by subsystem and include recovery hints so the
//! embedder's loop can decide whether to keep driving the engine.

use std::io;

use thiserror::Error;

/// Top-level error type for tunnat
#[derive(Debug, Error)]
pub enum TunnatError {
    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet decoding errors
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Forwarding and socket errors
    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    /// The shared raw ICMP socket could not be opened at engine startup
    #[error("Failed to open raw ICMP socket: {0}")]
    IcmpSocket(io::Error),
}

impl TunnatError {
    /// Check if this error is recoverable (the engine can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Packet(e) => e.is_recoverable(),
            Self::Forward(e) => e.is_recoverable(),
            Self::IcmpSocket(_) => false,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value or inconsistent pair of values
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    /// Config errors require user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// Packet decoding errors
///
/// One distinct variant per reject class so the embedder can count and log
/// them separately. The parser never mutates engine state, so every variant
/// is recoverable: drop the packet and keep reading from the tun device.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// IP version field is not 4
    #[error("Unsupported IP version: {0}")]
    UnsupportedIpVersion(u8),

    /// Buffer shorter than the advertised IP header
    #[error("Truncated IP packet")]
    TruncatedIp,

    /// TCP segment shorter than the minimum 20-byte header
    #[error("Truncated TCP segment")]
    TruncatedTcp,

    /// TCP data offset points past the end of the buffer (or below 20)
    #[error("Malformed TCP data offset")]
    MalformedTcpOffset,

    /// UDP datagram shorter than the 8-byte header
    #[error("Truncated UDP datagram")]
    TruncatedUdp,

    /// ICMP message shorter than the 8-byte echo header
    #[error("Truncated ICMP message")]
    TruncatedIcmp,

    /// ICMP message that is neither echo request nor echo reply
    #[error("Unsupported ICMP type: {0}")]
    UnsupportedIcmpType(u8),

    /// L4 protocol other than TCP, UDP or ICMP
    #[error("Unknown IP protocol: {0}")]
    UnknownProtocol(u8),
}

impl PacketError {
    /// Packet errors never corrupt engine state
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Check whether this is an "unsupported" soft reject (drop silently)
    /// rather than a malformed input.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedIpVersion(_) | Self::UnsupportedIcmpType(_) | Self::UnknownProtocol(_)
        )
    }
}

/// Forwarding errors
///
/// Peer-side socket failures (refused, reset, aborted) are absorbed inside
/// the engine and surface only as a closed connection; the variants here are
/// the failures that reach the caller.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No connection exists for the packet's 5-tuple
    #[error("No connection for 5-tuple")]
    NoConnection,

    /// Failed to create an OS socket
    #[error("Failed to create socket: {0}")]
    SocketCreate(#[source] io::Error),

    /// Failed to connect a TCP socket (synchronous failure)
    #[error("Failed to connect: {0}")]
    Connect(#[source] io::Error),

    /// Failed to send payload on the connection's socket
    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    /// Failed to receive from the connection's socket
    #[error("Receive failed: {0}")]
    Recv(#[source] io::Error),
}

impl ForwardError {
    /// Check if this error is recoverable
    ///
    /// Transient send/recv/connect failures kill at most one connection;
    /// the engine itself remains usable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoConnection => true,
            Self::SocketCreate(_) => false,
            Self::Connect(_) | Self::Send(_) | Self::Recv(_) => true,
        }
    }
}

/// Type alias for Result with TunnatError
pub type Result<T> = std::result::Result<T, TunnatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        assert!(PacketError::TruncatedIp.is_recoverable());
        assert!(PacketError::UnknownProtocol(47).is_recoverable());

        assert!(!ForwardError::SocketCreate(io::Error::from(io::ErrorKind::Other)).is_recoverable());
        assert!(ForwardError::Send(io::Error::from(io::ErrorKind::BrokenPipe)).is_recoverable());

        let config_err = ConfigError::validation("bad ceiling");
        assert!(!config_err.is_recoverable());

        let top: TunnatError = PacketError::TruncatedTcp.into();
        assert!(top.is_recoverable());
    }

    #[test]
    fn test_unsupported_classification() {
        assert!(PacketError::UnsupportedIpVersion(6).is_unsupported());
        assert!(PacketError::UnsupportedIcmpType(3).is_unsupported());
        assert!(PacketError::UnknownProtocol(47).is_unsupported());
        assert!(!PacketError::TruncatedUdp.is_unsupported());
        assert!(!PacketError::MalformedTcpOffset.is_unsupported());
    }

    #[test]
    fn test_error_display() {
        let err = PacketError::UnknownProtocol(47);
        assert!(err.to_string().contains("47"));

        let err = TunnatError::IcmpSocket(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.to_string().contains("ICMP"));
    }
}
