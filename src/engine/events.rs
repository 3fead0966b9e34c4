//! Embedder callback interface
//!
//! The engine is driven by its embedder: packets in, readiness results in,
//! synthesized packets out through [`TunnelEvents::send_client`]. All hooks
//! except `send_client` have no-op defaults.

use std::io;
use std::os::fd::RawFd;

use crate::conn::Conn;

/// Which way a packet is traveling, as seen from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the client into the engine (read off the tun device)
    FromClient,
    /// From the engine back to the client (to be written to the tun device)
    ToClient,
}

/// Callbacks consumed by the engine
///
/// Within a single engine call, each hook fires at most a bounded number of
/// times and always on the caller's thread. The engine guarantees that
/// [`connection_opened`](Self::connection_opened) fires exactly once before
/// any forwarding on a connection, that
/// [`connection_closed`](Self::connection_closed) fires exactly once before
/// the record is destroyed, and that no callback fires for a connection
/// after its destruction returns.
pub trait TunnelEvents {
    /// Deliver a synthesized IPv4 packet to the client
    ///
    /// # Errors
    ///
    /// Returning an error closes the connection the packet belongs to.
    fn send_client(&mut self, packet: &[u8], conn: &Conn) -> io::Result<()>;

    /// An OS socket was opened on behalf of a connection
    fn socket_opened(&mut self, _fd: RawFd) {}

    /// An OS socket was released
    fn socket_closed(&mut self, _fd: RawFd) {}

    /// A connection is about to be created; return `false` to refuse it
    fn connection_opened(&mut self, _conn: &Conn) -> bool {
        true
    }

    /// A connection was logically closed; last chance to release user state
    fn connection_closed(&mut self, _conn: &Conn) {}

    /// Observe a packet crossing the engine boundary
    fn account_packet(&mut self, _packet: &[u8], _direction: Direction, _conn: &Conn) {}
}
