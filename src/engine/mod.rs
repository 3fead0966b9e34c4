//! The tunneling engine
//!
//! [`Engine`] owns the connection table, the readiness interest sets, the
//! shared raw ICMP socket and the scratch reply buffer. It is
//! single-threaded and cooperative: every public operation performs at most
//! one non-blocking syscall per connection and returns; the embedder
//! suspends on its own readiness primitive and calls back in with the
//! result.
//!
//! ```text
//! tun reader -> parse() -> lookup()/forward() -> OS socket
//! readiness  -> dispatch() -> reply handler -> send_client callback
//! timer tick -> purge_expired()
//! ```

mod events;
mod icmp;
mod tcp;
mod udp;

pub use events::{Direction, TunnelEvents};

use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::conn::{Conn, ConnStatus, ConnTable, ProtoState};
use crate::error::{ForwardError, TunnatError};
use crate::packet::{self, tcp_flags, FiveTuple, PacketView, Proto, Transport, MAX_PACKET_SIZE};
use crate::stats::TunnelStats;

/// Seconds since the Unix epoch
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A set of socket descriptors
///
/// Used both for the engine's interest sets and for the readiness results
/// the embedder passes back into [`Engine::dispatch`].
#[derive(Debug, Default, Clone)]
pub struct FdSet {
    fds: HashSet<RawFd>,
}

impl FdSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor
    pub fn insert(&mut self, fd: RawFd) {
        self.fds.insert(fd);
    }

    /// Remove a descriptor
    pub fn remove(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
    }

    /// Check membership
    #[must_use]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.contains(&fd)
    }

    /// Number of descriptors in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Check if the set is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Iterate the descriptors
    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.fds.iter().copied()
    }

    /// The highest descriptor, for select-style callers
    #[must_use]
    pub fn max_fd(&self) -> Option<RawFd> {
        self.fds.iter().copied().max()
    }
}

impl FromIterator<RawFd> for FdSet {
    fn from_iter<I: IntoIterator<Item = RawFd>>(iter: I) -> Self {
        Self {
            fds: iter.into_iter().collect(),
        }
    }
}

/// The descriptors the engine currently wants readiness signals for
#[derive(Debug, Clone)]
pub struct Interest {
    /// Sockets to watch for readability
    pub readable: FdSet,
    /// Sockets waiting for asynchronous TCP connect completion
    pub writable: FdSet,
}

impl Interest {
    /// The highest descriptor across both sets, for select-style callers
    #[must_use]
    pub fn max_fd(&self) -> Option<RawFd> {
        self.readable.max_fd().max(self.writable.max_fd())
    }
}

/// Everything the engine owns except the connection table
///
/// Split from the table so forwarding helpers can mutate engine state while
/// holding a `&mut Conn` borrowed out of the table.
pub(crate) struct Core<H: TunnelEvents> {
    pub(crate) handler: H,
    pub(crate) config: EngineConfig,
    /// Single-writer scratch buffer; one reply is built at a time
    pub(crate) reply_buf: Box<[u8]>,
    pub(crate) all_fds: FdSet,
    pub(crate) connecting: FdSet,
    pub(crate) num_open_socks: usize,
    pub(crate) opened_tcp: u32,
    pub(crate) opened_udp: u32,
    pub(crate) opened_icmp: u32,
    pub(crate) icmp_socket: Option<Socket>,
    pub(crate) max_tcp_window: u16,
}

impl<H: TunnelEvents> Core<H> {
    /// Send the first `len` bytes of the scratch buffer to the client
    ///
    /// A failing `send_client` closes the connection.
    pub(crate) fn send_to_client(&mut self, conn: &mut Conn, len: usize) -> io::Result<()> {
        match self.handler.send_client(&self.reply_buf[..len], conn) {
            Ok(()) => {
                self.handler
                    .account_packet(&self.reply_buf[..len], Direction::ToClient, conn);
                Ok(())
            }
            Err(e) => {
                warn!(conn = %conn.tuple(), error = %e, "send_client failed, closing connection");
                self.close(conn);
                Err(e)
            }
        }
    }

    /// Release the connection's OS socket and drop it from the interest sets
    pub(crate) fn finalize_socket(&mut self, conn: &mut Conn) {
        if let Some(sock) = conn.sock.take() {
            let fd = sock.as_raw_fd();
            self.all_fds.remove(fd);
            self.connecting.remove(fd);
            drop(sock);
            self.handler.socket_closed(fd);
            self.num_open_socks -= 1;
            trace!(fd, "socket released");
        }
    }

    /// Logically close a connection
    ///
    /// Idempotent. Releases the socket immediately, emits a RST toward the
    /// client for established TCP flows that have not seen a FIN+ACK, fires
    /// the close callback, and leaves the record in the table for the next
    /// purge.
    pub(crate) fn close(&mut self, conn: &mut Conn) {
        self.close_with(conn, true);
    }

    /// [`close`](Self::close), optionally suppressing the teardown RST
    ///
    /// Used when the client itself sent the RST: from its point of view the
    /// remote is already gone.
    pub(crate) fn close_with(&mut self, conn: &mut Conn, teardown: bool) {
        if conn.status == ConnStatus::Closed {
            return;
        }
        let was_connected = conn.status == ConnStatus::Connected;
        // Flip the status first: the RST below goes through send_client,
        // whose failure path re-enters close().
        conn.status = ConnStatus::Closed;

        self.finalize_socket(conn);

        let mut rst_needed = false;
        if let ProtoState::Tcp(t) = &mut conn.proto {
            t.pending = None;
            rst_needed = teardown && was_connected && !t.fin_ack_sent;
        }
        if rst_needed {
            let _ = self.emit_tcp(conn, tcp_flags::RST | tcp_flags::ACK, 0, 0);
        }

        self.handler.connection_closed(conn);
        debug!(conn = %conn.tuple(), "connection closed");
    }

    /// Forward a parsed client packet on its connection
    pub(crate) fn forward_conn(
        &mut self,
        conn: &mut Conn,
        pkt: &PacketView<'_>,
        no_ack: bool,
    ) -> Result<(), ForwardError> {
        if conn.status == ConnStatus::Closed {
            debug!(conn = %conn.tuple(), "refusing to forward on closed connection");
            return Ok(());
        }

        let result = match &pkt.transport {
            Transport::Tcp(tcp) => self.handle_tcp_forward(conn, pkt, tcp, no_ack),
            Transport::Udp(_) => self.handle_udp_forward(conn, pkt),
            Transport::Icmp(_) => self.handle_icmp_forward(conn, pkt),
        };

        if result.is_ok() {
            conn.tstamp = unix_now();
            if conn.status == ConnStatus::New {
                warn!(conn = %conn.tuple(), "connection still NEW after forward");
            }
        }
        result
    }
}

/// User-space packet-to-socket tunneling engine
///
/// Generic over the embedder's [`TunnelEvents`] implementation. Not `Sync`
/// and not internally concurrent: a single owning thread drives the
/// forwarding calls, the readiness dispatch and the periodic purge.
pub struct Engine<H: TunnelEvents> {
    conns: ConnTable,
    core: Core<H>,
}

impl<H: TunnelEvents> Engine<H> {
    /// Create an engine
    ///
    /// Opens the shared raw ICMP socket unless the configuration disables
    /// it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation or the raw
    /// ICMP socket cannot be opened (usually missing privileges).
    pub fn new(config: EngineConfig, handler: H) -> Result<Self, TunnatError> {
        config.validate()?;

        let max_tcp_window = config.max_tcp_window;
        let mut core = Core {
            handler,
            config,
            reply_buf: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
            all_fds: FdSet::new(),
            connecting: FdSet::new(),
            num_open_socks: 0,
            opened_tcp: 0,
            opened_udp: 0,
            opened_icmp: 0,
            icmp_socket: None,
            max_tcp_window,
        };

        if core.config.icmp {
            let sock = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
                .map_err(TunnatError::IcmpSocket)?;
            let fd = sock.as_raw_fd();
            core.handler.socket_opened(fd);
            core.all_fds.insert(fd);
            core.num_open_socks += 1;
            core.icmp_socket = Some(sock);
            debug!(fd, "shared ICMP socket opened");
        }

        Ok(Self {
            conns: ConnTable::new(),
            core,
        })
    }

    /// Borrow the embedder's handler
    pub fn handler(&self) -> &H {
        &self.core.handler
    }

    /// Mutably borrow the embedder's handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.core.handler
    }

    /// The engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Override the maximum TCP window advertised to clients
    pub fn set_max_tcp_window(&mut self, window: u16) {
        self.core.max_tcp_window = window;
    }

    /// Look up a connection by 5-tuple, optionally creating it
    ///
    /// Creation runs an eager purge first when the open-socket count has
    /// reached the configured ceiling, then asks the embedder through
    /// `connection_opened`; a refusal returns `None`.
    pub fn lookup(&mut self, tuple: &FiveTuple, create: bool) -> Option<&mut Conn> {
        if create && !self.conns.contains(tuple) {
            if tuple.proto == Proto::Icmp && self.core.icmp_socket.is_none() {
                debug!(conn = %tuple, "ICMP disabled, refusing connection");
                return None;
            }
            if self.core.num_open_socks >= self.core.config.max_sockets {
                debug!(
                    open = self.core.num_open_socks,
                    "socket ceiling reached, purging eagerly"
                );
                self.purge_expired(unix_now());
            }

            let conn = Conn::new(*tuple, unix_now());
            if !self.core.handler.connection_opened(&conn) {
                debug!(conn = %tuple, "connection refused by embedder");
                return None;
            }
            self.conns.insert(conn);
            trace!(conn = %tuple, "connection created");
        }
        self.conns.get_mut(tuple)
    }

    /// Forward a parsed client packet, acknowledging TCP payload
    ///
    /// # Errors
    ///
    /// Fails if no connection exists for the packet's tuple or the
    /// underlying socket operation fails; per-peer socket errors are
    /// absorbed as connection closure and reported as success.
    pub fn forward(&mut self, pkt: &PacketView<'_>) -> Result<(), ForwardError> {
        let Some(conn) = self.conns.get_mut(&pkt.tuple) else {
            return Err(ForwardError::NoConnection);
        };
        self.core.forward_conn(conn, pkt, false)
    }

    /// Forward a parsed client packet without advancing the client sequence
    /// or emitting the ACK
    ///
    /// Used to inject out-of-band data into a TCP stream.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub fn forward_oob(&mut self, pkt: &PacketView<'_>) -> Result<(), ForwardError> {
        let Some(conn) = self.conns.get_mut(&pkt.tuple) else {
            return Err(ForwardError::NoConnection);
        };
        self.core.forward_conn(conn, pkt, true)
    }

    /// Parse, look up (creating if appropriate) and forward in one call
    ///
    /// A TCP packet that is not an initial SYN never creates a connection:
    /// mid-stream segments of flows the engine does not know are ignored.
    /// On a forward error the connection is destroyed immediately.
    ///
    /// Returns the packet's tuple when it was forwarded, `None` when it was
    /// ignored or refused.
    ///
    /// # Errors
    ///
    /// Propagates parse and forward errors.
    pub fn easy_forward(&mut self, data: &[u8]) -> Result<Option<FiveTuple>, TunnatError> {
        let pkt = packet::parse(data)?;

        let tcp_established = matches!(
            &pkt.transport,
            Transport::Tcp(t) if !t.has(tcp_flags::SYN) || t.has(tcp_flags::ACK)
        );

        if self.lookup(&pkt.tuple, !tcp_established).is_none() {
            if tcp_established {
                trace!(conn = %pkt.tuple, "ignoring mid-stream TCP segment");
            }
            return Ok(None);
        }

        match self.forward(&pkt) {
            Ok(()) => Ok(Some(pkt.tuple)),
            Err(e) => {
                debug!(conn = %pkt.tuple, error = %e, "forward failed, destroying connection");
                self.destroy(&pkt.tuple);
                Err(e.into())
            }
        }
    }

    /// Destroy a connection: close it (idempotent) and remove the record
    ///
    /// Returns whether a record existed. After destruction the identity is
    /// gone; a later packet with the same 5-tuple creates a fresh
    /// connection.
    pub fn destroy(&mut self, tuple: &FiveTuple) -> bool {
        match self.conns.remove(tuple) {
            Some(mut conn) => {
                self.core.close(&mut conn);
                true
            }
            None => false,
        }
    }

    /// The descriptors to wait on before the next [`dispatch`](Self::dispatch)
    #[must_use]
    pub fn interest(&self) -> Interest {
        Interest {
            readable: self.core.all_fds.clone(),
            writable: self.core.connecting.clone(),
        }
    }

    /// Route a readiness result to the per-protocol reply handlers
    ///
    /// Returns the number of dispatched events.
    pub fn dispatch(&mut self, readable: &FdSet, writable: &FdSet) -> usize {
        let mut hits = 0;

        let icmp_ready = self
            .core
            .icmp_socket
            .as_ref()
            .is_some_and(|s| readable.contains(s.as_raw_fd()));
        if icmp_ready {
            if let Err(e) = self.core.handle_icmp_reply(&mut self.conns) {
                debug!(error = %e, "ICMP reply handling failed");
            }
            hits += 1;
        }

        for conn in self.conns.values_mut() {
            let Some(fd) = conn.socket_fd() else { continue };

            if readable.contains(fd) {
                let result = match conn.tuple().proto {
                    Proto::Tcp => self.core.handle_tcp_reply(conn),
                    Proto::Udp => self.core.handle_udp_reply(conn),
                    Proto::Icmp => {
                        warn!(fd, "readable socket on an ICMP connection");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    debug!(conn = %conn.tuple(), error = %e, "reply handling failed");
                }
                hits += 1;
            } else if writable.contains(fd) {
                match conn.tuple().proto {
                    Proto::Tcp => {
                        if let Err(e) = self.core.handle_tcp_connect_result(conn) {
                            debug!(conn = %conn.tuple(), error = %e, "connect completion failed");
                        }
                    }
                    proto => warn!(fd, %proto, "writable socket on a non-TCP connection"),
                }
                hits += 1;
            }
        }

        hits
    }

    /// Evict stale connections
    ///
    /// First destroys records that are logically closed or idle beyond
    /// their protocol's budget at `now`; if the open-socket count still
    /// exceeds the ceiling, destroys the oldest records until it falls to
    /// the configured post-purge target.
    pub fn purge_expired(&mut self, now: u64) {
        for tuple in self.conns.collect_expired(now, &self.core.config) {
            trace!(conn = %tuple, "purging idle connection");
            self.destroy(&tuple);
        }

        if self.core.num_open_socks > self.core.config.max_sockets {
            let mut to_purge = self.core.num_open_socks - self.core.config.sockets_after_purge;
            debug!(to_purge, "socket ceiling exceeded, evicting oldest");

            for tuple in self.conns.oldest_first() {
                if to_purge == 0 {
                    break;
                }
                self.destroy(&tuple);
                to_purge -= 1;
            }
        }
    }

    /// Iterate connections that are not logically closed
    pub fn connections(&self) -> impl Iterator<Item = &Conn> {
        self.conns.active()
    }

    /// Number of records in the table (including closed ones awaiting purge)
    #[must_use]
    pub fn num_connections(&self) -> usize {
        self.conns.len()
    }

    /// Aggregate statistics
    #[must_use]
    pub fn stats(&self) -> TunnelStats {
        let mut stats = TunnelStats {
            num_open_sockets: self.core.num_open_socks,
            num_connections: self.conns.len(),
            total_tcp_opened: self.core.opened_tcp,
            total_udp_opened: self.core.opened_udp,
            total_icmp_opened: self.core.opened_icmp,
            ..TunnelStats::default()
        };

        for conn in self.conns.values() {
            let (count, oldest) = match conn.tuple().proto {
                Proto::Tcp => (&mut stats.num_tcp_conns, &mut stats.oldest_tcp_tstamp),
                Proto::Udp => (&mut stats.num_udp_conns, &mut stats.oldest_udp_tstamp),
                Proto::Icmp => (&mut stats.num_icmp_conns, &mut stats.oldest_icmp_tstamp),
            };
            *count += 1;
            *oldest = Some(oldest.map_or(conn.tstamp, |t: u64| t.min(conn.tstamp)));
        }

        stats
    }
}

impl<H: TunnelEvents> Drop for Engine<H> {
    fn drop(&mut self) {
        let tuples: Vec<FiveTuple> = self.conns.values().map(|c| *c.tuple()).collect();
        for tuple in tuples {
            self.destroy(&tuple);
        }

        if let Some(sock) = self.core.icmp_socket.take() {
            let fd = sock.as_raw_fd();
            drop(sock);
            self.core.handler.socket_closed(fd);
            self.core.num_open_socks -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_set() {
        let mut set = FdSet::new();
        assert!(set.is_empty());
        assert_eq!(set.max_fd(), None);

        set.insert(5);
        set.insert(9);
        set.insert(3);
        assert_eq!(set.len(), 3);
        assert!(set.contains(9));
        assert_eq!(set.max_fd(), Some(9));

        set.remove(9);
        assert!(!set.contains(9));
        assert_eq!(set.max_fd(), Some(5));

        let collected: FdSet = [1, 2].into_iter().collect();
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn test_interest_max_fd() {
        let interest = Interest {
            readable: [4, 7].into_iter().collect(),
            writable: [11].into_iter().collect(),
        };
        assert_eq!(interest.max_fd(), Some(11));
    }
}
