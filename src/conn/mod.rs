//! Connection records
//!
//! One [`Conn`] per tracked 5-tuple. Records are created lazily when a
//! client packet arrives with no matching flow, carry the protocol-tagged
//! forwarding state, and go through a two-phase teardown: a logical close
//! releases the OS socket and fires the close callback immediately, while
//! the record itself stays in the table until the next purge pass so that
//! in-flight references never dangle.

mod table;

pub(crate) use table::ConnTable;

use std::any::Any;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, RawFd};

use socket2::Socket;

use crate::packet::FiveTuple;

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Created, no socket yet
    New,
    /// TCP only: non-blocking connect in flight
    Connecting,
    /// Forwarding
    Connected,
    /// Logically closed, awaiting purge
    Closed,
}

/// Server-side bytes waiting for the client's window to reopen
#[derive(Debug)]
pub(crate) struct PendingData {
    pub(crate) data: Vec<u8>,
    pub(crate) sent: usize,
}

impl PendingData {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data, sent: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }
}

/// TCP forwarding state
#[derive(Debug, Default)]
pub(crate) struct TcpState {
    /// Next sequence number expected from the client
    pub(crate) client_seq: u32,
    /// Next sequence number the engine will emit
    pub(crate) local_seq: u32,
    /// Remaining client window, in bytes
    pub(crate) window: u16,
    /// FIN+ACK already emitted toward the client
    pub(crate) fin_ack_sent: bool,
    /// Server EOF seen while data was still queued; emit FIN once drained
    pub(crate) fin_pending: bool,
    /// Queued server-side bytes
    pub(crate) pending: Option<PendingData>,
}

/// ICMP echo state
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IcmpState {
    pub(crate) echo_id: u16,
    pub(crate) echo_seq: u16,
}

/// Protocol-tagged per-connection state
///
/// TCP fields are unreachable from non-TCP records by construction.
#[derive(Debug)]
pub(crate) enum ProtoState {
    Tcp(TcpState),
    Udp,
    Icmp(IcmpState),
}

impl ProtoState {
    fn for_tuple(tuple: &FiveTuple) -> Self {
        match tuple.proto {
            crate::packet::Proto::Tcp => Self::Tcp(TcpState::default()),
            crate::packet::Proto::Udp => Self::Udp,
            crate::packet::Proto::Icmp => Self::Icmp(IcmpState::default()),
        }
    }
}

/// A tracked connection
pub struct Conn {
    tuple: FiveTuple,
    pub(crate) tstamp: u64,
    pub(crate) sock: Option<Socket>,
    pub(crate) status: ConnStatus,
    dnat: Option<SocketAddrV4>,
    pub(crate) proto: ProtoState,
    user_token: Option<Box<dyn Any>>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("tuple", &self.tuple)
            .field("tstamp", &self.tstamp)
            .field("sock", &self.socket_fd())
            .field("status", &self.status)
            .field("dnat", &self.dnat)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn new(tuple: FiveTuple, tstamp: u64) -> Self {
        Self {
            tuple,
            tstamp,
            sock: None,
            status: ConnStatus::New,
            dnat: None,
            proto: ProtoState::for_tuple(&tuple),
            user_token: None,
        }
    }

    /// The connection's 5-tuple
    #[must_use]
    pub fn tuple(&self) -> &FiveTuple {
        &self.tuple
    }

    /// Current lifecycle status
    #[must_use]
    pub fn status(&self) -> ConnStatus {
        self.status
    }

    /// Seconds-resolution timestamp of the last activity
    #[must_use]
    pub fn last_activity(&self) -> u64 {
        self.tstamp
    }

    /// The raw descriptor of the associated OS socket, if one is open
    #[must_use]
    pub fn socket_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Override the destination the connection connects to
    ///
    /// Takes effect when the OS socket is created, i.e. it must be set
    /// before the first packet is forwarded.
    pub fn set_dnat(&mut self, dest: SocketAddrV4) {
        self.dnat = Some(dest);
    }

    /// The configured DNAT override, if any
    #[must_use]
    pub fn dnat(&self) -> Option<SocketAddrV4> {
        self.dnat
    }

    /// The address the connection targets: the DNAT override when present,
    /// the packet destination otherwise
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.dnat
            .unwrap_or_else(|| SocketAddrV4::new(self.tuple.dst_ip, self.tuple.dst_port))
    }

    /// Attach opaque embedder state to the connection
    pub fn set_user_token(&mut self, token: Box<dyn Any>) {
        self.user_token = Some(token);
    }

    /// Borrow the embedder state
    #[must_use]
    pub fn user_token(&self) -> Option<&dyn Any> {
        self.user_token.as_deref()
    }

    /// Remove and return the embedder state
    pub fn take_user_token(&mut self) -> Option<Box<dyn Any>> {
        self.user_token.take()
    }

    pub(crate) fn tcp(&self) -> Option<&TcpState> {
        match &self.proto {
            ProtoState::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn tcp_mut(&mut self) -> Option<&mut TcpState> {
        match &mut self.proto {
            ProtoState::Tcp(t) => Some(t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tcp_tuple() -> FiveTuple {
        FiveTuple::tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            Ipv4Addr::new(1, 2, 3, 4),
            80,
        )
    }

    #[test]
    fn test_new_conn() {
        let conn = Conn::new(tcp_tuple(), 100);
        assert_eq!(conn.status(), ConnStatus::New);
        assert_eq!(conn.last_activity(), 100);
        assert!(conn.socket_fd().is_none());
        assert!(conn.tcp().is_some());
        assert_eq!(conn.remote_addr().port(), 80);
    }

    #[test]
    fn test_dnat_override() {
        let mut conn = Conn::new(tcp_tuple(), 0);
        conn.set_dnat(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080));
        assert_eq!(
            conn.remote_addr(),
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080)
        );
    }

    #[test]
    fn test_proto_state_matches_tuple() {
        let udp = Conn::new(
            FiveTuple::udp(
                Ipv4Addr::new(10, 0, 0, 2),
                40000,
                Ipv4Addr::new(8, 8, 8, 8),
                53,
            ),
            0,
        );
        assert!(udp.tcp().is_none());
        assert!(matches!(udp.proto, ProtoState::Udp));

        let icmp = Conn::new(
            FiveTuple::icmp_echo(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(1, 1, 1, 1), 7, 1),
            0,
        );
        assert!(matches!(icmp.proto, ProtoState::Icmp(_)));
    }

    #[test]
    fn test_user_token() {
        let mut conn = Conn::new(tcp_tuple(), 0);
        assert!(conn.user_token().is_none());
        conn.set_user_token(Box::new(42u32));
        assert_eq!(conn.user_token().unwrap().downcast_ref::<u32>(), Some(&42));
        let token = conn.take_user_token().unwrap();
        assert!(token.downcast::<u32>().is_ok());
        assert!(conn.user_token().is_none());
    }

    #[test]
    fn test_pending_data_accounting() {
        let mut pending = PendingData::new(vec![0u8; 10]);
        assert_eq!(pending.remaining(), 10);
        pending.sent += 4;
        assert_eq!(pending.remaining(), 6);
    }
}
