//! UDP forwarder
//!
//! Near-stateless: a datagram socket is created on the first packet of a
//! flow and every payload is relayed with `sendto`. Replies are wrapped in
//! a fresh UDP/IPv4 header with the ports swapped. A reply that looks like
//! a DNS response purges the flow eagerly, since resolvers rarely reuse the
//! ephemeral port and the socket is better spent elsewhere.

use std::io::Read;
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, trace};

use crate::conn::{Conn, ConnStatus};
use crate::error::ForwardError;
use crate::packet::dns::{is_dns_response, DNS_PORT};
use crate::packet::{builder, PacketView, IPV4_HEADER_LEN, UDP_HEADER_LEN};

use super::{unix_now, Core, Direction, TunnelEvents};

/// Where UDP payload lands in the scratch buffer
const REPLY_HEADROOM: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

impl<H: TunnelEvents> Core<H> {
    /// Handle a client UDP datagram
    pub(crate) fn handle_udp_forward(
        &mut self,
        conn: &mut Conn,
        pkt: &PacketView<'_>,
    ) -> Result<(), ForwardError> {
        if conn.status == ConnStatus::New {
            debug!(conn = %conn.tuple(), "opening UDP socket");
            let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
                error!(error = %e, "cannot create UDP socket");
                ForwardError::SocketCreate(e)
            })?;
            self.handler.socket_opened(sock.as_raw_fd());
            self.all_fds.insert(sock.as_raw_fd());
            self.num_open_socks += 1;
            self.opened_udp += 1;
            conn.sock = Some(sock);
            conn.status = ConnStatus::Connected;
        }

        self.handler
            .account_packet(pkt.data(), Direction::FromClient, conn);

        let remote = conn.remote_addr();
        let Some(sock) = &conn.sock else {
            return Ok(());
        };
        sock.send_to(pkt.payload(), &SockAddr::from(remote))
            .map_err(|e| {
                error!(conn = %conn.tuple(), error = %e, "UDP sendto failed");
                ForwardError::Send(e)
            })?;

        trace!(conn = %conn.tuple(), len = pkt.payload_len(), "datagram relayed");
        Ok(())
    }

    /// A reply datagram arrived on the flow's socket
    pub(crate) fn handle_udp_reply(&mut self, conn: &mut Conn) -> Result<(), ForwardError> {
        let read_result = {
            let Some(sock) = &conn.sock else {
                return Ok(());
            };
            let mut reader: &Socket = sock;
            reader.read(&mut self.reply_buf[REPLY_HEADROOM..])
        };

        let n = match read_result {
            Err(e) => {
                error!(conn = %conn.tuple(), error = %e, "UDP recv failed");
                self.close(conn);
                return Err(ForwardError::Recv(e));
            }
            Ok(n) => n,
        };

        let tuple = *conn.tuple();
        let len = builder::udp_packet(
            &mut self.reply_buf,
            tuple.dst_ip,
            tuple.src_ip,
            tuple.dst_port,
            tuple.src_port,
            n,
        );
        trace!(conn = %tuple, len = n, "reply datagram");
        let _ = self.send_to_client(conn, len);

        conn.tstamp = unix_now();

        if tuple.dst_port == DNS_PORT
            && is_dns_response(&self.reply_buf[REPLY_HEADROOM..REPLY_HEADROOM + n])
        {
            debug!(conn = %tuple, "DNS response seen, purging flow");
            self.close(conn);
        }

        Ok(())
    }
}
