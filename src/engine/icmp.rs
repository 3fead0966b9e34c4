//! ICMP echo forwarder
//!
//! All echo flows share one raw socket opened at engine startup. Outbound
//! echo bodies are relayed unchanged; inbound replies carry no flow address
//! the kernel could demultiplex on, so they are matched by scanning the
//! connection table for `(ICMP, remote address, echo id)`. A reply that
//! matches no flow is dropped silently.

use std::io::Read;

use socket2::{SockAddr, Socket};
use tracing::{error, trace, warn};

use crate::conn::{Conn, ConnStatus, ConnTable, ProtoState};
use crate::error::ForwardError;
use crate::packet::{
    builder, checksum, PacketView, Proto, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_HEADER_LEN,
    IPV4_HEADER_LEN,
};

use super::{unix_now, Core, Direction, TunnelEvents};

impl<H: TunnelEvents> Core<H> {
    /// Handle a client echo message
    pub(crate) fn handle_icmp_forward(
        &mut self,
        conn: &mut Conn,
        pkt: &PacketView<'_>,
    ) -> Result<(), ForwardError> {
        if conn.status == ConnStatus::New {
            self.opened_icmp += 1;
            conn.status = ConnStatus::Connected;
        }
        let (echo_id, echo_seq) = (conn.tuple().echo_id(), conn.tuple().echo_seq());
        if let ProtoState::Icmp(st) = &mut conn.proto {
            st.echo_id = echo_id;
            st.echo_seq = echo_seq;
        }

        self.handler
            .account_packet(pkt.data(), Direction::FromClient, conn);

        trace!(conn = %conn.tuple(), len = pkt.payload_len(), "echo relayed");

        // Port is meaningless on a raw socket; only the address routes
        let remote = SockAddr::from(std::net::SocketAddrV4::new(*conn.remote_addr().ip(), 0));
        let Some(sock) = &self.icmp_socket else {
            return Ok(());
        };
        sock.send_to(pkt.l4(), &remote).map_err(|e| {
            error!(conn = %conn.tuple(), error = %e, "ICMP sendto failed");
            ForwardError::Send(e)
        })?;

        Ok(())
    }

    /// The shared raw socket turned readable
    ///
    /// Raw ICMP sockets deliver the full IP datagram, so the reply is
    /// rewritten in place: recompute the ICMP checksum, swap the addresses
    /// into a fresh IP header, and hand the packet to the client.
    pub(crate) fn handle_icmp_reply(&mut self, conns: &mut ConnTable) -> Result<(), ForwardError> {
        let n = {
            let Some(sock) = &self.icmp_socket else {
                return Ok(());
            };
            let mut reader: &Socket = sock;
            reader.read(&mut self.reply_buf[..]).map_err(|e| {
                error!(error = %e, "ICMP recv failed");
                ForwardError::Recv(e)
            })?
        };

        if n < IPV4_HEADER_LEN {
            warn!(len = n, "short ICMP datagram");
            return Ok(());
        }
        let ip_header_len = ((self.reply_buf[0] & 0x0F) as usize) * 4;
        if ip_header_len < IPV4_HEADER_LEN || n < ip_header_len + ICMP_HEADER_LEN {
            warn!(len = n, "short ICMP datagram");
            return Ok(());
        }

        let icmp_type = self.reply_buf[ip_header_len];
        if icmp_type != ICMP_ECHO_REQUEST && icmp_type != ICMP_ECHO_REPLY {
            trace!(icmp_type, "unsupported ICMP type, dropped");
            return Ok(());
        }

        let src_ip = std::net::Ipv4Addr::new(
            self.reply_buf[12],
            self.reply_buf[13],
            self.reply_buf[14],
            self.reply_buf[15],
        );
        let echo_id = u16::from_be_bytes([
            self.reply_buf[ip_header_len + 4],
            self.reply_buf[ip_header_len + 5],
        ]);

        // The reply's destination is one of the host's own addresses, so
        // the flow has to be found by remote address and echo id
        let Some(conn) = conns.values_mut().find(|c| {
            c.status != ConnStatus::Closed
                && c.tuple().proto == Proto::Icmp
                && c.tuple().dst_ip == src_ip
                && c.tuple().echo_id() == echo_id
        }) else {
            trace!(%src_ip, echo_id, "no matching echo flow, dropped");
            return Ok(());
        };

        conn.tstamp = unix_now();
        if let ProtoState::Icmp(st) = &mut conn.proto {
            st.echo_seq = 0;
        }

        let tuple = *conn.tuple();
        self.reply_buf[ip_header_len + 2..ip_header_len + 4].fill(0);
        let sum = checksum::icmp(&self.reply_buf[ip_header_len..n]);
        self.reply_buf[ip_header_len + 2..ip_header_len + 4].copy_from_slice(&sum.to_be_bytes());

        builder::ipv4_header(&mut self.reply_buf, n as u16, 1, tuple.dst_ip, tuple.src_ip);

        trace!(conn = %tuple, len = n, "echo reply");
        let _ = self.send_to_client(conn, n);
        Ok(())
    }
}
