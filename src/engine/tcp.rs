//! TCP forwarder
//!
//! Terminates client TCP flows on host stream sockets. The engine plays the
//! remote endpoint from the client's point of view: it answers the SYN with
//! its own SYN+ACK, acknowledges payload, honors the client's advertised
//! window when relaying server data back, and translates server-side EOF
//! and errors into FIN and RST segments.
//!
//! Sequence bookkeeping: `local_seq` is the engine's next outbound sequence
//! and advances by 1 on SYN and FIN and by the payload length on data;
//! `client_seq` is the engine's view of the client's next sequence and
//! advances as payload is acknowledged.

use std::io::{self, Read};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error, trace, warn};

use crate::conn::{Conn, ConnStatus, PendingData};
use crate::error::ForwardError;
use crate::packet::{flags_string, tcp_flags, PacketView, TcpHeader, IPV4_HEADER_LEN, TCP_HEADER_LEN};

use super::{unix_now, Core, Direction, TunnelEvents};

/// Fixed initial sequence number for engine-originated segments
pub(crate) const INITIAL_TCP_SEQ: u32 = 0x77EB_77EB;

/// Where TCP payload lands in the scratch buffer
const REPLY_HEADROOM: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;

fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

/// Server-side failures that are normal connection teardown, not engine
/// errors
fn is_peer_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

impl<H: TunnelEvents> Core<H> {
    /// Build and send a TCP segment toward the client
    ///
    /// The payload (if any) must already sit at `reply_buf[40..]`. The
    /// segment carries the current `local_seq`, which is then advanced by
    /// `seq_advance` before the send callback runs.
    pub(crate) fn emit_tcp(
        &mut self,
        conn: &mut Conn,
        flags: u8,
        payload_len: usize,
        seq_advance: u32,
    ) -> io::Result<()> {
        let tuple = *conn.tuple();
        let Some((seq, ack)) = conn.tcp().map(|t| (t.local_seq, t.client_seq)) else {
            return Ok(());
        };

        let len = crate::packet::builder::tcp_packet(
            &mut self.reply_buf,
            tuple.dst_ip,
            tuple.src_ip,
            tuple.dst_port,
            tuple.src_port,
            seq,
            ack,
            flags,
            self.max_tcp_window,
            payload_len,
        );

        if let Some(t) = conn.tcp_mut() {
            t.local_seq = t.local_seq.wrapping_add(seq_advance);
        }
        self.send_to_client(conn, len)
    }

    /// Handle a client TCP segment
    pub(crate) fn handle_tcp_forward(
        &mut self,
        conn: &mut Conn,
        pkt: &PacketView<'_>,
        tcp: &TcpHeader,
        no_ack: bool,
    ) -> Result<(), ForwardError> {
        trace!(conn = %conn.tuple(), flags = %flags_string(tcp.flags), len = pkt.payload_len(), "client segment");

        match conn.status {
            ConnStatus::Connecting => {
                // Client will retransmit once the connect completes
                debug!(conn = %conn.tuple(), "segment while connecting, dropped");
                return Ok(());
            }
            ConnStatus::New => return self.tcp_open(conn, pkt, tcp),
            _ => {}
        }

        self.handler
            .account_packet(pkt.data(), Direction::FromClient, conn);

        if tcp.has(tcp_flags::RST) {
            debug!(conn = %conn.tuple(), "client RST");
            self.close_with(conn, false);
            return Ok(());
        }

        if tcp.has_all(tcp_flags::FIN | tcp_flags::ACK) {
            debug!(conn = %conn.tuple(), "client FIN+ACK");
            if let Some(t) = conn.tcp_mut() {
                t.client_seq = t.client_seq.wrapping_add(pkt.payload_len() as u32 + 1);
            }
            // The server side may still send data; its EOF drives the
            // engine's own FIN+ACK later.
            let _ = self.emit_tcp(conn, tcp_flags::ACK, 0, 0);
            return Ok(());
        }

        if conn.sock.is_none() {
            // Server side already gone; the record only lives to complete
            // the client-side teardown
            debug!(conn = %conn.tuple(), "segment on released socket, dropped");
            return Ok(());
        }

        if tcp.has(tcp_flags::ACK) {
            let max_window = self.max_tcp_window;
            let mut window_update = None;
            if let Some(t) = conn.tcp_mut() {
                // In-flight bytes the client has not acknowledged yet,
                // modulo sequence wrap
                let in_flight = t.local_seq.wrapping_sub(tcp.ack);
                let allowed = u32::from(tcp.window.min(max_window));
                t.window = allowed.saturating_sub(in_flight) as u16;
                window_update = Some((t.window, in_flight));
            }
            if let Some((window, in_flight)) = window_update {
                trace!(conn = %conn.tuple(), window, in_flight, "window update");
            }
            self.drain_pending(conn);
        }

        if pkt.payload_len() > 0 {
            // drain_pending may have closed the connection on a send_client
            // failure
            let Some(sock) = &conn.sock else {
                return Ok(());
            };
            sock.send(pkt.payload()).map_err(|e| {
                error!(conn = %conn.tuple(), error = %e, "TCP send failed");
                ForwardError::Send(e)
            })?;

            if !no_ack {
                if let Some(t) = conn.tcp_mut() {
                    t.client_seq = t.client_seq.wrapping_add(pkt.payload_len() as u32);
                }
                self.emit_tcp(conn, tcp_flags::ACK, 0, 0)
                    .map_err(ForwardError::Send)?;
            }
        }

        Ok(())
    }

    /// First SYN on a fresh record: open the stream socket and connect
    fn tcp_open(
        &mut self,
        conn: &mut Conn,
        pkt: &PacketView<'_>,
        tcp: &TcpHeader,
    ) -> Result<(), ForwardError> {
        debug!(conn = %conn.tuple(), "opening TCP socket");

        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
            error!(error = %e, "cannot create TCP socket");
            ForwardError::SocketCreate(e)
        })?;
        self.handler.socket_opened(sock.as_raw_fd());
        self.opened_tcp += 1;

        if let Err(e) = sock.set_nonblocking(true) {
            warn!(error = %e, "cannot enable non-blocking mode");
        }

        let remote = conn.remote_addr();
        let mut in_progress = false;
        if let Err(e) = sock.connect(&SockAddr::from(remote)) {
            if connect_in_progress(&e) {
                in_progress = true;
            } else {
                warn!(%remote, error = %e, "TCP connect failed");
                let fd = sock.as_raw_fd();
                drop(sock);
                self.handler.socket_closed(fd);
                return Err(ForwardError::Connect(e));
            }
        }

        let fd = sock.as_raw_fd();
        self.all_fds.insert(fd);
        self.num_open_socks += 1;
        conn.sock = Some(sock);
        if let Some(t) = conn.tcp_mut() {
            t.client_seq = tcp.seq.wrapping_add(1);
            t.local_seq = INITIAL_TCP_SEQ;
        }

        self.handler
            .account_packet(pkt.data(), Direction::FromClient, conn);

        if in_progress {
            trace!(conn = %conn.tuple(), fd, "connect in progress");
            conn.status = ConnStatus::Connecting;
            self.connecting.insert(fd);
            return Ok(());
        }

        self.tcp_established(conn).map_err(ForwardError::Send)
    }

    /// Connect completed: answer the client's SYN
    pub(crate) fn tcp_established(&mut self, conn: &mut Conn) -> io::Result<()> {
        if let Some(sock) = &conn.sock {
            // Back to blocking mode for the data phase
            if let Err(e) = sock.set_nonblocking(false) {
                warn!(error = %e, "cannot clear non-blocking mode");
            }
            self.connecting.remove(sock.as_raw_fd());
        }
        conn.status = ConnStatus::Connected;

        self.emit_tcp(conn, tcp_flags::SYN | tcp_flags::ACK, 0, 1)
    }

    /// The socket turned writable while CONNECTING: read SO_ERROR
    pub(crate) fn handle_tcp_connect_result(
        &mut self,
        conn: &mut Conn,
    ) -> Result<(), ForwardError> {
        let Some(sock) = &conn.sock else {
            return Ok(());
        };

        match sock.take_error() {
            Ok(None) => {
                debug!(conn = %conn.tuple(), "async connect completed");
                let result = self.tcp_established(conn);
                conn.tstamp = unix_now();
                result.map_err(ForwardError::Send)
            }
            Ok(Some(e)) => {
                debug!(conn = %conn.tuple(), error = %e, "async connect failed");
                self.close(conn);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "SO_ERROR query failed");
                self.close(conn);
                Err(ForwardError::Recv(e))
            }
        }
    }

    /// Data (or EOF, or an error) arrived on the server-side socket
    pub(crate) fn handle_tcp_reply(&mut self, conn: &mut Conn) -> Result<(), ForwardError> {
        conn.tstamp = unix_now();

        let read_result = {
            let Some(sock) = &conn.sock else {
                return Ok(());
            };
            let mut reader: &Socket = sock;
            reader.read(&mut self.reply_buf[REPLY_HEADROOM..])
        };

        let n = match read_result {
            Err(e) if is_peer_reset(&e) => {
                debug!(conn = %conn.tuple(), error = %e, "server connection dropped");
                self.close(conn);
                return Ok(());
            }
            Err(e) => {
                error!(conn = %conn.tuple(), error = %e, "TCP recv failed");
                self.close(conn);
                return Err(ForwardError::Recv(e));
            }
            Ok(n) => n,
        };

        if n == 0 {
            debug!(conn = %conn.tuple(), "server EOF");
            let (has_pending, fin_ack_sent) = conn
                .tcp()
                .map_or((false, false), |t| (t.pending.is_some(), t.fin_ack_sent));

            if has_pending {
                // Queued bytes must reach the client before the FIN;
                // drain_pending emits it once the queue empties
                debug!(conn = %conn.tuple(), "EOF with queued data, deferring FIN");
                if let Some(t) = conn.tcp_mut() {
                    t.fin_pending = true;
                }
            } else if !fin_ack_sent {
                if let Some(t) = conn.tcp_mut() {
                    t.fin_ack_sent = true;
                }
                let _ = self.emit_tcp(conn, tcp_flags::FIN | tcp_flags::ACK, 0, 1);
            }

            // Release the socket or readiness would keep firing; the record
            // stays to absorb the client's closing ACK
            self.finalize_socket(conn);
            return Ok(());
        }

        let (must_queue, window) = match conn.tcp() {
            Some(t) => (t.pending.is_some() || (t.window as usize) < n, t.window),
            None => return Ok(()),
        };

        if must_queue {
            trace!(conn = %conn.tuple(), window, len = n, "insufficient window, queuing");
            let chunk = self.reply_buf[REPLY_HEADROOM..REPLY_HEADROOM + n].to_vec();
            if let Some(t) = conn.tcp_mut() {
                match &mut t.pending {
                    Some(p) => p.data.extend_from_slice(&chunk),
                    None => t.pending = Some(PendingData::new(chunk)),
                }
            }
            // Stop reading from the server until the client's window reopens
            if let Some(fd) = conn.socket_fd() {
                self.all_fds.remove(fd);
            }
            self.drain_pending(conn);
            return Ok(());
        }

        if let Some(t) = conn.tcp_mut() {
            t.window -= n as u16;
        }
        let _ = self.emit_tcp(conn, tcp_flags::PSH | tcp_flags::ACK, n, n as u32);
        Ok(())
    }

    /// Emit at most one queued chunk, bounded by the client's window
    ///
    /// When the queue fully drains the server socket becomes selectable
    /// again, and a FIN deferred by a server EOF is finally emitted.
    pub(crate) fn drain_pending(&mut self, conn: &mut Conn) {
        let mut sent_chunk = None;

        if let Some(t) = conn.tcp_mut() {
            if t.window > 0 {
                if let Some(p) = &mut t.pending {
                    let to_send = p.remaining().min(t.window as usize);
                    trace!(to_send, remaining = p.remaining(), "draining queued data");
                    self.reply_buf[REPLY_HEADROOM..REPLY_HEADROOM + to_send]
                        .copy_from_slice(&p.data[p.sent..p.sent + to_send]);
                    p.sent += to_send;
                    let drained = p.remaining() == 0;
                    if drained {
                        t.pending = None;
                    }
                    t.window -= to_send as u16;
                    sent_chunk = Some((to_send, drained));
                }
            }
        }

        if let Some((to_send, drained)) = sent_chunk {
            if drained {
                // Socket selectable again (unless EOF already released it)
                if let Some(fd) = conn.socket_fd() {
                    self.all_fds.insert(fd);
                }
            }
            let _ = self.emit_tcp(conn, tcp_flags::PSH | tcp_flags::ACK, to_send, to_send as u32);
        }

        let fin_due = conn.status != ConnStatus::Closed
            && conn
                .tcp()
                .is_some_and(|t| t.pending.is_none() && t.fin_pending && !t.fin_ack_sent);
        if fin_due {
            debug!(conn = %conn.tuple(), "queue drained, emitting deferred FIN");
            if let Some(t) = conn.tcp_mut() {
                t.fin_ack_sent = true;
                t.fin_pending = false;
            }
            let _ = self.emit_tcp(conn, tcp_flags::FIN | tcp_flags::ACK, 0, 1);
        }
    }
}
