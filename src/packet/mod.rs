//! Raw IPv4 packet decoding and synthesis
//!
//! The engine both parses client packets coming off the tun device and
//! synthesizes response packets going back to it. Parsing produces a
//! [`PacketView`]: a typed borrow of the original buffer carrying the
//! 5-tuple, the decoded transport header and the payload slice. Synthesis
//! lives in [`builder`] and always writes into the engine's scratch buffer.
//!
//! All multi-byte fields are in network byte order on the wire; decoded
//! values are plain host integers. The parser performs no checksum
//! verification (the tun driver sits behind the kernel).

pub mod builder;
pub mod checksum;
pub mod dns;

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::PacketError;

/// IPv4 header length emitted by the engine (IHL 5, no options)
pub const IPV4_HEADER_LEN: usize = 20;
/// Minimum TCP header length (data offset 5, no options)
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;
/// ICMP echo header length
pub const ICMP_HEADER_LEN: usize = 8;
/// Largest IPv4 datagram; the scratch reply buffer is sized to this
pub const MAX_PACKET_SIZE: usize = 65535;

/// ICMP echo request type
pub const ICMP_ECHO_REQUEST: u8 = 8;
/// ICMP echo reply type
pub const ICMP_ECHO_REPLY: u8 = 0;

/// TCP flag bits (byte 13 of the TCP header)
pub mod tcp_flags {
    /// No more data from sender
    pub const FIN: u8 = 0x01;
    /// Synchronize sequence numbers
    pub const SYN: u8 = 0x02;
    /// Reset the connection
    pub const RST: u8 = 0x04;
    /// Push function
    pub const PSH: u8 = 0x08;
    /// Acknowledgment field is significant
    pub const ACK: u8 = 0x10;
    /// Urgent pointer field is significant
    pub const URG: u8 = 0x20;
}

/// Render a TCP flag byte for logging
#[must_use]
pub fn flags_string(flags: u8) -> String {
    let mut parts = Vec::new();
    if flags & tcp_flags::SYN != 0 {
        parts.push("SYN");
    }
    if flags & tcp_flags::ACK != 0 {
        parts.push("ACK");
    }
    if flags & tcp_flags::FIN != 0 {
        parts.push("FIN");
    }
    if flags & tcp_flags::RST != 0 {
        parts.push("RST");
    }
    if flags & tcp_flags::PSH != 0 {
        parts.push("PSH");
    }
    if flags & tcp_flags::URG != 0 {
        parts.push("URG");
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(",")
    }
}

/// L4 protocols the engine forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    /// Stream flows terminated on a host TCP socket
    Tcp,
    /// Datagram flows relayed through a host UDP socket
    Udp,
    /// Echo request/reply relayed through the shared raw socket
    Icmp,
}

impl Proto {
    /// The IP protocol number
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
        }
    }

    /// Map an IP protocol number to a supported protocol
    #[must_use]
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            1 => Some(Self::Icmp),
            _ => None,
        }
    }

    /// Protocol name for logging
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 5-tuple identifying a flow
///
/// For ICMP echo flows the port slots are reused: `src_port` holds the echo
/// identifier and `dst_port` the echo sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    /// Client-side source address
    pub src_ip: Ipv4Addr,
    /// Client-side source port (echo id for ICMP)
    pub src_port: u16,
    /// Remote destination address
    pub dst_ip: Ipv4Addr,
    /// Remote destination port (echo sequence for ICMP)
    pub dst_port: u16,
    /// L4 protocol
    pub proto: Proto,
}

impl FiveTuple {
    /// Create a TCP 5-tuple
    #[must_use]
    pub fn tcp(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            proto: Proto::Tcp,
        }
    }

    /// Create a UDP 5-tuple
    #[must_use]
    pub fn udp(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            proto: Proto::Udp,
        }
    }

    /// Create an ICMP echo 5-tuple from the echo identifier and sequence
    #[must_use]
    pub fn icmp_echo(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, echo_id: u16, echo_seq: u16) -> Self {
        Self {
            src_ip,
            src_port: echo_id,
            dst_ip,
            dst_port: echo_seq,
            proto: Proto::Icmp,
        }
    }

    /// The echo identifier of an ICMP flow
    #[must_use]
    pub fn echo_id(&self) -> u16 {
        self.src_port
    }

    /// The echo sequence number of an ICMP flow
    #[must_use]
    pub fn echo_seq(&self) -> u16 {
        self.dst_port
    }

    /// Create the reverse tuple (source and destination swapped)
    #[must_use]
    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            proto: self.proto,
        }
    }

    /// Check if this is a TCP flow
    #[must_use]
    pub fn is_tcp(&self) -> bool {
        self.proto == Proto::Tcp
    }

    /// Check if this is a UDP flow
    #[must_use]
    pub fn is_udp(&self) -> bool {
        self.proto == Proto::Udp
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proto {
            Proto::Icmp => write!(
                f,
                "ICMP {} -> {} (id={}, seq={})",
                self.src_ip,
                self.dst_ip,
                self.echo_id(),
                self.echo_seq()
            ),
            proto => write!(
                f,
                "{} {}:{} -> {}:{}",
                proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port
            ),
        }
    }
}

/// Decoded TCP header fields
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// Header length in bytes (data offset * 4)
    pub data_offset: usize,
    /// Flag byte
    pub flags: u8,
    /// Advertised receive window
    pub window: u16,
}

impl TcpHeader {
    /// Check if a flag bit is set
    #[must_use]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Check if all of the given flag bits are set
    #[must_use]
    pub fn has_all(&self, flags: u8) -> bool {
        self.flags & flags == flags
    }
}

/// Decoded UDP header fields
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Length field (header + payload)
    pub length: u16,
}

/// Decoded ICMP echo header fields
#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    /// ICMP type (echo request or echo reply)
    pub icmp_type: u8,
    /// ICMP code
    pub code: u8,
    /// Echo identifier
    pub echo_id: u16,
    /// Echo sequence number
    pub echo_seq: u16,
}

/// The decoded transport header of a parsed packet
#[derive(Debug, Clone, Copy)]
pub enum Transport {
    /// TCP segment
    Tcp(TcpHeader),
    /// UDP datagram
    Udp(UdpHeader),
    /// ICMP echo message
    Icmp(IcmpHeader),
}

/// Typed view over a raw IPv4 packet
///
/// Borrows the original buffer; the payload is a sub-slice, never a copy.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    data: &'a [u8],
    /// The flow this packet belongs to
    pub tuple: FiveTuple,
    /// IP header length in bytes
    pub ip_header_len: usize,
    /// Transport header length in bytes
    pub l4_header_len: usize,
    /// Decoded transport header
    pub transport: Transport,
}

impl<'a> PacketView<'a> {
    /// The whole packet as received
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// The L4 header and payload (everything after the IP header)
    #[must_use]
    pub fn l4(&self) -> &'a [u8] {
        &self.data[self.ip_header_len..]
    }

    /// The L7 payload
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.ip_header_len + self.l4_header_len..]
    }

    /// The L7 payload length
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.data.len() - self.ip_header_len - self.l4_header_len
    }

    /// The decoded TCP header, if this is a TCP packet
    #[must_use]
    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }
}

/// Parse a raw IPv4 packet into a typed view
///
/// # Errors
///
/// Returns a distinct [`PacketError`] per reject class; see the error type.
/// Unsupported ICMP types and unknown L4 protocols are soft rejects
/// (`PacketError::is_unsupported`), to be dropped without logging noise.
pub fn parse(data: &[u8]) -> Result<PacketView<'_>, PacketError> {
    if data.is_empty() {
        return Err(PacketError::TruncatedIp);
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(PacketError::UnsupportedIpVersion(version));
    }

    let ip_header_len = ((data[0] & 0x0F) as usize) * 4;
    if ip_header_len < IPV4_HEADER_LEN || data.len() < ip_header_len {
        return Err(PacketError::TruncatedIp);
    }

    let protocol = data[9];
    let src_ip = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    let (transport, l4_header_len, tuple) = match protocol {
        6 => {
            if data.len() < ip_header_len + TCP_HEADER_LEN {
                return Err(PacketError::TruncatedTcp);
            }
            let t = ip_header_len;
            let data_offset = ((data[t + 12] >> 4) as usize) * 4;
            if data_offset < TCP_HEADER_LEN || data.len() < t + data_offset {
                return Err(PacketError::MalformedTcpOffset);
            }
            let tcp = TcpHeader {
                src_port: u16::from_be_bytes([data[t], data[t + 1]]),
                dst_port: u16::from_be_bytes([data[t + 2], data[t + 3]]),
                seq: u32::from_be_bytes([data[t + 4], data[t + 5], data[t + 6], data[t + 7]]),
                ack: u32::from_be_bytes([data[t + 8], data[t + 9], data[t + 10], data[t + 11]]),
                data_offset,
                flags: data[t + 13],
                window: u16::from_be_bytes([data[t + 14], data[t + 15]]),
            };
            let tuple = FiveTuple::tcp(src_ip, tcp.src_port, dst_ip, tcp.dst_port);
            (Transport::Tcp(tcp), data_offset, tuple)
        }
        17 => {
            if data.len() < ip_header_len + UDP_HEADER_LEN {
                return Err(PacketError::TruncatedUdp);
            }
            let t = ip_header_len;
            let udp = UdpHeader {
                src_port: u16::from_be_bytes([data[t], data[t + 1]]),
                dst_port: u16::from_be_bytes([data[t + 2], data[t + 3]]),
                length: u16::from_be_bytes([data[t + 4], data[t + 5]]),
            };
            let tuple = FiveTuple::udp(src_ip, udp.src_port, dst_ip, udp.dst_port);
            (Transport::Udp(udp), UDP_HEADER_LEN, tuple)
        }
        1 => {
            if data.len() < ip_header_len + ICMP_HEADER_LEN {
                return Err(PacketError::TruncatedIcmp);
            }
            let t = ip_header_len;
            let icmp_type = data[t];
            if icmp_type != ICMP_ECHO_REQUEST && icmp_type != ICMP_ECHO_REPLY {
                return Err(PacketError::UnsupportedIcmpType(icmp_type));
            }
            let icmp = IcmpHeader {
                icmp_type,
                code: data[t + 1],
                echo_id: u16::from_be_bytes([data[t + 4], data[t + 5]]),
                echo_seq: u16::from_be_bytes([data[t + 6], data[t + 7]]),
            };
            let tuple = FiveTuple::icmp_echo(src_ip, dst_ip, icmp.echo_id, icmp.echo_seq);
            (Transport::Icmp(icmp), ICMP_HEADER_LEN, tuple)
        }
        other => return Err(PacketError::UnknownProtocol(other)),
    };

    Ok(PacketView {
        data,
        tuple,
        ip_header_len,
        l4_header_len,
        transport,
    })
}
