//! Synthesized packet construction
//!
//! Builders write complete IPv4 packets into a caller-provided buffer (the
//! engine's scratch reply buffer). Payload bytes are expected to already be
//! in place after the header area so that headers can be wrapped around them
//! without copying.
//!
//! Synthesized IP headers always use IHL 5, identification 0, the
//! don't-fragment flag and TTL 64; TCP headers use data offset 5 (no
//! options). Checksums are computed last, over the zeroed checksum field.

use std::net::Ipv4Addr;

use super::{checksum, tcp_flags, IPV4_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN};

/// Write an IPv4 header into `buf[..20]`
///
/// `total_len` is the full datagram length including this header.
pub fn ipv4_header(buf: &mut [u8], total_len: u16, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    let header = &mut buf[..IPV4_HEADER_LEN];
    header.fill(0);
    header[0] = 0x45; // version 4, IHL 5
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    header[8] = 64; // TTL
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());

    let sum = checksum::ipv4_header(header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Write a complete TCP/IPv4 packet around a payload already placed at
/// `buf[40..40 + payload_len]`
///
/// The acknowledgment field is emitted only when the ACK flag is present,
/// zero otherwise. Returns the total packet length.
#[allow(clippy::too_many_arguments)]
pub fn tcp_packet(
    buf: &mut [u8],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload_len: usize,
) -> usize {
    let l3_len = TCP_HEADER_LEN + payload_len;
    let total_len = IPV4_HEADER_LEN + l3_len;

    let tcp = &mut buf[IPV4_HEADER_LEN..IPV4_HEADER_LEN + TCP_HEADER_LEN];
    tcp.fill(0);
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    let ack_field = if flags & tcp_flags::ACK != 0 { ack } else { 0 };
    tcp[8..12].copy_from_slice(&ack_field.to_be_bytes());
    tcp[12] = 0x50; // data offset 5
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&window.to_be_bytes());

    ipv4_header(buf, total_len as u16, 6, src_ip, dst_ip);

    let sum = checksum::tcp(src_ip, dst_ip, &buf[IPV4_HEADER_LEN..total_len]);
    buf[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&sum.to_be_bytes());

    total_len
}

/// Write a complete UDP/IPv4 packet around a payload already placed at
/// `buf[28..28 + payload_len]`
///
/// The UDP checksum is written as zero, which IPv4 permits. Returns the
/// total packet length.
pub fn udp_packet(
    buf: &mut [u8],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload_len: usize,
) -> usize {
    let l3_len = UDP_HEADER_LEN + payload_len;
    let total_len = IPV4_HEADER_LEN + l3_len;

    let udp = &mut buf[IPV4_HEADER_LEN..IPV4_HEADER_LEN + UDP_HEADER_LEN];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(l3_len as u16).to_be_bytes());
    udp[6..8].copy_from_slice(&0u16.to_be_bytes());

    ipv4_header(buf, total_len as u16, 17, src_ip, dst_ip);

    total_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, Transport};

    #[test]
    fn test_ipv4_header_fields() {
        let mut buf = [0u8; IPV4_HEADER_LEN];
        ipv4_header(
            &mut buf,
            60,
            17,
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(10, 0, 0, 2),
        );

        assert_eq!(buf[0], 0x45);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 60);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 0, "identification");
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 0x4000, "DF flag");
        assert_eq!(buf[8], 64, "TTL");
        assert_eq!(buf[9], 17);
        assert!(checksum::verify_ipv4_header(&buf));
    }

    #[test]
    fn test_tcp_packet_layout() {
        let mut buf = vec![0u8; 256];
        buf[40..45].copy_from_slice(b"hello");
        let len = tcp_packet(
            &mut buf,
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            40000,
            0x77EB_77EB,
            1001,
            tcp_flags::SYN | tcp_flags::ACK,
            64240,
            5,
        );
        assert_eq!(len, 45);

        let view = packet::parse(&buf[..len]).unwrap();
        let tcp = view.tcp().unwrap();
        assert_eq!(tcp.src_port, 80);
        assert_eq!(tcp.dst_port, 40000);
        assert_eq!(tcp.seq, 0x77EB_77EB);
        assert_eq!(tcp.ack, 1001);
        assert_eq!(tcp.data_offset, TCP_HEADER_LEN);
        assert_eq!(tcp.window, 64240);
        assert_eq!(view.payload(), b"hello");

        assert!(checksum::verify_ipv4_header(&buf[..IPV4_HEADER_LEN]));
        assert!(checksum::verify_tcp(
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(10, 0, 0, 2),
            &buf[IPV4_HEADER_LEN..len]
        ));
    }

    #[test]
    fn test_tcp_ack_field_zero_without_ack_flag() {
        let mut buf = vec![0u8; 64];
        let len = tcp_packet(
            &mut buf,
            Ipv4Addr::new(1, 2, 3, 4),
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            40000,
            42,
            9999,
            tcp_flags::RST,
            0,
            0,
        );
        let view = packet::parse(&buf[..len]).unwrap();
        assert_eq!(view.tcp().unwrap().ack, 0);
    }

    #[test]
    fn test_udp_packet_layout() {
        let mut buf = vec![0u8; 128];
        buf[28..32].copy_from_slice(b"pong");
        let len = udp_packet(
            &mut buf,
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(10, 0, 0, 2),
            53,
            40000,
            4,
        );
        assert_eq!(len, 32);

        let view = packet::parse(&buf[..len]).unwrap();
        match view.transport {
            Transport::Udp(udp) => {
                assert_eq!(udp.src_port, 53);
                assert_eq!(udp.dst_port, 40000);
                assert_eq!(udp.length, 12);
            }
            _ => panic!("expected UDP"),
        }
        // Checksum field is intentionally zero
        assert_eq!(&buf[26..28], &[0, 0]);
        assert!(checksum::verify_ipv4_header(&buf[..IPV4_HEADER_LEN]));
    }
}
