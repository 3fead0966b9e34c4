//! Minimal DNS classification
//!
//! The engine does not interpret DNS; it only needs to recognize a response
//! arriving on a port-53 UDP flow so the connection can be purged eagerly
//! instead of idling out (a resolver rarely reuses the ephemeral port).

/// Well-known DNS port
pub const DNS_PORT: u16 = 53;

/// Fixed DNS header length
const DNS_HEADER_LEN: usize = 12;

/// QR bit in the first flags byte (byte 2 of the header)
const QR_RESPONSE: u8 = 0x80;

/// Check whether a UDP payload looks like a DNS response
///
/// Payloads shorter than the DNS header are never classified as responses.
#[must_use]
pub fn is_dns_response(payload: &[u8]) -> bool {
    payload.len() >= DNS_HEADER_LEN && payload[2] & QR_RESPONSE != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns_message(flags: u16) -> Vec<u8> {
        let mut msg = vec![0u8; DNS_HEADER_LEN];
        msg[0..2].copy_from_slice(&0x1234u16.to_be_bytes());
        msg[2..4].copy_from_slice(&flags.to_be_bytes());
        msg[4..6].copy_from_slice(&1u16.to_be_bytes()); // one question
        msg
    }

    #[test]
    fn test_query_is_not_response() {
        assert!(!is_dns_response(&dns_message(0x0100)));
    }

    #[test]
    fn test_response_bit() {
        assert!(is_dns_response(&dns_message(0x8180)));
        assert!(is_dns_response(&dns_message(0x8000)));
    }

    #[test]
    fn test_short_payload() {
        assert!(!is_dns_response(b""));
        assert!(!is_dns_response(&[0x80; 11]));
    }
}
