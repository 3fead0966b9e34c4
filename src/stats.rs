//! Aggregate engine statistics

use serde::Serialize;

/// Snapshot of the engine's connection and socket accounting
///
/// Produced on demand by [`Engine::stats`](crate::Engine::stats); current
/// counts are computed from the table, lifetime counters accumulate across
/// the engine's life.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStats {
    /// Current TCP connections (including closed records awaiting purge)
    pub num_tcp_conns: u32,
    /// Current UDP connections
    pub num_udp_conns: u32,
    /// Current ICMP echo flows
    pub num_icmp_conns: u32,

    /// Last-activity timestamp of the oldest TCP connection
    pub oldest_tcp_tstamp: Option<u64>,
    /// Last-activity timestamp of the oldest UDP connection
    pub oldest_udp_tstamp: Option<u64>,
    /// Last-activity timestamp of the oldest ICMP flow
    pub oldest_icmp_tstamp: Option<u64>,

    /// OS sockets currently open (including the shared ICMP socket)
    pub num_open_sockets: usize,
    /// Records currently in the connection table
    pub num_connections: usize,

    /// TCP sockets opened over the engine's lifetime
    pub total_tcp_opened: u32,
    /// UDP sockets opened over the engine's lifetime
    pub total_udp_opened: u32,
    /// ICMP flows opened over the engine's lifetime
    pub total_icmp_opened: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zeroed() {
        let stats = TunnelStats::default();
        assert_eq!(stats.num_tcp_conns, 0);
        assert_eq!(stats.oldest_udp_tstamp, None);
        assert_eq!(stats.num_open_sockets, 0);
    }

    #[test]
    fn test_serializes() {
        let stats = TunnelStats {
            num_tcp_conns: 2,
            oldest_tcp_tstamp: Some(1000),
            ..TunnelStats::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"num_tcp_conns\":2"));
        assert!(json.contains("\"oldest_tcp_tstamp\":1000"));
    }
}
