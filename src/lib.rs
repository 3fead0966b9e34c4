//! tunnat: user-space packet-to-socket tunneling engine
//!
//! This crate terminates the TCP, UDP and ICMP echo flows found in raw IPv4
//! packets on behalf of the client that emitted them, relays the payloads
//! through ordinary host sockets, and synthesizes response packets back to
//! the client. It is the engine beneath a VPN or packet-capture app on a
//! device that hands out a tun file descriptor but no raw routing
//! privileges.
//!
//! # Architecture
//!
//! ```text
//! tun device ──> parse() ──> Engine::lookup()/forward() ──> host sockets
//!                                                               │
//! client <── TunnelEvents::send_client <── Engine::dispatch <── readiness
//! ```
//!
//! The engine is single-threaded and cooperative. It never blocks and never
//! waits: the embedder reads packets from the tun device, drives a
//! select-style loop over [`Engine::interest`], feeds results back through
//! [`Engine::dispatch`], and ticks [`Engine::purge_expired`] periodically.
//!
//! # Quick start
//!
//! ```no_run
//! use tunnat::{Engine, EngineConfig, TunnelEvents};
//!
//! struct Tun;
//!
//! impl TunnelEvents for Tun {
//!     fn send_client(&mut self, packet: &[u8], _conn: &tunnat::Conn) -> std::io::Result<()> {
//!         // write `packet` to the tun device
//!         # let _ = packet;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), tunnat::TunnatError> {
//! let mut engine = Engine::new(EngineConfig::default().without_icmp(), Tun)?;
//!
//! // packet read off the tun device
//! let raw: &[u8] = &[];
//! if let Ok(Some(tuple)) = engine.easy_forward(raw) {
//!     println!("forwarded {tuple}");
//! }
//!
//! let interest = engine.interest();
//! // select()/poll() on interest, then:
//! let hits = engine.dispatch(&interest.readable, &interest.writable);
//! # let _ = hits;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: engine tunables
//! - [`conn`]: connection records and lifecycle
//! - [`engine`]: the engine, readiness dispatch and callbacks
//! - [`error`]: error types
//! - [`packet`]: raw IPv4 parsing, checksums and synthesis
//! - [`stats`]: aggregate statistics

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod packet;
pub mod stats;

// Re-export commonly used types at the crate root
pub use config::EngineConfig;
pub use conn::{Conn, ConnStatus};
pub use engine::{Direction, Engine, FdSet, Interest, TunnelEvents};
pub use error::{ConfigError, ForwardError, PacketError, Result, TunnatError};
pub use packet::{parse, FiveTuple, PacketView, Proto};
pub use stats::TunnelStats;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
