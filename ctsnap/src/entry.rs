use std::{fmt, net::SocketAddr};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One normalized conntrack flow.
///
/// The datapath only keeps a single packet/byte counter per entry, so the
/// `tx_*` and `rx_*` fields always carry the same values. Treat them as an
/// approximation of the flow volume, not a directional split.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Entry {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    /// Wall-clock instant at which the kernel will consider the entry expired.
    pub lifetime: DateTime<Utc>,
    pub proto: u8,
}

impl Entry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lifetime <= now
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} proto:{} bytes:{} packets:{} expires:{}",
            self.src,
            self.dst,
            self.proto,
            self.tx_bytes,
            self.tx_packets,
            self.lifetime.to_rfc3339()
        )
    }
}
