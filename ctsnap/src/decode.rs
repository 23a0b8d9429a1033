//! Turns raw Cilium conntrack records into [`Entry`] values.
//!
//! Cilium stores the tuple addresses reversed relative to the original
//! direction of the flow (cilium/cilium#21346): the `daddr` field holds the
//! flow source and `saddr` the destination. Ports are stored as named. The
//! decoder undoes the reversal unless told the backend stores addresses in
//! their natural order.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use chrono::{DateTime, TimeDelta, Utc};
use clap::ValueEnum;
use ctsnap_common::{CtEntry, CtKey4, CtKey6};

use crate::{
    clock::TimeDiff,
    entry::Entry,
    error::{Error, Result},
};

/// A key/value pair as streamed from one of the conntrack maps.
#[derive(Clone, Copy, Debug)]
pub enum RawRecord {
    V4(CtKey4, CtEntry),
    V6(CtKey6, CtEntry),
}

/// How the backend lays out the tuple addresses.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum AddrOrder {
    /// `daddr` holds the source. What every Cilium release to date does.
    #[default]
    Swapped,
    /// `saddr` holds the source.
    Native,
}

impl fmt::Display for AddrOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrOrder::Swapped => f.write_str("swapped"),
            AddrOrder::Native => f.write_str("native"),
        }
    }
}

impl FromStr for AddrOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "swapped" => Ok(AddrOrder::Swapped),
            "native" => Ok(AddrOrder::Native),
            other => Err(Error::UnsupportedAddrOrder(other.to_owned())),
        }
    }
}

/// Field access shared by the v4 and v6 tuple layouts, in host order.
pub trait CtKeyExt {
    fn saddr_field(&self) -> IpAddr;
    fn daddr_field(&self) -> IpAddr;
    fn source_port(&self) -> u16;
    fn dest_port(&self) -> u16;
    fn next_header(&self) -> u8;
}

impl CtKeyExt for CtKey4 {
    fn saddr_field(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(self.saddr))
    }

    fn daddr_field(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(self.daddr))
    }

    fn source_port(&self) -> u16 {
        u16::from_be(self.sport)
    }

    fn dest_port(&self) -> u16 {
        u16::from_be(self.dport)
    }

    fn next_header(&self) -> u8 {
        self.nexthdr
    }
}

impl CtKeyExt for CtKey6 {
    fn saddr_field(&self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(self.saddr))
    }

    fn daddr_field(&self) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(self.daddr))
    }

    fn source_port(&self) -> u16 {
        u16::from_be(self.sport)
    }

    fn dest_port(&self) -> u16 {
        u16::from_be(self.dport)
    }

    fn next_header(&self) -> u8 {
        self.nexthdr
    }
}

/// Everything the decoder needs that is fixed for one snapshot.
#[derive(Clone, Copy, Debug)]
pub struct DecodeContext {
    pub now: DateTime<Utc>,
    pub time_diff: TimeDiff,
    pub order: AddrOrder,
}

impl DecodeContext {
    pub fn lifetime(&self, raw: u32) -> DateTime<Utc> {
        let secs = self.time_diff.seconds(i64::from(raw));
        TimeDelta::try_seconds(secs)
            .and_then(|delta| self.now.checked_add_signed(delta))
            .unwrap_or(if secs < 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            })
    }
}

/// Decodes one record. Returns `None` for unused slots (`nexthdr == 0`).
pub fn decode(record: &RawRecord, ctx: &DecodeContext) -> Option<Entry> {
    match record {
        RawRecord::V4(key, val) => decode_tuple(key, val, ctx),
        RawRecord::V6(key, val) => decode_tuple(key, val, ctx),
    }
}

fn decode_tuple<K: CtKeyExt>(key: &K, val: &CtEntry, ctx: &DecodeContext) -> Option<Entry> {
    let proto = key.next_header();
    if proto == 0 {
        return None;
    }

    let (src_ip, dst_ip) = match ctx.order {
        AddrOrder::Swapped => (key.daddr_field(), key.saddr_field()),
        AddrOrder::Native => (key.saddr_field(), key.daddr_field()),
    };

    Some(Entry {
        src: SocketAddr::new(src_ip, key.source_port()),
        dst: SocketAddr::new(dst_ip, key.dest_port()),
        tx_bytes: val.bytes,
        tx_packets: val.packets,
        rx_bytes: val.bytes,
        rx_packets: val.packets,
        lifetime: ctx.lifetime(val.lifetime),
        proto,
    })
}
