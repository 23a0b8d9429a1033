use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;

use crate::entry::Entry;

/// Composable inclusion predicate for snapshot entries. An empty filter
/// accepts everything.
#[derive(Clone, Debug, Default)]
pub struct FlowFilter {
    protocols: Vec<u8>,
    skip_loopback: bool,
    expired_before: Option<DateTime<Utc>>,
    src_nets: Vec<IpNet>,
    dst_nets: Vec<IpNet>,
}

impl FlowFilter {
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Only keep these IP protocol numbers.
    pub fn protocols(mut self, protos: &[u8]) -> Self {
        self.protocols.extend_from_slice(protos);
        self
    }

    pub fn skip_loopback(mut self) -> Self {
        self.skip_loopback = true;
        self
    }

    /// Drop entries whose lifetime is at or before `now`.
    pub fn skip_expired(mut self, now: DateTime<Utc>) -> Self {
        self.expired_before = Some(now);
        self
    }

    /// Only keep entries whose source lies in one of `nets`.
    pub fn src_nets<I: IntoIterator<Item = IpNet>>(mut self, nets: I) -> Self {
        self.src_nets.extend(nets);
        self
    }

    /// Only keep entries whose destination lies in one of `nets`.
    pub fn dst_nets<I: IntoIterator<Item = IpNet>>(mut self, nets: I) -> Self {
        self.dst_nets.extend(nets);
        self
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        if !self.protocols.is_empty() && !self.protocols.contains(&entry.proto) {
            return false;
        }
        if self.skip_loopback && (entry.src.ip().is_loopback() || entry.dst.ip().is_loopback()) {
            return false;
        }
        if let Some(now) = self.expired_before {
            if entry.is_expired_at(now) {
                return false;
            }
        }
        in_any(&self.src_nets, entry.src.ip()) && in_any(&self.dst_nets, entry.dst.ip())
    }
}

fn in_any(nets: &[IpNet], addr: IpAddr) -> bool {
    nets.is_empty() || nets.iter().any(|net| net.contains(&addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn entry(src: &str, dst: &str, proto: u8, ttl: i64) -> Entry {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Entry {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            tx_bytes: 0,
            tx_packets: 0,
            rx_bytes: 0,
            rx_packets: 0,
            lifetime: now + TimeDelta::seconds(ttl),
            proto,
        }
    }

    #[test]
    fn mixed_family_networks_only_match_their_family() {
        let filter = FlowFilter::accept_all()
            .src_nets(["fd00::/8".parse().unwrap(), "10.0.0.0/8".parse().unwrap()]);
        assert!(filter.matches(&entry("[fd12::1]:1", "[2001:db8::1]:443", 6, 10)));
        assert!(filter.matches(&entry("10.1.2.3:1", "1.1.1.1:443", 6, 10)));
        assert!(!filter.matches(&entry("[2001:db8::2]:1", "[2001:db8::1]:443", 6, 10)));
        assert!(!filter.matches(&entry("192.168.0.1:1", "1.1.1.1:443", 6, 10)));
    }

    #[test]
    fn empty_filter_accepts_everything() {
        assert!(FlowFilter::accept_all().matches(&entry("127.0.0.1:1", "127.0.0.1:2", 6, -5)));
    }

    #[test]
    fn protocol_and_loopback_rules() {
        let filter = FlowFilter::accept_all().protocols(&[6]).skip_loopback();
        assert!(filter.matches(&entry("10.0.0.1:1", "1.1.1.1:443", 6, 10)));
        assert!(!filter.matches(&entry("10.0.0.1:1", "1.1.1.1:53", 17, 10)));
        assert!(!filter.matches(&entry("127.0.0.1:1", "127.0.0.1:80", 6, 10)));
    }

    #[test]
    fn expired_entries_are_dropped() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let filter = FlowFilter::accept_all().skip_expired(now);
        assert!(filter.matches(&entry("10.0.0.1:1", "1.1.1.1:443", 6, 1)));
        assert!(!filter.matches(&entry("10.0.0.1:1", "1.1.1.1:443", 6, 0)));
        assert!(!filter.matches(&entry("10.0.0.1:1", "1.1.1.1:443", 6, -30)));
    }

    #[test]
    fn network_rules() {
        let filter = FlowFilter::accept_all()
            .src_nets(["10.0.0.0/8".parse().unwrap()])
            .dst_nets(["1.1.1.0/24".parse().unwrap(), "8.8.8.8/32".parse().unwrap()]);
        assert!(filter.matches(&entry("10.0.0.1:1", "1.1.1.1:443", 6, 10)));
        assert!(filter.matches(&entry("10.9.0.1:1", "8.8.8.8:53", 17, 10)));
        assert!(!filter.matches(&entry("192.168.0.1:1", "1.1.1.1:443", 6, 10)));
        assert!(!filter.matches(&entry("10.0.0.1:1", "9.9.9.9:53", 17, 10)));
    }
}
