#![cfg_attr(not(test), no_std)]

//! Raw layouts of Cilium's global conntrack maps, as the kernel programs
//! write them. Addresses and ports are in network byte order, counters and
//! lifetime in host byte order.

/// BPF lifetimes stamped from jiffies are shifted right by this much.
pub const BPF_MONO_SCALER: u32 = 8;

// have to do packed here, the kernel tuple is __packed and the map
// key size would not match the padded struct otherwise
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[repr(C, packed)]
pub struct CtKey4 {
    /// Holds the flow source despite the name.
    pub daddr: [u8; 4],
    /// Holds the flow destination despite the name.
    pub saddr: [u8; 4],
    pub sport: u16,
    pub dport: u16,
    pub nexthdr: u8,
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[repr(C, packed)]
pub struct CtKey6 {
    pub daddr: [u8; 16],
    pub saddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
    pub nexthdr: u8,
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct CtEntry {
    pub reserved0: u64,
    pub backend_id: u64,
    pub packets: u64,
    pub bytes: u64,
    pub lifetime: u32,
    pub flags: u16,
    pub rev_nat_index: u16,
    pub ifindex: u16,
    pub tx_flags_seen: u8,
    pub rx_flags_seen: u8,
    pub src_sec_id: u32,
    pub last_tx_report: u32,
    pub last_rx_report: u32,
}

#[cfg(feature = "userspace")]
mod user_impls {
    use super::{CtEntry, CtKey4, CtKey6};
    use aya::Pod;

    unsafe impl Pod for CtKey4 {}
    unsafe impl Pod for CtKey6 {}
    unsafe impl Pod for CtEntry {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layouts_match_kernel_sizes() {
        assert_eq!(size_of::<CtKey4>(), 14);
        assert_eq!(size_of::<CtKey6>(), 38);
        assert_eq!(size_of::<CtEntry>(), 56);
    }
}
