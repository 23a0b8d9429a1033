use chrono::{DateTime, Utc};
use metrics::gauge;
use tracing::debug;

use crate::{
    clock::{kernel_time_diff, ClockSource, KernelClock},
    decode::{AddrOrder, DecodeContext},
    entry::Entry,
    error::Result,
    table::{enumerate, CtTable},
};

pub const ENTRIES_COUNT_GAUGE: &str = "conntrack_entries_count";

/// Result of one full scan.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Entries accepted by the filter, in backend order.
    pub entries: Vec<Entry>,
    /// Records streamed from all tables, whether accepted, filtered or skipped.
    pub visited: u64,
    pub captured_at: DateTime<Utc>,
}

/// Per-snapshot settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SnapshotConfig {
    pub clock_source: ClockSource,
    pub addr_order: AddrOrder,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            clock_source: ClockSource::Ktime,
            addr_order: AddrOrder::Swapped,
        }
    }
}

/// Scans every table and returns the entries accepted by `filter`.
///
/// The clock is read once up front. Any failure discards everything
/// collected so far. On success the `conntrack_entries_count` gauge is set
/// to the number of records visited.
pub fn list_records<T, C, F>(
    tables: &[T],
    config: SnapshotConfig,
    clock: &C,
    filter: F,
) -> Result<Snapshot>
where
    T: CtTable,
    C: KernelClock + ?Sized,
    F: Fn(&Entry) -> bool,
{
    let now = Utc::now();
    let time_diff = kernel_time_diff(config.clock_source, clock)?;
    let ctx = DecodeContext {
        now,
        time_diff,
        order: config.addr_order,
    };

    let mut entries = Vec::new();
    let mut visited = 0u64;
    for table in tables {
        enumerate(table, &ctx, &filter, &mut visited, &mut entries)?;
    }

    gauge!(ENTRIES_COUNT_GAUGE).set(visited as f64);
    debug!(
        tables = tables.len(),
        visited,
        accepted = entries.len(),
        "conntrack snapshot complete"
    );

    Ok(Snapshot {
        entries,
        visited,
        captured_at: now,
    })
}
