//! Point-in-time snapshots of Cilium's eBPF conntrack maps.
//!
//! ```no_run
//! use ctsnap::{
//!     backend_exists, global_tables, list_records, Families, FlowFilter, SnapshotConfig,
//!     SystemClock,
//! };
//!
//! # fn main() -> ctsnap::Result<()> {
//! if backend_exists("/sys/fs/bpf") {
//!     let tables = global_tables("/sys/fs/bpf", Families::default());
//!     let filter = FlowFilter::accept_all().skip_loopback();
//!     let clock = SystemClock::new();
//!     let snap = list_records(&tables, SnapshotConfig::default(), &clock, |e| filter.matches(e))?;
//!     println!("{} of {} entries", snap.entries.len(), snap.visited);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod decode;
pub mod entry;
pub mod error;
pub mod filter;
pub mod snapshot;
pub mod table;

pub use clock::{kernel_time_diff, ClockSource, KernelClock, SystemClock, TimeDiff};
pub use decode::{decode, AddrOrder, DecodeContext, RawRecord};
pub use entry::Entry;
pub use error::{Error, Result};
pub use filter::FlowFilter;
pub use snapshot::{list_records, Snapshot, SnapshotConfig};
pub use table::{
    backend_exists, enumerate, global_tables, BpfTable, CtReader, CtTable, Families, Family,
};
