use std::{
    fs, io,
    path::{Path, PathBuf},
};

use aya::maps::{HashMap, Map, MapData, MapError};
use ctsnap_common::{CtEntry, CtKey4, CtKey6};
use tracing::debug;

use crate::{
    decode::{decode, DecodeContext, RawRecord},
    entry::Entry,
    error::{Error, Result},
};

pub const DEFAULT_BPFFS_ROOT: &str = "/sys/fs/bpf";
pub const TC_GLOBALS_PATH: &str = "tc/globals";

pub const MAP_CT4_TCP: &str = "cilium_ct4_global";
pub const MAP_CT4_ANY: &str = "cilium_ct_any4_global";
pub const MAP_CT6_TCP: &str = "cilium_ct6_global";
pub const MAP_CT6_ANY: &str = "cilium_ct_any6_global";

/// A conntrack table that can be opened for one enumeration.
pub trait CtTable {
    type Reader: CtReader;

    fn name(&self) -> &str;

    /// Opens the table. The returned reader releases the table when dropped.
    fn open(&self) -> io::Result<Self::Reader>;
}

/// An opened table.
pub trait CtReader {
    /// Streams every record to `f`. Stops at the first error.
    fn dump(&mut self, f: &mut dyn FnMut(RawRecord)) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    V4,
    V6,
}

/// Which address families to read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Families {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Default for Families {
    fn default() -> Self {
        Families {
            ipv4: true,
            ipv6: false,
        }
    }
}

/// Whether Cilium's global maps are pinned under `bpffs_root`.
pub fn backend_exists<P: AsRef<Path>>(bpffs_root: P) -> bool {
    fs::metadata(bpffs_root.as_ref().join(TC_GLOBALS_PATH)).is_ok()
}

/// The global conntrack maps for the requested families, TCP map first.
pub fn global_tables<P: AsRef<Path>>(bpffs_root: P, families: Families) -> Vec<BpfTable> {
    let dir = bpffs_root.as_ref().join(TC_GLOBALS_PATH);
    let mut tables = Vec::with_capacity(4);
    if families.ipv4 {
        tables.push(BpfTable::new(dir.join(MAP_CT4_TCP), Family::V4));
        tables.push(BpfTable::new(dir.join(MAP_CT4_ANY), Family::V4));
    }
    if families.ipv6 {
        tables.push(BpfTable::new(dir.join(MAP_CT6_TCP), Family::V6));
        tables.push(BpfTable::new(dir.join(MAP_CT6_ANY), Family::V6));
    }
    tables
}

/// A pinned Cilium conntrack map.
#[derive(Clone, Debug)]
pub struct BpfTable {
    path: PathBuf,
    name: String,
    family: Family,
}

impl BpfTable {
    pub fn new(path: PathBuf, family: Family) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        BpfTable { path, name, family }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn family(&self) -> Family {
        self.family
    }
}

pub enum BpfReader {
    V4(HashMap<MapData, CtKey4, CtEntry>),
    V6(HashMap<MapData, CtKey6, CtEntry>),
}

impl CtTable for BpfTable {
    type Reader = BpfReader;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<BpfReader> {
        let data = MapData::from_pin(&self.path).map_err(map_io_error)?;
        // the global CT maps are BPF_MAP_TYPE_LRU_HASH
        let map = Map::LruHashMap(data);
        let reader = match self.family {
            Family::V4 => BpfReader::V4(HashMap::try_from(map).map_err(map_io_error)?),
            Family::V6 => BpfReader::V6(HashMap::try_from(map).map_err(map_io_error)?),
        };
        Ok(reader)
    }
}

impl CtReader for BpfReader {
    fn dump(&mut self, f: &mut dyn FnMut(RawRecord)) -> io::Result<()> {
        match self {
            BpfReader::V4(map) => {
                for item in map.iter() {
                    let (key, val) = item.map_err(map_io_error)?;
                    f(RawRecord::V4(key, val));
                }
            }
            BpfReader::V6(map) => {
                for item in map.iter() {
                    let (key, val) = item.map_err(map_io_error)?;
                    f(RawRecord::V6(key, val));
                }
            }
        }
        Ok(())
    }
}

fn map_io_error(err: MapError) -> io::Error {
    match err {
        MapError::SyscallError(err) => err.io_error,
        other => io::Error::other(other),
    }
}

/// Enumerates one table into `out`, bumping `visited` for every record streamed.
///
/// The reader is dropped, and the table released, before this returns on
/// every path.
pub fn enumerate<T, F>(
    table: &T,
    ctx: &DecodeContext,
    filter: &F,
    visited: &mut u64,
    out: &mut Vec<Entry>,
) -> Result<()>
where
    T: CtTable + ?Sized,
    F: Fn(&Entry) -> bool + ?Sized,
{
    let name = table.name();
    let mut reader = table.open().map_err(|source| Error::open(name, source))?;
    debug!(table = name, "opened conntrack table");

    let before = *visited;
    let accepted_before = out.len();
    reader
        .dump(&mut |record| {
            *visited += 1;
            if let Some(entry) = decode(&record, ctx) {
                if filter(&entry) {
                    out.push(entry);
                }
            }
        })
        .map_err(|source| Error::TableIteration {
            table: name.to_owned(),
            source,
        })?;

    debug!(
        table = name,
        visited = *visited - before,
        accepted = out.len() - accepted_before,
        "dumped conntrack table"
    );
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTable;
    use super::*;
    use crate::decode::tests::{ctx, key4, value};

    fn accept(_: &Entry) -> bool {
        true
    }

    fn records(n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| {
                RawRecord::V4(
                    key4([10, 0, 0, 1], 30000 + i as u16, [10, 0, 0, 2], 80, 6),
                    value(1, 100, 0),
                )
            })
            .collect()
    }

    #[test]
    fn missing_backend_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!backend_exists(dir.path()));
        assert!(!backend_exists("/nonexistent/bpffs"));

        fs::create_dir_all(dir.path().join(TC_GLOBALS_PATH)).unwrap();
        assert!(backend_exists(dir.path()));
    }

    #[test]
    fn global_tables_follow_families() {
        let v4 = global_tables("/sys/fs/bpf", Families::default());
        let names: Vec<_> = v4.iter().map(|t| t.name().to_owned()).collect();
        assert_eq!(names, vec![MAP_CT4_TCP, MAP_CT4_ANY]);
        assert_eq!(
            v4[0].path(),
            Path::new("/sys/fs/bpf/tc/globals/cilium_ct4_global")
        );

        let both = global_tables(
            "/sys/fs/bpf",
            Families {
                ipv4: true,
                ipv6: true,
            },
        );
        assert_eq!(both.len(), 4);
        assert_eq!(both[3].family(), Family::V6);
    }

    #[test]
    fn enumerate_counts_every_record_and_closes_once() {
        let mut recs = records(3);
        recs.push(RawRecord::V4(
            key4([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0),
            value(0, 0, 0),
        ));
        let table = FakeTable::new("t", recs);
        let mut visited = 0;
        let mut out = Vec::new();

        let skip_one = |e: &Entry| e.src.port() != 30001;
        enumerate(&table, &ctx(0), &skip_one, &mut visited, &mut out).unwrap();

        assert_eq!(visited, 4);
        assert_eq!(out.len(), 2);
        assert_eq!(table.opens.get(), 1);
        assert_eq!(table.closes.get(), 1);
    }

    #[test]
    fn iteration_error_still_closes() {
        let table = FakeTable::new("t", records(10)).failing_after(3);
        let mut visited = 0;
        let mut out = Vec::new();

        let err = enumerate(&table, &ctx(0), &accept, &mut visited, &mut out).unwrap_err();

        assert!(matches!(err, Error::TableIteration { ref table, .. } if table == "t"));
        assert_eq!(table.closes.get(), 1);
        assert_eq!(visited, 3);
        assert_eq!(out.len(), 3);
        let ports: Vec<_> = out.iter().map(|e| e.src.port()).collect();
        assert_eq!(ports, vec![30000, 30001, 30002]);
    }

    #[test]
    fn open_errors_are_classified() {
        let mut visited = 0;
        let mut out = Vec::new();

        let missing = FakeTable::failing_open("gone", io::ErrorKind::NotFound);
        let err = enumerate(&missing, &ctx(0), &accept, &mut visited, &mut out).unwrap_err();
        assert!(matches!(err, Error::TableNotFound { .. }));

        let denied = FakeTable::failing_open("locked", io::ErrorKind::PermissionDenied);
        let err = enumerate(&denied, &ctx(0), &accept, &mut visited, &mut out).unwrap_err();
        assert!(matches!(err, Error::TableOpen { .. }));

        assert_eq!(denied.closes.get(), 0);
        assert_eq!(visited, 0);
    }
}
