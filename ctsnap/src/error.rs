//! Error types for conntrack snapshots.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure a snapshot call can surface. None of them are retried here.
#[derive(Error, Debug)]
pub enum Error {
    /// The kernel clock backing the selected clock source could not be read
    #[error("kernel clock {clock} unavailable")]
    ClockUnavailable {
        clock: &'static str,
        #[source]
        source: io::Error,
    },

    /// The table is not present on this kernel, i.e. the capability is absent
    #[error("conntrack table {table} not found")]
    TableNotFound {
        table: String,
        #[source]
        source: io::Error,
    },

    /// The table exists but could not be opened
    #[error("unable to open conntrack table {table}")]
    TableOpen {
        table: String,
        #[source]
        source: io::Error,
    },

    /// Streaming records from an opened table failed part way
    #[error("error while collecting entries from conntrack table {table}")]
    TableIteration {
        table: String,
        #[source]
        source: io::Error,
    },

    #[error("unsupported clock source {0:?}")]
    UnsupportedClockSource(String),

    #[error("unsupported address order {0:?}")]
    UnsupportedAddrOrder(String),
}

impl Error {
    /// Name of the table the error refers to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Error::TableNotFound { table, .. }
            | Error::TableOpen { table, .. }
            | Error::TableIteration { table, .. } => Some(table),
            _ => None,
        }
    }

    pub(crate) fn open(table: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Error::TableNotFound {
                table: table.to_owned(),
                source,
            }
        } else {
            Error::TableOpen {
                table: table.to_owned(),
                source,
            }
        }
    }
}
