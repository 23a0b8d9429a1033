use std::io::{self, Write};

use anyhow::{anyhow, Context};
use chrono::Utc;
use ctsnap::{
    list_records, BpfTable, Entry, Error, FlowFilter, Snapshot, SnapshotConfig, SystemClock,
};
use metrics::counter;
use tokio::{
    task::{self, JoinError, JoinHandle},
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

pub const SNAPSHOT_ERRORS: &str = "conntrack_snapshot_errors";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Output {
    Log,
    Json,
}

/// Takes snapshots on a schedule and reports them.
pub struct Agent {
    pub tables: Vec<BpfTable>,
    pub config: SnapshotConfig,
    pub clock: SystemClock,
    pub filter: FlowFilter,
    pub skip_expired: bool,
    pub output: Output,
    pub timeout: Duration,
}

impl Agent {
    pub async fn run(&self, interval: Duration) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut slot = ScanSlot::default();
        loop {
            ticker.tick().await;
            if slot.busy() {
                warn!("previous conntrack snapshot is still running, skipping this tick");
                continue;
            }
            match self.snapshot(&mut slot).await {
                Ok(snap) => {
                    if let Err(err) = self.report(&snap) {
                        error!("failed to write snapshot: {:#}", err);
                    }
                }
                Err(err) => {
                    counter!(SNAPSHOT_ERRORS).increment(1);
                    match err.downcast_ref::<Error>() {
                        Some(e) if matches!(e, Error::TableNotFound { .. }) => {
                            warn!("conntrack map missing on this node: {}", e)
                        }
                        _ => error!("conntrack snapshot failed: {:#}", err),
                    }
                }
            }
        }
    }

    pub async fn snapshot_once(&self) -> anyhow::Result<()> {
        let snap = self.snapshot(&mut ScanSlot::default()).await?;
        self.report(&snap)
    }

    /// Runs the blocking scan off the runtime, bounded by `timeout`. A scan
    /// that runs over is left in `slot`.
    async fn snapshot(
        &self,
        slot: &mut ScanSlot<ctsnap::Result<Snapshot>>,
    ) -> anyhow::Result<Snapshot> {
        let tables = self.tables.clone();
        let clock = self.clock.clone();
        let config = self.config;
        let filter = if self.skip_expired {
            self.filter.clone().skip_expired(Utc::now())
        } else {
            self.filter.clone()
        };

        let scan = task::spawn_blocking(move || {
            list_records(&tables, config, &clock, |e| filter.matches(e))
        });
        let snap = slot
            .run(self.timeout, scan)
            .await
            .ok_or_else(|| anyhow!("snapshot did not finish within {:?}", self.timeout))?
            .context("snapshot task panicked")??;
        Ok(snap)
    }

    fn report(&self, snap: &Snapshot) -> anyhow::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_report(&mut out, snap)?;
        out.flush()?;
        Ok(())
    }

    /// Only entries go to `out`; the summary is logged.
    fn write_report<W: Write>(&self, out: &mut W, snap: &Snapshot) -> anyhow::Result<()> {
        info!(
            "conntrack snapshot at {}: {} entries of {} visited",
            snap.captured_at.to_rfc3339(),
            snap.entries.len(),
            snap.visited
        );
        match self.output {
            Output::Log => {
                for entry in &snap.entries {
                    info!("{}", entry);
                }
            }
            Output::Json => write_json_lines(out, &snap.entries)?,
        }
        Ok(())
    }
}

/// Holds on to a scan that outlived its timeout, so the next one is not
/// started until it has finished.
struct ScanSlot<T> {
    stalled: Option<JoinHandle<T>>,
}

impl<T> Default for ScanSlot<T> {
    fn default() -> Self {
        ScanSlot { stalled: None }
    }
}

impl<T> ScanSlot<T> {
    fn busy(&mut self) -> bool {
        match &self.stalled {
            Some(handle) if !handle.is_finished() => true,
            _ => {
                self.stalled = None;
                false
            }
        }
    }

    /// Waits up to `timeout` for `handle`. On timeout the task keeps running,
    /// is parked in the slot and `None` is returned.
    async fn run(
        &mut self,
        timeout: Duration,
        mut handle: JoinHandle<T>,
    ) -> Option<Result<T, JoinError>> {
        match time::timeout(timeout, &mut handle).await {
            Ok(res) => Some(res),
            Err(_) => {
                self.stalled = Some(handle);
                None
            }
        }
    }
}

fn write_json_lines<W: Write>(out: &mut W, entries: &[Entry]) -> anyhow::Result<()> {
    for entry in entries {
        serde_json::to_writer(&mut *out, entry).context("failed to encode entry")?;
        out.write_all(b"\n")?;
    }
    Ok(())
}
