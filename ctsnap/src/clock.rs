use std::{
    fmt, fs, io, mem,
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::Duration,
};

use clap::ValueEnum;
use ctsnap_common::BPF_MONO_SCALER;
use tracing::debug;

use crate::error::{Error, Result};

const NSEC_PER_SEC: i64 = 1_000_000_000;
const TIMER_LIST: &str = "/proc/timer_list";
const KNOWN_HZ: [u64; 4] = [100, 250, 300, 1000];

/// Kernel clock the datapath used to stamp conntrack lifetimes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ClockSource {
    Ktime,
    Jiffies,
}

impl ClockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockSource::Ktime => "ktime",
            ClockSource::Jiffies => "jiffies",
        }
    }
}

impl fmt::Display for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClockSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ktime" => Ok(ClockSource::Ktime),
            "jiffies" => Ok(ClockSource::Jiffies),
            other => Err(Error::UnsupportedClockSource(other.to_owned())),
        }
    }
}

/// Read access to the kernel clocks a conntrack lifetime can be stamped with.
pub trait KernelClock {
    /// CLOCK_MONOTONIC in nanoseconds.
    fn monotonic_ns(&self) -> io::Result<i64>;
    /// Raw, unscaled jiffies counter.
    fn jiffies(&self) -> io::Result<u64>;
    /// Timer interrupt frequency (CONFIG_HZ).
    fn hz(&self) -> io::Result<u64>;
}

/// Converts raw lifetimes into seconds relative to the instant it was built.
///
/// Built once per snapshot so every record is corrected against the same
/// clock reading.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeDiff {
    Ktime { now_secs: i64 },
    Jiffies { now_scaled: i64, hz: i64 },
}

impl TimeDiff {
    /// Signed seconds until the raw lifetime expires; negative when already past.
    pub fn seconds(&self, lifetime: i64) -> i64 {
        match *self {
            TimeDiff::Ktime { now_secs } => lifetime - now_secs,
            TimeDiff::Jiffies { now_scaled, hz } => {
                let diff = (lifetime - now_scaled) << BPF_MONO_SCALER;
                diff / hz
            }
        }
    }
}

/// Reads `clock` once and returns the conversion for `source`.
pub fn kernel_time_diff<C>(source: ClockSource, clock: &C) -> Result<TimeDiff>
where
    C: KernelClock + ?Sized,
{
    match source {
        ClockSource::Ktime => {
            let now = clock.monotonic_ns().map_err(|source| Error::ClockUnavailable {
                clock: "CLOCK_MONOTONIC",
                source,
            })?;
            Ok(TimeDiff::Ktime {
                now_secs: now / NSEC_PER_SEC,
            })
        }
        ClockSource::Jiffies => {
            let jiffies = clock.jiffies().map_err(|source| Error::ClockUnavailable {
                clock: "jiffies",
                source,
            })?;
            let hz = clock
                .hz()
                .and_then(|hz| match hz {
                    0 => Err(io::Error::new(io::ErrorKind::InvalidData, "kernel HZ is zero")),
                    hz => Ok(hz),
                })
                .map_err(|source| Error::ClockUnavailable {
                    clock: "CONFIG_HZ",
                    source,
                })?;
            Ok(TimeDiff::Jiffies {
                now_scaled: (jiffies >> BPF_MONO_SCALER) as i64,
                hz: hz as i64,
            })
        }
    }
}

/// The host's clocks: `clock_gettime(2)` and `/proc/timer_list`.
#[derive(Clone, Debug)]
pub struct SystemClock {
    timer_list: PathBuf,
    hz: Option<u64>,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            timer_list: PathBuf::from(TIMER_LIST),
            hz: None,
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hz(mut self, hz: u64) -> Self {
        self.hz = Some(hz);
        self
    }

    pub fn with_timer_list<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.timer_list = path.as_ref().to_path_buf();
        self
    }

    /// Estimates CONFIG_HZ by sampling jiffies over a short interval and
    /// snapping to the nearest common value. Blocks for `window`.
    pub fn detect_hz(&self, window: Duration) -> io::Result<u64> {
        let start_ns = self.monotonic_ns()?;
        let start = self.jiffies()?;
        thread::sleep(window);
        let end_ns = self.monotonic_ns()?;
        let end = self.jiffies()?;

        let elapsed = (end_ns - start_ns) as f64 / NSEC_PER_SEC as f64;
        if elapsed <= 0.0 || end <= start {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "jiffies did not advance while probing HZ",
            ));
        }
        let measured = (end - start) as f64 / elapsed;
        let hz = nearest_hz(measured);
        debug!(measured, hz, "detected kernel HZ");
        Ok(hz)
    }
}

impl KernelClock for SystemClock {
    fn monotonic_ns(&self) -> io::Result<i64> {
        let mut ts: libc::timespec = unsafe { mem::zeroed() };
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ts.tv_sec as i64 * NSEC_PER_SEC + ts.tv_nsec as i64)
    }

    fn jiffies(&self) -> io::Result<u64> {
        let content = fs::read_to_string(&self.timer_list)?;
        parse_jiffies(&content).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no jiffies line in {}", self.timer_list.display()),
            )
        })
    }

    fn hz(&self) -> io::Result<u64> {
        self.hz.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "kernel HZ not configured or detected")
        })
    }
}

fn parse_jiffies(timer_list: &str) -> Option<u64> {
    timer_list.lines().find_map(|line| {
        line.trim()
            .strip_prefix("jiffies:")
            .and_then(|v| v.trim().parse().ok())
    })
}

fn nearest_hz(measured: f64) -> u64 {
    KNOWN_HZ
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = (*a as f64 - measured).abs();
            let db = (*b as f64 - measured).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(KNOWN_HZ[1])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FixedClock {
        pub monotonic_ns: Option<i64>,
        pub jiffies: Option<u64>,
        pub hz: Option<u64>,
    }

    impl FixedClock {
        pub(crate) fn ktime(secs: i64) -> Self {
            FixedClock {
                monotonic_ns: Some(secs * NSEC_PER_SEC),
                jiffies: None,
                hz: None,
            }
        }
    }

    fn unavailable() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "clock unavailable")
    }

    impl KernelClock for FixedClock {
        fn monotonic_ns(&self) -> io::Result<i64> {
            self.monotonic_ns.ok_or_else(unavailable)
        }

        fn jiffies(&self) -> io::Result<u64> {
            self.jiffies.ok_or_else(unavailable)
        }

        fn hz(&self) -> io::Result<u64> {
            self.hz.ok_or_else(unavailable)
        }
    }

    #[test]
    fn ktime_offsets_are_relative_to_monotonic_seconds() {
        let clock = FixedClock {
            monotonic_ns: Some(1_000 * NSEC_PER_SEC + 999_999_999),
            jiffies: None,
            hz: None,
        };
        let diff = kernel_time_diff(ClockSource::Ktime, &clock).unwrap();
        assert_eq!(diff, TimeDiff::Ktime { now_secs: 1_000 });
        assert_eq!(diff.seconds(1_060), 60);
        assert_eq!(diff.seconds(990), -10);
    }

    #[test]
    fn jiffies_offsets_are_scaled_back_to_seconds() {
        let clock = FixedClock {
            monotonic_ns: None,
            jiffies: Some(256 * 10_000),
            hz: Some(250),
        };
        let diff = kernel_time_diff(ClockSource::Jiffies, &clock).unwrap();
        assert_eq!(
            diff,
            TimeDiff::Jiffies {
                now_scaled: 10_000,
                hz: 250
            }
        );
        // 250 scaled ticks = 64000 jiffies = 256s at 250Hz
        assert_eq!(diff.seconds(10_250), 256);
        assert_eq!(diff.seconds(10_000), 0);
    }

    #[test]
    fn unreadable_clock_is_reported() {
        let clock = FixedClock {
            monotonic_ns: None,
            jiffies: Some(1),
            hz: None,
        };
        let err = kernel_time_diff(ClockSource::Ktime, &clock).unwrap_err();
        assert!(matches!(
            err,
            Error::ClockUnavailable {
                clock: "CLOCK_MONOTONIC",
                ..
            }
        ));

        let err = kernel_time_diff(ClockSource::Jiffies, &clock).unwrap_err();
        assert!(matches!(err, Error::ClockUnavailable { clock: "CONFIG_HZ", .. }));
    }

    #[test]
    fn zero_hz_is_rejected() {
        let clock = FixedClock {
            monotonic_ns: None,
            jiffies: Some(1),
            hz: Some(0),
        };
        assert!(kernel_time_diff(ClockSource::Jiffies, &clock).is_err());
    }

    #[test]
    fn clock_source_parsing() {
        assert_eq!("ktime".parse::<ClockSource>().unwrap(), ClockSource::Ktime);
        assert_eq!("jiffies".parse::<ClockSource>().unwrap(), ClockSource::Jiffies);
        assert!(matches!(
            "tsc".parse::<ClockSource>(),
            Err(Error::UnsupportedClockSource(s)) if s == "tsc"
        ));
    }

    #[test]
    fn jiffies_line_is_found_in_timer_list() {
        let sample = "Timer List Version: v0.9\n\
                      HRTIMER_MAX_CLOCK_BASES: 8\n\
                      now at 4917440861058 nsecs\n\
                      \n\
                      jiffies: 4296146656\n\
                      \n\
                      cpu: 0\n";
        assert_eq!(parse_jiffies(sample), Some(4296146656));
        assert_eq!(parse_jiffies("now at 1 nsecs\n"), None);
    }

    #[test]
    fn system_clock_reads_jiffies_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timer_list");
        fs::write(&path, "jiffies: 512\n").unwrap();
        let clock = SystemClock::new().with_timer_list(&path).with_hz(100);
        assert_eq!(clock.jiffies().unwrap(), 512);
        assert_eq!(clock.hz().unwrap(), 100);
        assert!(SystemClock::new().hz().is_err());
    }

    #[test]
    fn measured_rates_snap_to_known_hz() {
        assert_eq!(nearest_hz(248.7), 250);
        assert_eq!(nearest_hz(990.0), 1000);
        assert_eq!(nearest_hz(104.0), 100);
        assert_eq!(nearest_hz(290.0), 300);
    }
}
