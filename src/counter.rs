//! Transfer rate tracking.
//!
//! Used both per-peer (to size the request queue, eventually) and per-torrent
//! (to produce the progress lines described in the error handling design).
//! The counter itself never does I/O or locking; it's plain arithmetic meant
//! to be owned by whichever task already holds the relevant state.

use std::time::{Duration, Instant};

/// Tracks a running total and derives a instantaneous rate from the bytes
/// accumulated since the last `reset_tick`.
#[derive(Debug)]
pub(crate) struct ThroughputCounter {
    /// Total bytes counted over the counter's lifetime.
    total: u64,
    /// Bytes counted since the last tick.
    since_tick: u64,
    /// The most recently computed rate, in bytes/sec.
    last_rate: f64,
    /// When the current tick window started.
    tick_start: Instant,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self {
            total: 0,
            since_tick: 0,
            last_rate: 0.0,
            tick_start: Instant::now(),
        }
    }

    /// Records that `n` additional bytes have been transferred.
    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.since_tick += n;
    }

    /// Total bytes transferred over the counter's lifetime.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Closes out the current window, returning the rate in bytes/sec
    /// observed during it, and starts a new one.
    pub fn tick(&mut self) -> f64 {
        let elapsed = self.tick_start.elapsed();
        self.last_rate = if elapsed.as_secs_f64() > 0.0 {
            self.since_tick as f64 / elapsed.as_secs_f64()
        } else {
            self.last_rate
        };
        self.since_tick = 0;
        self.tick_start = Instant::now();
        self.last_rate
    }

    /// The most recently computed rate, in bytes/sec, without advancing the
    /// window.
    pub fn rate(&self) -> f64 {
        self.last_rate
    }
}

/// Formats a byte rate as a human readable KiB/s string, as used in the
/// progress lines the coordinator logs.
pub(crate) fn fmt_rate_kib(bytes_per_sec: f64) -> String {
    format!("{:.1} KiB/s", bytes_per_sec / 1024.0)
}

/// Formats an elapsed duration as the `Hh Mm Ss` style used in progress
/// summaries.
pub(crate) fn fmt_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, rem) = (secs / 3600, secs % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn total_accumulates_across_ticks() {
        let mut c = ThroughputCounter::new();
        c.add(100);
        c.tick();
        c.add(50);
        assert_eq!(c.total(), 150);
    }

    #[test]
    fn tick_computes_a_nonnegative_rate() {
        let mut c = ThroughputCounter::new();
        c.add(1024);
        sleep(Duration::from_millis(10));
        let rate = c.tick();
        assert!(rate >= 0.0);
    }

    #[test]
    fn fmt_elapsed_picks_the_coarsest_unit() {
        assert_eq!(fmt_elapsed(Duration::from_secs(5)), "5s");
        assert_eq!(fmt_elapsed(Duration::from_secs(65)), "1m 5s");
        assert_eq!(fmt_elapsed(Duration::from_secs(3665)), "1h 1m 5s");
    }
}
