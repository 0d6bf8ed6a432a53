//! Runtime accounting
//!
//! Monotonic accumulators that attribute wall time to the major cost
//! centers of the proxy (readiness waits, request rewrite, stream parsing,
//! trace writing). The accumulators are plain atomics so the signal-handler
//! thread can read a consistent summary while the event loop is running.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sentinel for "timer not currently running".
const STOPPED: u64 = u64::MAX;

/// A stopwatch that can be started and stopped repeatedly and reports the
/// total accumulated interval. `start` on a running timer and `stop` on a
/// stopped one are no-ops, which lets callers nest pause/resume freely.
pub struct Timer {
    base: Instant,
    accum_ns: AtomicU64,
    started_ns: AtomicU64,
}

impl Timer {
    fn new(base: Instant) -> Self {
        Self {
            base,
            accum_ns: AtomicU64::new(0),
            started_ns: AtomicU64::new(STOPPED),
        }
    }

    fn now_ns(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }

    pub fn start(&self) {
        let now = self.now_ns();
        let _ = self
            .started_ns
            .compare_exchange(STOPPED, now, Ordering::AcqRel, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        let started = self.started_ns.swap(STOPPED, Ordering::AcqRel);
        if started != STOPPED {
            let elapsed = self.now_ns().saturating_sub(started);
            self.accum_ns.fetch_add(elapsed, Ordering::AcqRel);
        }
    }

    /// Total accumulated time, including the currently running interval.
    pub fn total(&self) -> Duration {
        let mut ns = self.accum_ns.load(Ordering::Acquire);
        let started = self.started_ns.load(Ordering::Acquire);
        if started != STOPPED {
            ns += self.now_ns().saturating_sub(started);
        }
        Duration::from_nanos(ns)
    }
}

/// The fixed set of cost centers reported in the timing summary.
pub struct Timers {
    /// Whole-process runtime; started once at startup, stopped on signal.
    pub runtime: Timer,
    /// Time blocked in readiness waits.
    pub io_wait: Timer,
    /// Time spent in the one-shot HTTP request rewrite.
    pub rewrite: Timer,
    /// Time spent driving stream followers.
    pub parse: Timer,
    /// Time spent committing trace records.
    pub trace: Timer,
}

impl Timers {
    pub fn new() -> Self {
        let base = Instant::now();
        Self {
            runtime: Timer::new(base),
            io_wait: Timer::new(base),
            rewrite: Timer::new(base),
            parse: Timer::new(base),
            trace: Timer::new(base),
        }
    }

    /// Write the timing summary. `other` is whatever part of the total the
    /// named categories do not explain, clamped at zero.
    pub fn write_summary(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let total = self.runtime.total().as_secs_f64();
        let io_wait = self.io_wait.total().as_secs_f64();
        let rewrite = self.rewrite.total().as_secs_f64();
        let parse = self.parse.total().as_secs_f64();
        let trace = self.trace.total().as_secs_f64();
        let other = (total - io_wait - rewrite - parse - trace).max(0.0);

        let pct = |part: f64| if total > 0.0 { part / total * 100.0 } else { 0.0 };

        writeln!(out, "timing summary:")?;
        writeln!(out, "  total runtime   {total:12.6}s")?;
        writeln!(out, "  readiness waits {io_wait:12.6}s  {:5.1}%", pct(io_wait))?;
        writeln!(out, "  request rewrite {rewrite:12.6}s  {:5.1}%", pct(rewrite))?;
        writeln!(out, "  follower parse  {parse:12.6}s  {:5.1}%", pct(parse))?;
        writeln!(out, "  trace write     {trace:12.6}s  {:5.1}%", pct(trace))?;
        writeln!(out, "  other           {other:12.6}s  {:5.1}%", pct(other))?;
        Ok(())
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}
