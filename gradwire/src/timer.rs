//! Named scoped timers for profiling reducer phases.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    total: Duration,
    count: u64,
}

/// Accumulates wall-clock time per named scope.
///
/// Clones share the same totals. Scopes opened with a verbosity above the
/// timer's level do nothing.
#[derive(Debug, Clone)]
pub struct Timer {
    verbosity: u8,
    totals: Option<Arc<Mutex<BTreeMap<&'static str, Entry>>>>,
}

impl Timer {
    pub fn new(verbosity: u8) -> Self {
        Self {
            verbosity,
            totals: Some(Arc::new(Mutex::new(BTreeMap::new()))),
        }
    }

    /// A timer whose scopes are always inert.
    pub fn disabled() -> Self {
        Self {
            verbosity: 0,
            totals: None,
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    /// Open a scope. Elapsed time is recorded when the scope is dropped.
    pub fn begin(&self, name: &'static str, verbosity: u8) -> TimerScope {
        let active = match &self.totals {
            Some(totals) if verbosity <= self.verbosity => {
                Some((Arc::clone(totals), Instant::now()))
            }
            _ => None,
        };
        TimerScope { name, active }
    }

    /// `(name, total, count)` for every recorded scope, sorted by name.
    pub fn totals(&self) -> Vec<(&'static str, Duration, u64)> {
        let Some(totals) = &self.totals else {
            return Vec::new();
        };
        let map = totals.lock().unwrap_or_else(|e| e.into_inner());
        map.iter().map(|(k, e)| (*k, e.total, e.count)).collect()
    }

    /// Printable table of [`totals`](Self::totals).
    pub fn summary(&self) -> String {
        let rows = self.totals();
        let width = rows.iter().map(|(n, _, _)| n.len()).max().unwrap_or(0).max(5);
        let mut out = format!("{:<width$} {:>12} {:>8} {:>12}\n", "scope", "total_ms", "count", "mean_ms");
        for (name, total, count) in rows {
            let total_ms = total.as_secs_f64() * 1e3;
            let mean_ms = if count == 0 { 0.0 } else { total_ms / count as f64 };
            out.push_str(&format!(
                "{name:<width$} {total_ms:>12.3} {count:>8} {mean_ms:>12.3}\n"
            ));
        }
        out
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Guard returned by [`Timer::begin`].
#[must_use = "the scope is timed until it is dropped"]
pub struct TimerScope {
    name: &'static str,
    active: Option<(Arc<Mutex<BTreeMap<&'static str, Entry>>>, Instant)>,
}

impl Drop for TimerScope {
    fn drop(&mut self) {
        let Some((totals, start)) = self.active.take() else {
            return;
        };
        let elapsed = start.elapsed();
        tracing::trace!(scope = self.name, elapsed_us = elapsed.as_micros() as u64, "timer");
        let mut map = totals.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(self.name).or_default();
        entry.total += elapsed;
        entry.count += 1;
    }
}
