//! Call-site profiler backing the `/sys/profile` listing.
//!
//! Scopes are measured with an RAII [`ProfileGuard`]; each call site
//! accumulates a sample count, total wall time, and exclusive wall time
//! (total minus time spent in nested profiled scopes on the same thread).
//! Guards are for synchronous scopes: a guard held across an `.await` will
//! attribute child time to whichever scopes happen to run on the thread in
//! between.

use std::{cell::Cell, panic::Location, time::Instant};

use dashmap::DashMap;

/// Identity of a profiled scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallSite {
    /// Source file.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
    /// Function or scope label.
    pub func: &'static str,
}

#[derive(Default)]
struct Accum {
    samples: u64,
    total_us: u64,
    exclusive_us: u64,
}

/// One row of the profiler snapshot.
#[derive(Clone, Copy, Debug)]
pub struct ProfileEntry {
    /// Source file.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
    /// Function or scope label.
    pub func: &'static str,
    /// Number of completed scopes.
    pub samples: u64,
    /// Total microseconds spent in the scope.
    pub us_total: u64,
    /// Microseconds not attributed to nested profiled scopes.
    pub us_exclusive: u64,
}

thread_local! {
    // Microseconds accumulated by completed child scopes of the scope
    // currently open on this thread.
    static CHILD_US: Cell<u64> = const { Cell::new(0) };
}

/// Concurrent accumulator of profiled scopes.
#[derive(Default)]
pub struct Profiler {
    sites: DashMap<CallSite, Accum>,
}

impl Profiler {
    /// An empty profiler.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Open a profiled scope labelled `func` at the caller's location.
    #[track_caller]
    pub fn enter(&self, func: &'static str) -> ProfileGuard<'_> {
        let location = Location::caller();
        ProfileGuard {
            profiler: self,
            site: CallSite {
                file: location.file(),
                line: location.line(),
                func,
            },
            start: Instant::now(),
            parent_child_us: CHILD_US.replace(0),
        }
    }

    /// Point-in-time listing of every recorded call site.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProfileEntry> {
        self.sites
            .iter()
            .map(|entry| ProfileEntry {
                file: entry.key().file,
                line: entry.key().line,
                func: entry.key().func,
                samples: entry.value().samples,
                us_total: entry.value().total_us,
                us_exclusive: entry.value().exclusive_us,
            })
            .collect()
    }

    fn record(&self, site: CallSite, total_us: u64, exclusive_us: u64) {
        let mut accum = self.sites.entry(site).or_default();
        accum.samples += 1;
        accum.total_us += total_us;
        accum.exclusive_us += exclusive_us;
    }
}

/// RAII guard recording one sample on drop.
pub struct ProfileGuard<'a> {
    profiler: &'a Profiler,
    site: CallSite,
    start: Instant,
    parent_child_us: u64,
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        let total_us = self.start.elapsed().as_micros() as u64;
        let own_child_us = CHILD_US.get();
        let exclusive_us = total_us.saturating_sub(own_child_us);
        // This scope's total counts toward the parent's child time.
        CHILD_US.set(self.parent_child_us + total_us);
        self.profiler.record(self.site, total_us, exclusive_us);
    }
}
