//! Process-wide log level bitmask.
//!
//! The administrative `set_log_mask` endpoint adjusts which severities the
//! process emits at runtime. Each [`log::Level`] owns one bit; the mask is
//! applied to the `log` facade by lowering `max_level` to the most verbose
//! enabled severity. Severities above the chosen maximum therefore stay
//! compiled in but muted.

use std::sync::atomic::{AtomicU64, Ordering};

use log::LevelFilter;

/// Bit enabling error output.
pub const ERROR_BIT: u64 = 1 << 0;
/// Bit enabling warning output.
pub const WARN_BIT: u64 = 1 << 1;
/// Bit enabling informational output.
pub const INFO_BIT: u64 = 1 << 2;
/// Bit enabling debug output.
pub const DEBUG_BIT: u64 = 1 << 3;
/// Bit enabling trace output.
pub const TRACE_BIT: u64 = 1 << 4;

/// Mask enabled at startup.
pub const DEFAULT_MASK: u64 = ERROR_BIT | WARN_BIT | INFO_BIT;

static MASK: AtomicU64 = AtomicU64::new(DEFAULT_MASK);

/// The current mask.
#[must_use]
pub fn mask() -> u64 { MASK.load(Ordering::Relaxed) }

/// Clear the bits in `to_disable`, then set the bits in `to_enable`, and
/// re-derive the `log` facade's maximum level. Returns the new mask.
pub fn set_mask(to_disable: u64, to_enable: u64) -> u64 {
    let mut current = MASK.load(Ordering::Relaxed);
    loop {
        let next = (current & !to_disable) | to_enable;
        match MASK.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                log::set_max_level(level_filter(next));
                return next;
            }
            Err(observed) => current = observed,
        }
    }
}

fn level_filter(mask: u64) -> LevelFilter {
    if mask & TRACE_BIT != 0 {
        LevelFilter::Trace
    } else if mask & DEBUG_BIT != 0 {
        LevelFilter::Debug
    } else if mask & INFO_BIT != 0 {
        LevelFilter::Info
    } else if mask & WARN_BIT != 0 {
        LevelFilter::Warn
    } else if mask & ERROR_BIT != 0 {
        LevelFilter::Error
    } else {
        LevelFilter::Off
    }
}
