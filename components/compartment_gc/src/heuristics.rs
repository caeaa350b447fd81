//! Heap growth and trigger policy.
//!
//! After each collection every domain gets a new trigger: the byte count at
//! which allocation asks for the next collection. The trigger is the
//! post-collection heap size times a growth factor. With dynamic growth the
//! factor depends on how often collections happen: frequent collections of a
//! small heap let it grow quickly, frequent collections of a large heap keep
//! it tight, and infrequent collections use a flat factor.

use crate::config::GcConfig;
use crate::stats::GcInvocationKind;
use std::time::{Duration, Instant};

/// Growth factor used when dynamic growth is off.
pub(crate) const STATIC_HEAP_GROWTH: f64 = 3.0;

/// Slice budgets are multiplied by this while collections are frequent.
pub(crate) const MARK_SLICE_MULTIPLIER: u64 = 2;

/// Heaps smaller than this always use the low-frequency factor.
const SMALL_HEAP_BYTES: usize = 1024 * 1024;

/// `maybe_gc` starts a collection once a domain reaches this share of its trigger.
pub(crate) fn maybe_gc_factor(high_frequency: bool) -> f64 {
    if high_frequency {
        0.75
    } else {
        0.9
    }
}

/// Below this a domain is never collected by `maybe_gc`'s byte check.
pub(crate) const MAYBE_GC_MIN_BYTES: usize = 1024 * 1024;

/// Growth factor chosen after a collection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Growth {
    pub(crate) factor: f64,
    /// New value of the collector's high-frequency flag, if it changes
    pub(crate) high_frequency: Option<bool>,
}

/// Picks the growth factor for a domain that holds `last_bytes` after a
/// collection.
pub(crate) fn growth_factor(
    config: &GcConfig,
    last_bytes: usize,
    last_gc_time: Option<Instant>,
    now: Instant,
) -> Growth {
    if !config.dynamic_heap_growth {
        return Growth { factor: STATIC_HEAP_GROWTH, high_frequency: None };
    }
    if last_bytes < SMALL_HEAP_BYTES {
        return Growth { factor: config.low_frequency_heap_growth, high_frequency: None };
    }

    debug_assert!(config.high_frequency_high_limit_bytes > config.high_frequency_low_limit_bytes);
    let threshold = Duration::from_millis(config.high_frequency_time_threshold_ms);
    let recent = last_gc_time.is_some_and(|last| last + threshold > now);
    if !recent {
        return Growth { factor: config.low_frequency_heap_growth, high_frequency: Some(false) };
    }

    let (low, high) = (config.high_frequency_low_limit_bytes, config.high_frequency_high_limit_bytes);
    let (min, max) = (config.high_frequency_heap_growth_min, config.high_frequency_heap_growth_max);
    let factor = if last_bytes <= low {
        max
    } else if last_bytes >= high {
        min
    } else {
        let k = (min - max) / (high - low) as f64;
        k * (last_bytes - low) as f64 + max
    };
    Growth { factor, high_frequency: Some(true) }
}

/// Bytes at which the next collection is requested.
///
/// Shrinking collections grow from what is actually live; normal ones never
/// go below the allocation threshold.
pub(crate) fn trigger_bytes(
    last_bytes: usize,
    allocation_threshold: usize,
    max_bytes: usize,
    factor: f64,
    kind: GcInvocationKind,
) -> usize {
    let base = match kind {
        GcInvocationKind::Shrink => last_bytes,
        GcInvocationKind::Normal => last_bytes.max(allocation_threshold),
    };
    let trigger = base as f64 * factor;
    if trigger >= max_bytes as f64 {
        max_bytes
    } else {
        trigger as usize
    }
}
