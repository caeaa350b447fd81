//! Collector configuration.
//!
//! All tunables live in [`GcConfig`]. The defaults describe a desktop-sized
//! heap with incremental collection and a helper thread; embedders can
//! override any subset through JSON:
//!
//! ```
//! use compartment_gc::{GcConfig, GcMode};
//!
//! let config = GcConfig::from_json(r#"{ "mode": "compartment", "slice_budget_ms": 5 }"#).unwrap();
//! assert_eq!(config.mode, GcMode::Compartment);
//! assert_eq!(config.slice_budget_ms, 5);
//! assert!(config.use_helper_thread);
//! ```

use crate::chunk::ARENA_SIZE;
use crate::error::GcResult;
use serde::{Deserialize, Serialize};

/// How domains are selected for collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Every collection covers every domain and runs to completion.
    Global,
    /// Only scheduled domains are collected, non-incrementally.
    Compartment,
    /// Scheduled domains are collected in bounded slices.
    Incremental,
}

impl Default for GcMode {
    fn default() -> Self {
        GcMode::Incremental
    }
}

/// Tunable parameters of a [`CollectorContext`](crate::CollectorContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Upper bound on bytes held in arenas across all domains
    pub max_bytes: usize,
    /// Malloc bytes reported through `report_malloc` before a full GC is requested
    pub max_malloc_bytes: usize,
    /// Lower bound used when computing a domain's trigger
    pub allocation_threshold: usize,
    /// Domain selection and incrementality
    pub mode: GcMode,
    /// Whether incremental slices are permitted at all
    pub incremental_enabled: bool,
    /// Default time budget of one slice
    pub slice_budget_ms: u64,
    /// Double the slice budget while collections are frequent
    pub dynamic_mark_slice: bool,
    /// Use the frequency-dependent growth factor instead of a flat 3.0
    pub dynamic_heap_growth: bool,
    /// Two collections closer than this are "high frequency"
    pub high_frequency_time_threshold_ms: u64,
    /// Heap size at or below which the maximum growth factor applies
    pub high_frequency_low_limit_bytes: usize,
    /// Heap size at or above which the minimum growth factor applies
    pub high_frequency_high_limit_bytes: usize,
    pub high_frequency_heap_growth_min: f64,
    pub high_frequency_heap_growth_max: f64,
    pub low_frequency_heap_growth: f64,
    /// Mark stack capacity; overflowing things are delayed per arena
    pub mark_stack_limit: usize,
    /// Maximum buffered gray roots before falling back to a rescan
    pub gray_root_buffer_limit: usize,
    /// Run background sweeping and chunk allocation on a helper thread
    pub use_helper_thread: bool,
    /// Yield once between draining the mark stack and starting to sweep
    pub extra_mark_yield: bool,
    /// Collections an empty chunk survives in the pool before it is unmapped
    pub max_empty_chunk_age: u32,
    /// Free committed arenas tolerated before an idle GC shrinks the heap
    pub free_committed_arenas_threshold: usize,
    /// Interval after which an idle `maybe_gc` runs a full shrinking GC
    pub idle_full_gc_span_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            max_bytes: u32::MAX as usize,
            max_malloc_bytes: u32::MAX as usize,
            allocation_threshold: 30 * 1024 * 1024,
            mode: GcMode::Incremental,
            incremental_enabled: true,
            slice_budget_ms: 10,
            dynamic_mark_slice: false,
            dynamic_heap_growth: false,
            high_frequency_time_threshold_ms: 1000,
            high_frequency_low_limit_bytes: 100 * 1024 * 1024,
            high_frequency_high_limit_bytes: 500 * 1024 * 1024,
            high_frequency_heap_growth_min: 1.5,
            high_frequency_heap_growth_max: 3.0,
            low_frequency_heap_growth: 1.5,
            mark_stack_limit: usize::MAX,
            gray_root_buffer_limit: usize::MAX,
            use_helper_thread: true,
            extra_mark_yield: true,
            max_empty_chunk_age: 4,
            free_committed_arenas_threshold: (8 * 1024 * 1024) / ARENA_SIZE,
            idle_full_gc_span_ms: 20 * 1000,
        }
    }
}

impl GcConfig {
    /// Parses a configuration, filling omitted fields with defaults.
    pub fn from_json(json: &str) -> GcResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the configuration as pretty-printed JSON.
    pub fn to_json(&self) -> GcResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Configuration without a helper thread, for deterministic embedding.
    pub fn single_threaded() -> Self {
        GcConfig {
            use_helper_thread: false,
            ..GcConfig::default()
        }
    }
}
