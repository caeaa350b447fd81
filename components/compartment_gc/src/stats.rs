//! Collection statistics and observer events.

use crate::collector::IncrementalState;
use std::fmt;

/// Why a collection (or slice) was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// Explicit request through the API
    Api,
    /// A domain crossed its allocation trigger
    AllocTrigger,
    /// Allocation failed and a synchronous collection is the last resort
    LastDitch,
    /// Heuristic check from `maybe_gc`
    MaybeGc,
    /// Malloc counters crossed their limit
    TooMuchMalloc,
    /// Finishing an interrupted sweep during a reset
    Reset,
    /// Final collection before teardown
    Shutdown,
    /// Debug slice with a work budget
    Debug,
    /// Collecting a released domain
    DestroyDomain,
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcReason::Api => "API",
            GcReason::AllocTrigger => "ALLOC_TRIGGER",
            GcReason::LastDitch => "LAST_DITCH",
            GcReason::MaybeGc => "MAYBEGC",
            GcReason::TooMuchMalloc => "TOO_MUCH_MALLOC",
            GcReason::Reset => "RESET",
            GcReason::Shutdown => "SHUTDOWN",
            GcReason::Debug => "DEBUG_GC",
            GcReason::DestroyDomain => "DESTROY_DOMAIN",
        };
        f.write_str(name)
    }
}

/// Whether a collection also gives memory back aggressively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GcInvocationKind {
    #[default]
    Normal,
    /// Release every empty chunk and decommit free arenas
    Shrink,
}

/// Notifications delivered to the observer installed with
/// [`CollectorContext::set_observer`](crate::CollectorContext::set_observer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcEvent {
    /// A collection is about to start
    Begin,
    /// A collection call returned with no collection in progress
    End,
    /// A sweep group is about to be finalized
    GroupStart,
    /// The sweep group's eager work is done
    GroupEnd,
    /// Sweeping finished; `is_compartment_gc` when some domain was left out
    CollectionEnd { is_compartment_gc: bool },
    /// The incremental state machine moved
    StateChange {
        from: IncrementalState,
        to: IncrementalState,
    },
    /// An incremental collection was abandoned or forced to completion
    Reset { reason: String },
}

/// Counters accumulated over the collector's lifetime.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed collections
    pub collections: u64,
    /// Slices run, including the single slice of a non-incremental collection
    pub slices: u64,
    /// Incremental collections that were reset
    pub resets: u64,
    pub last_reset_reason: Option<String>,
    /// Why the last collection ran without slicing
    pub nonincremental_reason: Option<String>,
    pub things_finalized: u64,
    pub arenas_released: u64,
    pub chunks_mapped: u64,
    pub chunks_unmapped: u64,
    pub arenas_decommitted: u64,
    pub groups_swept: u64,
    /// Incoming cross-domain edges whose target was marked black
    pub incoming_black_edges: u64,
    /// Incoming cross-domain edges whose target was marked gray
    pub incoming_gray_edges: u64,
    pub gray_buffer_failures: u64,
    pub last_ditch_gcs: u64,
}

impl GcStats {
    pub(crate) fn reset(&mut self, reason: &str) {
        self.resets += 1;
        self.last_reset_reason = Some(reason.to_string());
    }

    pub(crate) fn nonincremental(&mut self, reason: &str) {
        self.nonincremental_reason = Some(reason.to_string());
    }
}
