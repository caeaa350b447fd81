//! Compartment GC - Incremental, compartmentalized mark-and-sweep collector
//!
//! This component provides:
//! - Chunk and arena management with a pooled, decommitting page allocator
//! - Size-classed allocation kinds with per-domain free lists
//! - Domains (compartments) that are scheduled and collected independently
//! - Incremental marking with pre-write barriers and bounded slices
//! - Black/gray marking and cross-domain sweep groups
//! - Foreground and helper-thread sweeping
//! - Heap growth heuristics and collection triggers
//!
//! # Example
//!
//! ```
//! use compartment_gc::{AllocKind, CollectorContext, GcConfig, GcInvocationKind, GcReason, Trace, Tracer};
//!
//! struct Leaf;
//!
//! impl Trace for Leaf {
//!     fn trace(&self, _tracer: &mut dyn Tracer) {}
//! }
//!
//! let mut gc = CollectorContext::new(GcConfig::single_threaded()).unwrap();
//! let domain = gc.new_domain("page", false);
//! let kept = gc.allocate(domain, AllocKind::Object0, Leaf).unwrap();
//! let dropped = gc.allocate(domain, AllocKind::Object0, Leaf).unwrap();
//! gc.add_root(kept, "kept").unwrap();
//!
//! gc.gc(GcInvocationKind::Normal, GcReason::Api);
//! assert!(gc.contains(kept));
//! assert!(!gc.contains(dropped));
//! ```

pub mod budget;
pub mod chunk;
pub mod collector;
pub mod config;
pub mod domain;
pub mod error;
pub mod kind;
pub mod roots;
pub mod stats;
pub mod sweep;
pub mod trace;

mod arena;
mod arena_list;
mod group_finder;
mod heap;
mod helper_thread;
mod heuristics;
mod incremental;
mod marker;

// Re-export main types
pub use budget::{Budget, SliceBudget};
pub use chunk::{
    BoundedPageMapper, ChunkClass, ChunkPool, DomainBytes, MarkColor, PageMapper, SystemPageMapper,
    ARENAS_PER_CHUNK, ARENA_CELL_COUNT, ARENA_HEADER_SIZE, ARENA_SIZE, CELL_SIZE, CHUNK_SIZE,
};
pub use collector::{CollectorContext, IncrementalState};
pub use config::{GcConfig, GcMode};
pub use domain::{
    CrossDomainKey, Domain, DomainGcState, DomainId, EdgeColor, IncomingEdge, SweepHook, WeakEntry, WrapperKind,
};
pub use error::{GcError, GcResult};
pub use kind::{AllocKind, TraceKind, ALLOC_KIND_COUNT};
pub use roots::{RootList, RootProvider};
pub use stats::{GcEvent, GcInvocationKind, GcReason, GcStats};
pub use sweep::SweepView;
pub use trace::{ArenaAddr, ChunkId, ThingRef, Trace, Tracer};

pub use arena_list::BackgroundFinalizeState;
pub use helper_thread::HelperState;
