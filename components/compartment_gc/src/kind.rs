//! Allocation kinds.
//!
//! Every thing is allocated with an [`AllocKind`], which fixes its size, the
//! arenas it may share, and when it is finalized. Objects come in a
//! foreground variant (finalized as soon as their group starts sweeping) and
//! a background variant (finalized on the helper thread).

use crate::chunk::{ARENA_HEADER_SIZE, ARENA_SIZE, CELL_SIZE};
use serde::{Deserialize, Serialize};

/// Category of a collector-managed thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AllocKind {
    Object0,
    Object0Background,
    Object2,
    Object2Background,
    Object4,
    Object4Background,
    Object8,
    Object8Background,
    Object12,
    Object12Background,
    Object16,
    Object16Background,
    Script,
    Shape,
    BaseShape,
    TypeObject,
    ShortString,
    String,
    ExternalString,
    Code,
}

/// Number of distinct allocation kinds.
pub const ALLOC_KIND_COUNT: usize = 20;

/// Coarse category used when reporting what a thing is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Object,
    Script,
    Shape,
    BaseShape,
    TypeObject,
    String,
    Code,
}

/// Foreground finalization order used while a group sweeps incrementally.
///
/// Script teardown may still look at strings, and shapes must outlive the
/// scripts that reference them.
pub(crate) const FOREGROUND_PHASES: [&[AllocKind]; 3] = [
    &[AllocKind::ExternalString],
    &[AllocKind::Script],
    &[AllocKind::Shape, AllocKind::BaseShape, AllocKind::TypeObject],
];

/// Finalization order for kinds swept off the main thread.
pub(crate) const BACKGROUND_PHASES: [&[AllocKind]; 2] = [
    &[
        AllocKind::Object0Background,
        AllocKind::Object2Background,
        AllocKind::Object4Background,
        AllocKind::Object8Background,
        AllocKind::Object12Background,
        AllocKind::Object16Background,
    ],
    &[AllocKind::ShortString, AllocKind::String],
];

/// Kinds finalized immediately when a group begins sweeping.
pub(crate) const EAGER_KINDS: [AllocKind; 7] = [
    AllocKind::Object0,
    AllocKind::Object2,
    AllocKind::Object4,
    AllocKind::Object8,
    AllocKind::Object12,
    AllocKind::Object16,
    AllocKind::Code,
];

const OBJECT_KIND_BY_SLOTS: [AllocKind; 17] = [
    AllocKind::Object0,
    AllocKind::Object2,
    AllocKind::Object2,
    AllocKind::Object4,
    AllocKind::Object4,
    AllocKind::Object8,
    AllocKind::Object8,
    AllocKind::Object8,
    AllocKind::Object8,
    AllocKind::Object12,
    AllocKind::Object12,
    AllocKind::Object12,
    AllocKind::Object12,
    AllocKind::Object16,
    AllocKind::Object16,
    AllocKind::Object16,
    AllocKind::Object16,
];

impl AllocKind {
    /// All kinds in index order.
    pub const ALL: [AllocKind; ALLOC_KIND_COUNT] = [
        AllocKind::Object0,
        AllocKind::Object0Background,
        AllocKind::Object2,
        AllocKind::Object2Background,
        AllocKind::Object4,
        AllocKind::Object4Background,
        AllocKind::Object8,
        AllocKind::Object8Background,
        AllocKind::Object12,
        AllocKind::Object12Background,
        AllocKind::Object16,
        AllocKind::Object16Background,
        AllocKind::Script,
        AllocKind::Shape,
        AllocKind::BaseShape,
        AllocKind::TypeObject,
        AllocKind::ShortString,
        AllocKind::String,
        AllocKind::ExternalString,
        AllocKind::Code,
    ];

    /// Dense index of the kind, usable for per-kind tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`index`](Self::index).
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Size in bytes of one thing of this kind. Always a multiple of the cell size.
    pub fn thing_size(self) -> usize {
        match self {
            AllocKind::Object0 | AllocKind::Object0Background => 32,
            AllocKind::Object2 | AllocKind::Object2Background => 48,
            AllocKind::Object4 | AllocKind::Object4Background => 64,
            AllocKind::Object8 | AllocKind::Object8Background => 96,
            AllocKind::Object12 | AllocKind::Object12Background => 128,
            AllocKind::Object16 | AllocKind::Object16Background => 160,
            AllocKind::Script => 160,
            AllocKind::Shape => 40,
            AllocKind::BaseShape => 64,
            AllocKind::TypeObject => 56,
            AllocKind::ShortString => 32,
            AllocKind::String => 24,
            AllocKind::ExternalString => 24,
            AllocKind::Code => 64,
        }
    }

    /// How many things of this kind fit after the arena header.
    pub fn things_per_arena(self) -> usize {
        (ARENA_SIZE - ARENA_HEADER_SIZE) / self.thing_size()
    }

    /// Byte offset of the first thing; things are packed against the arena end.
    pub fn first_thing_offset(self) -> usize {
        ARENA_SIZE - self.things_per_arena() * self.thing_size()
    }

    /// Cell index (within its arena) of the thing in `slot`.
    pub(crate) fn cell_of_slot(self, slot: usize) -> usize {
        (self.first_thing_offset() + slot * self.thing_size()) / CELL_SIZE
    }

    /// Whether things of this kind are finalized by the background sweep.
    pub fn is_background_finalized(self) -> bool {
        matches!(
            self,
            AllocKind::Object0Background
                | AllocKind::Object2Background
                | AllocKind::Object4Background
                | AllocKind::Object8Background
                | AllocKind::Object12Background
                | AllocKind::Object16Background
                | AllocKind::ShortString
                | AllocKind::String
        )
    }

    pub fn trace_kind(self) -> TraceKind {
        match self {
            AllocKind::Script => TraceKind::Script,
            AllocKind::Shape => TraceKind::Shape,
            AllocKind::BaseShape => TraceKind::BaseShape,
            AllocKind::TypeObject => TraceKind::TypeObject,
            AllocKind::ShortString | AllocKind::String | AllocKind::ExternalString => {
                TraceKind::String
            }
            AllocKind::Code => TraceKind::Code,
            _ => TraceKind::Object,
        }
    }

    /// Smallest object kind with at least `slots` fixed slots.
    ///
    /// Objects needing more than sixteen slots use the sixteen-slot kind and
    /// keep the rest out of line.
    pub fn for_object_slots(slots: usize) -> AllocKind {
        OBJECT_KIND_BY_SLOTS
            .get(slots)
            .copied()
            .unwrap_or(AllocKind::Object16)
    }

    /// Background-finalized counterpart of a foreground object kind.
    pub fn background_variant(self) -> AllocKind {
        match self {
            AllocKind::Object0 => AllocKind::Object0Background,
            AllocKind::Object2 => AllocKind::Object2Background,
            AllocKind::Object4 => AllocKind::Object4Background,
            AllocKind::Object8 => AllocKind::Object8Background,
            AllocKind::Object12 => AllocKind::Object12Background,
            AllocKind::Object16 => AllocKind::Object16Background,
            other => other,
        }
    }
}
