//! Thing references and the tracing contract.
//!
//! The collector never hands out pointers into its arenas. A thing is named
//! by a [`ThingRef`] (chunk, arena, slot, generation) and the mutator reaches
//! its value through
//! [`CollectorContext::with_thing`](crate::CollectorContext::with_thing).
//! Managed values implement [`Trace`] so the marker can discover their
//! outgoing references and so the sweeper can finalize them.

use std::fmt;

/// Identifier of a mapped chunk. Never reused within one collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) u32);

impl ChunkId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Address of one arena: its chunk and its index inside the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaAddr {
    pub chunk: ChunkId,
    pub index: u16,
}

impl ArenaAddr {
    pub(crate) fn new(chunk: ChunkId, index: usize) -> Self {
        ArenaAddr {
            chunk,
            index: index as u16,
        }
    }

    /// Reference to `slot` of this arena at generation zero.
    pub(crate) fn thing(self, slot: usize) -> ThingRef {
        ThingRef {
            arena: self,
            slot: slot as u16,
            generation: 0,
        }
    }
}

/// Handle to a collector-managed thing.
///
/// A `ThingRef` stays valid until the thing is finalized. Using it after that
/// point is a mutator bug; the collector answers with
/// [`GcError::InvalidThing`](crate::GcError::InvalidThing) or ignores the edge.
/// The slot's generation is part of the reference, so a stale reference never
/// names a thing later allocated in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThingRef {
    pub(crate) arena: ArenaAddr,
    pub(crate) slot: u16,
    pub(crate) generation: u32,
}

impl ThingRef {
    /// The arena holding this thing.
    pub fn arena(self) -> ArenaAddr {
        self.arena
    }

    /// Slot index within the arena.
    pub fn slot(self) -> usize {
        self.slot as usize
    }

    /// How many times the slot had been emptied when this thing was stored.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ThingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.arena.chunk.0, self.arena.index, self.slot
        )
    }
}

/// Receiver of outgoing edges reported by [`Trace::trace`].
pub trait Tracer {
    /// Reports one reference held by the thing being traced.
    fn edge(&mut self, target: ThingRef);
}

/// Contract every managed value fulfils.
///
/// `trace` must report every [`ThingRef`] the value holds, including targets of
/// cross-domain wrappers. `finalize` runs exactly once, on the thread sweeping
/// the thing's arena, right before the value is dropped.
pub trait Trace {
    fn trace(&self, tracer: &mut dyn Tracer);

    fn finalize(&mut self) {}
}

/// Tracer that records edges into a vector.
#[derive(Debug, Default)]
pub(crate) struct EdgeCollector {
    pub(crate) edges: Vec<ThingRef>,
}

impl Tracer for EdgeCollector {
    fn edge(&mut self, target: ThingRef) {
        self.edges.push(target);
    }
}
