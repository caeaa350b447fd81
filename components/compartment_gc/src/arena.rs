//! Arenas: fixed-size pages of same-kind things.

use crate::chunk::{MarkBitmap, MarkColor};
use crate::kind::AllocKind;
use crate::trace::{ArenaAddr, ThingRef, Trace};

/// Inclusive range of free slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeSpan {
    pub(crate) first: u16,
    pub(crate) last: u16,
}

/// Per-arena bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct ArenaHeader {
    /// `None` while the arena sits free in its chunk
    pub(crate) kind: Option<AllocKind>,
    /// Free slots not currently handed to a free list
    pub(crate) free_spans: Vec<FreeSpan>,
    pub(crate) has_delayed_marking: bool,
    pub(crate) mark_overflow: bool,
    pub(crate) allocated_during_incremental: bool,
    pub(crate) allocated_during_sweep: bool,
}

impl ArenaHeader {
    fn free() -> Self {
        ArenaHeader {
            kind: None,
            free_spans: Vec::new(),
            has_delayed_marking: false,
            mark_overflow: false,
            allocated_during_incremental: false,
            allocated_during_sweep: false,
        }
    }

    pub(crate) fn has_free_things(&self) -> bool {
        !self.free_spans.is_empty()
    }

    /// Moves the free spans out, leaving the arena looking fully used.
    pub(crate) fn take_free_spans(&mut self) -> Vec<FreeSpan> {
        std::mem::take(&mut self.free_spans)
    }

    pub(crate) fn clear_marking_flags(&mut self) {
        self.has_delayed_marking = false;
        self.mark_overflow = false;
        self.allocated_during_incremental = false;
    }
}

/// Result of finalizing one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalizeOutcome {
    /// Nothing survived; the arena goes back to its chunk.
    Empty { finalized: usize },
    /// Some things survived.
    Live { finalized: usize, has_free: bool },
}

/// Storage of one arena.
pub(crate) struct Arena<T> {
    pub(crate) header: ArenaHeader,
    pub(crate) things: Vec<Option<T>>,
    /// Bumped each time a slot is emptied. Survives reuse of the arena.
    generations: Vec<u32>,
}

impl<T: Trace> Arena<T> {
    pub(crate) fn new() -> Self {
        Arena {
            header: ArenaHeader::free(),
            things: Vec::new(),
            generations: Vec::new(),
        }
    }

    /// Prepares a freshly handed-out arena: every slot free.
    pub(crate) fn init(&mut self, kind: AllocKind) {
        let count = kind.things_per_arena();
        self.header = ArenaHeader {
            kind: Some(kind),
            free_spans: vec![FreeSpan {
                first: 0,
                last: (count - 1) as u16,
            }],
            ..ArenaHeader::free()
        };
        self.things.clear();
        self.things.resize_with(count, || None);
        if self.generations.len() < count {
            self.generations.resize(count, 0);
        }
    }

    /// Reference to whatever currently occupies `slot`.
    pub(crate) fn current_ref(&self, addr: ArenaAddr, slot: usize) -> ThingRef {
        ThingRef {
            generation: self.generations.get(slot).copied().unwrap_or(0),
            ..addr.thing(slot)
        }
    }

    /// Whether `thing` names the current occupant of its slot.
    pub(crate) fn is_current(&self, thing: ThingRef) -> bool {
        thing.slot() < self.things.len() && self.generations.get(thing.slot()) == Some(&thing.generation)
    }

    /// Drops storage of a released or decommitted arena.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.things.iter().all(Option::is_none));
        self.header = ArenaHeader::free();
        self.things = Vec::new();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.things.iter().all(Option::is_none)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.things.iter().filter(|t| t.is_some()).count()
    }

    /// Finalizes every unmarked thing and rebuilds the free spans from what
    /// is left.
    pub(crate) fn finalize(&mut self, bitmap: &MarkBitmap, arena_index: usize) -> FinalizeOutcome {
        debug_assert!(!self.header.has_delayed_marking);
        debug_assert!(!self.header.allocated_during_incremental);
        let Some(kind) = self.header.kind else {
            return FinalizeOutcome::Empty { finalized: 0 };
        };

        let mut finalized = 0;
        let slots = self.things.iter_mut().zip(self.generations.iter_mut());
        for (slot, (thing, generation)) in slots.enumerate() {
            if bitmap.is_marked(arena_index, kind.cell_of_slot(slot), MarkColor::Black) {
                continue;
            }
            if let Some(mut value) = thing.take() {
                value.finalize();
                *generation = generation.wrapping_add(1);
                finalized += 1;
            }
        }

        self.header.free_spans = free_spans_of(&self.things);
        if self.is_empty() {
            FinalizeOutcome::Empty { finalized }
        } else {
            FinalizeOutcome::Live {
                finalized,
                has_free: self.header.has_free_things(),
            }
        }
    }

    /// Drops every thing, running finalizers. Used at shutdown.
    pub(crate) fn finalize_all(&mut self) -> usize {
        let mut finalized = 0;
        for (thing, generation) in self.things.iter_mut().zip(self.generations.iter_mut()) {
            if let Some(mut value) = thing.take() {
                value.finalize();
                *generation = generation.wrapping_add(1);
                finalized += 1;
            }
        }
        finalized
    }
}

fn free_spans_of<T>(things: &[Option<T>]) -> Vec<FreeSpan> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (slot, thing) in things.iter().enumerate() {
        match (thing.is_none(), start) {
            (true, None) => start = Some(slot),
            (false, Some(first)) => {
                spans.push(FreeSpan {
                    first: first as u16,
                    last: (slot - 1) as u16,
                });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(first) = start {
        spans.push(FreeSpan {
            first: first as u16,
            last: (things.len() - 1) as u16,
        });
    }
    spans
}
