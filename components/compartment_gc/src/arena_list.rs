//! Per-domain arena lists and free lists.
//!
//! Each domain keeps one [`ArenaList`] per allocation kind. Arenas before the
//! list's cursor are full; arenas at or after it still have free things, so
//! finding the next arena to allocate from is O(1). The arena currently being
//! allocated from has its free spans moved into a [`FreeList`].

use crate::arena::FreeSpan;
use crate::kind::{AllocKind, ALLOC_KIND_COUNT};
use crate::trace::{ArenaAddr, ThingRef};
use std::collections::VecDeque;

/// Arenas of one kind in one domain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ArenaList {
    arenas: Vec<ArenaAddr>,
    cursor: usize,
}

impl ArenaList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.arenas.len()
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    #[cfg(test)]
    pub(crate) fn arenas(&self) -> &[ArenaAddr] {
        &self.arenas
    }

    /// Empties the list, returning its arenas head first.
    pub(crate) fn take(&mut self) -> Vec<ArenaAddr> {
        self.cursor = 0;
        std::mem::take(&mut self.arenas)
    }

    /// Next arena with free things, advancing the cursor past it.
    pub(crate) fn next_with_free(&mut self) -> Option<ArenaAddr> {
        let addr = *self.arenas.get(self.cursor)?;
        self.cursor += 1;
        Some(addr)
    }

    /// Inserts a finalized arena at the cursor, keeping full arenas in front.
    pub(crate) fn insert(&mut self, addr: ArenaAddr, has_free: bool) {
        self.arenas.insert(self.cursor, addr);
        if !has_free {
            self.cursor += 1;
        }
    }

    /// Adds a fresh arena whose free span was moved to the free list.
    pub(crate) fn push_new(&mut self, addr: ArenaAddr) {
        debug_assert_eq!(self.cursor, self.arenas.len());
        self.arenas.insert(0, addr);
        self.cursor += 1;
    }

    /// Splices the result of a background finalization behind the arenas
    /// allocated while it ran.
    pub(crate) fn append_finalized(&mut self, finalized: ArenaList) {
        debug_assert_eq!(self.cursor, self.arenas.len());
        let base = self.arenas.len();
        self.arenas.extend(finalized.arenas);
        self.cursor = base + finalized.cursor;
    }
}

/// Free slots of the arena currently being allocated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FreeList {
    pub(crate) arena: ArenaAddr,
    spans: VecDeque<FreeSpan>,
    /// The arena was queued for delayed marking since the last slice ended
    delayed: bool,
}

impl FreeList {
    pub(crate) fn new(arena: ArenaAddr, spans: Vec<FreeSpan>, delayed: bool) -> Self {
        FreeList {
            arena,
            spans: spans.into(),
            delayed,
        }
    }

    pub(crate) fn allocate(&mut self) -> Option<ThingRef> {
        let span = self.spans.front_mut()?;
        let slot = span.first;
        if span.first == span.last {
            self.spans.pop_front();
        } else {
            span.first += 1;
        }
        Some(self.arena.thing(slot as usize))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub(crate) fn into_spans(self) -> Vec<FreeSpan> {
        self.spans.into()
    }
}

/// Whether a kind's arenas are being finalized off the main thread.
///
/// `Done → Running` when the arenas are queued, `Running → JustFinished`
/// once the swept list has been merged back, and `JustFinished → Done` on
/// the next allocation from the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundFinalizeState {
    Done,
    Running,
    JustFinished,
}

/// A free list returned to its arena by [`ArenaLists::purge`].
pub(crate) type PurgedFreeList = (ArenaAddr, Vec<FreeSpan>);

/// All arena bookkeeping of one domain.
#[derive(Debug)]
pub(crate) struct ArenaLists {
    lists: [ArenaList; ALLOC_KIND_COUNT],
    free_lists: [Option<FreeList>; ALLOC_KIND_COUNT],
    to_sweep: [VecDeque<ArenaAddr>; ALLOC_KIND_COUNT],
    background: [BackgroundFinalizeState; ALLOC_KIND_COUNT],
}

impl ArenaLists {
    pub(crate) fn new() -> Self {
        ArenaLists {
            lists: std::array::from_fn(|_| ArenaList::new()),
            free_lists: std::array::from_fn(|_| None),
            to_sweep: std::array::from_fn(|_| VecDeque::new()),
            background: [BackgroundFinalizeState::Done; ALLOC_KIND_COUNT],
        }
    }

    pub(crate) fn list_mut(&mut self, kind: AllocKind) -> &mut ArenaList {
        &mut self.lists[kind.index()]
    }

    pub(crate) fn allocate_from_free_list(&mut self, kind: AllocKind) -> Option<ThingRef> {
        self.free_lists[kind.index()].as_mut()?.allocate()
    }

    pub(crate) fn set_free_list(&mut self, kind: AllocKind, free_list: FreeList) {
        self.free_lists[kind.index()] = Some(free_list);
    }

    /// Returns the free list's arena the first time it is asked for after
    /// [`rearm_free_list_delays`](Self::rearm_free_list_delays).
    pub(crate) fn claim_free_list_delay(&mut self, kind: AllocKind) -> Option<ArenaAddr> {
        let list = self.free_lists[kind.index()].as_mut()?;
        if std::mem::replace(&mut list.delayed, true) {
            return None;
        }
        Some(list.arena)
    }

    /// Called at the end of every marking slice: the marker has visited the
    /// free-list arenas, so the next allocation from each must queue it again.
    pub(crate) fn rearm_free_list_delays(&mut self) {
        for list in self.free_lists.iter_mut().flatten() {
            list.delayed = false;
        }
    }

    /// Clears every free list, handing the remaining spans back so the caller
    /// can store them in the arena headers.
    pub(crate) fn purge(&mut self) -> Vec<PurgedFreeList> {
        self.free_lists
            .iter_mut()
            .filter_map(Option::take)
            .filter(|list| !list.is_empty())
            .map(|list| (list.arena, list.into_spans()))
            .collect()
    }

    /// Every arena held in the lists, queued or not.
    pub(crate) fn all_arenas(&self) -> Vec<ArenaAddr> {
        self.lists
            .iter()
            .flat_map(|list| list.arenas.iter().copied())
            .chain(self.to_sweep.iter().flat_map(|queue| queue.iter().copied()))
            .collect()
    }

    pub(crate) fn arena_count(&self) -> usize {
        self.lists.iter().map(ArenaList::len).sum::<usize>()
            + self.to_sweep.iter().map(VecDeque::len).sum::<usize>()
    }

    /// True when the domain owns no arenas and nothing is being swept for it.
    pub(crate) fn are_empty(&self) -> bool {
        self.arena_count() == 0
            && self
                .background
                .iter()
                .all(|state| *state != BackgroundFinalizeState::Running)
    }

    pub(crate) fn background_state(&self, kind: AllocKind) -> BackgroundFinalizeState {
        self.background[kind.index()]
    }

    /// Moves `JustFinished` to `Done`; called on the allocation path.
    pub(crate) fn acknowledge_background(&mut self, kind: AllocKind) {
        let state = &mut self.background[kind.index()];
        if *state == BackgroundFinalizeState::JustFinished {
            *state = BackgroundFinalizeState::Done;
        }
    }

    /// Empties a kind's list so it can be finalized immediately.
    pub(crate) fn take_for_finalize(&mut self, kind: AllocKind) -> Vec<ArenaAddr> {
        debug_assert!(!kind.is_background_finalized());
        self.lists[kind.index()].take()
    }

    pub(crate) fn queue_for_foreground_sweep(&mut self, kind: AllocKind) {
        debug_assert!(!kind.is_background_finalized());
        debug_assert!(self.to_sweep[kind.index()].is_empty());
        self.to_sweep[kind.index()] = self.lists[kind.index()].take().into();
    }

    /// Empties a background kind's list and marks it as running, or returns
    /// `None` when there is nothing to sweep.
    pub(crate) fn queue_for_background_sweep(&mut self, kind: AllocKind) -> Option<Vec<ArenaAddr>> {
        debug_assert!(kind.is_background_finalized());
        let list = &mut self.lists[kind.index()];
        if list.is_empty() {
            return None;
        }
        debug_assert_ne!(self.background[kind.index()], BackgroundFinalizeState::Running);
        self.background[kind.index()] = BackgroundFinalizeState::Running;
        Some(list.take())
    }

    /// Merges swept arenas back after a background finalization.
    pub(crate) fn finish_background_sweep(&mut self, kind: AllocKind, finalized: ArenaList, on_background: bool) {
        debug_assert_eq!(self.background[kind.index()], BackgroundFinalizeState::Running);
        let touched = !finalized.is_empty();
        self.lists[kind.index()].append_finalized(finalized);
        self.background[kind.index()] = if on_background && touched {
            BackgroundFinalizeState::JustFinished
        } else {
            BackgroundFinalizeState::Done
        };
    }

    /// Queued foreground arenas and the destination list of one kind.
    pub(crate) fn sweep_parts(&mut self, kind: AllocKind) -> (&mut VecDeque<ArenaAddr>, &mut ArenaList) {
        (&mut self.to_sweep[kind.index()], &mut self.lists[kind.index()])
    }

}
