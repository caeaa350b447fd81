//! Heap storage
//!
//! This module provides the storage side of the collector:
//! - A registry of mapped chunks, each holding its arenas and mark bitmap
//! - Arena hand-out and release through the [`ChunkPool`] allocator lock
//! - Thing access, mark-bit queries and per-arena finalization
//! - Chunk expiry and decommit of free arenas
//!
//! The heap is shared with the helper thread, so every method takes `&self`.
//! Locks are always taken in the order pool, then registry, then arena.

use crate::arena::{Arena, ArenaHeader, FinalizeOutcome};
use crate::chunk::{
    ArenaGrant, ChunkClass, ChunkPool, MarkBitmap, MarkColor, PageMapper, ARENAS_PER_CHUNK,
};
use crate::domain::DomainId;
use crate::kind::AllocKind;
use crate::trace::{ArenaAddr, ChunkId, EdgeCollector, ThingRef, Trace};
use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Owner tag of a free arena.
const FREE_ARENA: u64 = 0;

fn owner_tag(domain: DomainId, kind: AllocKind) -> u64 {
    (u64::from(domain.as_u32()) << 8) | (kind.index() as u64 + 1)
}

fn decode_owner(tag: u64) -> Option<(DomainId, AllocKind)> {
    if tag == FREE_ARENA {
        return None;
    }
    let kind = AllocKind::from_index(((tag & 0xff) as usize).checked_sub(1)?)?;
    Some((DomainId::new((tag >> 8) as u32), kind))
}

/// One mapped chunk: arena storage, owners and mark bits.
pub(crate) struct Chunk<T> {
    arenas: Box<[Mutex<Arena<T>>]>,
    /// Domain and kind of each allocated arena, readable without the arena lock
    owners: Box<[AtomicU64]>,
    pub(crate) bitmap: MarkBitmap,
}

impl<T: Trace> Chunk<T> {
    fn new() -> Self {
        Chunk {
            arenas: (0..ARENAS_PER_CHUNK).map(|_| Mutex::new(Arena::new())).collect(),
            owners: (0..ARENAS_PER_CHUNK).map(|_| AtomicU64::new(FREE_ARENA)).collect(),
            bitmap: MarkBitmap::new(),
        }
    }

    fn arena(&self, index: u16) -> MutexGuard<'_, Arena<T>> {
        self.arenas[index as usize].lock()
    }

    fn owner(&self, index: u16) -> Option<(DomainId, AllocKind)> {
        decode_owner(self.owners[index as usize].load(Ordering::Acquire))
    }
}

/// Chunk registry plus the allocator lock.
pub struct Heap<T> {
    /// Mapped chunks indexed by chunk id; `None` once unmapped
    chunks: RwLock<Vec<Option<Arc<Chunk<T>>>>>,
    /// Allocator lock
    pool: Mutex<ChunkPool>,
    mapper: Arc<dyn PageMapper>,
}

impl<T: Trace> Heap<T> {
    /// Creates an empty heap.
    ///
    /// # Arguments
    ///
    /// * `pool` - Allocator state, usually built from the collector configuration
    /// * `mapper` - Source of chunk memory
    pub fn new(pool: ChunkPool, mapper: Arc<dyn PageMapper>) -> Self {
        Heap {
            chunks: RwLock::new(Vec::new()),
            pool: Mutex::new(pool),
            mapper,
        }
    }

    /// Takes the allocator lock.
    pub(crate) fn pool(&self) -> MutexGuard<'_, ChunkPool> {
        self.pool.lock()
    }

    fn chunk(&self, id: ChunkId) -> Option<Arc<Chunk<T>>> {
        self.chunks.read().get(id.index()).and_then(Clone::clone)
    }

    fn register(&self, id: ChunkId) {
        let mut chunks = self.chunks.write();
        if chunks.len() <= id.index() {
            chunks.resize_with(id.index() + 1, || None);
        }
        chunks[id.index()] = Some(Arc::new(Chunk::new()));
    }

    /// Hands out an initialized arena of `kind` for `domain`.
    ///
    /// # Returns
    ///
    /// The grant, or `None` if the byte limit is reached or no chunk could
    /// be mapped.
    pub(crate) fn allocate_arena(
        &self,
        domain: DomainId,
        kind: AllocKind,
        class: ChunkClass,
    ) -> Option<ArenaGrant> {
        let grant = {
            let mut pool = self.pool.lock();
            let grant = pool.allocate_arena(domain, class, &*self.mapper)?;
            if let Some(id) = grant.mapped {
                self.register(id);
            }
            grant
        };

        let addr = grant.addr;
        let chunk = self.chunk(addr.chunk)?;
        chunk.arena(addr.index).init(kind);
        chunk.bitmap.clear_arena(addr.index as usize);
        chunk.owners[addr.index as usize].store(owner_tag(domain, kind), Ordering::Release);
        trace!("arena {:?} -> domain {} ({:?})", addr, domain, kind);
        Some(grant)
    }

    /// Returns an empty arena to its chunk.
    ///
    /// `helper_sweeping` is set when the helper thread releases the arena;
    /// the owning domain's trigger is lowered in that case.
    pub(crate) fn release_arena(&self, addr: ArenaAddr, domain: DomainId, helper_sweeping: bool) {
        if let Some(chunk) = self.chunk(addr.chunk) {
            chunk.arena(addr.index).reset();
            chunk.owners[addr.index as usize].store(FREE_ARENA, Ordering::Release);
        }
        self.pool.lock().release_arena(addr, domain, helper_sweeping);
    }

    /// Maps one chunk into the empty pool ahead of demand.
    pub(crate) fn background_allocate(&self) -> bool {
        let mut pool = self.pool.lock();
        match pool.put_new_chunk(&*self.mapper) {
            Some(id) => {
                self.register(id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn want_background_allocation(&self) -> bool {
        self.pool.lock().want_background_allocation(true)
    }

    /// Unmaps empty chunks that aged out of the pool, or all of them.
    pub(crate) fn expire_chunks(&self, release_all: bool) -> usize {
        let freed = {
            let mut pool = self.pool.lock();
            let freed = pool.expire(release_all);
            let mut chunks = self.chunks.write();
            for id in &freed {
                if let Some(slot) = chunks.get_mut(id.index()) {
                    *slot = None;
                }
            }
            freed
        };
        for _ in &freed {
            self.mapper.unmap_chunk();
        }
        freed.len()
    }

    /// Decommits free arenas of available chunks, tail first, with the
    /// allocator lock dropped around each page release.
    ///
    /// Stops early when a chunk was allocated since the last GC or `cancel`
    /// returns true.
    pub(crate) fn decommit_arenas(&self, cancel: &dyn Fn() -> bool) -> usize {
        let mut decommitted = 0;
        for class in [ChunkClass::System, ChunkClass::User] {
            let available = self.pool.lock().available_chunks(class);
            for id in available.into_iter().rev() {
                loop {
                    let ticket = {
                        let mut pool = self.pool.lock();
                        if pool.chunk_allocation_since_last_gc() || cancel() {
                            return decommitted;
                        }
                        match pool.begin_decommit(id) {
                            Some(ticket) => ticket,
                            None => break,
                        }
                    };
                    let ok = self.mapper.mark_pages_unused();
                    self.pool.lock().finish_decommit(ticket, ok);
                    if !ok {
                        break;
                    }
                    decommitted += 1;
                }
            }
        }
        if decommitted > 0 {
            debug!("decommitted {} arenas", decommitted);
        }
        decommitted
    }

    /// Finalizes every remaining thing and unmaps every chunk.
    pub(crate) fn release_everything(&self) -> usize {
        let mut finalized = 0;
        let ids = {
            let mut pool = self.pool.lock();
            let mut chunks = self.chunks.write();
            for chunk in chunks.iter().flatten() {
                for arena in chunk.arenas.iter() {
                    let mut arena = arena.lock();
                    finalized += arena.finalize_all();
                    arena.reset();
                }
            }
            chunks.clear();
            pool.release_all()
        };
        for _ in &ids {
            self.mapper.unmap_chunk();
        }
        finalized
    }

    /// Domain and kind of the arena holding `thing`, or `None` once the
    /// slot has been reused.
    pub fn owner(&self, thing: ThingRef) -> Option<(DomainId, AllocKind)> {
        let chunk = self.chunk(thing.arena.chunk)?;
        if !chunk.arena(thing.arena.index).is_current(thing) {
            return None;
        }
        chunk.owner(thing.arena.index)
    }

    pub(crate) fn arena_owner(&self, addr: ArenaAddr) -> Option<(DomainId, AllocKind)> {
        self.chunk(addr.chunk)?.owner(addr.index)
    }

    /// Whether `thing` names a live value.
    pub fn contains(&self, thing: ThingRef) -> bool {
        self.with_thing(thing, |_| ()).is_some()
    }

    pub(crate) fn with_thing<R>(&self, thing: ThingRef, f: impl FnOnce(&T) -> R) -> Option<R> {
        let chunk = self.chunk(thing.arena.chunk)?;
        let arena = chunk.arena(thing.arena.index);
        if !arena.is_current(thing) {
            return None;
        }
        arena.things.get(thing.slot())?.as_ref().map(f)
    }

    pub(crate) fn with_thing_mut<R>(&self, thing: ThingRef, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let chunk = self.chunk(thing.arena.chunk)?;
        let mut arena = chunk.arena(thing.arena.index);
        if !arena.is_current(thing) {
            return None;
        }
        arena.things.get_mut(thing.slot())?.as_mut().map(f)
    }

    /// Stores a freshly allocated value in the slot `thing` names and
    /// returns the reference, stamped with the slot's generation.
    pub(crate) fn store(&self, thing: ThingRef, value: T) -> Option<ThingRef> {
        let chunk = self.chunk(thing.arena.chunk)?;
        let mut arena = chunk.arena(thing.arena.index);
        let slot = arena.things.get_mut(thing.slot())?;
        debug_assert!(slot.is_none(), "slot {} already holds a thing", thing);
        *slot = Some(value);
        Some(arena.current_ref(thing.arena, thing.slot()))
    }

    /// Outgoing edges of `thing`, collected under its arena lock.
    pub(crate) fn edges_of(&self, thing: ThingRef) -> Vec<ThingRef> {
        let mut collector = EdgeCollector::default();
        self.with_thing(thing, |value| value.trace(&mut collector));
        collector.edges
    }

    pub(crate) fn with_header<R>(&self, addr: ArenaAddr, f: impl FnOnce(&mut ArenaHeader) -> R) -> Option<R> {
        let chunk = self.chunk(addr.chunk)?;
        let mut arena = chunk.arena(addr.index);
        Some(f(&mut arena.header))
    }

    /// Slots of `addr` currently holding a value.
    pub(crate) fn live_things(&self, addr: ArenaAddr) -> Vec<ThingRef> {
        let Some(chunk) = self.chunk(addr.chunk) else {
            return Vec::new();
        };
        let arena = chunk.arena(addr.index);
        arena
            .things
            .iter()
            .enumerate()
            .filter(|(_, thing)| thing.is_some())
            .map(|(slot, _)| arena.current_ref(addr, slot))
            .collect()
    }

    pub(crate) fn live_count(&self, addr: ArenaAddr) -> usize {
        self.chunk(addr.chunk)
            .map_or(0, |chunk| chunk.arena(addr.index).live_count())
    }

    fn mark_cell(&self, thing: ThingRef) -> Option<(Arc<Chunk<T>>, usize, usize)> {
        let chunk = self.chunk(thing.arena.chunk)?;
        let (_, kind) = chunk.owner(thing.arena.index)?;
        let cell = kind.cell_of_slot(thing.slot());
        Some((chunk, thing.arena.index as usize, cell))
    }

    /// Whether `thing` carries at least `color`. Gray things are also black.
    pub fn is_marked(&self, thing: ThingRef, color: MarkColor) -> bool {
        self.mark_cell(thing)
            .is_some_and(|(chunk, arena, cell)| chunk.bitmap.is_marked(arena, cell, color))
    }

    /// Marks `thing`; false if it already carried the color.
    pub(crate) fn mark(&self, thing: ThingRef, color: MarkColor) -> bool {
        self.mark_cell(thing)
            .is_some_and(|(chunk, arena, cell)| chunk.bitmap.mark_if_unmarked(arena, cell, color))
    }

    /// Clears the gray bit; true if it was set.
    pub(crate) fn unmark_gray(&self, thing: ThingRef) -> bool {
        self.mark_cell(thing)
            .is_some_and(|(chunk, arena, cell)| chunk.bitmap.unmark_gray(arena, cell))
    }

    pub(crate) fn unmark_arena(&self, addr: ArenaAddr) {
        if let Some(chunk) = self.chunk(addr.chunk) {
            chunk.bitmap.clear_arena(addr.index as usize);
        }
    }

    /// Finalizes the unmarked things of one arena.
    pub(crate) fn finalize_arena(&self, addr: ArenaAddr) -> FinalizeOutcome {
        match self.chunk(addr.chunk) {
            Some(chunk) => chunk
                .arena(addr.index)
                .finalize(&chunk.bitmap, addr.index as usize),
            None => FinalizeOutcome::Empty { finalized: 0 },
        }
    }
}
