//! Chunk bookkeeping and the chunk pool.
//!
//! The heap is carved into 1 MiB chunks, each holding [`ARENAS_PER_CHUNK`]
//! arenas of [`ARENA_SIZE`] bytes. This module owns everything that lives under
//! the single allocator lock:
//!
//! - per-chunk free-arena lists and decommit state ([`ChunkInfo`]),
//! - the available-chunk lists (one for system domains, one for user domains),
//! - the pool of empty chunks kept around for a few collections before they
//!   are unmapped,
//! - heap-wide and per-domain byte accounting.
//!
//! Thing storage and mark bits live in [`Heap`](crate::heap::Heap); the pool
//! only hands out [`ArenaAddr`]s.

use crate::domain::DomainId;
use crate::trace::{ArenaAddr, ChunkId};
use log::{debug, trace};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Granularity of mark bits.
pub const CELL_SIZE: usize = 8;
/// Size of one arena.
pub const ARENA_SIZE: usize = 4096;
/// Bytes reserved at the start of each arena for its header.
pub const ARENA_HEADER_SIZE: usize = 32;
/// Size of one chunk.
pub const CHUNK_SIZE: usize = 1 << 20;
/// Arenas per chunk: 1 MiB less the trailer holding the mark bitmap and chunk info.
pub const ARENAS_PER_CHUNK: usize = 252;
/// Mark-bit cells per arena.
pub const ARENA_CELL_COUNT: usize = ARENA_SIZE / CELL_SIZE;

const BITMAP_WORDS_PER_ARENA: usize = ARENA_CELL_COUNT / 64;

/// Color of a mark bit. A gray thing has both its black and its gray bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkColor {
    Black = 0,
    Gray = 1,
}

/// Side-table mark bitmap covering every cell of a chunk.
///
/// Kept outside the things so the collector can answer "is marked" without
/// touching (or locking) the thing itself.
pub(crate) struct MarkBitmap {
    words: Box<[AtomicU64]>,
}

impl MarkBitmap {
    pub(crate) fn new() -> Self {
        let words = (0..ARENAS_PER_CHUNK * BITMAP_WORDS_PER_ARENA)
            .map(|_| AtomicU64::new(0))
            .collect();
        MarkBitmap { words }
    }

    #[inline]
    fn word_and_mask(arena: usize, cell: usize, color: MarkColor) -> (usize, u64) {
        let bit = arena * ARENA_CELL_COUNT + cell + color as usize;
        (bit / 64, 1u64 << (bit % 64))
    }

    pub(crate) fn is_marked(&self, arena: usize, cell: usize, color: MarkColor) -> bool {
        let (word, mask) = Self::word_and_mask(arena, cell, color);
        self.words[word].load(Ordering::Relaxed) & mask != 0
    }

    /// Sets the black bit and, for gray, the gray bit.
    ///
    /// Returns false if the thing was already marked with at least `color`.
    pub(crate) fn mark_if_unmarked(&self, arena: usize, cell: usize, color: MarkColor) -> bool {
        let (word, mask) = Self::word_and_mask(arena, cell, MarkColor::Black);
        if self.words[word].fetch_or(mask, Ordering::Relaxed) & mask != 0 {
            return false;
        }
        if color == MarkColor::Gray {
            let (word, mask) = Self::word_and_mask(arena, cell, MarkColor::Gray);
            self.words[word].fetch_or(mask, Ordering::Relaxed);
        }
        true
    }

    /// Turns a gray thing black. Returns whether the gray bit was set.
    pub(crate) fn unmark_gray(&self, arena: usize, cell: usize) -> bool {
        let (word, mask) = Self::word_and_mask(arena, cell, MarkColor::Gray);
        self.words[word].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    pub(crate) fn clear_arena(&self, arena: usize) {
        let start = arena * BITMAP_WORDS_PER_ARENA;
        for word in &self.words[start..start + BITMAP_WORDS_PER_ARENA] {
            word.store(0, Ordering::Relaxed);
        }
    }
}

/// Which available list a chunk serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkClass {
    System,
    User,
}

impl ChunkClass {
    fn slot(self) -> usize {
        match self {
            ChunkClass::System => 0,
            ChunkClass::User => 1,
        }
    }
}

/// Capability that acquires and releases address space.
///
/// The default [`SystemPageMapper`] always succeeds; tests substitute a
/// [`BoundedPageMapper`] to provoke out-of-memory paths.
pub trait PageMapper: Send + Sync {
    /// Maps one chunk. Returns false when the system is out of memory.
    fn map_chunk(&self) -> bool;

    fn unmap_chunk(&self);

    /// Releases the physical pages of one arena. May fail.
    fn mark_pages_unused(&self) -> bool {
        true
    }

    fn mark_pages_in_use(&self) {}
}

/// Page mapper backed by the process allocator.
#[derive(Debug, Default)]
pub struct SystemPageMapper;

impl PageMapper for SystemPageMapper {
    fn map_chunk(&self) -> bool {
        true
    }

    fn unmap_chunk(&self) {}
}

/// Page mapper that refuses to map more than a fixed number of chunks.
#[derive(Debug)]
pub struct BoundedPageMapper {
    limit: usize,
    mapped: AtomicUsize,
}

impl BoundedPageMapper {
    pub fn new(limit: usize) -> Self {
        BoundedPageMapper {
            limit,
            mapped: AtomicUsize::new(0),
        }
    }

    /// Chunks currently mapped through this mapper.
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }
}

impl PageMapper for BoundedPageMapper {
    fn map_chunk(&self) -> bool {
        self.mapped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn unmap_chunk(&self) {
        self.mapped.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Allocator-lock state of one chunk.
#[derive(Debug)]
pub(crate) struct ChunkInfo {
    /// Committed free arenas; the last element is handed out first.
    free_arenas: Vec<u16>,
    decommitted: Vec<bool>,
    num_arenas_free: usize,
    last_decommitted_arena_offset: usize,
    age: u32,
    /// Set while the chunk is in use (in the chunk set).
    class: Option<ChunkClass>,
}

impl ChunkInfo {
    fn new() -> Self {
        ChunkInfo {
            free_arenas: (0..ARENAS_PER_CHUNK as u16).rev().collect(),
            decommitted: vec![false; ARENAS_PER_CHUNK],
            num_arenas_free: ARENAS_PER_CHUNK,
            last_decommitted_arena_offset: 0,
            age: 0,
            class: None,
        }
    }

    fn num_arenas_free_committed(&self) -> usize {
        self.free_arenas.len()
    }

    fn has_available_arenas(&self) -> bool {
        self.num_arenas_free > 0
    }

    fn unused(&self) -> bool {
        self.num_arenas_free == ARENAS_PER_CHUNK
    }

    /// Next decommitted arena, searching from just past the last one handed
    /// out so recently freed arenas are reused first.
    fn find_decommitted_arena_offset(&self) -> Option<usize> {
        let start = self.last_decommitted_arena_offset.min(ARENAS_PER_CHUNK);
        (start..ARENAS_PER_CHUNK)
            .chain(0..start)
            .find(|&i| self.decommitted[i])
    }
}

/// Byte accounting for one domain, kept under the allocator lock so the
/// helper thread can release arenas without touching the domain itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainBytes {
    pub gc_bytes: usize,
    pub trigger_bytes: usize,
    pub heap_growth_factor: f64,
}

/// Result of a successful [`ChunkPool::allocate_arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArenaGrant {
    pub(crate) addr: ArenaAddr,
    /// Chunk that had to be mapped to satisfy the request
    pub(crate) mapped: Option<ChunkId>,
    /// The domain crossed its trigger with this arena
    pub(crate) trigger: bool,
    /// A chunk left the pool and background allocation would help
    pub(crate) want_background_allocation: bool,
}

/// All state protected by the allocator lock.
#[derive(Debug)]
pub struct ChunkPool {
    chunks: Vec<Option<ChunkInfo>>,
    /// Empty chunks; the last element is the most recently added
    empty: Vec<ChunkId>,
    available: [Vec<ChunkId>; 2],
    chunk_set_count: usize,
    num_arenas_free_committed: usize,
    gc_bytes: usize,
    max_bytes: usize,
    allocation_threshold: usize,
    max_empty_chunk_age: u32,
    chunk_allocation_since_last_gc: bool,
    domains: BTreeMap<DomainId, DomainBytes>,
    chunks_mapped: u64,
    chunks_unmapped: u64,
    arenas_decommitted: u64,
}

impl ChunkPool {
    pub fn new(max_bytes: usize, allocation_threshold: usize, max_empty_chunk_age: u32) -> Self {
        ChunkPool {
            chunks: Vec::new(),
            empty: Vec::new(),
            available: [Vec::new(), Vec::new()],
            chunk_set_count: 0,
            num_arenas_free_committed: 0,
            gc_bytes: 0,
            max_bytes,
            allocation_threshold,
            max_empty_chunk_age,
            chunk_allocation_since_last_gc: false,
            domains: BTreeMap::new(),
            chunks_mapped: 0,
            chunks_unmapped: 0,
            arenas_decommitted: 0,
        }
    }

    fn info(&self, id: ChunkId) -> Option<&ChunkInfo> {
        self.chunks.get(id.index()).and_then(Option::as_ref)
    }

    fn info_mut(&mut self, id: ChunkId) -> Option<&mut ChunkInfo> {
        self.chunks.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn register_domain(&mut self, domain: DomainId, trigger_bytes: usize, heap_growth_factor: f64) {
        self.domains.insert(
            domain,
            DomainBytes {
                gc_bytes: 0,
                trigger_bytes,
                heap_growth_factor,
            },
        );
    }

    pub fn remove_domain(&mut self, domain: DomainId) {
        self.domains.remove(&domain);
    }

    pub fn domain_bytes(&self, domain: DomainId) -> Option<DomainBytes> {
        self.domains.get(&domain).copied()
    }

    pub fn set_domain_trigger(&mut self, domain: DomainId, trigger_bytes: usize, heap_growth_factor: f64) {
        if let Some(bytes) = self.domains.get_mut(&domain) {
            bytes.trigger_bytes = trigger_bytes;
            bytes.heap_growth_factor = heap_growth_factor;
        }
    }

    /// Bytes held in allocated arenas across the heap.
    pub fn gc_bytes(&self) -> usize {
        self.gc_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Chunks currently holding at least one allocated arena.
    pub fn chunk_count(&self) -> usize {
        self.chunk_set_count
    }

    pub fn empty_chunk_count(&self) -> usize {
        self.empty.len()
    }

    pub fn num_arenas_free_committed(&self) -> usize {
        self.num_arenas_free_committed
    }

    pub fn chunks_mapped(&self) -> u64 {
        self.chunks_mapped
    }

    pub fn chunks_unmapped(&self) -> u64 {
        self.chunks_unmapped
    }

    pub fn arenas_decommitted(&self) -> u64 {
        self.arenas_decommitted
    }

    pub fn chunk_allocation_since_last_gc(&self) -> bool {
        self.chunk_allocation_since_last_gc
    }

    pub fn clear_chunk_allocation_since_last_gc(&mut self) {
        self.chunk_allocation_since_last_gc = false;
    }

    /// Free arenas (committed or not) of a chunk.
    pub fn free_arena_count(&self, chunk: ChunkId) -> Option<usize> {
        self.info(chunk).map(|info| info.num_arenas_free)
    }

    /// Arenas of a chunk currently handed out.
    pub fn allocated_arena_count(&self, chunk: ChunkId) -> Option<usize> {
        self.info(chunk)
            .map(|info| ARENAS_PER_CHUNK - info.num_arenas_free)
    }

    /// Index of the decommitted arena the next allocation in `chunk` would reuse.
    pub fn find_decommitted_arena_offset(&self, chunk: ChunkId) -> Option<usize> {
        self.info(chunk)?.find_decommitted_arena_offset()
    }

    /// Whether mapping chunks on the helper thread ahead of demand is worthwhile.
    pub fn want_background_allocation(&self, helper_can_allocate: bool) -> bool {
        helper_can_allocate && self.empty.is_empty() && self.chunk_set_count >= 4
    }

    fn map_new_chunk(&mut self, mapper: &dyn PageMapper) -> Option<ChunkId> {
        if !mapper.map_chunk() {
            debug!("chunk mapping failed");
            return None;
        }
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(Some(ChunkInfo::new()));
        self.num_arenas_free_committed += ARENAS_PER_CHUNK;
        self.chunks_mapped += 1;
        trace!("mapped chunk {}", id.0);
        Some(id)
    }

    /// Maps a chunk straight into the empty pool (background allocation).
    pub(crate) fn put_new_chunk(&mut self, mapper: &dyn PageMapper) -> Option<ChunkId> {
        let id = self.map_new_chunk(mapper)?;
        self.put(id);
        Some(id)
    }

    fn put(&mut self, id: ChunkId) {
        if let Some(info) = self.info_mut(id) {
            info.age = 0;
        }
        self.empty.push(id);
    }

    /// Takes a chunk from the empty pool, mapping one if the pool is empty.
    fn get(&mut self, mapper: &dyn PageMapper) -> Option<(ChunkId, bool)> {
        match self.empty.pop() {
            Some(id) => Some((id, false)),
            None => self.map_new_chunk(mapper).map(|id| (id, true)),
        }
    }

    fn add_to_available(&mut self, id: ChunkId, class: ChunkClass, position: usize) {
        let list = &mut self.available[class.slot()];
        debug_assert!(!list.contains(&id));
        let position = position.min(list.len());
        list.insert(position, id);
    }

    fn remove_from_available(&mut self, id: ChunkId, class: ChunkClass) -> Option<usize> {
        let list = &mut self.available[class.slot()];
        let position = list.iter().position(|c| *c == id)?;
        list.remove(position);
        Some(position)
    }

    /// Hands out a fresh arena for `domain`.
    ///
    /// # Arguments
    ///
    /// * `domain` - Domain the arena will belong to
    /// * `class` - Available list to draw chunks from
    /// * `mapper` - Used when no chunk with free arenas exists
    ///
    /// # Returns
    ///
    /// `None` when the heap-wide byte limit would be exceeded or no chunk
    /// could be mapped.
    pub(crate) fn allocate_arena(
        &mut self,
        domain: DomainId,
        class: ChunkClass,
        mapper: &dyn PageMapper,
    ) -> Option<ArenaGrant> {
        if self.max_bytes.saturating_sub(self.gc_bytes) < ARENA_SIZE {
            return None;
        }

        let mut mapped = None;
        let mut want_background_allocation = false;
        let id = match self.available[class.slot()].first().copied() {
            Some(id) => id,
            None => {
                let (id, fresh) = self.get(mapper)?;
                if fresh {
                    mapped = Some(id);
                }
                want_background_allocation = self.empty.is_empty();
                self.chunk_allocation_since_last_gc = true;
                self.chunk_set_count += 1;
                if let Some(info) = self.info_mut(id) {
                    info.class = Some(class);
                }
                self.add_to_available(id, class, 0);
                id
            }
        };

        let info = self.info_mut(id)?;
        debug_assert!(info.has_available_arenas());
        let (index, committed) = match info.free_arenas.pop() {
            Some(index) => (index as usize, true),
            None => {
                let offset = info.find_decommitted_arena_offset()?;
                info.last_decommitted_arena_offset = offset + 1;
                info.decommitted[offset] = false;
                (offset, false)
            }
        };
        info.num_arenas_free -= 1;
        let exhausted = !info.has_available_arenas();
        if committed {
            self.num_arenas_free_committed -= 1;
        } else {
            mapper.mark_pages_in_use();
        }
        if exhausted {
            self.remove_from_available(id, class);
        }

        self.gc_bytes += ARENA_SIZE;
        let trigger = match self.domains.get_mut(&domain) {
            Some(bytes) => {
                bytes.gc_bytes += ARENA_SIZE;
                bytes.gc_bytes >= bytes.trigger_bytes
            }
            None => false,
        };

        Some(ArenaGrant {
            addr: ArenaAddr::new(id, index),
            mapped,
            trigger,
            want_background_allocation: want_background_allocation
                && self.chunk_set_count >= 4,
        })
    }

    /// Returns an empty arena to its chunk. A chunk left without allocated
    /// arenas moves to the empty pool.
    pub(crate) fn release_arena(&mut self, addr: ArenaAddr, domain: DomainId, helper_sweeping: bool) {
        let allocation_threshold = self.allocation_threshold;
        if let Some(bytes) = self.domains.get_mut(&domain) {
            if helper_sweeping {
                let amount = (bytes.heap_growth_factor * ARENA_SIZE as f64) as usize;
                let floor = (allocation_threshold as f64 * bytes.heap_growth_factor) as usize;
                if bytes.trigger_bytes.saturating_sub(amount) >= floor {
                    bytes.trigger_bytes -= amount;
                }
            }
            bytes.gc_bytes = bytes.gc_bytes.saturating_sub(ARENA_SIZE);
        }
        self.gc_bytes = self.gc_bytes.saturating_sub(ARENA_SIZE);

        let Some(info) = self.info_mut(addr.chunk) else {
            debug_assert!(false, "released arena of unknown chunk");
            return;
        };
        debug_assert!(!info.free_arenas.contains(&addr.index));
        info.free_arenas.push(addr.index);
        info.num_arenas_free += 1;
        let num_free = info.num_arenas_free;
        let unused = info.unused();
        let class = info.class;
        self.num_arenas_free_committed += 1;

        let Some(class) = class else { return };
        if unused {
            self.remove_from_available(addr.chunk, class);
            if let Some(info) = self.info_mut(addr.chunk) {
                info.class = None;
            }
            self.chunk_set_count -= 1;
            self.put(addr.chunk);
        } else if num_free == 1 {
            self.add_to_available(addr.chunk, class, 0);
        }
    }

    /// Ages the empty pool and removes chunks that reached the maximum age
    /// (or all of them). The caller unmaps the returned chunks outside the lock.
    pub(crate) fn expire(&mut self, release_all: bool) -> Vec<ChunkId> {
        let max_age = self.max_empty_chunk_age;
        let mut freed = Vec::new();
        let mut kept = Vec::with_capacity(self.empty.len());
        for id in std::mem::take(&mut self.empty) {
            let Some(info) = self.chunks.get_mut(id.index()).and_then(Option::as_mut) else {
                continue;
            };
            debug_assert!(info.unused());
            if release_all || info.age >= max_age {
                self.num_arenas_free_committed -= info.num_arenas_free_committed();
                self.chunks[id.index()] = None;
                self.chunks_unmapped += 1;
                freed.push(id);
            } else {
                info.age += 1;
                kept.push(id);
            }
        }
        self.empty = kept;
        if !freed.is_empty() {
            debug!("expiring {} empty chunks", freed.len());
        }
        freed
    }

    /// Releases every chunk, in use or pooled. Used at shutdown.
    pub(crate) fn release_all(&mut self) -> Vec<ChunkId> {
        let ids: Vec<ChunkId> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_some())
            .map(|(i, _)| ChunkId(i as u32))
            .collect();
        self.chunks_unmapped += ids.len() as u64;
        self.chunks.iter_mut().for_each(|info| *info = None);
        self.empty.clear();
        self.available = [Vec::new(), Vec::new()];
        self.chunk_set_count = 0;
        self.num_arenas_free_committed = 0;
        self.gc_bytes = 0;
        for bytes in self.domains.values_mut() {
            bytes.gc_bytes = 0;
        }
        ids
    }

    /// Available chunks of one class, head first.
    pub(crate) fn available_chunks(&self, class: ChunkClass) -> Vec<ChunkId> {
        self.available[class.slot()].clone()
    }

    /// Takes a committed free arena out of circulation so it can be
    /// decommitted without the lock held.
    pub(crate) fn begin_decommit(&mut self, chunk: ChunkId) -> Option<DecommitTicket> {
        let info = self.info_mut(chunk)?;
        let class = info.class?;
        let index = info.free_arenas.pop()?;
        info.num_arenas_free -= 1;
        let exhausted = !info.has_available_arenas();
        self.num_arenas_free_committed -= 1;
        let position = if exhausted {
            self.remove_from_available(chunk, class)
        } else {
            None
        };
        Some(DecommitTicket {
            addr: ArenaAddr::new(chunk, index as usize),
            class,
            position,
        })
    }

    /// Completes a decommit started by [`begin_decommit`](Self::begin_decommit).
    pub(crate) fn finish_decommit(&mut self, ticket: DecommitTicket, decommitted: bool) {
        let Some(info) = self.info_mut(ticket.addr.chunk) else {
            return;
        };
        let index = ticket.addr.index as usize;
        info.num_arenas_free += 1;
        if decommitted {
            info.decommitted[index] = true;
        } else {
            info.free_arenas.push(ticket.addr.index);
        }
        let num_free = info.num_arenas_free;
        if decommitted {
            self.arenas_decommitted += 1;
        } else {
            self.num_arenas_free_committed += 1;
        }
        if num_free == 1 {
            let position = ticket.position.unwrap_or(0);
            self.add_to_available(ticket.addr.chunk, ticket.class, position);
        }
    }
}

/// An arena removed from its chunk's free list while it is decommitted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecommitTicket {
    pub(crate) addr: ArenaAddr,
    class: ChunkClass,
    position: Option<usize>,
}
