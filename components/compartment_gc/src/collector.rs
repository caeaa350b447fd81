//! The collector context.
//!
//! [`CollectorContext`] owns everything one collector instance needs: the
//! shared heap, the domains, the root table, the marker and the helper
//! thread. Nothing is global, so independent collectors can coexist in one
//! process.
//!
//! This module holds the mutator-facing surface: domain and root management,
//! allocation, triggers and diagnostics. The incremental state machine lives
//! in `incremental.rs`.

use crate::arena_list::{ArenaLists, BackgroundFinalizeState, FreeList};
use crate::budget::Budget;
use crate::chunk::{ChunkClass, ChunkPool, MarkColor, PageMapper, SystemPageMapper};
use crate::config::{GcConfig, GcMode};
use crate::domain::{CrossDomainKey, Domain, DomainGcState, DomainId, DomainMap, IncomingEdge, WeakEntry, WrapperKind};
use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::helper_thread::{HelperState, HelperThread};
use crate::heuristics::{maybe_gc_factor, MARK_SLICE_MULTIPLIER, MAYBE_GC_MIN_BYTES};
use crate::incremental::SweepCursor;
use crate::kind::{AllocKind, TraceKind};
use crate::marker::Marker;
use crate::roots::{RootProvider, RootTable};
use crate::stats::{GcEvent, GcInvocationKind, GcReason, GcStats};
use crate::sweep::{SweepJob, SweepView};
use crate::trace::{ArenaAddr, ThingRef, Trace};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Heap size a new domain's first trigger is computed from.
const NEW_DOMAIN_BYTES: usize = 8192;

/// Share of the runtime malloc limit each domain may use before it asks for
/// a collection.
const DOMAIN_MALLOC_SHARE: f64 = 0.9;

/// Collector-wide incremental state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncrementalState {
    NoIncremental,
    MarkRoots,
    Mark,
    Sweep,
}

/// One independent collector and its heap.
///
/// `T` is the payload stored in every thing. The heap is shared with the
/// helper thread, which finalizes background kinds, so payloads must be
/// `Send`.
pub struct CollectorContext<T: Trace + Send + 'static> {
    pub(crate) config: GcConfig,
    pub(crate) heap: Arc<Heap<T>>,
    pub(crate) domains: DomainMap,
    next_domain_id: u32,
    pub(crate) roots: RootTable,
    pub(crate) root_provider: Option<Box<dyn RootProvider>>,
    pub(crate) marker: Marker,
    pub(crate) helper: Option<HelperThread>,
    observer: Option<Box<dyn FnMut(&GcEvent)>>,
    pub(crate) stats: GcStats,
    pub(crate) state: IncrementalState,
    pub(crate) is_incremental: bool,
    pub(crate) is_full: bool,
    pub(crate) keep_atoms: bool,
    pub(crate) incremental_allowed: bool,
    pub(crate) last_mark_slice: bool,
    pub(crate) sweep_on_background: bool,
    pub(crate) sweep: SweepCursor,
    /// Background kinds queued by the groups swept so far
    pub(crate) background_jobs: Vec<SweepJob>,
    pub(crate) arenas_allocated_during_sweep: Vec<ArenaAddr>,
    pub(crate) is_needed: bool,
    pub(crate) trigger_reason: Option<GcReason>,
    /// A root was removed since the last collection started
    pub(crate) poke: bool,
    pub(crate) malloc_bytes: usize,
    pub(crate) high_frequency: bool,
    pub(crate) last_gc_time: Option<Instant>,
    pub(crate) next_full_gc_time: Option<Instant>,
    finished: bool,
}

impl<T: Trace + Send + 'static> CollectorContext<T> {
    /// Creates a collector backed by the system page mapper.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::HelperThread`] if the configuration asks for a
    /// helper thread and it cannot be spawned.
    pub fn new(config: GcConfig) -> GcResult<Self> {
        Self::with_mapper(config, Arc::new(SystemPageMapper))
    }

    /// Creates a collector that maps chunks through `mapper`.
    pub fn with_mapper(config: GcConfig, mapper: Arc<dyn PageMapper>) -> GcResult<Self> {
        let pool = ChunkPool::new(config.max_bytes, config.allocation_threshold, config.max_empty_chunk_age);
        let heap = Arc::new(Heap::new(pool, mapper));
        let helper = if config.use_helper_thread {
            Some(HelperThread::spawn(Arc::clone(&heap))?)
        } else {
            None
        };

        let mut context = CollectorContext {
            marker: Marker::new(&config),
            incremental_allowed: config.incremental_enabled,
            config,
            heap,
            domains: DomainMap::new(),
            next_domain_id: 1,
            roots: RootTable::default(),
            root_provider: None,
            helper,
            observer: None,
            stats: GcStats::default(),
            state: IncrementalState::NoIncremental,
            is_incremental: false,
            is_full: false,
            keep_atoms: false,
            last_mark_slice: false,
            sweep_on_background: false,
            sweep: SweepCursor::default(),
            background_jobs: Vec::new(),
            arenas_allocated_during_sweep: Vec::new(),
            is_needed: false,
            trigger_reason: None,
            poke: false,
            malloc_bytes: 0,
            high_frequency: false,
            last_gc_time: None,
            next_full_gc_time: None,
            finished: false,
        };
        context.insert_domain(DomainId::ATOMS, "atoms", true);
        info!(
            "collector created (mode {:?}, helper thread {})",
            context.config.mode,
            context.helper.is_some()
        );
        Ok(context)
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Switches the collection mode. A collection in progress is reset by
    /// its next slice if the new mode is not incremental.
    pub fn set_mode(&mut self, mode: GcMode) {
        self.config.mode = mode;
    }

    /// Installs the callback that receives [`GcEvent`]s.
    pub fn set_observer(&mut self, observer: impl FnMut(&GcEvent) + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub(crate) fn emit(&mut self, event: GcEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    pub fn set_root_provider(&mut self, provider: impl RootProvider + 'static) {
        self.root_provider = Some(Box::new(provider));
    }

    pub fn clear_root_provider(&mut self) {
        self.root_provider = None;
    }

    // Domains

    fn insert_domain(&mut self, id: DomainId, name: &str, is_system: bool) {
        let malloc_trigger = (self.config.max_malloc_bytes as f64 * DOMAIN_MALLOC_SHARE) as usize;
        self.domains.insert(id, Domain::new(id, name, is_system, malloc_trigger));
        self.heap.pool().register_domain(id, self.config.max_bytes, 1.0);
        self.set_gc_last_bytes(id, NEW_DOMAIN_BYTES, GcInvocationKind::Normal, Instant::now());
        debug!("created domain {} ({})", id, name);
    }

    /// Creates a domain. System domains allocate from the system chunk list.
    pub fn new_domain(&mut self, name: &str, is_system: bool) -> DomainId {
        let id = DomainId::new(self.next_domain_id);
        self.next_domain_id += 1;
        self.insert_domain(id, name, is_system);
        id
    }

    /// Drops the embedder's hold on a domain. The domain is destroyed by the
    /// first collection that finds it with no arenas left.
    pub fn release_domain(&mut self, domain: DomainId) -> GcResult<()> {
        if domain.is_atoms() {
            return Err(GcError::AtomsDomain);
        }
        self.domain_mut(domain)?.hold = false;
        if self.state == IncrementalState::NoIncremental {
            self.trigger_domain_gc(domain, GcReason::DestroyDomain)?;
        }
        Ok(())
    }

    pub fn domain(&self, domain: DomainId) -> Option<&Domain> {
        self.domains.get(&domain)
    }

    pub fn domain_ids(&self) -> Vec<DomainId> {
        self.domains.keys().copied().collect()
    }

    pub(crate) fn domain_mut(&mut self, domain: DomainId) -> GcResult<&mut Domain> {
        self.domains.get_mut(&domain).ok_or(GcError::UnknownDomain(domain))
    }

    fn owner_domain(&self, thing: ThingRef) -> GcResult<DomainId> {
        if !self.heap.contains(thing) {
            return Err(GcError::InvalidThing(thing));
        }
        self.heap
            .owner(thing)
            .map(|(domain, _)| domain)
            .ok_or(GcError::InvalidThing(thing))
    }

    // Allocation

    /// Allocates a thing of `kind` in `domain` holding `value`.
    ///
    /// Tries the domain's free list, then its arena list, then a fresh arena.
    /// When the heap is exhausted a last-ditch collection of the domain runs
    /// before the allocation is retried.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] when even the last-ditch collection did not
    /// free enough memory, [`GcError::UnknownDomain`] for a destroyed domain.
    pub fn allocate(&mut self, domain: DomainId, kind: AllocKind, value: T) -> GcResult<ThingRef> {
        let thing = match self.allocate_from_free_list(domain, kind)? {
            Some(thing) => thing,
            None => self.refill_free_list(domain, kind)?,
        };
        self.heap.store(thing, value).ok_or(GcError::InvalidThing(thing))
    }

    /// Takes the next slot of the current free list. The first allocation
    /// from it after a marking slice queues its arena for delayed marking.
    fn allocate_from_free_list(&mut self, id: DomainId, kind: AllocKind) -> GcResult<Option<ThingRef>> {
        let heap: &Heap<T> = &self.heap;
        let domain = self.domains.get_mut(&id).ok_or(GcError::UnknownDomain(id))?;
        let Some(thing) = domain.arenas.allocate_from_free_list(kind) else {
            return Ok(None);
        };
        if domain.needs_barrier() {
            if let Some(addr) = domain.arenas.claim_free_list_delay(kind) {
                heap.with_header(addr, |header| header.allocated_during_incremental = true);
                self.marker.delay_marking_arena(heap, addr);
            }
        }
        Ok(Some(thing))
    }

    fn refill_free_list(&mut self, domain: DomainId, kind: AllocKind) -> GcResult<ThingRef> {
        let mut run_gc = self.state != IncrementalState::NoIncremental && self.is_over_trigger(domain);
        loop {
            if run_gc {
                if let Some(thing) = self.run_last_ditch_gc(domain, kind)? {
                    return Ok(thing);
                }
            }

            // A background sweep may still be returning arenas; wait once and retry.
            for second_attempt in [false, true] {
                if let Some(thing) = self.allocate_from_arena(domain, kind)? {
                    return Ok(thing);
                }
                if !second_attempt {
                    self.wait_background_sweep_end();
                }
            }

            if run_gc {
                break;
            }
            run_gc = true;
        }

        warn!("out of memory allocating {:?} in domain {}", kind, domain);
        Err(GcError::OutOfMemory { domain, kind })
    }

    fn is_over_trigger(&self, domain: DomainId) -> bool {
        self.heap
            .pool()
            .domain_bytes(domain)
            .is_some_and(|bytes| bytes.gc_bytes > bytes.trigger_bytes)
    }

    fn run_last_ditch_gc(&mut self, domain: DomainId, kind: AllocKind) -> GcResult<Option<ThingRef>> {
        debug!("last-ditch GC for {:?} in domain {}", kind, domain);
        self.stats.last_ditch_gcs += 1;
        if domain.is_atoms() {
            self.prepare_for_full_gc();
        } else {
            self.prepare_domain_for_gc(domain)?;
        }

        // Atoms survive a last-ditch GC.
        let keep_atoms = std::mem::replace(&mut self.keep_atoms, true);
        self.gc(GcInvocationKind::Normal, GcReason::LastDitch);
        self.keep_atoms = keep_atoms;

        self.allocate_from_free_list(domain, kind)
    }

    /// Moves the next arena with free things (or a new arena) into the free
    /// list of `kind` and allocates from it.
    fn allocate_from_arena(&mut self, id: DomainId, kind: AllocKind) -> GcResult<Option<ThingRef>> {
        self.absorb_background_results();

        let heap: &Heap<T> = &self.heap;
        let domain = self.domains.get_mut(&id).ok_or(GcError::UnknownDomain(id))?;
        let class = if domain.is_system() {
            ChunkClass::System
        } else {
            ChunkClass::User
        };

        // While the helper owns the kind's arenas only fresh arenas may be used.
        let mut fresh_only = false;
        match domain.arenas.background_state(kind) {
            BackgroundFinalizeState::Running => fresh_only = true,
            BackgroundFinalizeState::JustFinished => domain.arenas.acknowledge_background(kind),
            BackgroundFinalizeState::Done => {}
        }

        let reused = if fresh_only {
            None
        } else {
            domain.arenas.list_mut(kind).next_with_free()
        };
        let (addr, grant) = match reused {
            Some(addr) => (addr, None),
            None => {
                let Some(grant) = heap.allocate_arena(id, kind, class) else {
                    return Ok(None);
                };
                domain.arenas.list_mut(kind).push_new(grant.addr);
                (grant.addr, Some(grant))
            }
        };
        let spans = heap.with_header(addr, |header| header.take_free_spans()).unwrap_or_default();

        let state = domain.state();
        if state.is_collecting() {
            if domain.needs_barrier() {
                heap.with_header(addr, |header| header.allocated_during_incremental = true);
                self.marker.delay_marking_arena(heap, addr);
            } else if state.is_sweeping() {
                heap.with_header(addr, |header| header.allocated_during_sweep = true);
                self.arenas_allocated_during_sweep.push(addr);
            }
        }

        let mut free_list = FreeList::new(addr, spans, domain.needs_barrier());
        let thing = free_list.allocate();
        domain.arenas.set_free_list(kind, free_list);

        if let Some(grant) = grant {
            if grant.mapped.is_some() {
                debug!("mapped a chunk for domain {}", id);
            }
            if grant.want_background_allocation {
                if let Some(helper) = &self.helper {
                    helper.start_background_allocation_if_idle();
                }
            }
            if grant.trigger {
                self.trigger_domain_gc(id, GcReason::AllocTrigger)?;
            }
        }
        Ok(thing)
    }

    // Things

    /// Runs `f` on the payload of `thing`.
    pub fn with_thing<R>(&self, thing: ThingRef, f: impl FnOnce(&T) -> R) -> GcResult<R> {
        self.heap.with_thing(thing, f).ok_or(GcError::InvalidThing(thing))
    }

    /// Runs `f` on the payload of `thing` mutably.
    ///
    /// Overwriting a reference while a collection is marking requires a
    /// call to [`write_barrier`](Self::write_barrier) with the old target.
    pub fn with_thing_mut<R>(&self, thing: ThingRef, f: impl FnOnce(&mut T) -> R) -> GcResult<R> {
        self.heap.with_thing_mut(thing, f).ok_or(GcError::InvalidThing(thing))
    }

    /// Pre-write barrier: `old` is about to be overwritten in some thing.
    ///
    /// While `old`'s domain is marking it is marked black, so everything
    /// reachable when the collection started survives it. Otherwise a no-op.
    pub fn write_barrier(&mut self, old: ThingRef) {
        let Some((domain, _)) = self.heap.owner(old) else {
            return;
        };
        if !self.domains.get(&domain).is_some_and(Domain::needs_barrier) {
            return;
        }
        let heap: &Heap<T> = &self.heap;
        self.marker.mark_and_push(heap, old, MarkColor::Black);
    }

    // Roots

    /// Registers `thing` as a named root.
    pub fn add_root(&mut self, thing: ThingRef, name: &str) -> GcResult<()> {
        self.owner_domain(thing)?;
        self.roots.add_root(thing, name);
        self.write_barrier(thing);
        Ok(())
    }

    /// Unregisters a root. Returns whether it was registered.
    pub fn remove_root(&mut self, thing: ThingRef) -> bool {
        let removed = self.roots.remove_root(thing);
        if removed {
            self.poke = true;
        }
        removed
    }

    pub fn root_name(&self, thing: ThingRef) -> Option<&str> {
        self.roots.root_name(thing)
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Locks `thing`, keeping it alive until unlocked as often as locked.
    /// Returns the new lock count.
    pub fn lock_thing(&mut self, thing: ThingRef) -> GcResult<usize> {
        self.owner_domain(thing)?;
        let count = self.roots.lock(thing);
        self.write_barrier(thing);
        Ok(count)
    }

    /// Drops one lock. Returns the remaining count.
    pub fn unlock_thing(&mut self, thing: ThingRef) -> GcResult<usize> {
        let remaining = self.roots.unlock(thing).ok_or(GcError::InvalidThing(thing))?;
        self.poke = true;
        Ok(remaining)
    }

    pub fn is_locked(&self, thing: ThingRef) -> bool {
        self.roots.is_locked(thing)
    }

    // Cross-domain state

    /// Records `wrapper` as the wrapper of `target` in the wrapper's domain.
    ///
    /// The wrapper's payload must report `target` when traced.
    pub fn add_wrapper(&mut self, wrapper: ThingRef, target: ThingRef, kind: WrapperKind) -> GcResult<()> {
        let source = self.owner_domain(wrapper)?;
        self.owner_domain(target)?;
        self.domain_mut(source)?
            .wrappers
            .insert(CrossDomainKey { kind, target }, wrapper);
        Ok(())
    }

    /// Removes the wrapper of `target` held by `domain`, returning it.
    pub fn remove_wrapper(
        &mut self,
        domain: DomainId,
        target: ThingRef,
        kind: WrapperKind,
    ) -> GcResult<Option<ThingRef>> {
        let removed = self.domain_mut(domain)?.wrappers.remove(&CrossDomainKey { kind, target });
        if let Some(wrapper) = removed {
            if let Some((target_domain, _)) = self.heap.owner(target) {
                if let Some(target_domain) = self.domains.get_mut(&target_domain) {
                    target_domain.unlink_incoming(wrapper);
                }
            }
        }
        Ok(removed)
    }

    pub fn wrapper_count(&self, domain: DomainId) -> GcResult<usize> {
        self.domains
            .get(&domain)
            .map(|domain| domain.wrappers.len())
            .ok_or(GcError::UnknownDomain(domain))
    }

    /// Gray edges recorded into `domain` that are still waiting for its
    /// group to finish marking.
    pub fn incoming_edges(&self, domain: DomainId) -> GcResult<&[IncomingEdge]> {
        self.domains
            .get(&domain)
            .map(|domain| domain.incoming.as_slice())
            .ok_or(GcError::UnknownDomain(domain))
    }

    /// Adds an ephemeron: `value` stays alive as long as `key` does. The
    /// key must live in `domain`.
    pub fn add_weak_entry(&mut self, domain: DomainId, key: ThingRef, value: ThingRef) -> GcResult<()> {
        if self.owner_domain(key)? != domain {
            return Err(GcError::DomainMismatch { thing: key, expected: domain });
        }
        self.owner_domain(value)?;
        self.domain_mut(domain)?.weak_entries.push(WeakEntry { key, value });
        Ok(())
    }

    pub fn weak_entry_count(&self, domain: DomainId) -> GcResult<usize> {
        self.domains
            .get(&domain)
            .map(|domain| domain.weak_entries.len())
            .ok_or(GcError::UnknownDomain(domain))
    }

    /// Installs a hook that runs each time `domain` starts sweeping.
    pub fn set_sweep_hook(&mut self, domain: DomainId, hook: impl FnMut(&dyn SweepView) + 'static) -> GcResult<()> {
        self.domain_mut(domain)?.sweep_hook = Some(Box::new(hook));
        Ok(())
    }

    // Scheduling

    pub fn prepare_domain_for_gc(&mut self, domain: DomainId) -> GcResult<()> {
        self.domain_mut(domain)?.scheduled = true;
        Ok(())
    }

    pub fn prepare_for_full_gc(&mut self) {
        for domain in self.domains.values_mut() {
            domain.scheduled = true;
        }
    }

    /// Schedules every domain unless some are already scheduled.
    pub(crate) fn prepare_for_debug_gc(&mut self) {
        if !self.domains.values().any(Domain::is_gc_scheduled) {
            self.prepare_for_full_gc();
        }
    }

    pub fn is_gc_scheduled(&self, domain: DomainId) -> GcResult<bool> {
        self.domains
            .get(&domain)
            .map(Domain::is_gc_scheduled)
            .ok_or(GcError::UnknownDomain(domain))
    }

    /// Runs a complete, non-incremental collection of the scheduled domains,
    /// or of every domain when none is scheduled.
    pub fn gc(&mut self, kind: GcInvocationKind, reason: GcReason) {
        self.prepare_for_debug_gc();
        self.collect(false, Budget::Unlimited, kind, reason);
    }

    /// Runs one incremental slice of at most `millis` milliseconds, or of
    /// the configured slice budget when `millis` is zero.
    ///
    /// A new collection only starts if some domain is scheduled.
    pub fn gc_slice(&mut self, kind: GcInvocationKind, reason: GcReason, millis: u64) {
        let budget = self.slice_budget(millis);
        self.collect(true, budget, kind, reason);
    }

    /// Finishes the current incremental collection in one slice.
    pub fn gc_final_slice(&mut self, kind: GcInvocationKind, reason: GcReason) {
        self.collect(true, Budget::Unlimited, kind, reason);
    }

    /// Runs one slice bounded by `work` units when `limit` is set, otherwise
    /// by the configured slice budget. Schedules every domain if none is.
    pub fn gc_debug_slice(&mut self, limit: bool, work: u64) {
        let budget = if limit { Budget::Work(work) } else { self.slice_budget(0) };
        self.prepare_for_debug_gc();
        self.collect(true, budget, GcInvocationKind::Normal, GcReason::Debug);
    }

    fn slice_budget(&self, millis: u64) -> Budget {
        if millis > 0 {
            return Budget::TimeMs(millis);
        }
        match self.config.slice_budget_ms {
            0 => Budget::Unlimited,
            ms if self.high_frequency && self.config.dynamic_mark_slice => {
                Budget::TimeMs(ms * MARK_SLICE_MULTIPLIER)
            }
            ms => Budget::TimeMs(ms),
        }
    }

    // Triggers

    /// Requests a full collection at the next [`maybe_gc`](Self::maybe_gc)
    /// or [`invoke_pending_gc`](Self::invoke_pending_gc).
    pub fn trigger_gc(&mut self, reason: GcReason) {
        self.prepare_for_full_gc();
        self.is_needed = true;
        self.trigger_reason = Some(reason);
        debug!("GC requested ({})", reason);
    }

    /// Requests a collection of `domain`. Triggers on the atoms domain
    /// request a full collection.
    pub fn trigger_domain_gc(&mut self, domain: DomainId, reason: GcReason) -> GcResult<()> {
        if domain.is_atoms() {
            self.trigger_gc(reason);
            return Ok(());
        }
        self.prepare_domain_for_gc(domain)?;
        if self.is_needed {
            return Ok(());
        }
        self.is_needed = true;
        self.trigger_reason = Some(reason);
        debug!("GC of domain {} requested ({})", domain, reason);
        Ok(())
    }

    pub fn is_gc_needed(&self) -> bool {
        self.is_needed
    }

    /// Runs a requested collection slice. Returns whether one ran.
    pub fn invoke_pending_gc(&mut self) -> bool {
        if !self.is_needed {
            return false;
        }
        let reason = self.trigger_reason.unwrap_or(GcReason::Api);
        self.gc_slice(GcInvocationKind::Normal, reason, 0);
        true
    }

    /// Decides whether `domain`'s allocation warrants a collection and runs
    /// a slice if so. Also starts an idle shrinking collection once the idle
    /// span has passed with chunks mapped or many free committed arenas.
    pub fn maybe_gc(&mut self, domain: DomainId) -> GcResult<()> {
        if self.is_needed {
            self.gc_slice(GcInvocationKind::Normal, GcReason::MaybeGc, 0);
            return Ok(());
        }

        let bytes = self
            .heap
            .pool()
            .domain_bytes(domain)
            .ok_or(GcError::UnknownDomain(domain))?;
        let factor = maybe_gc_factor(self.high_frequency);
        let helper_sweeping = self.helper.as_ref().is_some_and(HelperThread::is_sweeping);
        if bytes.gc_bytes > MAYBE_GC_MIN_BYTES
            && bytes.gc_bytes as f64 >= factor * bytes.trigger_bytes as f64
            && self.state == IncrementalState::NoIncremental
            && !helper_sweeping
        {
            self.prepare_domain_for_gc(domain)?;
            self.gc_slice(GcInvocationKind::Normal, GcReason::MaybeGc, 0);
            return Ok(());
        }

        let over_malloc = self
            .domains
            .get(&domain)
            .is_some_and(|domain| domain.malloc_bytes > domain.malloc_trigger_bytes);
        if over_malloc {
            self.prepare_domain_for_gc(domain)?;
            self.gc_slice(GcInvocationKind::Normal, GcReason::MaybeGc, 0);
            return Ok(());
        }

        let now = Instant::now();
        if self.next_full_gc_time.is_some_and(|next| next <= now) {
            let worth_shrinking = {
                let pool = self.heap.pool();
                pool.chunk_allocation_since_last_gc()
                    || pool.num_arenas_free_committed() > self.config.free_committed_arenas_threshold
            };
            if worth_shrinking {
                self.prepare_for_full_gc();
                self.gc_slice(GcInvocationKind::Shrink, GcReason::MaybeGc, 0);
            } else {
                self.next_full_gc_time = Some(now + self.idle_full_gc_span());
            }
        }
        Ok(())
    }

    pub(crate) fn idle_full_gc_span(&self) -> Duration {
        Duration::from_millis(self.config.idle_full_gc_span_ms)
    }

    /// Accounts `bytes` of malloc memory held by things of `domain`.
    pub fn report_malloc(&mut self, domain: DomainId, bytes: usize) -> GcResult<()> {
        let domain_over = {
            let domain = self.domain_mut(domain)?;
            domain.malloc_bytes = domain.malloc_bytes.saturating_add(bytes);
            domain.malloc_bytes >= domain.malloc_trigger_bytes
        };
        self.malloc_bytes = self.malloc_bytes.saturating_add(bytes);
        if domain_over {
            self.trigger_domain_gc(domain, GcReason::TooMuchMalloc)?;
        }
        if self.malloc_bytes >= self.config.max_malloc_bytes {
            self.trigger_gc(GcReason::TooMuchMalloc);
        }
        Ok(())
    }

    /// Permanently turns every later collection into a non-incremental one.
    pub fn disable_incremental_gc(&mut self) {
        self.incremental_allowed = false;
    }

    /// Abandons the current incremental collection: marking is discarded,
    /// sweeping is run to completion.
    pub fn reset_incremental_gc(&mut self, reason: &str) {
        self.reset_incremental(reason);
    }

    /// Releases empty chunks and decommits free arenas, on the helper thread
    /// when there is one.
    pub fn shrink_buffers(&mut self) {
        match &self.helper {
            Some(helper) => helper.start_background_shrink(),
            None => {
                self.heap.expire_chunks(true);
                self.heap.decommit_arenas(&|| false);
            }
        }
    }

    // Background results

    /// Merges swept lists the helper has returned so far.
    pub(crate) fn absorb_background_results(&mut self) {
        let results = match &self.helper {
            Some(helper) => helper.take_results(),
            None => return,
        };
        for swept in results {
            self.merge_swept(swept, true);
        }
    }

    pub(crate) fn wait_background_sweep_end(&mut self) {
        if let Some(helper) = &self.helper {
            helper.wait_background_sweep_end();
        }
        self.absorb_background_results();
    }

    pub(crate) fn wait_background_sweep_or_alloc_end(&mut self) {
        if let Some(helper) = &self.helper {
            helper.wait_background_sweep_or_alloc_end();
        }
        self.absorb_background_results();
    }

    // Diagnostics

    /// Live things of object kinds across every domain.
    pub fn object_count(&mut self) -> usize {
        self.wait_background_sweep_end();
        let heap: &Heap<T> = &self.heap;
        self.domains
            .values()
            .flat_map(|domain| domain.arenas.all_arenas())
            .filter(|addr| {
                heap.arena_owner(*addr)
                    .is_some_and(|(_, kind)| kind.trace_kind() == TraceKind::Object)
            })
            .map(|addr| heap.live_count(addr))
            .sum()
    }

    /// Live things of every kind in `domain`.
    pub fn live_thing_count(&mut self, domain: DomainId) -> GcResult<usize> {
        self.wait_background_sweep_end();
        let heap: &Heap<T> = &self.heap;
        let domain = self.domains.get(&domain).ok_or(GcError::UnknownDomain(domain))?;
        Ok(domain.arenas.all_arenas().into_iter().map(|addr| heap.live_count(addr)).sum())
    }

    pub fn incremental_state(&self) -> IncrementalState {
        self.state
    }

    pub fn is_incremental_gc_in_progress(&self) -> bool {
        self.state != IncrementalState::NoIncremental
    }

    pub fn domain_gc_state(&self, domain: DomainId) -> GcResult<DomainGcState> {
        self.domains
            .get(&domain)
            .map(Domain::state)
            .ok_or(GcError::UnknownDomain(domain))
    }

    pub fn chunk_count(&self) -> usize {
        self.heap.pool().chunk_count()
    }

    pub fn empty_chunk_count(&self) -> usize {
        self.heap.pool().empty_chunk_count()
    }

    pub fn free_committed_arena_count(&self) -> usize {
        self.heap.pool().num_arenas_free_committed()
    }

    /// Bytes in allocated arenas, heap-wide.
    pub fn gc_bytes(&self) -> usize {
        self.heap.pool().gc_bytes()
    }

    pub fn domain_gc_bytes(&self, domain: DomainId) -> GcResult<usize> {
        self.heap
            .pool()
            .domain_bytes(domain)
            .map(|bytes| bytes.gc_bytes)
            .ok_or(GcError::UnknownDomain(domain))
    }

    pub fn domain_trigger_bytes(&self, domain: DomainId) -> GcResult<usize> {
        self.heap
            .pool()
            .domain_bytes(domain)
            .map(|bytes| bytes.trigger_bytes)
            .ok_or(GcError::UnknownDomain(domain))
    }

    pub fn delayed_arena_count(&self) -> usize {
        self.marker.delayed_arena_count()
    }

    /// Arenas still flagged as allocated into during incremental marking.
    pub fn arenas_allocated_during_incremental(&self) -> usize {
        let heap: &Heap<T> = &self.heap;
        self.domains
            .values()
            .flat_map(|domain| domain.arenas.all_arenas())
            .filter(|addr| heap.with_header(*addr, |header| header.allocated_during_incremental) == Some(true))
            .count()
    }

    /// Whether `thing` carries a mark bit of either color.
    pub fn is_marked(&self, thing: ThingRef) -> bool {
        self.heap.is_marked(thing, MarkColor::Black)
    }

    pub fn is_gray(&self, thing: ThingRef) -> bool {
        self.heap.is_marked(thing, MarkColor::Gray)
    }

    /// Whether `thing` names a live thing.
    pub fn contains(&self, thing: ThingRef) -> bool {
        self.heap.contains(thing)
    }

    /// Counters, with the chunk figures read from the pool.
    pub fn stats(&self) -> GcStats {
        let mut stats = self.stats.clone();
        let pool = self.heap.pool();
        stats.chunks_mapped = pool.chunks_mapped();
        stats.chunks_unmapped = pool.chunks_unmapped();
        stats.arenas_decommitted = pool.arenas_decommitted();
        stats
    }

    pub fn helper_state(&self) -> Option<HelperState> {
        self.helper.as_ref().map(HelperThread::state)
    }

    // Shutdown

    /// Runs a final collection, stops the helper thread, finalizes every
    /// remaining thing and unmaps every chunk.
    pub fn finish_gc(mut self) -> GcStats {
        self.shut_down();
        self.stats()
    }

    fn shut_down(&mut self) {
        if self.finished {
            return;
        }
        self.prepare_for_full_gc();
        self.collect(false, Budget::Unlimited, GcInvocationKind::Normal, GcReason::Shutdown);
        self.wait_background_sweep_or_alloc_end();
        if let Some(mut helper) = self.helper.take() {
            helper.shutdown();
        }

        let finalized = self.heap.release_everything();
        self.stats.things_finalized += finalized as u64;
        for domain in self.domains.values_mut() {
            domain.arenas = ArenaLists::new();
        }
        self.finished = true;
        info!("collector shut down ({} things finalized at teardown)", finalized);
    }
}

impl<T: Trace + Send + 'static> Drop for CollectorContext<T> {
    fn drop(&mut self) {
        // A collector dropped while unwinding may be mid-transition.
        if !std::thread::panicking() {
            self.shut_down();
        }
    }
}
