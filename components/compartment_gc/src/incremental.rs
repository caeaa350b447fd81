//! The incremental collection state machine.
//!
//! A collection moves through `MarkRoots → Mark → Sweep → NoIncremental`,
//! one bounded slice at a time. Collected domains are split into sweep
//! groups; each group finishes its black and gray marking right before it
//! sweeps, while later groups keep marking with their barriers armed.
//!
//! Slices are entered through `collect`, which also decides whether the
//! requested slice may stay incremental or has to finish the collection.

use crate::budget::{Budget, SliceBudget};
use crate::chunk::MarkColor;
use crate::collector::{CollectorContext, IncrementalState};
use crate::config::GcMode;
use crate::domain::{Domain, DomainGcState, DomainId, DomainMap, EdgeColor, WeakEntry, WrapperKind};
use crate::group_finder::{merge_groups, DomainGraph};
use crate::heap::Heap;
use crate::heuristics::{growth_factor, trigger_bytes};
use crate::kind::{AllocKind, BACKGROUND_PHASES, EAGER_KINDS, FOREGROUND_PHASES};
use crate::marker::Marker;
use crate::stats::{GcEvent, GcInvocationKind, GcReason};
use crate::sweep::{
    finalize_arena_into, finalize_queued, is_about_to_be_finalized, sweep_job, HeapSweepView, SweepJob,
    SweepTotals, SweptArenas,
};
use crate::trace::{ThingRef, Trace, Tracer};
use log::{debug, info, trace, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Position of the foreground sweep, kept across slices.
#[derive(Debug, Default, Clone)]
pub(crate) struct SweepCursor {
    pub(crate) groups: Vec<Vec<DomainId>>,
    pub(crate) group: usize,
    pub(crate) phase: usize,
    pub(crate) domain: usize,
    pub(crate) kind: usize,
}

impl SweepCursor {
    fn current_group(&self) -> &[DomainId] {
        self.groups.get(self.group).map(Vec::as_slice).unwrap_or(&[])
    }

    fn rewind(&mut self) {
        self.phase = 0;
        self.domain = 0;
        self.kind = 0;
    }
}

/// Marks black roots reported by the embedder.
struct RootMarker<'a, T> {
    heap: &'a Heap<T>,
    marker: &'a mut Marker,
    domains: &'a mut DomainMap,
}

impl<T: Trace> Tracer for RootMarker<'_, T> {
    fn edge(&mut self, target: ThingRef) {
        self.marker.mark_root(self.heap, self.domains, target);
    }
}

/// Marks gray roots of the domains currently marking gray. Used when the
/// gray roots could not be buffered at the start of the collection.
struct GrayRootMarker<'a, T> {
    heap: &'a Heap<T>,
    marker: &'a mut Marker,
    domains: &'a DomainMap,
}

impl<T: Trace> Tracer for GrayRootMarker<'_, T> {
    fn edge(&mut self, target: ThingRef) {
        let marking_gray = self
            .heap
            .owner(target)
            .and_then(|(domain, _)| self.domains.get(&domain))
            .is_some_and(|domain| domain.state().is_marking_gray());
        if marking_gray {
            self.marker.mark_and_push(self.heap, target, MarkColor::Gray);
        }
    }
}

fn purge_free_lists<T: Trace>(heap: &Heap<T>, domain: &mut Domain) {
    for (addr, spans) in domain.arenas.purge() {
        heap.with_header(addr, |header| header.free_spans = spans);
    }
}

fn background_phase(kind: AllocKind) -> usize {
    BACKGROUND_PHASES
        .iter()
        .position(|phase| phase.contains(&kind))
        .unwrap_or(BACKGROUND_PHASES.len())
}

impl<T: Trace + Send + 'static> CollectorContext<T> {
    pub(crate) fn set_state(&mut self, next: IncrementalState) {
        if self.state == next {
            return;
        }
        let from = std::mem::replace(&mut self.state, next);
        trace!("incremental state {:?} -> {:?}", from, next);
        self.emit(GcEvent::StateChange { from, to: next });
    }

    /// Entry point of every collection and slice.
    pub(crate) fn collect(&mut self, incremental: bool, budget: Budget, kind: GcInvocationKind, reason: GcReason) {
        let in_progress = self.state != IncrementalState::NoIncremental;
        let global = self.config.mode == GcMode::Global;
        for domain in self.domains.values_mut() {
            // Domains already being collected stay in the collection.
            if global || (in_progress && domain.state().is_collecting()) {
                domain.scheduled = true;
            }
        }
        if !in_progress && !self.domains.values().any(Domain::is_gc_scheduled) {
            trace!("no domain scheduled; skipping {} collection", reason);
            return;
        }

        let clean_up = reason == GcReason::Shutdown || kind == GcInvocationKind::Shrink;
        loop {
            if self.state == IncrementalState::NoIncremental {
                self.emit(GcEvent::Begin);
            }
            self.poke = false;
            self.gc_cycle(incremental, budget, kind, reason);
            if self.state == IncrementalState::NoIncremental {
                self.emit(GcEvent::End);
            }

            // Roots removed during a cleanup collection may have freed more.
            if !(self.poke && clean_up) {
                break;
            }
            self.prepare_for_full_gc();
        }
    }

    fn gc_cycle(&mut self, incremental: bool, budget: Budget, kind: GcInvocationKind, reason: GcReason) {
        self.is_needed = false;
        self.trigger_reason = None;
        self.wait_background_sweep_or_alloc_end();

        if self.state == IncrementalState::NoIncremental {
            self.stats.nonincremental_reason = None;
        }

        let budget = if incremental {
            self.budget_incremental_gc(budget)
        } else {
            self.reset_incremental("requested");
            self.stats.nonincremental("requested");
            Budget::Unlimited
        };

        self.incremental_collect_slice(budget, reason, kind);
        self.end_session();
    }

    fn end_session(&mut self) {
        self.next_full_gc_time = Some(Instant::now() + self.idle_full_gc_span());
        self.heap.pool().clear_chunk_allocation_since_last_gc();
        self.malloc_bytes = 0;
        for domain in self.domains.values_mut() {
            domain.malloc_bytes = 0;
            domain.scheduled = false;
        }
    }

    /// Decides whether the slice may stay incremental. Returns the budget
    /// to use, resetting the collection when its domain set changed.
    fn budget_incremental_gc(&mut self, budget: Budget) -> Budget {
        let unsafe_reason = if self.keep_atoms {
            Some("keep atoms set")
        } else if !self.incremental_allowed || !self.config.incremental_enabled {
            Some("incremental permanently disabled")
        } else {
            None
        };
        if let Some(reason) = unsafe_reason {
            self.reset_incremental(reason);
            self.stats.nonincremental(reason);
            return Budget::Unlimited;
        }

        if self.config.mode != GcMode::Incremental {
            self.reset_incremental("GC mode change");
            self.stats.nonincremental("GC mode");
            return Budget::Unlimited;
        }

        let mut budget = budget;
        if self.malloc_bytes >= self.config.max_malloc_bytes {
            self.stats.nonincremental("malloc bytes trigger");
            budget = Budget::Unlimited;
        }

        let in_progress = self.state != IncrementalState::NoIncremental;
        let mut reset = false;
        {
            let pool = self.heap.pool();
            for domain in self.domains.values() {
                let over_trigger = pool
                    .domain_bytes(domain.id())
                    .is_some_and(|bytes| bytes.gc_bytes >= bytes.trigger_bytes);
                if over_trigger {
                    self.stats.nonincremental("allocation trigger");
                    budget = Budget::Unlimited;
                }
                if domain.malloc_bytes >= domain.malloc_trigger_bytes {
                    self.stats.nonincremental("malloc bytes trigger");
                    budget = Budget::Unlimited;
                }
                if in_progress && domain.is_gc_scheduled() != domain.state().is_collecting() {
                    reset = true;
                }
            }
        }

        if reset {
            self.reset_incremental("compartment change");
        }
        budget
    }

    /// Abandons an incremental collection. Marking is thrown away; a
    /// collection that is already sweeping is finished instead, since some
    /// of its groups may have been finalized.
    pub(crate) fn reset_incremental(&mut self, reason: &str) {
        match self.state {
            IncrementalState::NoIncremental => return,
            IncrementalState::MarkRoots | IncrementalState::Mark => {
                let heap = Arc::clone(&self.heap);
                self.marker.reset(&heap);
                for domain in self.domains.values_mut() {
                    domain.incoming.clear();
                    if domain.state().is_collecting() {
                        domain.needs_barrier = false;
                        domain.set_state(DomainGcState::NoGc);
                    }
                }
                self.set_state(IncrementalState::NoIncremental);
            }
            IncrementalState::Sweep => {
                for domain in self.domains.values_mut() {
                    domain.scheduled_for_destruction = false;
                }
                // The helper may be mapping chunks for the mutator; the
                // finishing slice hands it the background sweep.
                self.wait_background_sweep_or_alloc_end();
                // Later groups are still marking, so the marker is kept.
                self.incremental_collect_slice(Budget::Unlimited, GcReason::Reset, GcInvocationKind::Normal);
                self.wait_background_sweep_or_alloc_end();
            }
        }

        self.stats.reset(reason);
        info!("incremental GC reset: {}", reason);
        self.emit(GcEvent::Reset {
            reason: reason.to_string(),
        });
    }

    fn begin_slice(&mut self) {
        for domain in self.domains.values_mut() {
            if domain.state().is_marking() {
                domain.needs_barrier = false;
            }
        }
    }

    /// Arms the barriers of every domain that is still marking and makes
    /// sure things allocated from its current free lists get marked.
    fn end_slice(&mut self) {
        for domain in self.domains.values_mut() {
            if domain.state().is_marking() {
                domain.needs_barrier = true;
                domain.arenas.rearm_free_list_delays();
            } else {
                domain.needs_barrier = false;
            }
        }
    }

    fn incremental_collect_slice(&mut self, budget: Budget, reason: GcReason, kind: GcInvocationKind) {
        self.begin_slice();

        let initial = self.state;
        let mut slice_budget = SliceBudget::new(budget);
        self.is_incremental = self.state != IncrementalState::NoIncremental || budget != Budget::Unlimited;
        self.stats.slices += 1;
        let heap = Arc::clone(&self.heap);

        if self.state == IncrementalState::NoIncremental {
            self.set_state(IncrementalState::MarkRoots);
            self.last_mark_slice = false;
        }

        loop {
            match self.state {
                IncrementalState::MarkRoots => {
                    if !self.begin_mark_phase() {
                        self.set_state(IncrementalState::NoIncremental);
                        break;
                    }
                    self.set_state(IncrementalState::Mark);
                }
                IncrementalState::Mark => {
                    // Unbuffered gray roots are only valid within this slice.
                    if !self.marker.has_buffered_gray_roots() {
                        slice_budget.reset();
                    }
                    if !self.marker.drain(&heap, &mut self.domains, &mut slice_budget) {
                        break;
                    }

                    if !self.last_mark_slice
                        && initial == IncrementalState::Mark
                        && budget != Budget::Unlimited
                        && self.config.extra_mark_yield
                    {
                        self.last_mark_slice = true;
                        break;
                    }

                    self.set_state(IncrementalState::Sweep);
                    self.begin_sweep_phase(reason);
                    if slice_budget.is_over_budget() {
                        break;
                    }
                }
                IncrementalState::Sweep => {
                    if !self.sweep_phase(&mut slice_budget) {
                        break;
                    }
                    let jobs = self.end_sweep_phase(kind);
                    if self.sweep_on_background {
                        if let Some(helper) = &self.helper {
                            helper.start_background_sweep(jobs, kind == GcInvocationKind::Shrink);
                        }
                    }
                    self.set_state(IncrementalState::NoIncremental);
                    self.stats.collections += 1;
                    break;
                }
                IncrementalState::NoIncremental => break,
            }
        }

        self.end_slice();
    }

    /// Picks the domains to collect, clears their mark bits and marks the
    /// roots. Returns false when no domain is scheduled.
    fn begin_mark_phase(&mut self) -> bool {
        self.is_full = self.domains.values().all(Domain::is_gc_scheduled);

        let mut any = false;
        for domain in self.domains.values_mut() {
            domain.scheduled_for_destruction = false;
            domain.maybe_alive = false;
            if domain.is_gc_scheduled() && !domain.id().is_atoms() {
                domain.set_state(DomainGcState::Mark);
                any = true;
            }
        }
        if !any {
            return false;
        }

        // Atoms are only collected together with everything else.
        let collect_atoms = self.is_full && !self.keep_atoms;
        if let Some(atoms) = self.domains.get_mut(&DomainId::ATOMS) {
            if atoms.is_gc_scheduled() && collect_atoms {
                atoms.set_state(DomainGcState::Mark);
            }
        }

        self.marker.found_black_gray_edges = false;

        let heap = Arc::clone(&self.heap);
        let incremental = self.is_incremental;
        for domain in self.domains.values_mut() {
            if !domain.state().is_collecting() {
                continue;
            }
            if incremental {
                purge_free_lists(&heap, domain);
            }
            for addr in domain.arenas.all_arenas() {
                heap.unmark_arena(addr);
            }
        }

        for thing in self.roots.iter() {
            self.marker.mark_root(&heap, &mut self.domains, thing);
        }

        let wrapped: Vec<ThingRef> = self
            .domains
            .values()
            .filter(|domain| !domain.state().is_collecting())
            .flat_map(|domain| domain.wrappers.keys().map(|key| key.target))
            .collect();
        for target in wrapped {
            self.marker.mark_root(&heap, &mut self.domains, target);
        }

        if let Some(mut provider) = self.root_provider.take() {
            let mut tracer = RootMarker {
                heap: &heap,
                marker: &mut self.marker,
                domains: &mut self.domains,
            };
            provider.trace_roots(&mut tracer);
            if !self.marker.buffer_gray_roots(provider.as_mut()) {
                self.stats.gray_buffer_failures += 1;
            }
            self.root_provider = Some(provider);
        }

        let mut alive: Vec<DomainId> = Vec::new();
        for domain in self.domains.values() {
            if domain.state().is_collecting() {
                alive.extend(domain.wrappers.keys().filter_map(|key| heap.owner(key.target).map(|(id, _)| id)));
            }
            if domain.hold {
                alive.push(domain.id());
            }
        }
        alive.extend(
            self.marker
                .buffered_gray_roots()
                .iter()
                .filter_map(|thing| heap.owner(*thing).map(|(id, _)| id)),
        );
        for id in alive {
            if let Some(domain) = self.domains.get_mut(&id) {
                domain.maybe_alive = true;
            }
        }

        for domain in self.domains.values_mut() {
            if domain.state().is_collecting() && !domain.maybe_alive && !domain.id().is_atoms() {
                domain.scheduled_for_destruction = true;
                debug!("domain {} scheduled for destruction", domain.id());
            }
        }
        true
    }

    /// Computes the sweep groups and starts sweeping the first one.
    fn begin_sweep_phase(&mut self, reason: GcReason) {
        self.sweep_on_background = self.helper.is_some() && reason != GcReason::Shutdown;

        for domain in self.domains.values_mut() {
            domain.drop_string_wrappers();
        }

        let heap = Arc::clone(&self.heap);
        let atoms_marking = self
            .domains
            .get(&DomainId::ATOMS)
            .is_some_and(|atoms| atoms.state().is_marking());
        let marking: Vec<DomainId> = self
            .domains
            .values()
            .filter(|domain| domain.state().is_marking())
            .map(Domain::id)
            .collect();

        let mut graph = DomainGraph::new(marking.iter().copied());
        for id in &marking {
            let Some(domain) = self.domains.get(id) else {
                continue;
            };
            if atoms_marking {
                graph.add_edge(*id, DomainId::ATOMS);
            }
            for key in domain.wrappers.keys() {
                let Some((target_domain, _)) = heap.owner(key.target) else {
                    continue;
                };
                match key.kind {
                    WrapperKind::Object => {
                        let settled = heap.is_marked(key.target, MarkColor::Black)
                            && !heap.is_marked(key.target, MarkColor::Gray);
                        if !settled {
                            graph.add_edge(*id, target_domain);
                        }
                    }
                    WrapperKind::Debugger => {
                        graph.add_edge(*id, target_domain);
                        graph.add_edge(target_domain, *id);
                    }
                    WrapperKind::String => {}
                }
            }
        }

        let mut groups = graph.groups();
        if !self.is_incremental {
            groups = merge_groups(groups);
        }
        debug!("sweeping {} domains in {} groups", marking.len(), groups.len());

        self.sweep = SweepCursor {
            groups,
            ..SweepCursor::default()
        };
        self.background_jobs.clear();
        self.end_marking_group();
        self.begin_sweeping_group();
    }

    /// Finishes black and gray marking of the current group.
    fn end_marking_group(&mut self) {
        let heap = Arc::clone(&self.heap);
        let group = self.sweep.current_group().to_vec();

        self.mark_incoming(&heap, &group, MarkColor::Black);
        self.mark_weak_references(&heap, &group, MarkColor::Black);

        for id in &group {
            if let Some(domain) = self.domains.get_mut(id) {
                domain.set_state(DomainGcState::MarkGray);
            }
        }

        self.marker.set_color(MarkColor::Gray);
        self.mark_incoming(&heap, &group, MarkColor::Gray);
        for id in &group {
            if let Some(domain) = self.domains.get_mut(id) {
                domain.incoming.clear();
            }
        }
        self.marker.drain(&heap, &mut self.domains, &mut SliceBudget::unlimited());
        self.marker.set_color(MarkColor::Black);

        self.mark_gray_references(&heap, &group);

        for id in &group {
            if let Some(domain) = self.domains.get_mut(id) {
                domain.set_state(DomainGcState::Mark);
            }
        }
    }

    /// Resolves edges recorded into the group while their source domains
    /// were marking gray.
    fn mark_incoming(&mut self, heap: &Heap<T>, group: &[DomainId], color: MarkColor) {
        for id in group {
            let Some(domain) = self.domains.get_mut(id) else {
                continue;
            };
            for edge in domain.incoming.iter_mut() {
                let wrapper_marked = match color {
                    MarkColor::Black => {
                        heap.is_marked(edge.wrapper, MarkColor::Black) && !heap.is_marked(edge.wrapper, MarkColor::Gray)
                    }
                    MarkColor::Gray => heap.is_marked(edge.wrapper, MarkColor::Gray),
                };
                if !wrapper_marked {
                    continue;
                }
                self.marker.mark_and_push(heap, edge.target, color);
                match color {
                    MarkColor::Black => {
                        edge.color = EdgeColor::Black;
                        self.stats.incoming_black_edges += 1;
                    }
                    MarkColor::Gray => {
                        edge.color = EdgeColor::Gray;
                        self.stats.incoming_gray_edges += 1;
                    }
                }
            }
        }
    }

    /// Marks weak-entry values of the group until no more become live.
    fn mark_weak_references(&mut self, heap: &Heap<T>, group: &[DomainId], color: MarkColor) {
        let entries: Vec<WeakEntry> = group
            .iter()
            .filter_map(|id| self.domains.get(id))
            .flat_map(|domain| domain.weak_entries.iter().copied())
            .collect();

        loop {
            self.marker.drain(heap, &mut self.domains, &mut SliceBudget::unlimited());

            let mut marked_any = false;
            for entry in &entries {
                let state_of = |thing: ThingRef| {
                    heap.owner(thing)
                        .and_then(|(domain, _)| self.domains.get(&domain))
                        .map(Domain::state)
                };
                let key_live = match state_of(entry.key) {
                    None => false,
                    Some(state) if !state.is_collecting() => true,
                    Some(_) => match color {
                        MarkColor::Black => {
                            heap.is_marked(entry.key, MarkColor::Black) && !heap.is_marked(entry.key, MarkColor::Gray)
                        }
                        MarkColor::Gray => heap.is_marked(entry.key, MarkColor::Black),
                    },
                };
                let value_marking = state_of(entry.value).is_some_and(|state| match color {
                    MarkColor::Black => state.is_marking(),
                    MarkColor::Gray => state.is_marking_gray(),
                });
                if key_live && value_marking && self.marker.mark_and_push(heap, entry.value, color) {
                    marked_any = true;
                }
            }
            if !marked_any {
                break;
            }
        }
    }

    /// Marks gray roots of a group that is already in `MarkGray`.
    fn mark_gray_references(&mut self, heap: &Heap<T>, group: &[DomainId]) {
        self.marker.set_color(MarkColor::Gray);

        if self.marker.has_buffered_gray_roots() {
            self.marker.mark_buffered_gray_roots(heap, &self.domains);
        } else if let Some(mut provider) = self.root_provider.take() {
            let mut tracer = GrayRootMarker {
                heap,
                marker: &mut self.marker,
                domains: &self.domains,
            };
            provider.trace_gray_roots(&mut tracer);
            self.root_provider = Some(provider);
        }
        self.mark_weak_references(heap, group, MarkColor::Gray);

        self.marker.set_color(MarkColor::Black);
    }

    /// Moves the current group to sweeping: sweeps its cross-domain tables,
    /// runs sweep hooks, finalizes eager kinds and queues the rest.
    fn begin_sweeping_group(&mut self) {
        let heap = Arc::clone(&self.heap);
        let group = self.sweep.current_group().to_vec();

        for id in &group {
            if let Some(domain) = self.domains.get_mut(id) {
                domain.set_state(DomainGcState::Sweep);
                purge_free_lists(&heap, domain);
            }
        }
        self.emit(GcEvent::GroupStart);

        let sweeping: BTreeSet<DomainId> = group.iter().copied().collect();
        for id in &group {
            let Some(domain) = self.domains.get_mut(id) else {
                continue;
            };
            domain.wrappers.retain(|key, wrapper| {
                !is_about_to_be_finalized(&heap, &sweeping, key.target)
                    && !is_about_to_be_finalized(&heap, &sweeping, *wrapper)
            });
            domain.weak_entries.retain(|entry| {
                !is_about_to_be_finalized(&heap, &sweeping, entry.key)
                    && !is_about_to_be_finalized(&heap, &sweeping, entry.value)
            });
            if let Some(mut hook) = domain.sweep_hook.take() {
                hook(&HeapSweepView {
                    heap: &heap,
                    domain: *id,
                    sweeping: &sweeping,
                });
                domain.sweep_hook = Some(hook);
            }
        }

        let mut totals = SweepTotals::default();
        for id in &group {
            let Some(domain) = self.domains.get_mut(id) else {
                continue;
            };
            for kind in EAGER_KINDS {
                for addr in domain.arenas.take_for_finalize(kind) {
                    totals.add(finalize_arena_into(&heap, addr, *id, domain.arenas.list_mut(kind), false));
                }
            }
            for kind in BACKGROUND_PHASES.iter().flat_map(|phase| phase.iter().copied()) {
                if let Some(arenas) = domain.arenas.queue_for_background_sweep(kind) {
                    self.background_jobs.push(SweepJob { domain: *id, kind, arenas });
                }
            }
            for kind in FOREGROUND_PHASES.iter().flat_map(|phase| phase.iter().copied()) {
                domain.arenas.queue_for_foreground_sweep(kind);
            }
        }
        self.add_totals(totals);

        self.sweep.rewind();
        self.stats.groups_swept += 1;
        self.emit(GcEvent::GroupEnd);
    }

    fn add_totals(&mut self, totals: SweepTotals) {
        self.stats.things_finalized += totals.finalized as u64;
        self.stats.arenas_released += totals.released as u64;
    }

    /// Finalizes queued foreground arenas group by group. Returns false when
    /// the budget ran out first.
    fn sweep_phase(&mut self, budget: &mut SliceBudget) -> bool {
        let heap = Arc::clone(&self.heap);

        // Barriers of later groups may have pushed things.
        if !self.marker.drain(&heap, &mut self.domains, budget) {
            return false;
        }

        loop {
            while self.sweep.phase < FOREGROUND_PHASES.len() {
                let kinds = FOREGROUND_PHASES[self.sweep.phase];
                while self.sweep.domain < self.sweep.current_group().len() {
                    let id = self.sweep.current_group()[self.sweep.domain];
                    if let Some(domain) = self.domains.get_mut(&id) {
                        while self.sweep.kind < kinds.len() {
                            let kind = kinds[self.sweep.kind];
                            let (queue, dest) = domain.arenas.sweep_parts(kind);
                            let mut totals = SweepTotals::default();
                            let done = finalize_queued(&heap, queue, dest, id, kind, budget, &mut totals);
                            self.stats.things_finalized += totals.finalized as u64;
                            self.stats.arenas_released += totals.released as u64;
                            if !done {
                                return false;
                            }
                            self.sweep.kind += 1;
                        }
                    }
                    self.sweep.kind = 0;
                    self.sweep.domain += 1;
                }
                self.sweep.domain = 0;
                self.sweep.phase += 1;
            }

            self.end_sweeping_group();
            self.sweep.group += 1;
            if self.sweep.group >= self.sweep.groups.len() {
                return true;
            }
            self.end_marking_group();
            self.begin_sweeping_group();
        }
    }

    fn end_sweeping_group(&mut self) {
        for id in self.sweep.current_group() {
            if let Some(domain) = self.domains.get_mut(id) {
                domain.set_state(DomainGcState::Finished);
            }
        }
        let heap = Arc::clone(&self.heap);
        for addr in self.arenas_allocated_during_sweep.drain(..) {
            heap.with_header(addr, |header| header.allocated_during_sweep = false);
        }
    }

    /// Wraps up a collection: destroys dead domains, recomputes triggers and
    /// returns the background jobs still to run.
    fn end_sweep_phase(&mut self, kind: GcInvocationKind) -> Vec<SweepJob> {
        let heap = Arc::clone(&self.heap);
        self.marker.stop();

        if self.domains.values().any(|domain| !domain.state().is_collecting()) {
            self.is_full = false;
        }

        // Stale gray bits outside the collection would hide black edges.
        if self.marker.found_black_gray_edges {
            for domain in self.domains.values().filter(|domain| !domain.state().is_collecting()) {
                for addr in domain.arenas.all_arenas() {
                    heap.unmark_arena(addr);
                }
            }
        }

        let mut jobs = std::mem::take(&mut self.background_jobs);
        jobs.sort_by_key(|job| background_phase(job.kind));

        if !self.sweep_on_background {
            let shrink = kind == GcInvocationKind::Shrink;
            heap.expire_chunks(shrink);
            if shrink {
                heap.decommit_arenas(&|| false);
            }
        }

        self.emit(GcEvent::CollectionEnd {
            is_compartment_gc: !self.is_full,
        });

        if !self.sweep_on_background {
            for job in std::mem::take(&mut jobs) {
                let swept = sweep_job(&heap, job, false);
                self.merge_swept(swept, false);
            }
        }

        let doomed: Vec<DomainId> = self
            .domains
            .values()
            .filter(|domain| {
                !domain.id().is_atoms() && !domain.hold && domain.state().is_collecting() && domain.arenas.are_empty()
            })
            .map(Domain::id)
            .collect();
        for id in doomed {
            self.domains.remove(&id);
            heap.pool().remove_domain(id);
            info!("destroyed domain {}", id);
        }

        let now = Instant::now();
        let ids: Vec<DomainId> = self.domains.keys().copied().collect();
        for id in ids {
            let last_bytes = heap.pool().domain_bytes(id).map_or(0, |bytes| bytes.gc_bytes);
            self.set_gc_last_bytes(id, last_bytes, kind, now);
            if let Some(domain) = self.domains.get_mut(&id) {
                if domain.state().is_collecting() {
                    domain.set_state(DomainGcState::NoGc);
                }
            }
        }
        self.last_gc_time = Some(now);

        jobs
    }

    /// Recomputes `domain`'s trigger from the bytes it holds after a
    /// collection.
    pub(crate) fn set_gc_last_bytes(&mut self, domain: DomainId, last_bytes: usize, kind: GcInvocationKind, now: Instant) {
        let growth = growth_factor(&self.config, last_bytes, self.last_gc_time, now);
        if let Some(high_frequency) = growth.high_frequency {
            self.high_frequency = high_frequency;
        }
        let trigger = trigger_bytes(
            last_bytes,
            self.config.allocation_threshold,
            self.config.max_bytes,
            growth.factor,
            kind,
        );
        self.heap.pool().set_domain_trigger(domain, trigger, growth.factor);
    }

    /// Merges one finished background job into its domain's lists.
    pub(crate) fn merge_swept(&mut self, swept: SweptArenas, on_background: bool) {
        self.add_totals(swept.totals);
        match self.domains.get_mut(&swept.domain) {
            Some(domain) => domain.arenas.finish_background_sweep(swept.kind, swept.list, on_background),
            None => warn!("swept arenas returned for unknown domain {}", swept.domain),
        }
    }
}
