//! The marker.
//!
//! Marking is iterative: newly marked things go on an explicit mark stack
//! and are traced when popped. When the stack reaches its limit, the arena of
//! the thing that did not fit is flagged and pushed on a delayed-arena stack
//! instead; all of its marked things are traced again later. Arenas the
//! mutator allocated into during an incremental collection use the same
//! stack, so everything allocated in them is marked before sweeping.
//!
//! Things are marked black or gray. Gray marks things reachable only from
//! gray roots; edges from a gray-marking domain into a domain still marking
//! black are not followed but recorded on the target domain and resolved when
//! that domain's group finishes marking.

use crate::budget::SliceBudget;
use crate::chunk::MarkColor;
use crate::config::GcConfig;
use crate::domain::{DomainId, DomainMap};
use crate::heap::Heap;
use crate::roots::{GrayRootBuffer, RootProvider};
use crate::trace::{ArenaAddr, ThingRef, Trace};
use crossbeam_deque::Worker;
use log::{debug, trace};

/// Work charged for processing one delayed arena.
const DELAYED_ARENA_COST: usize = 150;

pub(crate) struct Marker {
    /// Things marked but not yet traced
    stack: Worker<ThingRef>,
    /// Arenas whose things must be (re)traced
    delayed: Vec<ArenaAddr>,
    color: MarkColor,
    mark_stack_limit: usize,
    gray_root_limit: usize,
    gray_roots: Vec<ThingRef>,
    gray_failed: bool,
    /// A black thing referenced a gray thing in a domain that is not collected
    pub(crate) found_black_gray_edges: bool,
}

impl Marker {
    pub(crate) fn new(config: &GcConfig) -> Self {
        Marker {
            stack: Worker::new_lifo(),
            delayed: Vec::new(),
            color: MarkColor::Black,
            mark_stack_limit: config.mark_stack_limit.max(1),
            gray_root_limit: config.gray_root_buffer_limit,
            gray_roots: Vec::new(),
            gray_failed: false,
            found_black_gray_edges: false,
        }
    }

    pub(crate) fn set_color(&mut self, color: MarkColor) {
        self.color = color;
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.stack.is_empty() && self.delayed.is_empty()
    }

    pub(crate) fn delayed_arena_count(&self) -> usize {
        self.delayed.len()
    }

    /// Marks a root with the current color if its domain is marking.
    pub(crate) fn mark_root<T: Trace>(&mut self, heap: &Heap<T>, domains: &mut DomainMap, thing: ThingRef) {
        let Some((domain_id, _)) = heap.owner(thing) else {
            return;
        };
        let Some(domain) = domains.get_mut(&domain_id) else {
            return;
        };
        if !domain.state().is_marking() {
            return;
        }
        domain.maybe_alive = true;
        self.mark_and_push(heap, thing, self.color);
    }

    /// Marks `thing` with `color` and queues it for tracing.
    ///
    /// Marking a gray thing black clears its gray bit and traces it again so
    /// its children turn black too.
    pub(crate) fn mark_and_push<T: Trace>(&mut self, heap: &Heap<T>, thing: ThingRef, color: MarkColor) -> bool {
        let newly = match color {
            MarkColor::Black => heap.mark(thing, MarkColor::Black) || heap.unmark_gray(thing),
            MarkColor::Gray => heap.mark(thing, MarkColor::Gray),
        };
        if newly {
            self.push(heap, thing);
        }
        newly
    }

    fn push<T: Trace>(&mut self, heap: &Heap<T>, thing: ThingRef) {
        if self.stack.len() >= self.mark_stack_limit {
            self.delay_marking_children(heap, thing.arena());
        } else {
            self.stack.push(thing);
        }
    }

    /// Queues an arena so its things are visited when the stack drains.
    pub(crate) fn delay_marking_arena<T: Trace>(&mut self, heap: &Heap<T>, addr: ArenaAddr) {
        let newly = heap
            .with_header(addr, |header| !std::mem::replace(&mut header.has_delayed_marking, true))
            .unwrap_or(false);
        if newly {
            self.delayed.push(addr);
        }
    }

    fn delay_marking_children<T: Trace>(&mut self, heap: &Heap<T>, addr: ArenaAddr) {
        heap.with_header(addr, |header| header.mark_overflow = true);
        self.delay_marking_arena(heap, addr);
    }

    /// Traces until the stack and the delayed arenas are empty or the budget
    /// runs out. Returns whether marking is drained.
    ///
    /// Running out of budget on the last piece of work still reports the
    /// marker as drained.
    pub(crate) fn drain<T: Trace>(&mut self, heap: &Heap<T>, domains: &mut DomainMap, budget: &mut SliceBudget) -> bool {
        loop {
            while let Some(thing) = self.stack.pop() {
                self.trace_children(heap, domains, thing);
                budget.step(1);
                if budget.is_over_budget() {
                    return self.is_drained();
                }
            }

            let Some(addr) = self.delayed.pop() else {
                return true;
            };
            heap.with_header(addr, |header| header.has_delayed_marking = false);
            self.mark_delayed_children(heap, domains, addr);
            budget.step(DELAYED_ARENA_COST);
            if budget.is_over_budget() {
                return self.is_drained();
            }
        }
    }

    fn trace_children<T: Trace>(&mut self, heap: &Heap<T>, domains: &mut DomainMap, thing: ThingRef) {
        let Some((source_domain, _)) = heap.owner(thing) else {
            return;
        };
        for target in heap.edges_of(thing) {
            self.mark_edge(heap, domains, source_domain, thing, target);
        }
    }

    fn mark_edge<T: Trace>(
        &mut self,
        heap: &Heap<T>,
        domains: &mut DomainMap,
        source_domain: DomainId,
        source: ThingRef,
        target: ThingRef,
    ) {
        let Some((target_domain, _)) = heap.owner(target) else {
            return;
        };
        let Some(domain) = domains.get_mut(&target_domain) else {
            return;
        };
        let state = domain.state();

        if target_domain == source_domain || target_domain.is_atoms() {
            if state.is_marking() {
                self.mark_and_push(heap, target, self.color);
            }
            return;
        }

        match self.color {
            MarkColor::Black => {
                if state.is_marking() {
                    self.mark_and_push(heap, target, MarkColor::Black);
                } else if !state.is_collecting() && heap.is_marked(target, MarkColor::Gray) {
                    self.found_black_gray_edges = true;
                }
            }
            MarkColor::Gray => {
                if state.is_marking_black() {
                    if !heap.is_marked(target, MarkColor::Black) {
                        trace!("delaying gray edge {} -> {}", source, target);
                        domain.delay_gray_edge(source_domain, source, target);
                    }
                } else if state.is_marking_gray() {
                    self.mark_and_push(heap, target, MarkColor::Gray);
                }
            }
        }
    }

    fn mark_delayed_children<T: Trace>(&mut self, heap: &Heap<T>, domains: &mut DomainMap, addr: ArenaAddr) {
        let Some((overflow, allocated_during_incremental)) = heap.with_header(addr, |header| {
            let flags = (header.mark_overflow, header.allocated_during_incremental);
            header.mark_overflow = false;
            header.allocated_during_incremental = false;
            flags
        }) else {
            return;
        };

        if overflow {
            for thing in heap.live_things(addr) {
                if allocated_during_incremental || heap.is_marked(thing, MarkColor::Black) {
                    heap.mark(thing, MarkColor::Black);
                    self.trace_children(heap, domains, thing);
                }
            }
        } else {
            // Things allocated during the collection are marked black and
            // traced in place; the whole arena costs one delayed step.
            debug_assert!(allocated_during_incremental);
            for thing in heap.live_things(addr) {
                if heap.mark(thing, MarkColor::Black) || heap.unmark_gray(thing) {
                    self.trace_children(heap, domains, thing);
                }
            }
        }
    }

    /// Abandons marking: empties both stacks and clears every flag the
    /// delayed arenas carry.
    pub(crate) fn reset<T: Trace>(&mut self, heap: &Heap<T>) {
        self.color = MarkColor::Black;
        while self.stack.pop().is_some() {}
        while let Some(addr) = self.delayed.pop() {
            heap.with_header(addr, |header| header.clear_marking_flags());
        }
        debug_assert!(self.is_drained());
        self.stop();
    }

    pub(crate) fn stop(&mut self) {
        self.gray_roots = Vec::new();
        self.gray_failed = false;
    }

    /// Records the provider's gray roots for marking once each group has
    /// finished black marking.
    pub(crate) fn buffer_gray_roots(&mut self, provider: &mut dyn RootProvider) -> bool {
        self.gray_roots.clear();
        let mut buffer = GrayRootBuffer {
            roots: &mut self.gray_roots,
            limit: self.gray_root_limit,
            failed: false,
        };
        provider.trace_gray_roots(&mut buffer);
        self.gray_failed = buffer.failed;
        if self.gray_failed {
            debug!("gray root buffer overflowed; gray roots will be rescanned");
        }
        !self.gray_failed
    }

    pub(crate) fn has_buffered_gray_roots(&self) -> bool {
        !self.gray_failed
    }

    pub(crate) fn buffered_gray_roots(&self) -> &[ThingRef] {
        &self.gray_roots
    }

    /// Marks buffered roots in gray-marking domains. Roots of domains that
    /// are still collecting stay buffered for their own group.
    pub(crate) fn mark_buffered_gray_roots<T: Trace>(&mut self, heap: &Heap<T>, domains: &DomainMap) {
        debug_assert_eq!(self.color, MarkColor::Gray);
        let mut kept = Vec::new();
        for thing in std::mem::take(&mut self.gray_roots) {
            let state = heap
                .owner(thing)
                .and_then(|(domain, _)| domains.get(&domain))
                .map(|domain| domain.state());
            match state {
                Some(state) if state.is_marking_gray() => {
                    self.mark_and_push(heap, thing, MarkColor::Gray);
                }
                Some(state) if state.is_collecting() => kept.push(thing),
                _ => {}
            }
        }
        self.gray_roots = kept;
    }
}
