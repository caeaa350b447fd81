//! The incremental state machine, barriers and resets

use super::{collector, finish_in_slices, link, node, Node};
use compartment_gc::{
    AllocKind, CollectorContext, DomainGcState, DomainId, GcEvent, GcInvocationKind, GcMode, GcReason,
    IncrementalState, RootList, ThingRef, WrapperKind,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Roots a chain of `len` nodes and returns its head.
fn rooted_chain(gc: &mut CollectorContext<Node>, domain: DomainId, len: usize) -> ThingRef {
    let mut head = node(gc, domain, Vec::new());
    for _ in 1..len {
        head = node(gc, domain, vec![head]);
    }
    gc.add_root(head, "chain").unwrap();
    head
}

#[test]
fn test_states_visited_in_order() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    rooted_chain(&mut gc, domain, 20);
    for _ in 0..5 {
        node(&mut gc, domain, Vec::new());
    }
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    gc.set_observer(move |event| {
        if let GcEvent::StateChange { to, .. } = event {
            sink.borrow_mut().push(*to);
        }
    });

    let slices = finish_in_slices(&mut gc, 1);
    assert!(slices > 10, "took {} slices", slices);
    assert_eq!(
        *seen.borrow(),
        vec![
            IncrementalState::MarkRoots,
            IncrementalState::Mark,
            IncrementalState::Sweep,
            IncrementalState::NoIncremental,
        ]
    );
    assert_eq!(gc.live_thing_count(domain).unwrap(), 20);
    assert_eq!(gc.stats().collections, 1);
    assert_eq!(gc.stats().slices, slices as u64);
}

#[test]
fn test_barriers_armed_only_between_marking_slices() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    rooted_chain(&mut gc, domain, 10);
    assert!(!gc.domain(domain).unwrap().needs_barrier());

    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::Mark);
    assert_eq!(gc.domain_gc_state(domain).unwrap(), DomainGcState::Mark);
    assert!(gc.domain(domain).unwrap().needs_barrier());

    gc.gc_final_slice(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.incremental_state(), IncrementalState::NoIncremental);
    assert_eq!(gc.domain_gc_state(domain).unwrap(), DomainGcState::NoGc);
    assert!(!gc.domain(domain).unwrap().needs_barrier());
}

#[test]
fn test_write_barrier_keeps_moved_reference_alive() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    let b = node(&mut gc, domain, Vec::new());
    let a = node(&mut gc, domain, vec![b]);
    let r = node(&mut gc, domain, vec![a]);
    gc.add_root(r, "r").unwrap();

    // One unit of work traces the root only; `a` is queued, `b` is not.
    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::Mark);
    assert!(!gc.is_marked(b));

    // Move `b` from the untraced `a` into the already traced root.
    link(&gc, r, b);
    gc.with_thing_mut(a, |node| node.edges.clear()).unwrap();
    gc.write_barrier(b);
    assert!(gc.is_marked(b));

    finish_in_slices(&mut gc, 1);
    assert!(gc.contains(b));
    assert!(gc.contains(a));
}

#[test]
fn test_write_barrier_is_noop_outside_marking() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    let thing = node(&mut gc, domain, Vec::new());
    gc.write_barrier(thing);
    assert!(!gc.is_marked(thing));
    assert_eq!(gc.delayed_arena_count(), 0);
}

#[test]
fn test_things_allocated_during_marking_survive() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    rooted_chain(&mut gc, domain, 10);
    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::Mark);

    let fresh = node(&mut gc, domain, Vec::new());
    assert!(gc.arenas_allocated_during_incremental() >= 1);
    finish_in_slices(&mut gc, 1);
    assert!(gc.contains(fresh));
    assert_eq!(gc.arenas_allocated_during_incremental(), 0);

    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert!(!gc.contains(fresh));
}

#[test]
fn test_marking_finishes_with_allocation_between_slices() {
    for work in [1, 10, 100] {
        let mut gc = collector();
        let domain = gc.new_domain("page", false);
        let head = rooted_chain(&mut gc, domain, 300);

        let mut fresh = Vec::new();
        let mut slices = 0;
        gc.gc_debug_slice(true, work);
        while gc.is_incremental_gc_in_progress() {
            fresh.push(node(&mut gc, domain, vec![head]));
            gc.gc_debug_slice(true, work);
            slices += 1;
            assert!(slices < 2_000, "collection with {} units per slice did not finish", work);
        }

        assert!(!fresh.is_empty());
        assert!(fresh.iter().all(|thing| gc.contains(*thing)));
        assert_eq!(gc.arenas_allocated_during_incremental(), 0);
        assert_eq!(gc.delayed_arena_count(), 0);
        assert_eq!(gc.stats().collections, 1);

        gc.gc(GcInvocationKind::Normal, GcReason::Api);
        assert!(fresh.iter().all(|thing| !gc.contains(*thing)));
        assert_eq!(gc.live_thing_count(domain).unwrap(), 300);
    }
}

#[test]
fn test_idle_slices_do_not_requeue_free_list_arenas() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    rooted_chain(&mut gc, domain, 30);
    gc.gc_debug_slice(true, 1);
    let fresh = node(&mut gc, domain, Vec::new());
    assert_eq!(gc.delayed_arena_count(), 1);

    let mut slices = 0;
    while gc.delayed_arena_count() > 0 {
        gc.gc_debug_slice(true, 1);
        slices += 1;
        assert!(slices < 100, "delayed arena was never marked");
    }
    // Nothing was allocated since, so no slice may queue the arena again.
    while gc.is_incremental_gc_in_progress() {
        assert_eq!(gc.delayed_arena_count(), 0);
        assert_eq!(gc.arenas_allocated_during_incremental(), 0);
        gc.gc_debug_slice(true, 1);
    }
    assert!(gc.contains(fresh));
}

#[test]
fn test_collections_with_gray_roots_run_through_shutdown() {
    let mut gc = collector();
    let counter = Arc::new(AtomicUsize::new(0));
    let a = gc.new_domain("a", false);
    let b = gc.new_domain("b", false);
    let c = gc.new_domain("c", false);
    let target = gc.allocate(b, AllocKind::Object0, Node::counted(&counter)).unwrap();
    let wrapper = gc.allocate(a, AllocKind::Object0, Node::counted(&counter)).unwrap();
    link(&gc, wrapper, target);
    gc.add_wrapper(wrapper, target, WrapperKind::Object).unwrap();
    let black = gc.allocate(c, AllocKind::Object0, Node::counted(&counter)).unwrap();
    gc.add_root(black, "black").unwrap();
    gc.set_root_provider(RootList {
        black: Vec::new(),
        gray: vec![wrapper],
    });
    let garbage = gc.allocate(c, AllocKind::Object0, Node::counted(&counter)).unwrap();

    // Every group passes through gray marking exactly once per collection.
    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert!(gc.is_gray(wrapper));
    assert!(gc.contains(target));
    assert!(!gc.contains(garbage));
    finish_in_slices(&mut gc, 2);
    gc.gc(GcInvocationKind::Shrink, GcReason::Api);
    assert_eq!(gc.stats().collections, 3);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    drop(gc);
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn test_reset_during_mark_discards_marking() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    rooted_chain(&mut gc, domain, 10);
    let garbage = node(&mut gc, domain, Vec::new());
    gc.gc_debug_slice(true, 1);
    node(&mut gc, domain, Vec::new());
    assert!(gc.arenas_allocated_during_incremental() >= 1);

    gc.reset_incremental_gc("test");
    assert_eq!(gc.incremental_state(), IncrementalState::NoIncremental);
    for id in gc.domain_ids() {
        assert_eq!(gc.domain_gc_state(id).unwrap(), DomainGcState::NoGc);
        assert!(!gc.domain(id).unwrap().needs_barrier());
    }
    assert_eq!(gc.arenas_allocated_during_incremental(), 0);
    assert_eq!(gc.delayed_arena_count(), 0);
    assert!(gc.contains(garbage));

    let stats = gc.stats();
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.last_reset_reason.as_deref(), Some("test"));
    assert_eq!(stats.collections, 0);
}

#[test]
fn test_reset_during_sweep_finishes_collection() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    let kind = AllocKind::Shape;
    for _ in 0..3 * kind.things_per_arena() {
        gc.allocate(domain, kind, Node::default()).unwrap();
    }

    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::Sweep);
    assert!(gc.live_thing_count(domain).unwrap() > 0);

    gc.reset_incremental_gc("test");
    assert_eq!(gc.incremental_state(), IncrementalState::NoIncremental);
    assert_eq!(gc.live_thing_count(domain).unwrap(), 0);
    assert_eq!(gc.domain_gc_state(domain).unwrap(), DomainGcState::NoGc);
    let stats = gc.stats();
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.collections, 1);
}

#[test]
fn test_foreground_sweeping_spans_slices() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    let kind = AllocKind::Script;
    let total = 4 * kind.things_per_arena();
    for _ in 0..total {
        gc.allocate(domain, kind, Node::default()).unwrap();
    }

    gc.gc_debug_slice(true, 1);
    let after_first = gc.stats().things_finalized;
    assert!(after_first < total as u64);
    let slices = finish_in_slices(&mut gc, 1);
    assert!(slices >= 3);
    assert_eq!(gc.stats().things_finalized, total as u64);
    assert_eq!(gc.stats().arenas_released, 4);
}

#[test]
fn test_time_budget_slice_completes_small_collection() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    let kept = node(&mut gc, domain, Vec::new());
    gc.add_root(kept, "kept").unwrap();
    node(&mut gc, domain, Vec::new());

    gc.prepare_domain_for_gc(domain).unwrap();
    assert!(gc.is_gc_scheduled(domain).unwrap());
    gc.gc_slice(GcInvocationKind::Normal, GcReason::Api, 1000);
    assert_eq!(gc.incremental_state(), IncrementalState::NoIncremental);
    assert_eq!(gc.live_thing_count(domain).unwrap(), 1);
    assert!(!gc.is_gc_scheduled(domain).unwrap());
    assert!(gc.stats().nonincremental_reason.is_none());
}

#[test]
fn test_scheduling_another_domain_resets() {
    let mut gc = collector();
    let a = gc.new_domain("a", false);
    let b = gc.new_domain("b", false);
    rooted_chain(&mut gc, a, 10);
    let b_garbage = node(&mut gc, b, Vec::new());

    gc.prepare_domain_for_gc(a).unwrap();
    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::Mark);
    assert_eq!(gc.domain_gc_state(b).unwrap(), DomainGcState::NoGc);

    gc.prepare_domain_for_gc(b).unwrap();
    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.stats().resets, 1);
    assert_eq!(gc.stats().last_reset_reason.as_deref(), Some("compartment change"));
    assert_eq!(gc.domain_gc_state(b).unwrap(), DomainGcState::Mark);

    gc.gc_final_slice(GcInvocationKind::Normal, GcReason::Api);
    assert!(!gc.contains(b_garbage));
    assert_eq!(gc.stats().resets, 1);
}

#[test]
fn test_domain_created_mid_collection_is_left_alone() {
    let mut gc = collector();
    let a = gc.new_domain("a", false);
    rooted_chain(&mut gc, a, 10);
    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::Mark);

    let late = gc.new_domain("late", false);
    let garbage = node(&mut gc, late, Vec::new());
    assert_eq!(gc.domain_gc_state(late).unwrap(), DomainGcState::NoGc);
    gc.gc_final_slice(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.incremental_state(), IncrementalState::NoIncremental);
    assert_eq!(gc.stats().resets, 0);
    assert!(gc.contains(garbage));
}

#[test]
fn test_global_mode_collects_everything_at_once() {
    let mut gc = collector();
    let a = gc.new_domain("a", false);
    let b = gc.new_domain("b", false);
    let in_a = node(&mut gc, a, Vec::new());
    let in_b = node(&mut gc, b, Vec::new());
    gc.set_mode(GcMode::Global);

    gc.prepare_domain_for_gc(a).unwrap();
    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::NoIncremental);
    assert!(!gc.contains(in_a));
    assert!(!gc.contains(in_b));
    assert_eq!(gc.stats().nonincremental_reason.as_deref(), Some("GC mode"));
}

#[test]
fn test_compartment_mode_collects_scheduled_domains_only() {
    let mut gc = collector();
    let a = gc.new_domain("a", false);
    let b = gc.new_domain("b", false);
    let in_a = node(&mut gc, a, Vec::new());
    let in_b = node(&mut gc, b, Vec::new());
    gc.set_mode(GcMode::Compartment);

    gc.prepare_domain_for_gc(a).unwrap();
    gc.gc_debug_slice(true, 1);
    assert_eq!(gc.incremental_state(), IncrementalState::NoIncremental);
    assert!(!gc.contains(in_a));
    assert!(gc.contains(in_b));
}

#[test]
fn test_observer_sees_collection_end() {
    let mut gc = collector();
    let a = gc.new_domain("a", false);
    gc.new_domain("b", false);
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    gc.set_observer(move |event| {
        if !matches!(event, GcEvent::StateChange { .. }) {
            sink.borrow_mut().push(event.clone());
        }
    });

    gc.prepare_domain_for_gc(a).unwrap();
    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(
        *events.borrow(),
        vec![
            GcEvent::Begin,
            GcEvent::GroupStart,
            GcEvent::GroupEnd,
            GcEvent::CollectionEnd { is_compartment_gc: true },
            GcEvent::End,
        ]
    );
}
