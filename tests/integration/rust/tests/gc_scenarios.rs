//! End-to-end collection scenarios
//!
//! Each test walks one complete collector workflow through the public API:
//! allocation, rooting, scheduling, incremental slices and chunk reuse.

use compartment_gc::{
    AllocKind, DomainGcState, GcError, GcEvent, GcInvocationKind, GcReason, IncrementalState, WrapperKind,
    ARENAS_PER_CHUNK,
};
use integration_tests::{init_logging, Graph};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Scenario: unrooted objects are all finalized by a full collection
#[test]
fn test_unrooted_objects_are_finalized() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let domain = graph.gc.new_domain("d", false);
    graph.add_nodes(domain, AllocKind::Object2, 3).unwrap();
    assert_eq!(graph.gc.object_count(), 3);

    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(graph.finalized(), 3);
    assert_eq!(graph.gc.object_count(), 0);
    assert!(graph.surviving().is_empty());
}

/// Scenario: a rooted object keeps its referent until the root goes away
#[test]
fn test_root_keeps_referent_alive() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let domain = graph.gc.new_domain("d", false);
    let x = graph.add_node(domain, AllocKind::Object4).unwrap();
    let y = graph.add_node(domain, AllocKind::Object4).unwrap();
    graph.add_edge(x, y).unwrap();
    graph.root(x).unwrap();

    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(graph.surviving(), BTreeSet::from([x, y]));
    assert_eq!(graph.finalized(), 0);

    assert!(graph.gc.remove_root(graph.thing(x)));
    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert!(graph.surviving().is_empty());
    assert_eq!(graph.finalized(), 2);
}

/// Scenario: collecting only the wrapper's domain leaves the wrapped domain untouched
#[test]
fn test_single_domain_collection_with_wrapper() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let a = graph.gc.new_domain("a", false);
    let b = graph.gc.new_domain("b", false);
    let z = graph.add_node(b, AllocKind::Object0).unwrap();
    let wrapper = graph.add_node(a, AllocKind::Object0).unwrap();
    graph.add_edge(wrapper, z).unwrap();
    graph
        .gc
        .add_wrapper(graph.thing(wrapper), graph.thing(z), WrapperKind::Object)
        .unwrap();
    graph.root(wrapper).unwrap();

    let states = Rc::new(RefCell::new(BTreeSet::new()));
    let sink = Rc::clone(&states);
    graph.gc.set_observer(move |event| {
        if let GcEvent::CollectionEnd { is_compartment_gc } = event {
            sink.borrow_mut().insert(*is_compartment_gc);
        }
    });

    graph.gc.prepare_domain_for_gc(a).unwrap();
    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert!(graph.gc.contains(graph.thing(z)));
    assert!(graph.gc.contains(graph.thing(wrapper)));
    assert_eq!(graph.gc.wrapper_count(a).unwrap(), 1);
    assert_eq!(graph.gc.domain_gc_state(b).unwrap(), DomainGcState::NoGc);
    assert_eq!(*states.borrow(), BTreeSet::from([true]));
    assert_eq!(graph.finalized(), 0);
}

/// Scenario: tiny slices visit every state in order and never skip sweeping
#[test]
fn test_tiny_slices_visit_every_state() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let domain = graph.gc.new_domain("d", false);
    let nodes = graph.add_nodes(domain, AllocKind::Object4, 40).unwrap();
    for pair in nodes.windows(2) {
        graph.add_edge(pair[0], pair[1]).unwrap();
    }
    graph.root(nodes[0]).unwrap();
    let scripts = graph.add_nodes(domain, AllocKind::Script, 60).unwrap();

    let transitions = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&transitions);
    graph.gc.set_observer(move |event| {
        if let GcEvent::StateChange { from, to } = event {
            sink.borrow_mut().push((*from, *to));
        }
    });

    let slices = graph.finish_in_slices(1);
    assert!(slices > 40);
    assert_eq!(
        *transitions.borrow(),
        vec![
            (IncrementalState::NoIncremental, IncrementalState::MarkRoots),
            (IncrementalState::MarkRoots, IncrementalState::Mark),
            (IncrementalState::Mark, IncrementalState::Sweep),
            (IncrementalState::Sweep, IncrementalState::NoIncremental),
        ]
    );
    let surviving = graph.surviving();
    assert!(nodes.iter().all(|n| surviving.contains(n)));
    assert!(scripts.iter().all(|s| !surviving.contains(s)));
}

/// Scenario: a mutator allocating between tiny slices never stalls the collection
#[test]
fn test_allocation_between_slices_across_groups() {
    init_logging();
    for work in [1, 10, 100] {
        let mut graph = Graph::single_threaded().unwrap();
        let a = graph.gc.new_domain("a", false);
        let b = graph.gc.new_domain("b", false);
        let chain = graph.add_nodes(a, AllocKind::Object4, 120).unwrap();
        for pair in chain.windows(2) {
            graph.add_edge(pair[0], pair[1]).unwrap();
        }
        graph.root(chain[0]).unwrap();
        let target = graph.add_node(b, AllocKind::Object4).unwrap();
        graph.add_edge(chain[119], target).unwrap();
        graph
            .gc
            .add_wrapper(graph.thing(chain[119]), graph.thing(target), WrapperKind::Object)
            .unwrap();
        graph.add_nodes(a, AllocKind::Object4, 20).unwrap();

        let mut fresh = Vec::new();
        let mut slices = 0;
        graph.gc.gc_debug_slice(true, work);
        while graph.gc.is_incremental_gc_in_progress() {
            let domain = if slices % 2 == 0 { a } else { b };
            fresh.push(graph.add_node(domain, AllocKind::Object4).unwrap());
            graph.gc.gc_debug_slice(true, work);
            slices += 1;
            assert!(slices < 5_000, "{} units per slice: collection did not finish", work);
        }

        let surviving = graph.surviving();
        assert!(chain.iter().chain(&fresh).all(|n| surviving.contains(n)));
        assert!(surviving.contains(&target));
        assert_eq!(graph.finalized(), 20);
        assert_eq!(graph.gc.delayed_arena_count(), 0);

        graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
        assert_eq!(graph.finalized(), 20 + fresh.len());
    }
}

/// Scenario: a reference to a finalized thing stays invalid once its slot is reused
#[test]
fn test_stale_reference_after_slot_reuse() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let domain = graph.gc.new_domain("d", false);
    let kept = graph.add_node(domain, AllocKind::Object2).unwrap();
    graph.root(kept).unwrap();
    let dead = graph.add_node(domain, AllocKind::Object2).unwrap();
    let stale = graph.thing(dead);
    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(graph.finalized(), 1);

    let reused = graph.add_node(domain, AllocKind::Object2).unwrap();
    let fresh = graph.thing(reused);
    assert_eq!((fresh.arena(), fresh.slot()), (stale.arena(), stale.slot()));
    assert!(graph.gc.contains(fresh));
    assert!(!graph.gc.contains(stale));
    assert!(matches!(graph.gc.add_root(stale, "stale"), Err(GcError::InvalidThing(t)) if t == stale));
    assert!(graph.gc.with_thing(stale, |node| node.index).is_err());
    assert_eq!(graph.gc.with_thing(fresh, |node| node.index).unwrap(), reused);
}

/// Scenario: resetting mid-mark returns every domain to NoGc with no stale flags
#[test]
fn test_reset_mid_mark() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let a = graph.gc.new_domain("a", false);
    let b = graph.gc.new_domain("b", false);
    for domain in [a, b] {
        let nodes = graph.add_nodes(domain, AllocKind::Object8, 10).unwrap();
        for pair in nodes.windows(2) {
            graph.add_edge(pair[0], pair[1]).unwrap();
        }
        graph.root(nodes[0]).unwrap();
    }

    graph.gc.gc_debug_slice(true, 2);
    assert_eq!(graph.gc.incremental_state(), IncrementalState::Mark);
    // Allocation during marking flags the arena it lands in.
    graph.add_nodes(a, AllocKind::Object8, 3).unwrap();
    graph.add_nodes(b, AllocKind::Object0Background, 3).unwrap();
    assert!(graph.gc.arenas_allocated_during_incremental() >= 2);

    graph.gc.reset_incremental_gc("scenario");
    assert_eq!(graph.gc.incremental_state(), IncrementalState::NoIncremental);
    for domain in graph.gc.domain_ids() {
        assert_eq!(graph.gc.domain_gc_state(domain).unwrap(), DomainGcState::NoGc);
    }
    assert_eq!(graph.gc.arenas_allocated_during_incremental(), 0);
    assert_eq!(graph.gc.delayed_arena_count(), 0);
    assert_eq!(graph.finalized(), 0);

    // The next collection starts from scratch and frees the unrooted additions.
    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(graph.finalized(), 6);
}

/// Scenario: freed arenas are reused before another chunk is mapped
#[test]
fn test_freed_arenas_reused_before_new_chunk() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let domain = graph.gc.new_domain("d", false);
    let kind = AllocKind::Object16;
    let per_arena = kind.things_per_arena();

    let mut freed = BTreeSet::new();
    for arena in 0..ARENAS_PER_CHUNK {
        let nodes = graph.add_nodes(domain, kind, per_arena).unwrap();
        let addr = graph.thing(nodes[0]).arena();
        if arena % 2 == 0 {
            for node in nodes {
                graph.root(node).unwrap();
            }
        } else {
            freed.insert(addr);
        }
    }
    assert_eq!(graph.gc.chunk_count(), 1);
    assert_eq!(graph.gc.free_committed_arena_count(), 0);

    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(graph.gc.chunk_count(), 1);
    assert_eq!(graph.gc.free_committed_arena_count(), ARENAS_PER_CHUNK / 2);
    assert_eq!(graph.gc.stats().arenas_released, (ARENAS_PER_CHUNK / 2) as u64);

    for _ in 0..ARENAS_PER_CHUNK / 2 {
        let nodes = graph.add_nodes(domain, kind, per_arena).unwrap();
        let addr = graph.thing(nodes[0]).arena();
        assert!(freed.remove(&addr), "arena {:?} was not freed before", addr);
    }
    assert!(freed.is_empty());
    assert_eq!(graph.gc.chunk_count(), 1);
    assert_eq!(graph.gc.stats().chunks_mapped, 1);

    graph.add_node(domain, kind).unwrap();
    assert_eq!(graph.gc.chunk_count(), 2);
    assert_eq!(graph.gc.stats().chunks_mapped, 2);
}

/// Scenario: shutting down finalizes everything, rooted or not
#[test]
fn test_finish_finalizes_everything() {
    init_logging();
    let mut graph = Graph::single_threaded().unwrap();
    let domain = graph.gc.new_domain("d", false);
    let nodes = graph.add_nodes(domain, AllocKind::Shape, 5).unwrap();
    graph.root(nodes[0]).unwrap();
    graph.add_nodes(domain, AllocKind::String, 5).unwrap();

    let (stats, finalized) = graph.finish();
    assert_eq!(finalized, 10);
    assert_eq!(stats.chunks_mapped, stats.chunks_unmapped);
}
