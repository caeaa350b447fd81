//! Collections with the helper thread enabled
//!
//! Background kinds are finalized off the mutator thread; these tests only
//! check results after the collector has absorbed the helper's work.

use compartment_gc::{AllocKind, GcConfig, GcInvocationKind, GcReason, HelperState};
use integration_tests::{init_logging, Graph};

fn threaded() -> Graph {
    let graph = Graph::new(GcConfig::default()).unwrap();
    assert!(graph.gc.helper_state().is_some());
    graph
}

#[test]
fn test_background_kinds_finalized_on_helper() {
    init_logging();
    let mut graph = threaded();
    let domain = graph.gc.new_domain("page", false);
    let kept = graph.add_nodes(domain, AllocKind::Object4Background, 8).unwrap();
    for pair in kept.windows(2) {
        graph.add_edge(pair[0], pair[1]).unwrap();
    }
    graph.root(kept[0]).unwrap();
    graph.add_nodes(domain, AllocKind::Object4Background, 30).unwrap();
    graph.add_nodes(domain, AllocKind::String, 30).unwrap();
    graph.add_nodes(domain, AllocKind::ShortString, 10).unwrap();

    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    // Counting waits for the helper and merges what it swept.
    assert_eq!(graph.gc.live_thing_count(domain).unwrap(), 8);
    assert_eq!(graph.finalized(), 70);
    assert_eq!(graph.gc.stats().things_finalized, 70);
    assert_ne!(graph.gc.helper_state(), Some(HelperState::Sweeping));
}

#[test]
fn test_mixed_foreground_and_background_sweeping() {
    init_logging();
    let mut graph = threaded();
    let a = graph.gc.new_domain("a", false);
    let b = graph.gc.new_domain("b", true);
    let foreground = graph.add_nodes(a, AllocKind::Object8, 20).unwrap();
    let background = graph.add_nodes(b, AllocKind::Object8Background, 20).unwrap();
    let scripts = graph.add_nodes(a, AllocKind::Script, 40).unwrap();
    graph.root(foreground[0]).unwrap();
    graph.root(background[0]).unwrap();
    graph.add_edge(foreground[0], scripts[0]).unwrap();

    graph.finish_in_slices(2);
    graph.gc.object_count();
    let surviving = graph.surviving();
    assert_eq!(surviving.len(), 3);
    assert!(surviving.contains(&scripts[0]));
    assert_eq!(graph.finalized(), 77);
}

#[test]
fn test_swept_arenas_are_reused_after_background_sweep() {
    init_logging();
    let mut graph = threaded();
    let domain = graph.gc.new_domain("page", false);
    let kind = AllocKind::String;
    graph.add_nodes(domain, kind, 3 * kind.things_per_arena()).unwrap();
    let kept = graph.add_node(domain, kind).unwrap();
    graph.root(kept).unwrap();

    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(graph.gc.live_thing_count(domain).unwrap(), 1);

    // The kept thing's arena has room again.
    let fresh = graph.add_node(domain, kind).unwrap();
    assert!(graph.gc.contains(graph.thing(kept)));
    assert!(graph.gc.contains(graph.thing(fresh)));
    assert_eq!(graph.gc.chunk_count(), 1);
}

#[test]
fn test_shrink_buffers_runs_on_helper() {
    init_logging();
    let mut graph = threaded();
    let domain = graph.gc.new_domain("page", false);
    graph.add_nodes(domain, AllocKind::Object0Background, 10).unwrap();

    graph.gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(graph.gc.live_thing_count(domain).unwrap(), 0);
    assert_eq!(graph.gc.gc_bytes(), 0);

    graph.gc.shrink_buffers();
    graph.gc.live_thing_count(domain).unwrap();
    assert!(graph.gc.stats().chunks_unmapped >= 1);
}

#[test]
fn test_shutdown_with_helper_finalizes_everything() {
    init_logging();
    let mut graph = threaded();
    let domain = graph.gc.new_domain("page", false);
    let rooted = graph.add_nodes(domain, AllocKind::Object2Background, 12).unwrap();
    for &node in &rooted {
        graph.root(node).unwrap();
    }
    graph.add_nodes(domain, AllocKind::ExternalString, 5).unwrap();

    let (stats, finalized) = graph.finish();
    assert_eq!(finalized, 17);
    assert_eq!(stats.things_finalized, 17);
    assert_eq!(stats.chunks_mapped, stats.chunks_unmapped);
}
