//! Collection triggers, heap growth and chunk release

use super::{collector, node, Node};
use compartment_gc::{
    AllocKind, CollectorContext, DomainId, GcConfig, GcInvocationKind, GcReason, ARENA_SIZE,
};

fn collector_with(config: GcConfig) -> CollectorContext<Node> {
    CollectorContext::new(config).expect("Should create collector")
}

#[test]
fn test_trigger_grows_from_last_heap_size() {
    let config = GcConfig {
        allocation_threshold: ARENA_SIZE,
        ..GcConfig::single_threaded()
    };
    let mut gc = collector_with(config);
    let domain = gc.new_domain("page", false);
    let kept = node(&mut gc, domain, Vec::new());
    gc.add_root(kept, "kept").unwrap();

    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.domain_trigger_bytes(domain).unwrap(), 3 * ARENA_SIZE);
    assert!(!gc.is_gc_needed());

    gc.allocate(domain, AllocKind::Script, Node::default()).unwrap();
    assert!(!gc.is_gc_needed());
    gc.allocate(domain, AllocKind::Shape, Node::default()).unwrap();
    assert!(gc.is_gc_needed());
    assert!(gc.is_gc_scheduled(domain).unwrap());
}

#[test]
fn test_default_trigger_uses_allocation_threshold() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.domain_trigger_bytes(domain).unwrap(), 3 * 30 * 1024 * 1024);
}

#[test]
fn test_domain_malloc_trigger() {
    let config = GcConfig {
        max_malloc_bytes: 1000,
        ..GcConfig::single_threaded()
    };
    let mut gc = collector_with(config);
    let domain = gc.new_domain("page", false);
    let other = gc.new_domain("other", false);
    node(&mut gc, domain, Vec::new());

    gc.report_malloc(domain, 500).unwrap();
    assert!(!gc.is_gc_needed());
    gc.report_malloc(domain, 450).unwrap();
    assert!(gc.is_gc_needed());
    assert!(gc.is_gc_scheduled(domain).unwrap());
    assert!(!gc.is_gc_scheduled(other).unwrap());

    assert!(gc.invoke_pending_gc());
    assert!(!gc.is_gc_needed());
    assert!(!gc.is_incremental_gc_in_progress());
    assert_eq!(gc.stats().nonincremental_reason.as_deref(), Some("malloc bytes trigger"));
    assert_eq!(gc.live_thing_count(domain).unwrap(), 0);
}

#[test]
fn test_runtime_malloc_trigger_requests_full_gc() {
    let config = GcConfig {
        max_malloc_bytes: 1000,
        ..GcConfig::single_threaded()
    };
    let mut gc = collector_with(config);
    let a = gc.new_domain("a", false);
    let b = gc.new_domain("b", false);
    gc.report_malloc(a, 600).unwrap();
    assert!(!gc.is_gc_needed());
    gc.report_malloc(b, 600).unwrap();
    assert!(gc.is_gc_needed());
    for id in gc.domain_ids() {
        assert!(gc.is_gc_scheduled(id).unwrap());
    }
}

#[test]
fn test_atoms_trigger_escalates_to_full_gc() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    gc.trigger_domain_gc(DomainId::ATOMS, GcReason::AllocTrigger).unwrap();
    assert!(gc.is_gc_scheduled(domain).unwrap());
    assert!(gc.is_gc_scheduled(DomainId::ATOMS).unwrap());
}

#[test]
fn test_maybe_gc_runs_requested_collection() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    node(&mut gc, domain, Vec::new());

    gc.maybe_gc(domain).unwrap();
    assert_eq!(gc.stats().slices, 0);

    gc.trigger_domain_gc(domain, GcReason::Api).unwrap();
    gc.maybe_gc(domain).unwrap();
    assert_eq!(gc.stats().slices, 1);
    assert!(!gc.is_gc_needed());
}

#[test]
fn test_invoke_pending_gc_without_request() {
    let mut gc = collector();
    gc.new_domain("page", false);
    assert!(!gc.invoke_pending_gc());
    assert_eq!(gc.stats().slices, 0);
}

#[test]
fn test_idle_maybe_gc_shrinks_heap() {
    let config = GcConfig {
        idle_full_gc_span_ms: 0,
        ..GcConfig::single_threaded()
    };
    let mut gc = collector_with(config);
    let domain = gc.new_domain("page", false);
    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.stats().collections, 1);

    // Nothing was mapped since the last collection.
    gc.maybe_gc(domain).unwrap();
    assert_eq!(gc.stats().collections, 1);

    let garbage = node(&mut gc, domain, Vec::new());
    gc.maybe_gc(domain).unwrap();
    if gc.is_incremental_gc_in_progress() {
        gc.gc_final_slice(GcInvocationKind::Shrink, GcReason::Api);
    }
    assert_eq!(gc.stats().collections, 2);
    assert!(!gc.contains(garbage));
    assert_eq!(gc.chunk_count(), 0);
    assert_eq!(gc.empty_chunk_count(), 0);
    assert_eq!(gc.stats().chunks_unmapped, 1);
}

#[test]
fn test_empty_chunks_age_out() {
    let config = GcConfig {
        max_empty_chunk_age: 1,
        ..GcConfig::single_threaded()
    };
    let mut gc = collector_with(config);
    let domain = gc.new_domain("page", false);
    node(&mut gc, domain, Vec::new());
    assert_eq!(gc.chunk_count(), 1);

    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.chunk_count(), 0);
    assert_eq!(gc.empty_chunk_count(), 1);

    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.empty_chunk_count(), 0);
    assert_eq!(gc.stats().chunks_unmapped, 1);
}

#[test]
fn test_shrink_buffers_releases_empty_chunks() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    node(&mut gc, domain, Vec::new());
    gc.gc(GcInvocationKind::Normal, GcReason::Api);
    assert_eq!(gc.empty_chunk_count(), 1);

    gc.shrink_buffers();
    assert_eq!(gc.empty_chunk_count(), 0);
    assert_eq!(gc.free_committed_arena_count(), 0);
    assert_eq!(gc.stats().chunks_mapped, 1);
    assert_eq!(gc.stats().chunks_unmapped, 1);
}

#[test]
fn test_shrinking_gc_releases_chunks_immediately() {
    let mut gc = collector();
    let domain = gc.new_domain("page", false);
    node(&mut gc, domain, Vec::new());
    gc.gc(GcInvocationKind::Shrink, GcReason::Api);
    assert_eq!(gc.empty_chunk_count(), 0);
    assert_eq!(gc.gc_bytes(), 0);
}
